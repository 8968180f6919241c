use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::error::StorageResult;
use crate::storage::keys;
use crate::storage::traits::{
    BlockingConnection, ExpirySubscription, Store, StoreNode, WriteBatchOp,
};

/// Keys fetched per SCAN round-trip during enumeration.
const SCAN_BATCH: usize = 500;

/// Build the Redis command for one batch operation.
pub(crate) fn op_command(op: &WriteBatchOp) -> redis::Cmd {
    match op {
        WriteBatchOp::Set { key, value } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            cmd
        }
        WriteBatchOp::SetExpiring { key, value, ttl_ms } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("PX").arg((*ttl_ms).max(1));
            cmd
        }
        WriteBatchOp::Delete { key } => {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(key);
            cmd
        }
        WriteBatchOp::PushTail { list, value } => {
            let mut cmd = redis::cmd("RPUSH");
            cmd.arg(list).arg(value);
            cmd
        }
    }
}

/// `SET key value NX PX ttl`.
pub(crate) fn set_nx_command(key: &str, value: &str, ttl_ms: u64) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value).arg("NX").arg("PX").arg(ttl_ms.max(1));
    cmd
}

/// BLPOP takes seconds, where `0` blocks forever.
pub(crate) fn blpop_timeout(timeout: Option<Duration>) -> f64 {
    match timeout {
        Some(t) => t.as_secs_f64().max(0.001),
        None => 0.0,
    }
}

/// One Redis server addressed directly (a standalone server or a cluster
/// master). Used for the per-node roles: enumeration, notification setup and
/// the expired-key subscription.
#[derive(Debug, Clone)]
pub struct RedisNode {
    client: redis::Client,
    addr: String,
    db: i64,
}

impl RedisNode {
    pub fn open<T: redis::IntoConnectionInfo>(params: T) -> StorageResult<Self> {
        let client = redis::Client::open(params)?;
        let info = client.get_connection_info();
        let addr = info.addr.to_string();
        let db = info.redis.db;
        Ok(Self { client, addr, db })
    }

    pub fn db(&self) -> i64 {
        self.db
    }

    pub(crate) fn client(&self) -> &redis::Client {
        &self.client
    }
}

#[async_trait]
impl StoreNode for RedisNode {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut found = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        found.sort_unstable();
        found.dedup();
        debug!(node = %self.addr, pattern, count = found.len(), "enumerated keys");
        Ok(found)
    }

    async fn enable_expiry_notifications(&self) -> StorageResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe_expired(&self) -> StorageResult<Box<dyn ExpirySubscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = keys::expired_channel(self.db);
        pubsub.subscribe(&channel).await?;
        debug!(node = %self.addr, %channel, "subscribed to expired keys");
        Ok(Box::new(RedisExpirySubscription {
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }
}

/// Single-node Redis: command traffic through a reconnecting
/// `ConnectionManager`, per-node roles through [`RedisNode`].
#[derive(Clone)]
pub struct RedisStore {
    node: RedisNode,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to a Redis server. The database index in the URL selects the
    /// keyevent channel as well.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let node = RedisNode::open(url)?;
        let conn = ConnectionManager::new(node.client().clone()).await?;
        Ok(Self { node, conn })
    }

    pub fn node(&self) -> &RedisNode {
        &self.node
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StorageResult<bool> {
        let mut conn = self.conn.clone();
        // Nil when the key already exists.
        let reply: Option<String> = set_nx_command(key, value, ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            pipe.add_command(op_command(op)).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn blocking_connection(&self) -> StorageResult<Box<dyn BlockingConnection>> {
        let conn = self.node.client().get_multiplexed_async_connection().await?;
        Ok(Box::new(RedisBlockingConnection { conn }))
    }
}

#[async_trait]
impl StoreNode for RedisStore {
    fn addr(&self) -> &str {
        self.node.addr()
    }

    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        self.node.keys(pattern).await
    }

    async fn enable_expiry_notifications(&self) -> StorageResult<()> {
        self.node.enable_expiry_notifications().await
    }

    async fn subscribe_expired(&self) -> StorageResult<Box<dyn ExpirySubscription>> {
        self.node.subscribe_expired().await
    }
}

struct RedisBlockingConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl BlockingConnection for RedisBlockingConnection {
    async fn pop_head(
        &mut self,
        list: &str,
        timeout: Option<Duration>,
    ) -> StorageResult<Option<String>> {
        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(list)
            .arg(blpop_timeout(timeout))
            .query_async(&mut self.conn)
            .await?;
        Ok(reply.map(|(_, value)| value))
    }
}

struct RedisExpirySubscription {
    messages: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl ExpirySubscription for RedisExpirySubscription {
    async fn next_expired(&mut self) -> StorageResult<Option<String>> {
        match self.messages.next().await {
            Some(msg) => Ok(Some(msg.get_payload::<String>()?)),
            None => Ok(None),
        }
    }
}
