use std::time::Duration;

use async_trait::async_trait;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;

use crate::broker::config::ClusterConfig;
use crate::error::StorageResult;
use crate::storage::redis::{blpop_timeout, op_command, set_nx_command};
use crate::storage::traits::{BlockingConnection, Store, WriteBatchOp};

/// Command traffic against a Redis Cluster. Keys are routed to their slot owner.
///
/// The keys of one batch generally hash to different slots, so batches cannot
/// run as one MULTI/EXEC. This holds for produce too: the timer key and the
/// payload key are plain `<uuid>` and `<uuid>:payload` with no hash tag, so
/// they land on different masters. The ops are applied in order instead, and
/// callers order them so a crash mid-batch duplicates a message rather than
/// dropping it. A produce cut off after its payload write leaves a payload
/// without a timer, which the next recovery scan delivers right away.
///
/// Hash-tagging both keys with `{<uuid>}` would put them in one slot, but it
/// changes the key names every producer and listener must agree on.
#[derive(Clone)]
pub struct RedisClusterStore {
    client: ClusterClient,
    conn: ClusterConnection,
}

impl RedisClusterStore {
    pub async fn connect(config: &ClusterConfig) -> StorageResult<Self> {
        let mut builder = ClusterClient::builder(config.nodes.clone());
        if let Some(username) = &config.username {
            builder = builder.username(username.clone());
        }
        if let Some(password) = &config.password {
            builder = builder.password(password.clone());
        }
        let client = builder.build()?;
        let conn = client.get_async_connection().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Store for RedisClusterStore {
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
        let reply: Option<String> = set_nx_command(key, value, ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        for op in &ops {
            let _: redis::Value = op_command(op).query_async(&mut conn).await?;
        }
        Ok(())
    }

    async fn blocking_connection(&self) -> StorageResult<Box<dyn BlockingConnection>> {
        let conn = self.client.get_async_connection().await?;
        Ok(Box::new(ClusterBlockingConnection { conn }))
    }
}

struct ClusterBlockingConnection {
    conn: ClusterConnection,
}

#[async_trait]
impl BlockingConnection for ClusterBlockingConnection {
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
