use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageResult;

/// Represents a single operation in an atomic write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteBatchOp {
    Set {
        key: String,
        value: String,
    },
    /// Set a key that expires `ttl_ms` milliseconds after the store applies
    /// the write. The deadline is taken from the store's clock.
    SetExpiring {
        key: String,
        value: String,
        ttl_ms: u64,
    },
    Delete {
        key: String,
    },
    PushTail {
        list: String,
        value: String,
    },
}

/// Command connection: ordinary request/response traffic.
///
/// Implementations must be thread-safe and must never put this connection in
/// subscribe mode or issue blocking pops on it.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Create `key` with a TTL unless it already exists (`SET NX PX`).
    /// Returns whether this call created it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StorageResult<bool>;

    /// Apply a batch of writes. Single-node stores run it as one transaction.
    /// Stores that cannot (a cluster spanning slots) apply the ops in order.
    async fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()>;

    /// Open a connection reserved for blocking pops. Each topic consumer
    /// holds its own so one topic's block does not stall another.
    async fn blocking_connection(&self) -> StorageResult<Box<dyn BlockingConnection>>;
}

/// A single master node. Each one owns a key space partition and emits its own
/// expiration events, so listeners and recovery run per node.
#[async_trait]
pub trait StoreNode: Send + Sync {
    /// Address used in logs.
    fn addr(&self) -> &str;

    /// Enumerate the keys on this node matching a glob pattern.
    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>>;

    /// Turn on expired-key notifications (`notify-keyspace-events Ex`).
    async fn enable_expiry_notifications(&self) -> StorageResult<()>;

    /// Open a subscribe-mode connection on the expired-key channel.
    async fn subscribe_expired(&self) -> StorageResult<Box<dyn ExpirySubscription>>;
}

/// Subscribe-mode connection. It can only wait for events.
#[async_trait]
pub trait ExpirySubscription: Send {
    /// Wait for the next expired key name. `Ok(None)` means the subscription
    /// was closed by the store.
    async fn next_expired(&mut self) -> StorageResult<Option<String>>;
}

/// Connection dedicated to blocking list pops.
#[async_trait]
pub trait BlockingConnection: Send {
    /// Pop the head of `list`, waiting up to `timeout` (`None` waits forever).
    async fn pop_head(&mut self, list: &str, timeout: Option<Duration>)
        -> StorageResult<Option<String>>;
}

/// A resolved deployment: the command store plus every master node to listen
/// on and recover from.
#[derive(Clone)]
pub struct Deployment {
    pub store: Arc<dyn Store>,
    pub nodes: Vec<Arc<dyn StoreNode>>,
}
