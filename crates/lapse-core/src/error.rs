/// Low-level storage errors (Redis, serialization, topology).
/// This is the error type for the storage traits. Store operations can only
/// fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("cluster topology error: {0}")]
    Topology(String),
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::Redis(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// --- Per-operation error types ---

#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised while bringing a broker up.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Every master node failed its listener or recovery init.
    #[error("no store node could be initialised: {0}")]
    NoNodesAvailable(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
