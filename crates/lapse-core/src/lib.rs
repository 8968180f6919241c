//! Delayed message queue on top of Redis.
//!
//! Delayed messages are parked as a payload key plus an expiring timer key.
//! When the timer expires, Redis publishes a keyevent notification and the
//! payload is moved onto the topic's delivery list, where consumers pull it
//! with a blocking pop. A recovery scan at startup delivers delays that
//! lapsed while no process was listening.

pub mod broker;
pub mod codec;
pub mod error;
pub mod message;
pub mod storage;
pub mod telemetry;

pub use broker::{
    Broker, ClusterConfig, DispatchEvent, LapseConfig, RecoveryReport, TopicConsumer, TopicStream,
};
pub use codec::Decoded;
pub use error::{BrokerError, ConsumeError, ProduceError, StorageError, StorageResult};
pub use message::{new_id, IdentifiedMessage, Message};
pub use storage::{
    Deployment, MemoryCluster, MemoryStore, RedisClusterStore, RedisStore, Store, StoreNode,
};
