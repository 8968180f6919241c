mod cluster;
pub mod keys;
mod memory;
mod redis;
pub mod topology;
mod traits;

pub use self::cluster::RedisClusterStore;
pub use self::memory::{MemoryCluster, MemoryStore};
pub use self::redis::{RedisNode, RedisStore};
pub use traits::{
    BlockingConnection, Deployment, ExpirySubscription, Store, StoreNode, WriteBatchOp,
};
