use super::*;
use crate::codec;
use crate::error::{StorageError, StorageResult};
use crate::storage::{BlockingConnection, ExpirySubscription};
use async_trait::async_trait;
use std::time::Instant;

pub(super) fn test_config() -> LapseConfig {
    LapseConfig::default()
}

pub(super) async fn start_broker(store: &MemoryStore) -> Broker {
    Broker::start(store.deployment(), &test_config())
        .await
        .unwrap()
}

/// Decode every entry of a delivery list, head first.
pub(super) fn decode_list(entries: Vec<String>) -> Vec<IdentifiedMessage> {
    entries
        .iter()
        .map(|raw| {
            codec::parse::<IdentifiedMessage>(raw)
                .message()
                .expect("delivery list entry should decode")
        })
        .collect()
}

pub(super) fn delivered(store: &MemoryStore, topic: &str) -> Vec<IdentifiedMessage> {
    decode_list(store.list(topic))
}

/// Poll until `check` holds or `within` elapses. Returns whether it held.
pub(super) async fn wait_until(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Write a delay record the way a producer in another process would have.
pub(super) async fn write_delay_record(
    store: &dyn Store,
    message: &IdentifiedMessage,
    timer_ttl_ms: Option<u64>,
) {
    let mut ops = vec![WriteBatchOp::Set {
        key: keys::payload_key(&message.id),
        value: codec::stringify(message).unwrap(),
    }];
    if let Some(ttl_ms) = timer_ttl_ms {
        ops.push(WriteBatchOp::SetExpiring {
            key: keys::timer_key(&message.id),
            value: String::new(),
            ttl_ms,
        });
    }
    store.write_batch(ops).await.unwrap();
}

pub(super) fn identified(topic: &str, body: serde_json::Value) -> IdentifiedMessage {
    IdentifiedMessage::from_message(new_id(), Message::new(topic, body))
}

/// A master that cannot be reached.
pub(super) struct UnreachableNode;

#[async_trait]
impl StoreNode for UnreachableNode {
    fn addr(&self) -> &str {
        "10.255.255.1:7000"
    }

    async fn keys(&self, _pattern: &str) -> StorageResult<Vec<String>> {
        Err(StorageError::Closed("connection refused".to_string()))
    }

    async fn enable_expiry_notifications(&self) -> StorageResult<()> {
        Err(StorageError::Closed("connection refused".to_string()))
    }

    async fn subscribe_expired(&self) -> StorageResult<Box<dyn ExpirySubscription>> {
        Err(StorageError::Closed("connection refused".to_string()))
    }
}

/// Store whose `get` returns only once `parties` reads are waiting, so
/// concurrent callers all see the same value before any of them writes.
pub(super) struct GatedReads {
    inner: MemoryStore,
    gate: tokio::sync::Barrier,
}

impl GatedReads {
    pub(super) fn new(inner: MemoryStore, parties: usize) -> Self {
        Self {
            inner,
            gate: tokio::sync::Barrier::new(parties),
        }
    }
}

#[async_trait]
impl Store for GatedReads {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let value = self.inner.get(key).await;
        self.gate.wait().await;
        value
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StorageResult<bool> {
        self.inner.set_if_absent(key, value, ttl_ms).await
    }

    async fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        // Yield so the other caller can run between our reads and writes.
        tokio::task::yield_now().await;
        self.inner.write_batch(ops).await
    }

    async fn blocking_connection(&self) -> StorageResult<Box<dyn BlockingConnection>> {
        self.inner.blocking_connection().await
    }
}
