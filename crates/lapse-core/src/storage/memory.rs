//! In-process implementation of the store surface.
//!
//! Mirrors the Redis behaviour the queue relies on: keys with absolute
//! millisecond expiry, expired-key events (only after notifications are
//! enabled, and only to live subscribers), FIFO lists with blocking pops and
//! glob enumeration. State lives as long as any clone of the store, so a
//! broker can be dropped and a new one started against the same data to
//! exercise recovery.
//!
//! [`MemoryCluster`] partitions keys across several stores, each with its own
//! expiration stream, the way Redis Cluster masters do.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::warn;

use crate::error::{StorageError, StorageResult};
use crate::storage::traits::{
    BlockingConnection, Deployment, ExpirySubscription, Store, StoreNode, WriteBatchOp,
};

const EVENT_BUFFER: usize = 4096;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
    generation: u64,
}

#[derive(Default)]
struct State {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    notify_expired: bool,
    next_generation: u64,
}

struct Shared {
    addr: String,
    state: Mutex<State>,
    pushed: Notify,
    expired: broadcast::Sender<String>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop `key` if its deadline passed, emitting the expired event.
    fn purge_if_expired(&self, state: &mut State, key: &str) {
        let expired = state
            .values
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|deadline| deadline <= Instant::now());
        if expired {
            state.values.remove(key);
            if state.notify_expired {
                // No receivers just means nobody is listening.
                let _ = self.expired.send(key.to_string());
            }
        }
    }

    fn expire(&self, key: &str, generation: u64) {
        let mut state = self.lock();
        let current = state
            .values
            .get(key)
            .is_some_and(|entry| entry.generation == generation);
        if current {
            self.purge_if_expired(&mut state, key);
        }
    }
}

/// Match a Redis-style glob supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// A single in-memory store node.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryStore {
    pub fn new(addr: impl Into<String>) -> Self {
        let (expired, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared {
                addr: addr.into(),
                state: Mutex::new(State::default()),
                pushed: Notify::new(),
                expired,
            }),
        }
    }

    /// This store as both the command store and its only node.
    pub fn deployment(&self) -> Deployment {
        Deployment {
            store: Arc::new(self.clone()),
            nodes: vec![Arc::new(self.clone())],
        }
    }

    /// Snapshot of a list, head first.
    pub fn list(&self, name: &str) -> Vec<String> {
        self.shared
            .lock()
            .lists
            .get(name)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let mut state = self.shared.lock();
        self.shared.purge_if_expired(&mut state, key);
        state.values.contains_key(key)
    }

    fn insert_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> bool {
        let mut state = self.shared.lock();
        self.shared.purge_if_expired(&mut state, key);
        if state.values.contains_key(key) {
            return false;
        }
        self.insert_expiring(&mut state, key.to_string(), value.to_string(), ttl_ms);
        true
    }

    fn get_value(&self, key: &str) -> Option<String> {
        let mut state = self.shared.lock();
        self.shared.purge_if_expired(&mut state, key);
        state.values.get(key).map(|entry| entry.value.clone())
    }

    fn insert_expiring(&self, state: &mut State, key: String, value: String, ttl_ms: u64) {
        state.next_generation += 1;
        let generation = state.next_generation;
        let deadline = Instant::now() + Duration::from_millis(ttl_ms);
        state.values.insert(
            key.clone(),
            Entry {
                value,
                expires_at: Some(deadline),
                generation,
            },
        );
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire(&key, generation);
            }
        });
    }

    /// Apply a whole batch under one lock so readers never see half of it.
    fn apply_all(&self, ops: Vec<WriteBatchOp>) {
        let mut state = self.shared.lock();
        for op in ops {
            self.apply(&mut state, op);
        }
    }

    fn apply(&self, state: &mut State, op: WriteBatchOp) {
        match op {
            WriteBatchOp::Set { key, value } => {
                state.next_generation += 1;
                let generation = state.next_generation;
                state.values.insert(
                    key,
                    Entry {
                        value,
                        expires_at: None,
                        generation,
                    },
                );
            }
            WriteBatchOp::SetExpiring { key, value, ttl_ms } => {
                self.insert_expiring(state, key, value, ttl_ms);
            }
            WriteBatchOp::Delete { key } => {
                state.values.remove(&key);
                state.lists.remove(&key);
            }
            WriteBatchOp::PushTail { list, value } => {
                state.lists.entry(list).or_default().push_back(value);
                self.shared.pushed.notify_waiters();
            }
        }
    }

    fn try_pop(&self, list: &str) -> Option<String> {
        let mut state = self.shared.lock();
        let items = state.lists.get_mut(list)?;
        let value = items.pop_front();
        if items.is_empty() {
            state.lists.remove(list);
        }
        value
    }

    async fn pop_wait(&self, list: &str, timeout: Option<Duration>) -> Option<String> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed.
            notified.as_mut().enable();
            if let Some(value) = self.try_pop(list) {
                return Some(value);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_pop(list);
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.get_value(key))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.contains_key(key))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StorageResult<bool> {
        Ok(self.insert_if_absent(key, value, ttl_ms))
    }

    async fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        self.apply_all(ops);
        Ok(())
    }

    async fn blocking_connection(&self) -> StorageResult<Box<dyn BlockingConnection>> {
        Ok(Box::new(MemoryBlockingConnection {
            route: Route::Single(self.clone()),
        }))
    }
}

#[async_trait]
impl StoreNode for MemoryStore {
    fn addr(&self) -> &str {
        &self.shared.addr
    }

    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        let mut state = self.shared.lock();
        let candidates: Vec<String> = state
            .values
            .keys()
            .chain(state.lists.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        for key in &candidates {
            self.shared.purge_if_expired(&mut state, key);
        }
        let mut keys: Vec<String> = candidates
            .into_iter()
            .filter(|key| state.values.contains_key(key) || state.lists.contains_key(key))
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn enable_expiry_notifications(&self) -> StorageResult<()> {
        self.shared.lock().notify_expired = true;
        Ok(())
    }

    async fn subscribe_expired(&self) -> StorageResult<Box<dyn ExpirySubscription>> {
        Ok(Box::new(MemoryExpirySubscription {
            addr: self.shared.addr.clone(),
            rx: self.shared.expired.subscribe(),
        }))
    }
}

struct MemoryExpirySubscription {
    addr: String,
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl ExpirySubscription for MemoryExpirySubscription {
    async fn next_expired(&mut self) -> StorageResult<Option<String>> {
        loop {
            match self.rx.recv().await {
                Ok(key) => return Ok(Some(key)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(node = %self.addr, missed, "expired-key subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

enum Route {
    Single(MemoryStore),
    Cluster(MemoryCluster),
}

struct MemoryBlockingConnection {
    route: Route,
}

#[async_trait]
impl BlockingConnection for MemoryBlockingConnection {
    async fn pop_head(
        &mut self,
        list: &str,
        timeout: Option<Duration>,
    ) -> StorageResult<Option<String>> {
        let node = match &self.route {
            Route::Single(store) => store,
            Route::Cluster(cluster) => cluster.node_for(list)?,
        };
        Ok(node.pop_wait(list, timeout).await)
    }
}

/// Several [`MemoryStore`] nodes with keys partitioned by a stable hash.
#[derive(Clone)]
pub struct MemoryCluster {
    nodes: Vec<MemoryStore>,
}

impl MemoryCluster {
    pub fn new(node_count: usize) -> Self {
        Self {
            nodes: (0..node_count)
                .map(|i| MemoryStore::new(format!("memory-{i}")))
                .collect(),
        }
    }

    pub fn nodes(&self) -> &[MemoryStore] {
        &self.nodes
    }

    /// Command store routed by key, with every node as a master.
    pub fn deployment(&self) -> Deployment {
        Deployment {
            store: Arc::new(self.clone()),
            nodes: self
                .nodes
                .iter()
                .map(|node| Arc::new(node.clone()) as Arc<dyn StoreNode>)
                .collect(),
        }
    }

    pub fn node_for(&self, key: &str) -> StorageResult<&MemoryStore> {
        if self.nodes.is_empty() {
            return Err(StorageError::Topology("cluster has no nodes".to_string()));
        }
        let hash = key
            .bytes()
            .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
        Ok(&self.nodes[hash as usize % self.nodes.len()])
    }

    /// Snapshot of a list on whichever node owns it.
    pub fn list(&self, name: &str) -> Vec<String> {
        self.node_for(name)
            .map(|node| node.list(name))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryCluster {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.node_for(key)?.get_value(key))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.node_for(key)?.contains_key(key))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StorageResult<bool> {
        Ok(self.node_for(key)?.insert_if_absent(key, value, ttl_ms))
    }

    async fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        for op in ops {
            let key = match &op {
                WriteBatchOp::Set { key, .. }
                | WriteBatchOp::SetExpiring { key, .. }
                | WriteBatchOp::Delete { key } => key.clone(),
                WriteBatchOp::PushTail { list, .. } => list.clone(),
            };
            self.node_for(&key)?.apply_all(vec![op]);
        }
        Ok(())
    }

    async fn blocking_connection(&self) -> StorageResult<Box<dyn BlockingConnection>> {
        Ok(Box::new(MemoryBlockingConnection {
            route: Route::Cluster(self.clone()),
        }))
    }
}
