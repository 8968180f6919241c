pub mod config;
mod consumer;
mod dispatcher;
mod listener;
pub mod metrics;
mod recovery;
mod scheduler;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::codec::Decoded;
use crate::error::{BrokerError, BrokerResult, ConsumeError, ProduceError};
use crate::message::{IdentifiedMessage, Message};
use crate::storage::{topology, Deployment, RedisClusterStore, RedisStore, Store, StoreNode};

pub use config::{ClusterConfig, ConsumerConfig, EventsConfig, LapseConfig, RedisConfig};
pub use consumer::{TopicConsumer, TopicStream};
pub use metrics::{DispatchSource, Metrics};
pub use recovery::RecoveryReport;

/// Local notification sent after a dispatch commits. Carries no payload;
/// observers that need the message pull it from the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchEvent;

/// State shared between the broker handle and its listener tasks.
pub(crate) struct Core {
    store: Arc<dyn Store>,
    events: broadcast::Sender<DispatchEvent>,
    metrics: Metrics,
}

impl Core {
    fn new(store: Arc<dyn Store>, events: &EventsConfig, metrics: Metrics) -> Self {
        let (events, _) = broadcast::channel(events.channel_capacity.max(1));
        Self {
            store,
            events,
            metrics,
        }
    }
}

/// A running delayed queue.
///
/// Startup enables expiration notifications and subscribes on every master
/// node, then replays lapsed delays found by the recovery scan. Nodes that
/// fail either step are logged and left out; the broker only fails to start
/// when no node is left.
pub struct Broker {
    core: Arc<Core>,
    consumers: Mutex<HashMap<String, TopicConsumer>>,
    listeners: Vec<JoinHandle<()>>,
    observers: Mutex<Vec<JoinHandle<()>>>,
    active_nodes: Vec<String>,
    recovery: RecoveryReport,
    pull_timeout: Duration,
}

impl Broker {
    /// Connect to Redis as configured: a single server, or the masters of a
    /// cluster resolved fresh from its entry points.
    pub async fn connect(config: &LapseConfig) -> BrokerResult<Self> {
        let deployment = match &config.cluster {
            Some(cluster) => {
                let store = RedisClusterStore::connect(cluster).await?;
                let masters = topology::resolve_masters(cluster).await?;
                Deployment {
                    store: Arc::new(store),
                    nodes: masters
                        .into_iter()
                        .map(|node| Arc::new(node) as Arc<dyn StoreNode>)
                        .collect(),
                }
            }
            None => {
                let store = Arc::new(RedisStore::connect(&config.redis.url).await?);
                Deployment {
                    store: store.clone(),
                    nodes: vec![store as Arc<dyn StoreNode>],
                }
            }
        };
        Self::start(deployment, config).await
    }

    /// Start on an already connected deployment.
    pub async fn start(deployment: Deployment, config: &LapseConfig) -> BrokerResult<Self> {
        Self::start_with_metrics(deployment, config, Metrics::new()).await
    }

    #[tracing::instrument(skip_all, fields(nodes = deployment.nodes.len()))]
    pub async fn start_with_metrics(
        deployment: Deployment,
        config: &LapseConfig,
        metrics: Metrics,
    ) -> BrokerResult<Self> {
        let core = Arc::new(Core::new(deployment.store, &config.events, metrics));

        let mut failures = Vec::new();
        let mut running = Vec::new();
        for node in &deployment.nodes {
            match listener::spawn(Arc::clone(&core), Arc::clone(node)).await {
                Ok(handle) => running.push((Arc::clone(node), handle)),
                Err(e) => {
                    error!(node = %node.addr(), error = %e, "expiration listener init failed");
                    failures.push(format!("{}: {e}", node.addr()));
                }
            }
        }

        let mut recovery = RecoveryReport::default();
        let mut listeners = Vec::new();
        let mut active_nodes = Vec::new();
        for (node, handle) in running {
            match core.recover_node(node.as_ref()).await {
                Ok(report) => {
                    recovery.merge(&report);
                    listeners.push(handle);
                    active_nodes.push(node.addr().to_string());
                }
                Err(e) => {
                    error!(node = %node.addr(), error = %e, "recovery scan failed");
                    handle.abort();
                    failures.push(format!("{}: {e}", node.addr()));
                }
            }
        }

        if active_nodes.is_empty() {
            return Err(BrokerError::NoNodesAvailable(if failures.is_empty() {
                "no nodes configured".to_string()
            } else {
                failures.join("; ")
            }));
        }

        info!(
            nodes = active_nodes.len(),
            failed = failures.len(),
            recovered = recovery.recovered,
            "broker started"
        );

        Ok(Self {
            core,
            consumers: Mutex::new(HashMap::new()),
            listeners,
            observers: Mutex::new(Vec::new()),
            active_nodes,
            recovery,
            pull_timeout: config.consumer.pull_timeout(),
        })
    }

    /// Produce a message. Returns its identifier without waiting for delivery.
    pub async fn produce<T: Serialize>(&self, message: Message<T>) -> Result<Uuid, ProduceError> {
        self.core.produce(message).await
    }

    /// The pull handle for `topic`. Repeated calls share one handle, and with
    /// it one blocking connection and one delivery position.
    pub fn consume(&self, topic: &str) -> TopicConsumer {
        let mut consumers = self
            .consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        consumers
            .entry(topic.to_string())
            .or_insert_with(|| {
                TopicConsumer::new(topic, Arc::clone(&self.core.store), self.pull_timeout)
            })
            .clone()
    }

    /// Pull the next message from `topic`, waiting up to `timeout`
    /// (`Duration::ZERO` waits indefinitely).
    pub async fn next(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<Decoded<IdentifiedMessage>>, ConsumeError> {
        self.consume(topic).next_timeout(timeout).await
    }

    /// Receiver of dispatch notifications.
    pub fn dispatch_events(&self) -> broadcast::Receiver<DispatchEvent> {
        self.core.events.subscribe()
    }

    /// Run `callback` once per dispatch, on a background task owned by the
    /// broker.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn() + Send + 'static,
    {
        let mut rx = self.dispatch_events();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(DispatchEvent) => callback(),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        for _ in 0..missed {
                            callback();
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// Addresses of the nodes whose listener and recovery came up.
    pub fn active_nodes(&self) -> &[String] {
        &self.active_nodes
    }

    /// What the startup recovery scan did, summed over nodes.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stop listeners and observers. Registered delays stay in the store and
    /// are recovered by the next broker to start.
    #[tracing::instrument(skip_all)]
    pub async fn shutdown(mut self) {
        info!("initiating broker shutdown");
        let listeners = std::mem::take(&mut self.listeners);
        for handle in &listeners {
            handle.abort();
        }
        for handle in listeners {
            // Aborted tasks resolve with a cancellation error.
            let _ = handle.await;
        }
        self.stop_observers();
        info!("broker shutdown complete");
    }

    fn stop_observers(&self) {
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for handle in observers.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        for handle in self.listeners.drain(..) {
            handle.abort();
        }
        self.stop_observers();
    }
}
