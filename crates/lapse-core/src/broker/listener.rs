use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::dispatcher::Release;
use super::metrics::DispatchSource;
use super::Core;
use crate::error::StorageResult;
use crate::storage::{keys, ExpirySubscription, StoreNode};

/// Enable notifications and subscribe on `node`, then hand the subscription to
/// a background task. Setup errors are returned; once running, a failed or
/// closed subscription ends the task without reconnecting.
pub(super) async fn spawn(core: Arc<Core>, node: Arc<dyn StoreNode>) -> StorageResult<JoinHandle<()>> {
    node.enable_expiry_notifications().await?;
    let subscription = node.subscribe_expired().await?;
    let addr = node.addr().to_string();
    info!(node = %addr, "expiration listener started");
    Ok(tokio::spawn(run(core, addr, subscription)))
}

async fn run(core: Arc<Core>, addr: String, mut subscription: Box<dyn ExpirySubscription>) {
    loop {
        match subscription.next_expired().await {
            Ok(Some(key)) => core.on_expired(&addr, &key).await,
            Ok(None) => {
                warn!(node = %addr, "expired-key subscription closed, listener stopped");
                break;
            }
            Err(e) => {
                error!(node = %addr, error = %e, "expired-key subscription failed, listener stopped");
                break;
            }
        }
    }
}

impl Core {
    async fn on_expired(&self, node: &str, key: &str) {
        // Unrelated keys expire in a shared keyspace too.
        let Some(id) = keys::parse_timer_key(key) else {
            trace!(node, key, "ignoring foreign expired key");
            return;
        };
        match self.release(&id, DispatchSource::Expired).await {
            Ok(Release::Dispatched) | Ok(Release::Undecodable) => {}
            Ok(Release::AlreadyDispatched) => {
                debug!(node, %id, "payload already dispatched");
            }
            // The payload stays in place; the next recovery scan picks it up.
            Err(e) => error!(node, %id, error = %e, "failed to dispatch expired message"),
        }
    }
}
