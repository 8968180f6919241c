use tracing::{debug, warn};
use uuid::Uuid;

use super::metrics::DispatchSource;
use super::{Core, DispatchEvent};
use crate::codec::{self, Decoded};
use crate::error::StorageResult;
use crate::message::IdentifiedMessage;
use crate::storage::{keys, WriteBatchOp};

/// Lifetime of a claim key. A dispatcher that dies while holding a claim
/// leaves the payload to a recovery scan that runs after the claim expires.
const CLAIM_TTL_MS: u64 = 30_000;

/// Outcome of trying to release a pending delay record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Release {
    Dispatched,
    /// The payload key is gone: another path already dispatched it.
    AlreadyDispatched,
    /// The payload exists but is not a message for this identifier.
    Undecodable,
}

impl Core {
    /// Move a message onto its topic's delivery list and delete its payload
    /// key. This is the only place payload keys are deleted.
    ///
    /// The push is ordered before the delete so that a store applying the
    /// batch op by op can only duplicate, never drop.
    pub(super) async fn dispatch(
        &self,
        message: IdentifiedMessage,
        source: DispatchSource,
    ) -> StorageResult<()> {
        let delivered = message.into_delivered();
        let ops = vec![
            WriteBatchOp::PushTail {
                list: delivered.topic.clone(),
                value: codec::stringify(&delivered)?,
            },
            WriteBatchOp::Delete {
                key: keys::payload_key(&delivered.id),
            },
        ];
        self.store.write_batch(ops).await?;

        self.metrics.record_dispatch(&delivered.topic, source);
        debug!(id = %delivered.id, topic = %delivered.topic, source = source.as_str(), "dispatched");
        // Nobody subscribed is fine.
        let _ = self.events.send(DispatchEvent);
        Ok(())
    }

    /// Read the pending payload for `id`.
    async fn load_pending(&self, id: &Uuid) -> StorageResult<Option<Decoded<IdentifiedMessage>>> {
        let raw = self.store.get(&keys::payload_key(id)).await?;
        Ok(raw.map(|value| codec::parse(&value)))
    }

    /// Dispatch the pending message for `id` if its payload is still there.
    ///
    /// The listener and a recovery scan can reach the same lapsed id at once.
    /// Only the caller that creates the claim key dispatches; the other reports
    /// the message as already dispatched.
    pub(super) async fn release(&self, id: &Uuid, source: DispatchSource) -> StorageResult<Release> {
        let message = match self.load_pending(id).await? {
            None => return Ok(Release::AlreadyDispatched),
            Some(Decoded::Message(message)) if message.id == *id => message,
            Some(Decoded::Message(message)) => {
                warn!(%id, stored_id = %message.id, "payload belongs to another id, skipping");
                return Ok(Release::Undecodable);
            }
            Some(Decoded::Raw(_)) => {
                warn!(%id, "undecodable payload, skipping");
                return Ok(Release::Undecodable);
            }
        };

        if !self
            .store
            .set_if_absent(&keys::claim_key(id), "", CLAIM_TTL_MS)
            .await?
        {
            debug!(%id, "payload claimed by another dispatcher");
            return Ok(Release::AlreadyDispatched);
        }
        // An expired claim may belong to a dispatch that already finished.
        if !self.store.exists(&keys::payload_key(id)).await? {
            return Ok(Release::AlreadyDispatched);
        }

        self.dispatch(message, source).await?;
        Ok(Release::Dispatched)
    }
}
