use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::metrics::DispatchSource;
use super::Core;
use crate::codec;
use crate::error::{ProduceError, StorageError, StorageResult};
use crate::message::{new_id, IdentifiedMessage, Message};
use crate::storage::{keys, WriteBatchOp};

impl Core {
    /// Assign an identifier, then either dispatch right away or register the
    /// delay record.
    #[tracing::instrument(skip_all, fields(topic = %message.topic))]
    pub(super) async fn produce<T: Serialize>(
        &self,
        message: Message<T>,
    ) -> Result<Uuid, ProduceError> {
        if message.topic.is_empty() {
            return Err(ProduceError::InvalidTopic(
                "topic must not be empty".to_string(),
            ));
        }
        let due_in = message.due_in();
        let body = serde_json::to_value(&message.body).map_err(StorageError::from)?;
        let id = new_id();
        let identified = IdentifiedMessage {
            id,
            topic: message.topic,
            body,
            delay: message.delay,
        };
        self.metrics.record_produce(&identified.topic);

        match due_in {
            None => {
                debug!(%id, "producing immediate message");
                self.dispatch(identified, DispatchSource::Immediate).await?;
            }
            Some(delay) => self.schedule(identified, delay).await?,
        }
        Ok(id)
    }

    /// Write the payload key and the expiring timer key in one batch.
    ///
    /// The payload goes first: if a non-atomic store stops halfway, a payload
    /// without a timer is picked up by the next recovery scan, whereas a timer
    /// without a payload would fire into nothing.
    async fn schedule(&self, message: IdentifiedMessage, delay: Duration) -> StorageResult<()> {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let ops = vec![
            WriteBatchOp::Set {
                key: keys::payload_key(&message.id),
                value: codec::stringify(&message)?,
            },
            WriteBatchOp::SetExpiring {
                key: keys::timer_key(&message.id),
                value: String::new(),
                ttl_ms: delay_ms,
            },
        ];
        self.store.write_batch(ops).await?;
        self.metrics.record_delay(&message.topic);
        debug!(id = %message.id, delay_ms, "registered delay");
        Ok(())
    }
}
