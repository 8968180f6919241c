use tracing::{debug, info};

use super::dispatcher::Release;
use super::metrics::DispatchSource;
use super::Core;
use crate::error::StorageResult;
use crate::storage::{keys, StoreNode};

/// Counts from a recovery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Lapsed delays dispatched by the scan.
    pub recovered: u64,
    /// Delays whose timer is still running.
    pub pending: u64,
    /// Payload keys with a malformed name or an undecodable value.
    pub skipped: u64,
}

impl RecoveryReport {
    pub fn merge(&mut self, other: &RecoveryReport) {
        self.recovered += other.recovered;
        self.pending += other.pending;
        self.skipped += other.skipped;
    }
}

impl Core {
    /// Replay every delay on `node` whose timer is already gone.
    ///
    /// A missing timer means either the expiration fired while nobody was
    /// listening, or a listener is handling it right now. Both are handled the
    /// same way: a payload that disappears before we read it is counted as
    /// delivered by the other path.
    #[tracing::instrument(skip_all, fields(node = %node.addr()))]
    pub(super) async fn recover_node(&self, node: &dyn StoreNode) -> StorageResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let payload_keys = node.keys(&keys::payload_pattern()).await?;

        for key in &payload_keys {
            let Some(id) = keys::parse_payload_key(key) else {
                debug!(key, "skipping malformed payload key");
                self.metrics.record_recovery_skip(node.addr());
                report.skipped += 1;
                continue;
            };

            if self.store.exists(&keys::timer_key(&id)).await? {
                report.pending += 1;
                continue;
            }

            match self.release(&id, DispatchSource::Recovered).await? {
                Release::Dispatched => report.recovered += 1,
                Release::AlreadyDispatched => {
                    debug!(%id, "payload dispatched by listener during scan");
                }
                Release::Undecodable => {
                    self.metrics.record_recovery_skip(node.addr());
                    report.skipped += 1;
                }
            }
        }

        info!(
            scanned = payload_keys.len(),
            recovered = report.recovered,
            pending = report.pending,
            skipped = report.skipped,
            "recovery scan complete"
        );
        Ok(report)
    }
}
