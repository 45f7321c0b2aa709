//! Bulk state transitions over the whole registry.
//!
//! Campaigns like "mark everything for resync" or "re-pend all
//! verifications" must not update millions of rows in one write. The
//! transitioner walks the registry in id order behind a persistent cursor,
//! touching a bounded batch per call.
//!
//! Each call scans a bounded id range, not "until the batch fills": a range
//! with few matching rows yields a small (even empty) batch, and the cursor
//! still advances past the whole scanned range. Progress is therefore bounded
//! per call even when nothing matches, and an interrupted campaign resumes
//! from the cursor instead of restarting.

use std::sync::Arc;

use tracing::{debug, info};

use fleetsync_registry::cursor::CursorStore;
use fleetsync_registry::state::{RegistryRecord, SyncState, VerificationState};
use fleetsync_registry::store::RegistryStore;

use crate::config::ReplConfig;

/// A campaign's per-row transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOp {
    /// Re-pend sync for every synced or failed unit.
    MarkPending,
    /// Re-pend verification for every unit with a completed verification.
    MarkVerificationPending,
}

impl TransitionOp {
    fn name(&self) -> &'static str {
        match self {
            TransitionOp::MarkPending => "mark_pending",
            TransitionOp::MarkVerificationPending => "mark_verification_pending",
        }
    }

    /// Whether the row still needs this transition.
    fn matches(&self, r: &RegistryRecord) -> bool {
        match self {
            TransitionOp::MarkPending => {
                matches!(r.state, SyncState::Synced | SyncState::Failed)
            }
            TransitionOp::MarkVerificationPending => matches!(
                r.verification_state,
                VerificationState::Succeeded | VerificationState::Failed
            ),
        }
    }

    fn apply(&self, r: &mut RegistryRecord) {
        match self {
            TransitionOp::MarkPending => {
                r.state = SyncState::Pending;
                r.retry_count = 0;
                r.retry_at_us = None;
            }
            TransitionOp::MarkVerificationPending => {
                r.verification_state = VerificationState::Pending;
                r.verification_retry_count = 0;
                r.verification_retry_at_us = None;
            }
        }
    }
}

/// Result of one transitioner call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkBatchResult {
    /// Rows transitioned in this batch.
    pub updated: usize,
    /// Cursor position after the batch.
    pub cursor: u64,
    /// Whether the scan has passed the largest known id. The campaign is
    /// complete once this is true.
    pub done: bool,
}

/// Walks the registry in bounded batches, applying one [`TransitionOp`].
pub struct BulkStateTransitioner {
    registry: Arc<RegistryStore>,
    cursors: Arc<CursorStore>,
    op: TransitionOp,
    kind: &'static str,
    batch_size: usize,
    scan_multiplier: u64,
}

impl BulkStateTransitioner {
    /// Create a transitioner for one campaign over one replicable kind.
    /// Batch and scan sizes come from the node configuration.
    pub fn new(
        registry: Arc<RegistryStore>,
        cursors: Arc<CursorStore>,
        op: TransitionOp,
        kind: &'static str,
        config: &ReplConfig,
    ) -> Self {
        Self {
            registry,
            cursors,
            op,
            kind,
            batch_size: config.bulk_batch_size,
            scan_multiplier: config.bulk_scan_multiplier,
        }
    }

    fn cursor_name(&self) -> String {
        format!("bulk:{}:{}", self.kind, self.op.name())
    }

    /// Current cursor position.
    pub fn cursor(&self) -> u64 {
        self.cursors.get(&self.cursor_name())
    }

    /// Restart the campaign from the beginning.
    pub fn reset(&self) {
        self.cursors.reset(&self.cursor_name());
        info!(kind = self.kind, op = self.op.name(), "bulk transition campaign restarted");
    }

    /// How many batches of work remain past the cursor, counted up to
    /// `max` batches.
    pub async fn remaining_batches(&self, max: usize) -> usize {
        let cursor = self.cursor();
        let count = self
            .registry
            .count_where(
                |r| r.model_id > cursor && self.op.matches(r),
                max.saturating_mul(self.batch_size),
            )
            .await;
        count.div_ceil(self.batch_size)
    }

    /// Transition one batch and advance the cursor.
    pub async fn run_one_batch(&self) -> BulkBatchResult {
        let cursor = self.cursor();
        let scan_end =
            cursor.saturating_add((self.batch_size as u64).saturating_mul(self.scan_multiplier));

        let candidates = self.registry.records_after(cursor, scan_end).await;
        let selected: Vec<u64> = candidates
            .iter()
            .filter(|r| self.op.matches(r))
            .take(self.batch_size)
            .map(|r| r.model_id)
            .collect();

        // A filled batch may not have scanned the whole range, so the cursor
        // only advances to the last transitioned id. A short batch proves the
        // rest of the range holds nothing to do.
        let new_cursor = if selected.len() == self.batch_size {
            selected.last().copied().unwrap_or(scan_end)
        } else {
            scan_end
        };

        let updated = self
            .registry
            .update_many(&selected, |r| self.op.apply(r))
            .await;
        self.cursors.advance(&self.cursor_name(), new_cursor);

        let done = match self.registry.max_id().await {
            Some(max) => new_cursor >= max,
            None => true,
        };
        debug!(
            kind = self.kind,
            op = self.op.name(),
            updated,
            cursor = new_cursor,
            done,
            "bulk transition batch"
        );
        BulkBatchResult {
            updated,
            cursor: new_cursor,
            done,
        }
    }

    /// Run batches until the campaign is complete. Returns total rows
    /// transitioned.
    pub async fn run_to_completion(&self) -> usize {
        let mut total = 0;
        loop {
            let batch = self.run_one_batch().await;
            total += batch.updated;
            if batch.done {
                return total;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transitioner(
        registry: Arc<RegistryStore>,
        cursors: Arc<CursorStore>,
        op: TransitionOp,
    ) -> BulkStateTransitioner {
        // Defaults: batches of 1000, scanning at most 10x that per call.
        BulkStateTransitioner::new(registry, cursors, op, "repository", &ReplConfig::default())
    }

    async fn synced_rows(registry: &RegistryStore, ids: &[u64]) {
        for id in ids {
            registry.insert_if_absent(*id).await;
            registry
                .update(*id, |r| r.state = SyncState::Synced)
                .await
                .unwrap();
        }
    }

    mod cursor_movement {
        use super::*;

        #[tokio::test]
        async fn test_sparse_range_advances_cursor_to_scan_end() {
            // Three matching rows inside (5000, 15000]: the batch holds 3
            // and the cursor jumps to 15000, not to the last matched id.
            let registry = Arc::new(RegistryStore::new());
            synced_rows(&registry, &[6_000, 9_000, 14_000, 80_000]).await;
            let cursors = Arc::new(CursorStore::new());
            let t = transitioner(registry.clone(), cursors.clone(), TransitionOp::MarkPending);
            cursors.advance(&t.cursor_name(), 5_000);

            let batch = t.run_one_batch().await;
            assert_eq!(batch.updated, 3);
            assert_eq!(batch.cursor, 15_000);
            assert!(!batch.done, "row 80000 still ahead");

            for id in [6_000, 9_000, 14_000] {
                assert_eq!(registry.get(id).await.unwrap().state, SyncState::Pending);
            }
            assert_eq!(registry.get(80_000).await.unwrap().state, SyncState::Synced);
        }

        #[tokio::test]
        async fn test_filled_batch_stops_cursor_at_last_selected() {
            let registry = Arc::new(RegistryStore::new());
            let ids: Vec<u64> = (1..=1_500).collect();
            synced_rows(&registry, &ids).await;
            let cursors = Arc::new(CursorStore::new());
            let t = transitioner(registry.clone(), cursors, TransitionOp::MarkPending);

            let batch = t.run_one_batch().await;
            assert_eq!(batch.updated, 1_000);
            assert_eq!(batch.cursor, 1_000, "range scanned to 10000 but batch filled at 1000");
            assert!(!batch.done);

            // Rows past the filled batch are untouched until the next call.
            assert_eq!(registry.get(1_001).await.unwrap().state, SyncState::Synced);
            let second = t.run_one_batch().await;
            assert_eq!(second.updated, 500);
            assert!(second.done);
        }

        #[tokio::test]
        async fn test_empty_range_still_makes_progress() {
            let registry = Arc::new(RegistryStore::new());
            synced_rows(&registry, &[50_000]).await;
            let cursors = Arc::new(CursorStore::new());
            let t = transitioner(registry, cursors, TransitionOp::MarkPending);

            let batch = t.run_one_batch().await;
            assert_eq!(batch.updated, 0);
            assert_eq!(batch.cursor, 10_000);
            assert!(!batch.done);
        }

        #[tokio::test]
        async fn test_config_drives_batch_and_scan_sizes() {
            let registry = Arc::new(RegistryStore::new());
            let ids: Vec<u64> = (1..=10).collect();
            synced_rows(&registry, &ids).await;

            let config = ReplConfig {
                bulk_batch_size: 2,
                bulk_scan_multiplier: 2,
                ..ReplConfig::default()
            };
            let t = BulkStateTransitioner::new(
                registry,
                Arc::new(CursorStore::new()),
                TransitionOp::MarkPending,
                "repository",
                &config,
            );

            // Scan range is (0, 4]; the batch fills at 2 rows.
            let batch = t.run_one_batch().await;
            assert_eq!(batch.updated, 2);
            assert_eq!(batch.cursor, 2);
        }

        #[tokio::test]
        async fn test_reset_restarts_campaign() {
            let registry = Arc::new(RegistryStore::new());
            synced_rows(&registry, &[1]).await;
            let cursors = Arc::new(CursorStore::new());
            let t = transitioner(registry, cursors, TransitionOp::MarkPending);

            t.run_one_batch().await;
            assert!(t.cursor() > 0);
            t.reset();
            assert_eq!(t.cursor(), 0);
        }
    }

    mod ops {
        use super::*;

        #[tokio::test]
        async fn test_mark_pending_skips_in_flight_rows() {
            let registry = Arc::new(RegistryStore::new());
            synced_rows(&registry, &[1]).await;
            registry.insert_if_absent(2).await;
            registry
                .update(2, |r| r.state = SyncState::Started)
                .await
                .unwrap();
            registry.insert_if_absent(3).await;
            registry
                .update(3, |r| {
                    r.state = SyncState::Failed;
                    r.retry_count = 7;
                    r.retry_at_us = Some(123);
                })
                .await
                .unwrap();

            let cursors = Arc::new(CursorStore::new());
            let t = transitioner(registry.clone(), cursors, TransitionOp::MarkPending);
            let total = t.run_to_completion().await;
            assert_eq!(total, 2);

            assert_eq!(registry.get(1).await.unwrap().state, SyncState::Pending);
            assert_eq!(registry.get(2).await.unwrap().state, SyncState::Started);
            let failed = registry.get(3).await.unwrap();
            assert_eq!(failed.state, SyncState::Pending);
            assert_eq!(failed.retry_count, 0, "retry state cleared");
            assert_eq!(failed.retry_at_us, None);
        }

        #[tokio::test]
        async fn test_mark_verification_pending_leaves_sync_state_alone() {
            let registry = Arc::new(RegistryStore::new());
            synced_rows(&registry, &[1]).await;
            registry
                .update(1, |r| {
                    r.verification_state = VerificationState::Succeeded;
                    r.verification_retry_count = 2;
                })
                .await
                .unwrap();

            let cursors = Arc::new(CursorStore::new());
            let t = transitioner(
                registry.clone(),
                cursors,
                TransitionOp::MarkVerificationPending,
            );
            assert_eq!(t.run_to_completion().await, 1);

            let row = registry.get(1).await.unwrap();
            assert_eq!(row.verification_state, VerificationState::Pending);
            assert_eq!(row.verification_retry_count, 0);
            assert_eq!(row.state, SyncState::Synced);
        }

        #[tokio::test]
        async fn test_remaining_batches_counts_past_cursor_only() {
            let registry = Arc::new(RegistryStore::new());
            let ids: Vec<u64> = (1..=2_500).collect();
            synced_rows(&registry, &ids).await;
            let cursors = Arc::new(CursorStore::new());
            let t = transitioner(registry, cursors.clone(), TransitionOp::MarkPending);

            assert_eq!(t.remaining_batches(100).await, 3);
            cursors.advance(&t.cursor_name(), 2_000);
            assert_eq!(t.remaining_batches(100).await, 1);
        }
    }
}
