//! Registry backfill and orphan cleanup.
//!
//! Event delivery is lossy: a create event can be missed (the unit exists on
//! the primary but has no registry row) and a delete event can be missed
//! (the row outlives the unit). The reconciler walks the id space one range
//! at a time and repairs both directions by set difference against the
//! primary's model index. Both repairs are idempotent, so re-scanning a
//! range after a crash is harmless.
//!
//! The cursor wraps to zero once a range reaches past the primary's largest
//! id. Reconciliation is a perpetual background sweep, not a one-shot
//! campaign.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use fleetsync_registry::cursor::CursorStore;
use fleetsync_registry::store::RegistryStore;

use crate::error::ReplError;

/// The primary's authoritative index of which units exist.
#[async_trait]
pub trait ReconcileSource: Send + Sync {
    /// IDs of units existing on the primary within `[start, end]`.
    async fn ids_in_range(&self, start: u64, end: u64) -> Result<Vec<u64>, ReplError>;

    /// Largest unit id on the primary, if any exist.
    async fn max_id(&self) -> Result<Option<u64>, ReplError>;
}

/// In-memory model index, the test and single-process source.
#[derive(Debug, Default)]
pub struct ModelIndex {
    ids: std::sync::RwLock<BTreeSet<u64>>,
}

impl ModelIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a unit exists.
    pub fn insert(&self, model_id: u64) {
        self.ids.write().unwrap().insert(model_id);
    }

    /// Record that a unit was deleted.
    pub fn remove(&self, model_id: u64) {
        self.ids.write().unwrap().remove(&model_id);
    }
}

#[async_trait]
impl ReconcileSource for ModelIndex {
    async fn ids_in_range(&self, start: u64, end: u64) -> Result<Vec<u64>, ReplError> {
        Ok(self.ids.read().unwrap().range(start..=end).copied().collect())
    }

    async fn max_id(&self) -> Result<Option<u64>, ReplError> {
        Ok(self.ids.read().unwrap().iter().next_back().copied())
    }
}

/// Outcome of one reconciliation range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Rows created for units missing a registry row.
    pub created: usize,
    /// Rows deleted for units gone from the primary.
    pub deleted: usize,
    /// Whether the cursor wrapped back to the start of the id space.
    pub wrapped: bool,
}

/// Sweeps the id space, repairing registry drift against a
/// [`ReconcileSource`].
pub struct BatchReconciler {
    registry: Arc<RegistryStore>,
    cursors: Arc<CursorStore>,
    source: Arc<dyn ReconcileSource>,
    kind: &'static str,
    range_size: u64,
}

impl BatchReconciler {
    /// Create a reconciler for one replicable kind.
    pub fn new(
        registry: Arc<RegistryStore>,
        cursors: Arc<CursorStore>,
        source: Arc<dyn ReconcileSource>,
        kind: &'static str,
        range_size: u64,
    ) -> Self {
        Self {
            registry,
            cursors,
            source,
            kind,
            range_size,
        }
    }

    fn cursor_name(&self) -> String {
        format!("reconcile:{}", self.kind)
    }

    /// Current cursor position.
    pub fn cursor(&self) -> u64 {
        self.cursors.get(&self.cursor_name())
    }

    /// Reconcile the next id range. Missing rows are created pending,
    /// orphaned rows are deleted.
    pub async fn run_one_range(&self) -> Result<ReconcileResult, ReplError> {
        let last = self.cursor();
        let start = last.saturating_add(1);
        let end = last.saturating_add(self.range_size);

        let source_ids: BTreeSet<u64> =
            self.source.ids_in_range(start, end).await?.into_iter().collect();
        let registry_ids: BTreeSet<u64> =
            self.registry.ids_in_range(start, end).await.into_iter().collect();

        let mut created = 0;
        for id in source_ids.difference(&registry_ids) {
            if self.registry.insert_if_absent(*id).await {
                created += 1;
            }
        }

        let mut deleted = 0;
        for id in registry_ids.difference(&source_ids) {
            if self.registry.remove(*id).await {
                deleted += 1;
            }
        }

        // Past the highest known unit there is nothing left to compare;
        // wrap and start the next sweep.
        let source_max = self.source.max_id().await?;
        let wrapped = match source_max {
            Some(max) => end >= max,
            None => true,
        };
        if wrapped {
            self.cursors.reset(&self.cursor_name());
        } else {
            self.cursors.advance(&self.cursor_name(), end);
        }

        if created > 0 || deleted > 0 {
            info!(
                kind = self.kind,
                start, end, created, deleted, "reconciled registry range"
            );
        } else {
            debug!(kind = self.kind, start, end, "registry range already consistent");
        }
        Ok(ReconcileResult {
            created,
            deleted,
            wrapped,
        })
    }
}
