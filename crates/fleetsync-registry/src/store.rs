//! In-memory registry store with optimistic row versioning.
//!
//! The store is an in-memory (later: persisted) map of registry rows keyed
//! by `model_id`. Every mutation goes through a closure held under a single
//! write lock, so multi-field writes are atomic: either the whole update
//! lands or none of it does. A bincode snapshot provides persistence.
//!
//! Row versions implement optimistic concurrency: a caller that read a row
//! at version N can request a write conditional on the version still being
//! N, and gets `RegistryError::Conflict` if another writer got there first.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::RegistryError;
use crate::state::RegistryRecord;

/// Shared store of registry rows for one replicable kind.
#[derive(Debug, Default)]
pub struct RegistryStore {
    rows: RwLock<BTreeMap<u64, RegistryRecord>>,
}

impl RegistryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Fetch a copy of the row for a unit, if one exists.
    pub async fn get(&self, model_id: u64) -> Option<RegistryRecord> {
        self.rows.read().await.get(&model_id).cloned()
    }

    /// Fetch the row for a unit, creating a fresh pending row if absent.
    /// Returns the row and whether it was just created.
    pub async fn get_or_create(&self, model_id: u64) -> (RegistryRecord, bool) {
        let mut rows = self.rows.write().await;
        match rows.get(&model_id) {
            Some(record) => (record.clone(), false),
            None => {
                let record = RegistryRecord::new(model_id);
                rows.insert(model_id, record.clone());
                debug!(model_id, "created registry row");
                (record, true)
            }
        }
    }

    /// Insert a fresh pending row unless one already exists.
    /// Returns true if a row was inserted. Duplicate inserts are no-ops.
    pub async fn insert_if_absent(&self, model_id: u64) -> bool {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&model_id) {
            return false;
        }
        rows.insert(model_id, RegistryRecord::new(model_id));
        true
    }

    /// Delete the row for a unit. Returns true if a row existed.
    /// Double deletes are no-ops.
    pub async fn remove(&self, model_id: u64) -> bool {
        self.rows.write().await.remove(&model_id).is_some()
    }

    /// Number of rows in the store.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Whether the store has no rows.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Largest model_id present, if any.
    pub async fn max_id(&self) -> Option<u64> {
        self.rows.read().await.keys().next_back().copied()
    }

    /// IDs present in the inclusive range `[start, end]`, ascending.
    pub async fn ids_in_range(&self, start: u64, end: u64) -> Vec<u64> {
        self.rows.read().await.range(start..=end).map(|(id, _)| *id).collect()
    }

    /// Copies of rows with `after < model_id <= end`, ascending by id.
    pub async fn records_after(&self, after: u64, end: u64) -> Vec<RegistryRecord> {
        if after >= end {
            return Vec::new();
        }
        self.rows
            .read()
            .await
            .range(after + 1..=end)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Apply `f` to the row atomically and bump its version.
    pub async fn update<F>(&self, model_id: u64, f: F) -> Result<RegistryRecord, RegistryError>
    where
        F: FnOnce(&mut RegistryRecord),
    {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(&model_id)
            .ok_or(RegistryError::NotFound { model_id })?;
        f(record);
        record.version += 1;
        Ok(record.clone())
    }

    /// Apply `f` only if the row version is still `expected_version`.
    ///
    /// This is the optimistic write used for the final "synced" transition:
    /// if another writer touched the row while a sync was in flight, the
    /// caller gets `Conflict` and must reschedule rather than clobber.
    pub async fn update_if_version<F>(
        &self,
        model_id: u64,
        expected_version: u64,
        f: F,
    ) -> Result<RegistryRecord, RegistryError>
    where
        F: FnOnce(&mut RegistryRecord),
    {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(&model_id)
            .ok_or(RegistryError::NotFound { model_id })?;
        if record.version != expected_version {
            return Err(RegistryError::Conflict { model_id });
        }
        f(record);
        record.version += 1;
        Ok(record.clone())
    }

    /// Apply `f` to every listed row that exists. Returns rows touched.
    pub async fn update_many<F>(&self, model_ids: &[u64], f: F) -> usize
    where
        F: Fn(&mut RegistryRecord),
    {
        let mut rows = self.rows.write().await;
        let mut touched = 0;
        for id in model_ids {
            if let Some(record) = rows.get_mut(id) {
                f(record);
                record.version += 1;
                touched += 1;
            }
        }
        touched
    }

    /// Atomically select up to `limit` rows matching `pred`, ordered
    /// ascending by `sort_key`, apply `apply` to each, and return their IDs.
    ///
    /// Selection and mutation happen under one write lock, so concurrent
    /// callers get disjoint batches.
    pub async fn select_update<P, K, F>(
        &self,
        pred: P,
        sort_key: K,
        limit: usize,
        apply: F,
    ) -> Vec<u64>
    where
        P: Fn(&RegistryRecord) -> bool,
        K: Fn(&RegistryRecord) -> u64,
        F: Fn(&mut RegistryRecord),
    {
        let mut rows = self.rows.write().await;

        let mut matching: Vec<(u64, u64)> = rows
            .values()
            .filter(|r| pred(r))
            .map(|r| (sort_key(r), r.model_id))
            .collect();
        matching.sort_unstable();
        matching.truncate(limit);

        let ids: Vec<u64> = matching.into_iter().map(|(_, id)| id).collect();
        for id in &ids {
            if let Some(record) = rows.get_mut(id) {
                apply(record);
                record.version += 1;
            }
        }
        ids
    }

    /// Count rows matching `pred`, stopping at `cap`.
    ///
    /// The cap avoids full-table counts when callers only need "how many
    /// batches, up to N".
    pub async fn count_where<P>(&self, pred: P, cap: usize) -> usize
    where
        P: Fn(&RegistryRecord) -> bool,
    {
        self.rows
            .read()
            .await
            .values()
            .filter(|r| pred(r))
            .take(cap)
            .count()
    }

    /// Serialize all rows to bincode bytes (for persistence).
    pub async fn snapshot_bytes(&self) -> Result<Vec<u8>, RegistryError> {
        let rows = self.rows.read().await;
        let records: Vec<&RegistryRecord> = rows.values().collect();
        Ok(bincode::serialize(&records)?)
    }

    /// Rebuild a store from snapshot bytes.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, RegistryError> {
        let records: Vec<RegistryRecord> = bincode::deserialize(bytes)?;
        let rows = records.into_iter().map(|r| (r.model_id, r)).collect();
        Ok(Self {
            rows: RwLock::new(rows),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SyncState, VerificationState};

    mod basic_ops {
        use super::*;

        #[tokio::test]
        async fn test_get_or_create_is_lazy() {
            let store = RegistryStore::new();
            assert!(store.get(7).await.is_none());

            let (record, created) = store.get_or_create(7).await;
            assert!(created);
            assert_eq!(record.model_id, 7);
            assert_eq!(record.state, SyncState::Pending);

            let (_, created_again) = store.get_or_create(7).await;
            assert!(!created_again);
            assert_eq!(store.len().await, 1);
        }

        #[tokio::test]
        async fn test_insert_if_absent_is_idempotent() {
            let store = RegistryStore::new();
            assert!(store.insert_if_absent(1).await);
            assert!(!store.insert_if_absent(1).await);
        }

        #[tokio::test]
        async fn test_remove_is_idempotent() {
            let store = RegistryStore::new();
            store.insert_if_absent(1).await;
            assert!(store.remove(1).await);
            assert!(!store.remove(1).await);
        }

        #[tokio::test]
        async fn test_records_after_excludes_lower_bound() {
            let store = RegistryStore::new();
            for id in [5, 10, 15, 20] {
                store.insert_if_absent(id).await;
            }
            let records = store.records_after(10, 20).await;
            let ids: Vec<u64> = records.iter().map(|r| r.model_id).collect();
            assert_eq!(ids, vec![15, 20]);
        }
    }

    mod versioning {
        use super::*;

        #[tokio::test]
        async fn test_update_bumps_version() {
            let store = RegistryStore::new();
            store.insert_if_absent(1).await;
            let updated = store
                .update(1, |r| r.state = SyncState::Started)
                .await
                .unwrap();
            assert_eq!(updated.version, 1);
            assert_eq!(updated.state, SyncState::Started);
        }

        #[tokio::test]
        async fn test_conditional_update_detects_stale_write() {
            let store = RegistryStore::new();
            store.insert_if_absent(1).await;
            let (record, _) = store.get_or_create(1).await;

            // Another writer sneaks in.
            store.update(1, |r| r.retry_count = 5).await.unwrap();

            let err = store
                .update_if_version(1, record.version, |r| r.state = SyncState::Synced)
                .await
                .unwrap_err();
            assert!(matches!(err, RegistryError::Conflict { model_id: 1 }));

            // The stale writer did not clobber anything.
            let current = store.get(1).await.unwrap();
            assert_eq!(current.state, SyncState::Pending);
            assert_eq!(current.retry_count, 5);
        }

        #[tokio::test]
        async fn test_conditional_update_succeeds_when_unchanged() {
            let store = RegistryStore::new();
            store.insert_if_absent(1).await;
            let (record, _) = store.get_or_create(1).await;
            let updated = store
                .update_if_version(1, record.version, |r| r.state = SyncState::Synced)
                .await
                .unwrap();
            assert_eq!(updated.state, SyncState::Synced);
        }

        #[tokio::test]
        async fn test_update_missing_row_is_not_found() {
            let store = RegistryStore::new();
            let err = store.update(99, |_| {}).await.unwrap_err();
            assert!(matches!(err, RegistryError::NotFound { model_id: 99 }));
        }
    }

    mod batch_selection {
        use super::*;

        #[tokio::test]
        async fn test_select_update_orders_and_limits() {
            let store = RegistryStore::new();
            for id in 1..=5u64 {
                store.insert_if_absent(id).await;
                store
                    .update(id, |r| r.verified_at_us = Some(100 - id))
                    .await
                    .unwrap();
            }

            // Oldest verified first, two at a time.
            let ids = store
                .select_update(
                    |r| r.verification_state == VerificationState::Pending,
                    |r| r.verified_at_us.unwrap_or(0),
                    2,
                    |r| r.verification_state = VerificationState::Started,
                )
                .await;
            assert_eq!(ids, vec![5, 4]);

            let second = store
                .select_update(
                    |r| r.verification_state == VerificationState::Pending,
                    |r| r.verified_at_us.unwrap_or(0),
                    2,
                    |r| r.verification_state = VerificationState::Started,
                )
                .await;
            assert_eq!(second, vec![3, 2], "batches are disjoint");
        }

        #[tokio::test]
        async fn test_count_where_respects_cap() {
            let store = RegistryStore::new();
            for id in 1..=10u64 {
                store.insert_if_absent(id).await;
            }
            assert_eq!(store.count_where(|_| true, 4).await, 4);
            assert_eq!(store.count_where(|_| true, 100).await, 10);
        }
    }

    mod snapshots {
        use super::*;

        #[tokio::test]
        async fn test_snapshot_round_trip() {
            let store = RegistryStore::new();
            store.insert_if_absent(1).await;
            store.insert_if_absent(2).await;
            store
                .update(2, |r| {
                    r.state = SyncState::Failed;
                    r.retry_count = 3;
                })
                .await
                .unwrap();

            let bytes = store.snapshot_bytes().await.unwrap();
            let restored = RegistryStore::from_snapshot(&bytes).unwrap();
            assert_eq!(restored.len().await, 2);
            let row = restored.get(2).await.unwrap();
            assert_eq!(row.retry_count, 3);
            assert_eq!(row.state, SyncState::Failed);
        }
    }
}
