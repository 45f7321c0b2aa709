//! Batch cursors: last-processed-ID bookkeeping for resumable sweeps.
//!
//! Each logical batch stream (e.g. "bulk_mark_pending:repository") keeps a
//! cursor recording the highest primary key it has processed. Cursors never
//! regress, and consumers must tolerate re-processing a row the cursor has
//! already advanced past, so only idempotent operations may be driven by a
//! cursor.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// A stream-name → last-processed-ID entry, as persisted in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorEntry {
    /// Logical stream name.
    pub key: String,
    /// Last primary key processed by the stream.
    pub last_id: u64,
}

/// Durable (in-memory, snapshot-persisted) store of batch cursors.
#[derive(Debug, Default)]
pub struct CursorStore {
    cursors: RwLock<HashMap<String, u64>>,
}

impl CursorStore {
    /// Create an empty cursor store.
    pub fn new() -> Self {
        Self {
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Current cursor for a stream. Unknown streams start at 0.
    pub fn get(&self, key: &str) -> u64 {
        self.cursors.read().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Advance the cursor for a stream to `id`, never backwards.
    /// Returns the stored value after the advance.
    pub fn advance(&self, key: &str, id: u64) -> u64 {
        let mut cursors = self.cursors.write().unwrap();
        let entry = cursors.entry(key.to_string()).or_insert(0);
        if id > *entry {
            *entry = id;
        }
        *entry
    }

    /// Reset a stream's cursor to 0 (used when a new sweep campaign starts).
    pub fn reset(&self, key: &str) {
        self.cursors.write().unwrap().remove(key);
    }

    /// All cursor entries, sorted by stream name.
    pub fn entries(&self) -> Vec<CursorEntry> {
        let mut entries: Vec<CursorEntry> = self
            .cursors
            .read()
            .unwrap()
            .iter()
            .map(|(key, &last_id)| CursorEntry {
                key: key.clone(),
                last_id,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Serialize all cursors to bincode bytes (for persistence).
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, RegistryError> {
        Ok(bincode::serialize(&self.entries())?)
    }

    /// Rebuild a cursor store from snapshot bytes.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, RegistryError> {
        let entries: Vec<CursorEntry> = bincode::deserialize(bytes)?;
        let cursors = entries.into_iter().map(|e| (e.key, e.last_id)).collect();
        Ok(Self {
            cursors: RwLock::new(cursors),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    mod advance {
        use super::*;

        #[test]
        fn test_unknown_stream_starts_at_zero() {
            let store = CursorStore::new();
            assert_eq!(store.get("bulk_mark_pending:repository"), 0);
        }

        #[test]
        fn test_advance_moves_forward() {
            let store = CursorStore::new();
            assert_eq!(store.advance("s", 100), 100);
            assert_eq!(store.get("s"), 100);
        }

        #[test]
        fn test_advance_never_regresses() {
            let store = CursorStore::new();
            store.advance("s", 100);
            assert_eq!(store.advance("s", 50), 100);
            assert_eq!(store.get("s"), 100);
        }

        #[test]
        fn test_streams_are_independent() {
            let store = CursorStore::new();
            store.advance("a", 10);
            store.advance("b", 20);
            assert_eq!(store.get("a"), 10);
            assert_eq!(store.get("b"), 20);
        }

        #[test]
        fn test_reset_restarts_stream() {
            let store = CursorStore::new();
            store.advance("s", 100);
            store.reset("s");
            assert_eq!(store.get("s"), 0);
        }
    }

    mod snapshots {
        use super::*;

        #[test]
        fn test_snapshot_round_trip() {
            let store = CursorStore::new();
            store.advance("a", 7);
            store.advance("b", 99);
            let bytes = store.snapshot_bytes().unwrap();
            let restored = CursorStore::from_snapshot(&bytes).unwrap();
            assert_eq!(restored.get("a"), 7);
            assert_eq!(restored.get("b"), 99);
        }
    }

    proptest! {
        #[test]
        fn prop_cursor_is_monotonic(advances in proptest::collection::vec(0u64..10_000, 1..50)) {
            let store = CursorStore::new();
            let mut high_water = 0u64;
            for id in advances {
                let stored = store.advance("stream", id);
                prop_assert!(stored >= high_water, "cursor regressed: {stored} < {high_water}");
                high_water = stored;
            }
        }
    }
}
