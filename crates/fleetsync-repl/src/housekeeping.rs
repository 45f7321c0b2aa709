//! Post-sync housekeeping (garbage collection and similar).
//!
//! Housekeeping runs under its own lease, independent from the sync lease.
//! Non-acquisition is an expected skip — some other worker is already on
//! it — and a failed housekeeping run never fails the sync that triggered
//! it.

use std::sync::Arc;

use tracing::{debug, warn};

use fleetsync_registry::lease::{try_with_lease, LeaseBackend};

use crate::replicable::ReplicableContent;

/// Runs best-effort housekeeping for freshly synced units.
pub struct Housekeeper {
    leases: Arc<dyn LeaseBackend>,
    lease_ttl_us: u64,
}

impl Housekeeper {
    /// Create a housekeeper using the given lease backend and ttl.
    pub fn new(leases: Arc<dyn LeaseBackend>, lease_ttl_us: u64) -> Self {
        Self {
            leases,
            lease_ttl_us,
        }
    }

    /// Attempt housekeeping for a unit. Returns true if it ran (regardless
    /// of whether the housekeeping itself succeeded), false if the lease
    /// was taken.
    pub async fn run_for<C>(&self, content: &C, model_id: u64) -> bool
    where
        C: ReplicableContent + ?Sized,
    {
        let kind = content.kind();
        let key = format!("housekeeping:{kind}:{model_id}");
        let ran = try_with_lease(&*self.leases, &key, self.lease_ttl_us, || async {
            if let Err(e) = content.run_housekeeping(model_id).await {
                warn!(kind, model_id, error = %e, "housekeeping failed");
            }
        })
        .await;

        match ran {
            Some(()) => true,
            None => {
                debug!(kind, model_id, "housekeeping lease taken, skipping");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use fleetsync_registry::lease::{current_time_us, LeaseStore};

    use crate::error::ReplError;

    #[derive(Default)]
    struct CountingContent {
        runs: AtomicU32,
    }

    #[async_trait]
    impl ReplicableContent for CountingContent {
        fn kind(&self) -> &'static str {
            "repository"
        }
        fn canonical_path(&self, _id: u64) -> PathBuf {
            PathBuf::new()
        }
        fn temp_path(&self, _id: u64) -> PathBuf {
            PathBuf::new()
        }
        fn exists_locally(&self, _id: u64) -> bool {
            false
        }
        async fn fetch(&self, _id: u64, _t: &Path, _f: bool) -> Result<(), ReplError> {
            Ok(())
        }
        async fn clone_fresh(&self, _id: u64, _t: &Path) -> Result<(), ReplError> {
            Ok(())
        }
        async fn create_from_snapshot(&self, _id: u64, _t: &Path) -> Result<(), ReplError> {
            Ok(())
        }
        async fn checksum(&self, _id: u64) -> Result<String, ReplError> {
            Ok(String::new())
        }
        async fn expire_caches(&self, _id: u64) {}
        async fn run_housekeeping(&self, _id: u64) -> Result<(), ReplError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Err(ReplError::Transport {
                msg: "gc hiccup".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_housekeeping_failure_is_non_fatal() {
        let leases: Arc<dyn LeaseBackend> = Arc::new(LeaseStore::new());
        let keeper = Housekeeper::new(leases, 1_000_000);
        let content = CountingContent::default();

        assert!(keeper.run_for(&content, 1).await);
        assert_eq!(content.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_held_lease_skips_housekeeping() {
        let store = Arc::new(LeaseStore::new());
        store
            .try_acquire("housekeeping:repository:1", 60_000_000, current_time_us())
            .await
            .unwrap();

        let keeper = Housekeeper::new(store.clone() as Arc<dyn LeaseBackend>, 1_000_000);
        let content = CountingContent::default();

        assert!(!keeper.run_for(&content, 1).await);
        assert_eq!(content.runs.load(Ordering::SeqCst), 0);
    }
}
