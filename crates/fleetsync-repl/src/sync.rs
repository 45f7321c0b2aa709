//! Per-unit sync orchestration.
//!
//! Each invocation syncs one replicated unit under a fleet-wide lease:
//! `idle → (lease acquired) → started → {synced | failed}`. Collaborator
//! failures are converted into registry state and retry metadata here; the
//! external scheduler only ever sees a typed outcome.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use fleetsync_registry::error::RegistryError;
use fleetsync_registry::lease::{current_time_us, LeaseBackend, LeaseToken};
use fleetsync_registry::state::{SyncState, VerificationState};
use fleetsync_registry::store::RegistryStore;

use crate::backoff::next_retry_time_us;
use crate::config::ReplConfig;
use crate::content::swap_in_place;
use crate::error::ReplError;
use crate::housekeeping::Housekeeper;
use crate::replicable::{ReplicableContent, ResyncScheduler};

/// Transfer strategy chosen for one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// First-time sync into an empty canonical location.
    Clone,
    /// Incremental fetch into existing local content.
    Fetch,
    /// Full rebuild: build into a temp location, then atomic swap.
    Redownload,
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStrategy::Clone => write!(f, "clone"),
            SyncStrategy::Fetch => write!(f, "fetch"),
            SyncStrategy::Redownload => write!(f, "redownload"),
        }
    }
}

/// Result of a sync attempt, surfaced to the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Content transferred and the registry row marked synced.
    Synced,
    /// The primary has no such unit; the secondary is correctly empty.
    MissingOnPrimary,
    /// The attempt failed; a retry is scheduled via backoff.
    Failed,
    /// Another worker holds the lease. Not a failure.
    Skipped,
}

/// Orchestrates sync attempts for one replicable kind.
pub struct SyncOrchestrator<C: ReplicableContent> {
    config: ReplConfig,
    registry: Arc<RegistryStore>,
    leases: Arc<dyn LeaseBackend>,
    content: Arc<C>,
    scheduler: Arc<dyn ResyncScheduler>,
    housekeeper: Housekeeper,
}

impl<C: ReplicableContent> SyncOrchestrator<C> {
    /// Create an orchestrator with explicit collaborators. No ambient state.
    pub fn new(
        config: ReplConfig,
        registry: Arc<RegistryStore>,
        leases: Arc<dyn LeaseBackend>,
        content: Arc<C>,
        scheduler: Arc<dyn ResyncScheduler>,
    ) -> Self {
        let housekeeper = Housekeeper::new(leases.clone(), config.lease_ttl_us);
        Self {
            config,
            registry,
            leases,
            content,
            scheduler,
            housekeeper,
        }
    }

    fn lease_key(&self, model_id: u64) -> String {
        format!("sync:{}:{}", self.content.kind(), model_id)
    }

    /// Sync one unit. Acquires the unit's lease, runs the transfer, updates
    /// the registry, and releases the lease. Never returns an error: every
    /// collaborator failure lands in the registry row instead.
    pub async fn execute(&self, model_id: u64) -> SyncOutcome {
        let key = self.lease_key(model_id);
        let token = match self.acquire_lease(&key).await {
            Ok(token) => token,
            Err(e) => {
                debug!(key, error = %e, "skipping sync");
                return SyncOutcome::Skipped;
            }
        };

        let (outcome, reschedule) = self.run_sync(model_id).await;

        if let Err(e) = self.leases.release(&token).await {
            warn!(key, error = %e, "failed to release sync lease, will expire by ttl");
        }

        // Rescheduling while holding the lease would leave the new job
        // unable to acquire it.
        if reschedule {
            self.scheduler.schedule(self.content.kind(), model_id);
        }

        outcome
    }

    /// Held and unavailable both surface as [`ReplError::LeaseUnavailable`]:
    /// either way this worker must not run.
    async fn acquire_lease(&self, key: &str) -> Result<LeaseToken, ReplError> {
        match self
            .leases
            .try_acquire(key, self.config.lease_ttl_us, current_time_us())
            .await
        {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(ReplError::LeaseUnavailable),
            Err(e) => {
                warn!(key, error = %e, "lease backend unavailable");
                Err(ReplError::LeaseUnavailable)
            }
        }
    }

    async fn run_sync(&self, model_id: u64) -> (SyncOutcome, bool) {
        let kind = self.content.kind();
        let (_, created) = self.registry.get_or_create(model_id).await;
        let started = match self
            .registry
            .update(model_id, |r| r.state = SyncState::Started)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(kind, model_id, error = %e, "could not mark sync started");
                return (SyncOutcome::Failed, false);
            }
        };

        let strategy = if started.should_be_redownloaded(self.config.redownload_retry_threshold) {
            SyncStrategy::Redownload
        } else if self.content.exists_locally(model_id) {
            SyncStrategy::Fetch
        } else {
            SyncStrategy::Clone
        };
        info!(
            node = %self.config.node_name,
            kind,
            model_id,
            %strategy,
            retry_count = started.retry_count,
            "sync attempt"
        );

        match self.transfer(model_id, strategy).await {
            Ok(()) => match self.mark_synced(model_id, started.version, false).await {
                Ok(()) => {
                    if created || strategy == SyncStrategy::Clone {
                        self.housekeeper.run_for(&*self.content, model_id).await;
                    }
                    (SyncOutcome::Synced, false)
                }
                Err(ReplError::Stale) => {
                    debug!(kind, model_id, "row changed during sync, rescheduling");
                    (SyncOutcome::Synced, true)
                }
                Err(e) => {
                    warn!(kind, model_id, error = %e, "could not mark sync successful");
                    (SyncOutcome::Failed, false)
                }
            },
            Err(ReplError::AbsentOnPrimary) => {
                match self.mark_synced(model_id, started.version, true).await {
                    Ok(()) => (SyncOutcome::MissingOnPrimary, false),
                    Err(ReplError::Stale) => (SyncOutcome::MissingOnPrimary, true),
                    Err(e) => {
                        warn!(kind, model_id, error = %e, "could not mark unit missing on primary");
                        (SyncOutcome::Failed, false)
                    }
                }
            }
            Err(ReplError::ContentCorrupt { msg }) => {
                self.fail_sync(model_id, &format!("invalid local content: {msg}"), true)
                    .await;
                // Stale cached state must not mask the coming redownload.
                self.content.expire_caches(model_id).await;
                (SyncOutcome::Failed, false)
            }
            Err(e) => {
                self.fail_sync(model_id, &format!("error syncing {kind}: {e}"), false)
                    .await;
                (SyncOutcome::Failed, false)
            }
        }
    }

    async fn transfer(&self, model_id: u64, strategy: SyncStrategy) -> Result<(), ReplError> {
        let canonical = self.content.canonical_path(model_id);
        match strategy {
            SyncStrategy::Fetch => self.content.fetch(model_id, &canonical, true).await,
            SyncStrategy::Clone => {
                if self.config.clone_on_first_sync {
                    self.content.clone_fresh(model_id, &canonical).await
                } else {
                    self.content.fetch(model_id, &canonical, true).await
                }
            }
            SyncStrategy::Redownload => self.redownload(model_id, &canonical).await,
        }
    }

    /// Full rebuild: build a replacement in the temp location, then swap it
    /// into the canonical location. The canonical content is only touched by
    /// the atomic swap.
    async fn redownload(&self, model_id: u64, canonical: &Path) -> Result<(), ReplError> {
        let temp = self.content.temp_path(model_id);
        if temp.exists() {
            std::fs::remove_dir_all(&temp)?;
        }

        let built = self.build_replacement(model_id, &temp).await;
        let result = match built {
            Ok(()) => swap_in_place(canonical, &temp),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(cleanup) = std::fs::remove_dir_all(&temp) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(model_id, error = %cleanup, "failed to clean temp content");
                }
            }
        }
        result
    }

    async fn build_replacement(&self, model_id: u64, temp: &Path) -> Result<(), ReplError> {
        if self.config.snapshot_transfer_enabled && !self.content.in_object_pool(model_id) {
            self.content.create_from_snapshot(model_id, temp).await
        } else if self.config.clone_on_first_sync {
            self.content.clone_fresh(model_id, temp).await
        } else {
            self.content.fetch(model_id, temp, true).await
        }
    }

    /// Version-checked success write. [`ReplError::Stale`] means a newer
    /// update event for the unit arrived while the lease was held.
    async fn mark_synced(
        &self,
        model_id: u64,
        expected_version: u64,
        missing_on_primary: bool,
    ) -> Result<(), ReplError> {
        let now = current_time_us();
        self.registry
            .update_if_version(model_id, expected_version, |r| {
                r.state = SyncState::Synced;
                r.last_synced_at_us = Some(now);
                r.retry_count = 0;
                r.retry_at_us = None;
                r.last_sync_failure = None;
                r.force_to_redownload = false;
                r.missing_on_primary = missing_on_primary;
                r.verification_state = VerificationState::Pending;
            })
            .await
            .map(|_| ())
            .map_err(|e| match e {
                RegistryError::Conflict { .. } => ReplError::Stale,
                other => ReplError::Registry(other),
            })
    }

    async fn fail_sync(&self, model_id: u64, msg: &str, force_redownload: bool) {
        let now = current_time_us();
        let cap = self.config.backoff_cap_us;
        let result = self
            .registry
            .update(model_id, |r| {
                r.state = SyncState::Failed;
                r.retry_count += 1;
                r.retry_at_us = Some(next_retry_time_us(now, r.retry_count, cap));
                r.last_sync_failure = Some(msg.to_string());
                if force_redownload {
                    r.force_to_redownload = true;
                }
            })
            .await;
        match result {
            Ok(record) => warn!(
                model_id,
                retry_count = record.retry_count,
                msg,
                "sync failed"
            ),
            Err(e) => warn!(model_id, error = %e, "failed to record sync failure"),
        }
    }
}
