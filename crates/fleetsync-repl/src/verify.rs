//! Checksum verification engine.
//!
//! After a unit reaches `Synced`, verification computes a content checksum
//! and compares it against the primary's. The primary checksum is fetched
//! fresh per attempt so a cached value can never produce a false mismatch.
//!
//! A mismatch, or a local checksum that cannot be computed at all, is
//! treated as corrupt local content: the same atomic write that records the
//! verification failure also flips the sync state back to `Pending`, so the
//! unit resyncs before verification runs again. Leaving those two writes
//! separate would open a window where a crashed worker strands a bad unit
//! in `Synced`.
//!
//! Batch selection marks rows `Started` under the store's write lock, so
//! concurrent verification workers always claim disjoint batches. Rows
//! stranded in `Started` by a dead worker are swept back to `Failed` once
//! the verification timeout passes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use fleetsync_registry::error::RegistryError;
use fleetsync_registry::lease::{current_time_us, try_with_lease, LeaseBackend};
use fleetsync_registry::state::{SyncState, VerificationState};
use fleetsync_registry::store::RegistryStore;

use crate::backoff::next_retry_time_us;
use crate::config::ReplConfig;
use crate::error::ReplError;
use crate::replicable::{PrimaryChecksums, ReplicableContent};

/// Result of one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Local checksum matched the primary's.
    Verified,
    /// Local checksum disagreed with the primary's; a resync was scheduled.
    Mismatch,
    /// Checksum computation or the primary lookup failed; retry scheduled.
    Failed,
    /// Nothing to do: lease held elsewhere, unit not synced, or the primary
    /// has no checksum yet.
    Skipped,
}

/// Serves the primary's checksums straight from its own registry store.
pub struct RegistryChecksums {
    primary: Arc<RegistryStore>,
}

impl RegistryChecksums {
    /// Wrap the primary node's registry store.
    pub fn new(primary: Arc<RegistryStore>) -> Self {
        Self { primary }
    }
}

#[async_trait::async_trait]
impl PrimaryChecksums for RegistryChecksums {
    async fn checksum_for(&self, _kind: &str, model_id: u64) -> Result<Option<String>, ReplError> {
        let row = self.primary.get(model_id).await;
        Ok(row.and_then(|r| {
            if r.verification_state == VerificationState::Succeeded {
                r.verification_checksum
            } else {
                None
            }
        }))
    }
}

/// Verifies synced units against the primary's checksums.
pub struct VerificationEngine<C: ReplicableContent> {
    config: ReplConfig,
    registry: Arc<RegistryStore>,
    leases: Arc<dyn LeaseBackend>,
    content: Arc<C>,
    primary: Arc<dyn PrimaryChecksums>,
}

impl<C: ReplicableContent> VerificationEngine<C> {
    /// Create an engine with explicit collaborators.
    pub fn new(
        config: ReplConfig,
        registry: Arc<RegistryStore>,
        leases: Arc<dyn LeaseBackend>,
        content: Arc<C>,
        primary: Arc<dyn PrimaryChecksums>,
    ) -> Self {
        Self {
            config,
            registry,
            leases,
            content,
            primary,
        }
    }

    fn lease_key(&self, model_id: u64) -> String {
        format!("verify:{}:{}", self.content.kind(), model_id)
    }

    /// Verify one unit against the primary's checksum, under the unit's
    /// verification lease.
    pub async fn verify(&self, model_id: u64) -> VerifyOutcome {
        let key = self.lease_key(model_id);
        let outcome = try_with_lease(&*self.leases, &key, self.config.lease_ttl_us, || {
            self.verify_under_lease(model_id)
        })
        .await;
        match outcome {
            Some(outcome) => outcome,
            None => {
                debug!(key, "verification lease held elsewhere, skipping");
                VerifyOutcome::Skipped
            }
        }
    }

    /// Primary-side verification: compute and record the unit's checksum.
    /// There is nothing to compare against; the recorded value is what
    /// secondaries verify themselves against.
    pub async fn verify_as_primary(&self, model_id: u64) -> VerifyOutcome {
        let key = self.lease_key(model_id);
        let outcome = try_with_lease(&*self.leases, &key, self.config.lease_ttl_us, || async {
            self.registry.get_or_create(model_id).await;
            self.mark_started(model_id).await;
            match self.content.checksum(model_id).await {
                Ok(sum) => match self.record_success(model_id, None, &sum).await {
                    Ok(()) => VerifyOutcome::Verified,
                    Err(e) => {
                        warn!(model_id, error = %e, "could not record primary checksum");
                        VerifyOutcome::Failed
                    }
                },
                Err(e) => {
                    self.fail_verification(model_id, &format!("checksum failed: {e}"))
                        .await;
                    VerifyOutcome::Failed
                }
            }
        })
        .await;
        outcome.unwrap_or(VerifyOutcome::Skipped)
    }

    async fn verify_under_lease(&self, model_id: u64) -> VerifyOutcome {
        let kind = self.content.kind();
        match self.registry.get(model_id).await {
            Some(record) if record.state == SyncState::Synced => {}
            Some(record) => {
                debug!(kind, model_id, state = %record.state, "unit not synced, skipping verification");
                return VerifyOutcome::Skipped;
            }
            None => {
                debug!(kind, model_id, "no registry row, skipping verification");
                return VerifyOutcome::Skipped;
            }
        }

        let started_version = match self.mark_started(model_id).await {
            Some(version) => version,
            None => return VerifyOutcome::Skipped,
        };

        let primary_sum = match self.primary.checksum_for(kind, model_id).await {
            Ok(Some(sum)) => sum,
            Ok(None) => {
                // The primary has not verified this unit yet. Back to
                // pending; a later pass will pick it up again.
                debug!(kind, model_id, "primary checksum not yet available");
                self.revert_to_pending(model_id).await;
                return VerifyOutcome::Skipped;
            }
            Err(e) => {
                self.fail_verification(model_id, &format!("primary checksum lookup failed: {e}"))
                    .await;
                return VerifyOutcome::Failed;
            }
        };

        let local_sum = match self.content.checksum(model_id).await {
            Ok(sum) => sum,
            Err(e) => {
                // Unreadable content is as suspect as mismatched content.
                self.fail_and_resync(model_id, &format!("checksum failed: {e}"), None)
                    .await;
                return VerifyOutcome::Failed;
            }
        };

        if local_sum == primary_sum {
            match self
                .record_success(model_id, Some(started_version), &local_sum)
                .await
            {
                Ok(()) => {
                    info!(kind, model_id, "verification succeeded");
                    VerifyOutcome::Verified
                }
                Err(RegistryError::Conflict { .. }) => {
                    // The row changed under us (e.g. an update event queued a
                    // resync). The new sync will re-pend verification.
                    debug!(kind, model_id, "row changed during verification");
                    VerifyOutcome::Skipped
                }
                Err(e) => {
                    warn!(kind, model_id, error = %e, "could not record verification success");
                    VerifyOutcome::Failed
                }
            }
        } else {
            let err = ReplError::ChecksumMismatch {
                primary: primary_sum,
                local: local_sum.clone(),
            };
            self.fail_and_resync(model_id, &err.to_string(), Some(&local_sum))
                .await;
            VerifyOutcome::Mismatch
        }
    }

    async fn mark_started(&self, model_id: u64) -> Option<u64> {
        let now = current_time_us();
        match self
            .registry
            .update(model_id, |r| {
                r.verification_state = VerificationState::Started;
                r.verification_started_at_us = Some(now);
            })
            .await
        {
            Ok(record) => Some(record.version),
            Err(e) => {
                warn!(model_id, error = %e, "could not mark verification started");
                None
            }
        }
    }

    async fn revert_to_pending(&self, model_id: u64) {
        let result = self
            .registry
            .update(model_id, |r| {
                r.verification_state = VerificationState::Pending;
                r.verification_started_at_us = None;
            })
            .await;
        if let Err(e) = result {
            warn!(model_id, error = %e, "could not revert verification to pending");
        }
    }

    /// Success clears the verification retry state and the sync retry state
    /// in one write: a verified unit is known good, so stale sync failure
    /// bookkeeping must not force a needless redownload later.
    async fn record_success(
        &self,
        model_id: u64,
        expected_version: Option<u64>,
        checksum: &str,
    ) -> Result<(), RegistryError> {
        let now = current_time_us();
        let apply = |r: &mut fleetsync_registry::state::RegistryRecord| {
            r.verification_state = VerificationState::Succeeded;
            r.verification_checksum = Some(checksum.to_string());
            r.verified_at_us = Some(now);
            r.verification_started_at_us = None;
            r.verification_failure = None;
            r.checksum_mismatch = false;
            r.mismatched_checksum = None;
            r.verification_retry_count = 0;
            r.verification_retry_at_us = None;
            r.retry_count = 0;
            r.retry_at_us = None;
        };
        match expected_version {
            Some(version) => self
                .registry
                .update_if_version(model_id, version, apply)
                .await
                .map(|_| ()),
            None => self.registry.update(model_id, apply).await.map(|_| ()),
        }
    }

    /// Failure write that leaves the sync state alone. Used for the primary
    /// role and for primary checksum lookup errors, neither of which says
    /// anything about the local content.
    async fn fail_verification(&self, model_id: u64, msg: &str) {
        let now = current_time_us();
        let cap = self.config.backoff_cap_us;
        let result = self
            .registry
            .update(model_id, |r| {
                r.verification_state = VerificationState::Failed;
                r.verification_failure = Some(msg.to_string());
                r.verification_checksum = None;
                r.verification_started_at_us = None;
                r.verified_at_us = Some(now);
                r.verification_retry_count += 1;
                r.verification_retry_at_us =
                    Some(next_retry_time_us(now, r.verification_retry_count, cap));
            })
            .await;
        match result {
            Ok(record) => warn!(
                model_id,
                retry_count = record.verification_retry_count,
                msg,
                "verification failed"
            ),
            Err(e) => warn!(model_id, error = %e, "failed to record verification failure"),
        }
    }

    /// Secondary-side failure write: one atomic update records the failure
    /// and flips the unit back to sync-pending, so the resync is scheduled
    /// even if this worker dies immediately after. Content that mismatched
    /// or could not be read must be fetched again before the next attempt.
    async fn fail_and_resync(&self, model_id: u64, msg: &str, mismatched: Option<&str>) {
        let now = current_time_us();
        let cap = self.config.backoff_cap_us;
        let result = self
            .registry
            .update(model_id, |r| {
                r.verification_state = VerificationState::Failed;
                r.verification_failure = Some(msg.to_string());
                r.verification_checksum = None;
                r.verification_started_at_us = None;
                r.verified_at_us = Some(now);
                if let Some(local) = mismatched {
                    r.checksum_mismatch = true;
                    r.mismatched_checksum = Some(local.to_string());
                }
                r.verification_retry_count += 1;
                r.verification_retry_at_us =
                    Some(next_retry_time_us(now, r.verification_retry_count, cap));
                r.state = SyncState::Pending;
                r.retry_count += 1;
                r.retry_at_us = Some(next_retry_time_us(now, r.retry_count, cap));
            })
            .await;
        match result {
            Ok(_) => warn!(model_id, msg, "verification failed, resync scheduled"),
            Err(e) => warn!(model_id, error = %e, "failed to record verification failure"),
        }
    }

    /// Claim a batch of units needing a first verification, ordered so units
    /// never verified come before units with the oldest completed
    /// verification. Claimed rows are marked `Started` atomically.
    pub async fn verification_pending_batch(&self, limit: usize) -> Vec<u64> {
        let now = current_time_us();
        self.registry
            .select_update(
                |r| {
                    r.state == SyncState::Synced
                        && r.verification_state == VerificationState::Pending
                },
                |r| r.verified_at_us.unwrap_or(0),
                limit,
                |r| {
                    r.verification_state = VerificationState::Started;
                    r.verification_started_at_us = Some(now);
                },
            )
            .await
    }

    /// Claim a batch of failed verifications whose backoff has elapsed,
    /// oldest retry deadline first.
    pub async fn verification_failed_batch(&self, limit: usize) -> Vec<u64> {
        let now = current_time_us();
        self.registry
            .select_update(
                |r| {
                    r.state == SyncState::Synced
                        && r.verification_state == VerificationState::Failed
                        && r.verification_retry_due(now)
                },
                |r| r.verification_retry_at_us.unwrap_or(0),
                limit,
                |r| {
                    r.verification_state = VerificationState::Started;
                    r.verification_started_at_us = Some(now);
                },
            )
            .await
    }

    /// One scheduler tick's worth of work: pending units first, the
    /// remainder of the batch filled with retry-due failures.
    pub async fn batch_to_verify(&self) -> Vec<u64> {
        let size = self.config.verification_batch_size;
        let mut batch = self.verification_pending_batch(size).await;
        if batch.len() < size {
            let failed = self.verification_failed_batch(size - batch.len()).await;
            batch.extend(failed);
        }
        batch
    }

    /// How many batches of verification work remain, capped at `max` so the
    /// scheduler never pays for a full-table count.
    pub async fn remaining_verification_batch_count(&self, max: usize) -> usize {
        let size = self.config.verification_batch_size;
        let now = current_time_us();
        let count = self
            .registry
            .count_where(
                |r| {
                    r.state == SyncState::Synced
                        && match r.verification_state {
                            VerificationState::Pending => true,
                            VerificationState::Failed => r.verification_retry_due(now),
                            _ => false,
                        }
                },
                max.saturating_mul(size),
            )
            .await;
        count.div_ceil(size)
    }

    /// Sweep rows stuck in `Started` past the verification timeout back to
    /// `Failed`. Returns how many rows were swept.
    pub async fn fail_verification_timeouts(&self) -> usize {
        let now = current_time_us();
        let deadline = now.saturating_sub(self.config.verification_timeout_us);
        let cap = self.config.backoff_cap_us;
        let swept = self
            .registry
            .select_update(
                |r| {
                    r.verification_state == VerificationState::Started
                        && r.verification_started_at_us.is_some_and(|at| at < deadline)
                },
                |r| r.model_id,
                usize::MAX,
                |r| {
                    r.verification_state = VerificationState::Failed;
                    r.verification_failure = Some("verification timed out".to_string());
                    r.verification_started_at_us = None;
                    // A timeout says nothing about the content, so the retry
                    // count restarts rather than compounding.
                    r.verification_retry_count = 1;
                    r.verification_retry_at_us = Some(next_retry_time_us(now, 1, cap));
                },
            )
            .await;
        if !swept.is_empty() {
            warn!(count = swept.len(), "swept timed out verifications");
        }
        swept.len()
    }

    /// Re-pend a batch of verified units whose checksums are older than the
    /// reverification interval, oldest first. Catches silent corruption that
    /// happened after the last verification.
    pub async fn reverify_batch(&self) -> Vec<u64> {
        let now = current_time_us();
        let cutoff = now.saturating_sub(self.config.reverification_interval_us);
        let ids = self
            .registry
            .select_update(
                |r| {
                    r.verification_state == VerificationState::Succeeded
                        && r.verified_at_us.is_some_and(|at| at < cutoff)
                },
                |r| r.verified_at_us.unwrap_or(0),
                self.config.reverification_batch_size,
                |r| {
                    r.verification_state = VerificationState::Pending;
                },
            )
            .await;
        if !ids.is_empty() {
            info!(count = ids.len(), "queued units for reverification");
        }
        ids
    }
}
