//! Registry row model: the per-unit sync and verification lifecycle.
//!
//! Every replicated unit (repository, wiki, container image, upload) tracked
//! on a secondary node has one `RegistryRecord`. The sync lifecycle and the
//! verification lifecycle are independent: a unit can be `Synced` while its
//! verification is still `Pending` or `Failed`.

use serde::{Deserialize, Serialize};

/// Sync lifecycle of a replicated unit on a secondary node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Unit needs a sync attempt.
    Pending,
    /// A sync attempt is in flight.
    Started,
    /// Local content matches the last successful sync.
    Synced,
    /// The last sync attempt failed; retry is scheduled via backoff.
    Failed,
}

/// Verification lifecycle, independent from the sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationState {
    /// Unit needs a verification attempt.
    Pending,
    /// A checksum computation is in flight.
    Started,
    /// The computed checksum matched the primary's.
    Succeeded,
    /// The checksum mismatched or computation failed; retry scheduled.
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Pending => write!(f, "pending"),
            SyncState::Started => write!(f, "started"),
            SyncState::Synced => write!(f, "synced"),
            SyncState::Failed => write!(f, "failed"),
        }
    }
}

impl std::fmt::Display for VerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationState::Pending => write!(f, "verification_pending"),
            VerificationState::Started => write!(f, "verification_started"),
            VerificationState::Succeeded => write!(f, "verification_succeeded"),
            VerificationState::Failed => write!(f, "verification_failed"),
        }
    }
}

/// One registry row: the secondary-node-local record of a replicated unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// Foreign reference to the replicated unit. Immutable after creation.
    pub model_id: u64,
    /// Sync lifecycle state.
    pub state: SyncState,
    /// Verification lifecycle state.
    pub verification_state: VerificationState,
    /// Consecutive failed sync attempts.
    pub retry_count: u32,
    /// Earliest time (microseconds since epoch) for the next sync attempt.
    pub retry_at_us: Option<u64>,
    /// Consecutive failed verification attempts, tracked separately.
    pub verification_retry_count: u32,
    /// Earliest time for the next verification attempt.
    pub verification_retry_at_us: Option<u64>,
    /// Last locally computed content checksum.
    pub verification_checksum: Option<String>,
    /// Whether the last computed checksum disagreed with the primary's.
    pub checksum_mismatch: bool,
    /// The local checksum value that mismatched, kept for diagnosis.
    pub mismatched_checksum: Option<String>,
    /// Message from the last sync failure.
    pub last_sync_failure: Option<String>,
    /// Message from the last verification failure.
    pub verification_failure: Option<String>,
    /// When the unit last reached `Synced` (microseconds since epoch).
    pub last_synced_at_us: Option<u64>,
    /// When verification last ran to completion.
    pub verified_at_us: Option<u64>,
    /// When the in-flight verification attempt started.
    pub verification_started_at_us: Option<u64>,
    /// Sticky flag forcing a full rebuild instead of an incremental fetch.
    pub force_to_redownload: bool,
    /// The primary reported the unit does not exist; the secondary is
    /// correctly empty. A terminal success, not an error.
    pub missing_on_primary: bool,
    /// Optimistic-concurrency token, bumped on every store write.
    pub version: u64,
}

impl RegistryRecord {
    /// Create a fresh row for a unit, pending both sync and verification.
    pub fn new(model_id: u64) -> Self {
        Self {
            model_id,
            state: SyncState::Pending,
            verification_state: VerificationState::Pending,
            retry_count: 0,
            retry_at_us: None,
            verification_retry_count: 0,
            verification_retry_at_us: None,
            verification_checksum: None,
            checksum_mismatch: false,
            mismatched_checksum: None,
            last_sync_failure: None,
            verification_failure: None,
            last_synced_at_us: None,
            verified_at_us: None,
            verification_started_at_us: None,
            force_to_redownload: false,
            missing_on_primary: false,
            version: 0,
        }
    }

    /// Whether the next sync attempt must be a full redownload.
    ///
    /// Redownload when the sticky flag is set, or when the retry count has
    /// passed `threshold` and is odd. The odd/even alternation keeps a
    /// persistently-broken unit from redownloading on every single attempt:
    /// odd counts redownload, even counts retry the incremental fetch.
    pub fn should_be_redownloaded(&self, threshold: u32) -> bool {
        self.force_to_redownload || (self.retry_count > threshold && self.retry_count % 2 == 1)
    }

    /// Whether the sync backoff window has elapsed.
    pub fn sync_retry_due(&self, now_us: u64) -> bool {
        self.retry_at_us.map_or(true, |at| at <= now_us)
    }

    /// Whether the verification backoff window has elapsed.
    pub fn verification_retry_due(&self, now_us: u64) -> bool {
        self.verification_retry_at_us.map_or(true, |at| at <= now_us)
    }

    /// Whether the unit is eligible for a sync attempt right now.
    pub fn needs_sync(&self, now_us: u64) -> bool {
        match self.state {
            SyncState::Pending => true,
            SyncState::Failed => self.sync_retry_due(now_us),
            SyncState::Started | SyncState::Synced => false,
        }
    }

    /// Whether the unit is eligible for a verification attempt right now.
    ///
    /// Verification never runs for a unit that is not `Synced`: a unit that
    /// failed sync must not be verified against stale or partial content.
    pub fn needs_verification(&self, now_us: u64) -> bool {
        if self.state != SyncState::Synced {
            return false;
        }
        match self.verification_state {
            VerificationState::Pending => true,
            VerificationState::Failed => self.verification_retry_due(now_us),
            VerificationState::Started | VerificationState::Succeeded => false,
        }
    }
}
