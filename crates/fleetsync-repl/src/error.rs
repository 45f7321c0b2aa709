//! Error types for the replication engine.
//!
//! Collaborator failures are typed, not thrown through: the orchestrator
//! inspects these variants and converts them into registry state plus retry
//! metadata. Only genuinely unexpected errors reach the scheduler.

use fleetsync_registry::error::RegistryError;
use thiserror::Error;

/// Errors that can occur while syncing or verifying a replicated unit.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Transient transport failure (network fetch/clone). Retryable.
    #[error("transport error: {msg}")]
    Transport {
        /// Error message from the transport collaborator.
        msg: String,
    },

    /// The primary reports the unit does not exist. This is a terminal
    /// success, not a failure: the secondary is correctly empty.
    #[error("content absent on primary")]
    AbsentOnPrimary,

    /// Local content is structurally invalid; the next sync attempt must be
    /// a full redownload.
    #[error("local content corrupt: {msg}")]
    ContentCorrupt {
        /// Description of the corruption.
        msg: String,
    },

    /// Another worker holds the lease for this unit. A silent no-op.
    #[error("lease unavailable")]
    LeaseUnavailable,

    /// Local checksum disagreed with the primary's.
    #[error("checksum mismatch: primary {primary}, local {local}")]
    ChecksumMismatch {
        /// The primary node's checksum.
        primary: String,
        /// The locally computed checksum.
        local: String,
    },

    /// Checksum computation failed.
    #[error("checksum computation failed: {msg}")]
    ChecksumFailed {
        /// Description of the failure.
        msg: String,
    },

    /// An optimistic registry write lost; the caller must reschedule after
    /// releasing its lease.
    #[error("optimistic write lost")]
    Stale,

    /// Filesystem error during fetch, rebuild, or swap. Retryable.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Registry store error.
    #[error("registry error")]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let e = ReplError::ChecksumMismatch {
            primary: "abc123".into(),
            local: "def456".into(),
        };
        assert_eq!(e.to_string(), "checksum mismatch: primary abc123, local def456");
    }
}
