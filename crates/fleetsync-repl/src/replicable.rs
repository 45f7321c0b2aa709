//! Capability seams for replicated content.
//!
//! Each replicable kind (git repository, wiki, container image, upload)
//! implements [`ReplicableContent`]: the orchestrator and verification
//! engine are generic over it and never dispatch on kind strings. The
//! transport underneath (git fetch, object storage, HTTP) is opaque; only
//! its typed success/failure surface matters here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::error::ReplError;

/// Well-known checksum of absent content. A unit that is missing on both
/// primary and secondary verifies successfully against this value.
pub const ABSENT_CHECKSUM: &str = "0000000000000000000000000000000000000000";

/// Per-kind content capabilities: paths, transfer, checksum, housekeeping.
#[async_trait]
pub trait ReplicableContent: Send + Sync {
    /// Stable kind name ("repository", "wiki", "container", "upload").
    fn kind(&self) -> &'static str;

    /// Canonical on-disk location of the unit's content.
    fn canonical_path(&self, model_id: u64) -> PathBuf;

    /// Scratch location used while rebuilding the unit from scratch.
    fn temp_path(&self, model_id: u64) -> PathBuf;

    /// Whether local content exists for the unit.
    fn exists_locally(&self, model_id: u64) -> bool;

    /// Whether the unit shares a deduplication object pool. Pooled units
    /// must not be rebuilt via snapshot transfer.
    fn in_object_pool(&self, _model_id: u64) -> bool {
        false
    }

    /// Incremental fetch from the primary into `target`.
    async fn fetch(&self, model_id: u64, target: &Path, forced: bool) -> Result<(), ReplError>;

    /// First-time clone from the primary into `target`.
    async fn clone_fresh(&self, model_id: u64, target: &Path) -> Result<(), ReplError>;

    /// Rebuild into `target` via snapshot transfer.
    async fn create_from_snapshot(&self, model_id: u64, target: &Path) -> Result<(), ReplError>;

    /// Compute the content checksum. Absent content yields
    /// [`ABSENT_CHECKSUM`]; computation failures are typed distinctly from
    /// transport errors.
    async fn checksum(&self, model_id: u64) -> Result<String, ReplError>;

    /// Expire any cached metadata about the unit. Best effort.
    async fn expire_caches(&self, model_id: u64);

    /// Post-sync housekeeping (e.g. garbage collection for a brand-new
    /// unit). Runs under its own lease; failures are non-fatal.
    async fn run_housekeeping(&self, model_id: u64) -> Result<(), ReplError>;
}

/// Source of the primary node's checksums, fetched fresh per verification
/// so staleness cannot produce false mismatches.
#[async_trait]
pub trait PrimaryChecksums: Send + Sync {
    /// The primary's current checksum for a unit, or `None` if the primary
    /// has not verified it yet.
    async fn checksum_for(&self, kind: &str, model_id: u64) -> Result<Option<String>, ReplError>;
}

/// Sink for "sync this unit again" requests, fed back to the external
/// scheduler. Used when an optimistic write loses: the reschedule happens
/// after the lease is released so the new job can acquire it.
pub trait ResyncScheduler: Send + Sync {
    /// Request an immediate resync of the unit.
    fn schedule(&self, kind: &str, model_id: u64);
}

/// Channel-backed scheduler: pushes (kind, model_id) pairs to a queue
/// consumer.
pub struct ChannelScheduler {
    tx: mpsc::UnboundedSender<(String, u64)>,
}

impl ChannelScheduler {
    /// Create a scheduler and the receiving end of its queue.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResyncScheduler for ChannelScheduler {
    fn schedule(&self, kind: &str, model_id: u64) {
        // A dropped receiver just means the scheduler is shutting down.
        let _ = self.tx.send((kind.to_string(), model_id));
    }
}

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_absent_checksum_is_forty_zeroes() {
        assert_eq!(ABSENT_CHECKSUM.len(), 40);
        assert!(ABSENT_CHECKSUM.chars().all(|c| c == '0'));
    }

    #[tokio::test]
    async fn test_channel_scheduler_delivers() {
        let (scheduler, mut rx) = ChannelScheduler::new();
        scheduler.schedule("repository", 42);
        assert_eq!(rx.recv().await, Some(("repository".to_string(), 42)));
    }

    #[test]
    fn test_channel_scheduler_tolerates_dropped_receiver() {
        let (scheduler, rx) = ChannelScheduler::new();
        drop(rx);
        scheduler.schedule("wiki", 1);
    }
}
