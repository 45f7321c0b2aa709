//! Engine configuration.
//!
//! All node-level knobs are passed in explicitly at construction time; the
//! engine reads no ambient global state.

use serde::{Deserialize, Serialize};

const HOUR_US: u64 = 3_600 * 1_000_000;
const DAY_US: u64 = 24 * HOUR_US;

/// Configuration for the sync orchestrator and verification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplConfig {
    /// Name of this secondary node, used in lease keys and logs.
    pub node_name: String,
    /// Retry count above which odd-numbered attempts redownload instead of
    /// fetching incrementally.
    pub redownload_retry_threshold: u32,
    /// Sync lease ttl in microseconds. Must exceed the worst-case transfer
    /// time; a lease expiring mid-transfer lets another worker start over.
    pub lease_ttl_us: u64,
    /// How long a verification may stay `Started` before the timeout sweep
    /// fails it.
    pub verification_timeout_us: u64,
    /// Re-verify units whose last successful verification is older than this.
    pub reverification_interval_us: u64,
    /// Upper bound on the retry backoff delay.
    pub backoff_cap_us: u64,
    /// Units verified per batch job.
    pub verification_batch_size: usize,
    /// Units marked for re-verification per batch job.
    pub reverification_batch_size: usize,
    /// ID-range width per registry-consistency pass.
    pub reconcile_range_size: u64,
    /// Rows mutated per bulk-transition batch.
    pub bulk_batch_size: usize,
    /// Scan ceiling multiplier for bulk transitions: at most
    /// `bulk_batch_size * bulk_scan_multiplier` IDs are examined per batch.
    pub bulk_scan_multiplier: u64,
    /// Prefer snapshot transfer when rebuilding, unless the unit shares a
    /// deduplication object pool.
    pub snapshot_transfer_enabled: bool,
    /// First-time syncs clone rather than fetching into an empty container.
    pub clone_on_first_sync: bool,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            node_name: "secondary".to_string(),
            redownload_retry_threshold: 10,
            lease_ttl_us: 8 * HOUR_US,
            verification_timeout_us: 8 * HOUR_US,
            reverification_interval_us: 7 * DAY_US,
            backoff_cap_us: HOUR_US,
            verification_batch_size: 10,
            reverification_batch_size: 1000,
            reconcile_range_size: 10_000,
            bulk_batch_size: 1000,
            bulk_scan_multiplier: 10,
            snapshot_transfer_enabled: true,
            clone_on_first_sync: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReplConfig::default();
        assert_eq!(config.redownload_retry_threshold, 10);
        assert_eq!(config.lease_ttl_us, 8 * HOUR_US);
        assert_eq!(config.backoff_cap_us, HOUR_US);
        assert_eq!(config.verification_batch_size, 10);
        assert_eq!(config.bulk_scan_multiplier, 10);
        assert!(config.clone_on_first_sync);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = ReplConfig {
            node_name: "site-2".into(),
            ..ReplConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ReplConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_name, "site-2");
        assert_eq!(back.reconcile_range_size, config.reconcile_range_size);
    }
}
