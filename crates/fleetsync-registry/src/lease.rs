//! Lease-based mutual exclusion for fleet-wide work deduplication.
//!
//! A lease is a time-bounded exclusion token for a resource key: at most one
//! unexpired holder exists per key at any instant. Expiry is clock-based
//! rather than held by handle, so a crashed holder self-heals after the ttl.
//! There is no queuing — a caller that cannot acquire skips its work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RegistryError;

/// Proof of lease ownership, required to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    /// The leased resource key.
    pub key: String,
    /// Unique holder identifier for this acquisition.
    pub holder: Uuid,
    /// When the lease expires (microseconds since epoch).
    pub expires_at_us: u64,
}

/// Backend storing lease entries. The in-memory [`LeaseStore`] implements
/// this; a production deployment would back it with a shared store.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Atomic set-if-absent-or-expired. Returns a token when acquired,
    /// `None` when another unexpired holder exists.
    async fn try_acquire(
        &self,
        key: &str,
        ttl_us: u64,
        now_us: u64,
    ) -> Result<Option<LeaseToken>, RegistryError>;

    /// Release a held lease. Releasing with a stale token (expired, or the
    /// key was re-acquired by someone else) is a no-op.
    async fn release(&self, token: &LeaseToken) -> Result<(), RegistryError>;
}

/// In-memory lease table.
#[derive(Debug, Default)]
pub struct LeaseStore {
    leases: RwLock<HashMap<String, (Uuid, u64)>>,
}

impl LeaseStore {
    /// Create an empty lease table.
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// Current holder of a key, if the lease is unexpired.
    pub fn holder_of(&self, key: &str, now_us: u64) -> Option<Uuid> {
        self.leases
            .read()
            .unwrap()
            .get(key)
            .filter(|(_, expires)| *expires > now_us)
            .map(|(holder, _)| *holder)
    }

    /// Number of unexpired leases.
    pub fn active_count(&self, now_us: u64) -> usize {
        self.leases
            .read()
            .unwrap()
            .values()
            .filter(|(_, expires)| *expires > now_us)
            .count()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self, now_us: u64) -> usize {
        let mut leases = self.leases.write().unwrap();
        let before = leases.len();
        leases.retain(|_, (_, expires)| *expires > now_us);
        before - leases.len()
    }
}

#[async_trait]
impl LeaseBackend for LeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        ttl_us: u64,
        now_us: u64,
    ) -> Result<Option<LeaseToken>, RegistryError> {
        let mut leases = self.leases.write().unwrap();
        if let Some((_, expires)) = leases.get(key) {
            if *expires > now_us {
                return Ok(None);
            }
        }
        let holder = Uuid::new_v4();
        let expires_at_us = now_us + ttl_us;
        leases.insert(key.to_string(), (holder, expires_at_us));
        debug!(key, %holder, "lease acquired");
        Ok(Some(LeaseToken {
            key: key.to_string(),
            holder,
            expires_at_us,
        }))
    }

    async fn release(&self, token: &LeaseToken) -> Result<(), RegistryError> {
        let mut leases = self.leases.write().unwrap();
        if let Some((holder, _)) = leases.get(&token.key) {
            if *holder == token.holder {
                leases.remove(&token.key);
                debug!(key = %token.key, "lease released");
            }
        }
        Ok(())
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn current_time_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}

/// Run `work` under a lease on `key`, releasing on completion.
///
/// Non-acquisition is a one-shot skip, not an error: the function returns
/// `None` without running `work`. A backend error is also treated as
/// non-acquisition (fail closed — skip work rather than risk running it
/// twice across the fleet).
pub async fn try_with_lease<B, F, Fut, T>(
    backend: &B,
    key: &str,
    ttl_us: u64,
    work: F,
) -> Option<T>
where
    B: LeaseBackend + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let token = match backend.try_acquire(key, ttl_us, current_time_us()).await {
        Ok(Some(token)) => token,
        Ok(None) => return None,
        Err(e) => {
            warn!(key, error = %e, "lease backend unavailable, skipping work");
            return None;
        }
    };

    let out = work().await;

    if let Err(e) = backend.release(&token).await {
        warn!(key, error = %e, "failed to release lease, will expire by ttl");
    }

    Some(out)
}
