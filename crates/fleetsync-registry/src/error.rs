//! Error types for the registry subsystem.

use thiserror::Error;

/// Errors that can occur in the registry subsystem.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No registry row exists for the given unit.
    #[error("registry row not found for model {model_id}")]
    NotFound {
        /// The unit whose row was missing.
        model_id: u64,
    },

    /// An optimistic write lost: the row changed since it was read.
    #[error("stale write for model {model_id}: row version changed")]
    Conflict {
        /// The unit whose row was concurrently modified.
        model_id: u64,
    },

    /// The underlying store is unavailable.
    #[error("registry store unavailable: {msg}")]
    Unavailable {
        /// Error message describing the outage.
        msg: String,
    },

    /// Snapshot serialization/deserialization error.
    #[error("snapshot serialization error")]
    Serialization(#[from] bincode::Error),
}
