#![warn(missing_docs)]

//! FleetSync replication engine: per-unit sync orchestration, checksum
//! verification against the primary, and cursor-driven batch state sweeps.

pub mod backoff;
pub mod config;
pub mod content;
pub mod error;
pub mod housekeeping;
pub mod reconcile;
pub mod replicable;
pub mod sync;
pub mod transition;
pub mod verify;
