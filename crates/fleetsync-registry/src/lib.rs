#![warn(missing_docs)]

//! FleetSync registry subsystem: per-unit sync/verification state rows,
//! resumable batch cursors, and lease-based mutual exclusion.

pub mod cursor;
pub mod error;
pub mod lease;
pub mod state;
pub mod store;
