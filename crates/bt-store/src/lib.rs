//! # bt-store
//!
//! The experiment's authoritative job table for BayesTune.
//!
//! A single JSON snapshot per experiment directory holds the parameter space,
//! the point matrix and the per-job status, value, duration and handle.
//! Mutations are serialized across processes by a marker-file lock and
//! committed with an atomic rename, so any reader sees a complete state.

pub mod grid;
pub mod lock;
mod snapshot;
mod store;

pub use grid::halton_grid;
pub use lock::{read_marker, LockConfig, LockGuard, LockMarker, StoreLock};
pub use snapshot::ExperimentSnapshot;
pub use store::{ExperimentStore, LOCK_FILE, STORE_FILE};
