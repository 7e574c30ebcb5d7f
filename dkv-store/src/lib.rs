//! Distributed key-value store for pi rows, plus worker-cohort collectives.
//!
//! The store maps a vertex id to a `K + 1`-length float record (pi row and
//! phi sum), sharded over the cohort. A generic client owns the read cache
//! and write staging; transports only move bytes. Reads stay valid until
//! `purge`; writes become visible to peers after the next `barrier`.

pub mod error;

/// Client with read cache and write staging over a pluggable transport
pub mod store;

/// File-backed transport (shared directory, single-process friendly)
pub mod file_store;

/// In-process transport for the emulated cohort
pub mod shared_store;

/// MPI-style collectives over an in-process worker cohort
pub mod cohort;

pub use cohort::{local_cohort, Cohort, LocalCohort};
pub use error::{DkvError, Result};
pub use store::{owner_of, shard_index, DkvClient, DkvTransport, Key, RwMode};
