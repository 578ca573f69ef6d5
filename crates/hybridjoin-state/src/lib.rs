//! Storage for the hybridjoin pipeline.
//!
//! Provides the [`PartitionLoader`], [`FactSink`] and [`Warehouse`] contracts
//! together with `SQLite`-backed and in-memory implementations: sorted
//! relation partitions for the join stages, surrogate-key dimension lookups,
//! batched fact persistence, and the run ledger.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod lookup;
pub mod memory;
pub mod sqlite;

pub use backend::{FactSink, PartitionLoader, Warehouse};
pub use error::StateError;
pub use lookup::DimensionLookup;
pub use memory::{MemoryFactSink, MemoryRelation};
pub use sqlite::{RelationSpec, SqliteFactSink, SqliteRelation, SqliteWarehouse};

/// Convenience re-exports for downstream crates and benches.
pub mod prelude {
    pub use crate::backend::{FactSink, PartitionLoader, Warehouse};
    pub use crate::error::StateError;
    pub use crate::lookup::DimensionLookup;
    pub use crate::memory::{MemoryFactSink, MemoryRelation};
    pub use crate::sqlite::{RelationSpec, SqliteFactSink, SqliteRelation, SqliteWarehouse};
    pub use hybridjoin_types::state::{PipelineId, RunStats, RunStatus};
    pub use hybridjoin_types::{FactRecord, JoinKey, PartitionRow, Record, Value};
}
