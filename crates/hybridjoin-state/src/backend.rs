//! Storage contracts consumed by the pipeline.
//!
//! [`PartitionLoader`] is the disk-resident relation a join stage probes,
//! [`FactSink`] is where the final stage persists batches, and [`Warehouse`]
//! serves dimension lookups and the run ledger. Model types live in
//! [`hybridjoin_types`].

use hybridjoin_types::state::{PipelineId, RunStats, RunStatus};
use hybridjoin_types::{FactRecord, JoinKey, PartitionRow};

use crate::error;
use crate::lookup::DimensionLookup;

/// Sorted, disk-resident relation read one bounded partition at a time.
///
/// Each join stage owns its own loader, so implementations hold an
/// independent handle and need not be `Sync`.
pub trait PartitionLoader: Send {
    /// Fetch up to `max_rows` rows whose key is `>= resume_key`, in ascending
    /// key order. An empty result means no row at or after `resume_key` exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on I/O or decode failure.
    fn fetch(&mut self, resume_key: &JoinKey, max_rows: usize)
        -> error::Result<Vec<PartitionRow>>;
}

/// Persistence target for enriched, surrogate-keyed facts.
pub trait FactSink: Send {
    /// Persist one batch atomically. Returns the number of rows stored.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    /// Callers treat this as fatal; nothing is retried.
    fn store(&mut self, batch: &[FactRecord]) -> error::Result<u64>;
}

/// Warehouse-level reads and the run ledger.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn Warehouse>`.
pub trait Warehouse: Send + Sync {
    /// Read a whole `natural_key -> surrogate_key` mapping from a dimension table.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure or
    /// when a key column holds a non-key value.
    fn load_dimension(
        &self,
        table: &str,
        natural_key: &str,
        surrogate_key: &str,
    ) -> error::Result<DimensionLookup>;

    /// Number of rows in `table`; used to verify that it exists and is readable.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) if the table is missing.
    fn count_rows(&self, table: &str) -> error::Result<u64>;

    /// Record the start of a pipeline run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64>;

    /// Finalize a run with its status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats)
        -> error::Result<()>;
}

impl<T: PartitionLoader + ?Sized> PartitionLoader for Box<T> {
    fn fetch(
        &mut self,
        resume_key: &JoinKey,
        max_rows: usize,
    ) -> error::Result<Vec<PartitionRow>> {
        (**self).fetch(resume_key, max_rows)
    }
}

impl<T: FactSink + ?Sized> FactSink for Box<T> {
    fn store(&mut self, batch: &[FactRecord]) -> error::Result<u64> {
        (**self).store(batch)
    }
}
