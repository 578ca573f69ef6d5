//! In-memory relation and fact sink, for tests and benches.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hybridjoin_types::{FactRecord, JoinKey, PartitionRow};

use crate::backend::{FactSink, PartitionLoader};
use crate::error::{self, StateError};

/// Relation held as a key-sorted vector. Duplicate keys keep insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelation {
    rows: Vec<PartitionRow>,
    fetches: Arc<AtomicUsize>,
    fail_after: Option<usize>,
}

impl MemoryRelation {
    #[must_use]
    pub fn new(rows: impl IntoIterator<Item = PartitionRow>) -> Self {
        let mut rows: Vec<PartitionRow> = rows.into_iter().collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            rows,
            fetches: Arc::default(),
            fail_after: None,
        }
    }

    /// Make every fetch after the first `n` successful ones fail.
    #[must_use]
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Shared counter of fetch calls, readable after the relation has been
    /// moved into a stage.
    #[must_use]
    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetches)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl PartitionLoader for MemoryRelation {
    fn fetch(
        &mut self,
        resume_key: &JoinKey,
        max_rows: usize,
    ) -> error::Result<Vec<PartitionRow>> {
        let attempt = self.fetches.fetch_add(1, Ordering::Relaxed);
        if self.fail_after.is_some_and(|n| attempt >= n) {
            return Err(StateError::Unavailable(format!(
                "injected failure at fetch #{} (resume key {resume_key})",
                attempt + 1
            )));
        }
        let start = self.rows.partition_point(|row| row.key < *resume_key);
        Ok(self.rows[start..]
            .iter()
            .take(max_rows)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct SinkInner {
    records: Vec<FactRecord>,
    batch_sizes: Vec<usize>,
}

/// Fact sink that appends to a shared vector. Clones observe the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryFactSink {
    inner: Arc<Mutex<SinkInner>>,
    fail_after: Option<usize>,
}

impl MemoryFactSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `store` after the first `n` batches fail.
    #[must_use]
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    fn lock(&self) -> error::Result<MutexGuard<'_, SinkInner>> {
        self.inner.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Every record stored so far, in persistence order.
    #[must_use]
    pub fn records(&self) -> Vec<FactRecord> {
        self.lock().map(|g| g.records.clone()).unwrap_or_default()
    }

    /// Size of each persisted batch, in order.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().map(|g| g.batch_sizes.clone()).unwrap_or_default()
    }
}

impl FactSink for MemoryFactSink {
    fn store(&mut self, batch: &[FactRecord]) -> error::Result<u64> {
        let mut inner = self.lock()?;
        if self.fail_after.is_some_and(|n| inner.batch_sizes.len() >= n) {
            return Err(StateError::Unavailable(
                "fact sink rejected batch".to_string(),
            ));
        }
        inner.records.extend_from_slice(batch);
        inner.batch_sizes.push(batch.len());
        Ok(batch.len() as u64)
    }
}
