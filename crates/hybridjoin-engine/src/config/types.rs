//! Pipeline configuration types, deserialized from YAML.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_WINDOW_CAPACITY: usize = 10_000;
pub const DEFAULT_PARTITION_SIZE: usize = 500;
pub const DEFAULT_STREAM_BUFFER: usize = 5_000;
pub const DEFAULT_INTERMEDIATE_QUEUE: usize = 5_000;
pub const DEFAULT_BATCH_SIZE: usize = 1_000;
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_IDLE_BACKOFF_MS: u64 = 10;
pub const DEFAULT_DROP_LOG_SAMPLES: u64 = 3;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    pub warehouse: WarehouseConfig,
    pub source: SourceConfig,
    pub stages: StagesConfig,
    #[serde(default)]
    pub dimensions: DimensionsConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
}

/// `SQLite` database holding master relations, dimensions and facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub path: PathBuf,
}

/// Transactional event file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    /// Pause after each emitted event, in microseconds. `0` streams at full speed.
    #[serde(default)]
    pub emit_delay_us: u64,
}

/// The two chained join stages, in pipeline order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    pub customer: RelationConfig,
    pub product: RelationConfig,
}

/// Master relation probed by one join stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationConfig {
    pub table: String,
    /// Join key column; also the stream field carrying the key.
    pub key: String,
    /// Enrichment columns merged into matching tuples.
    #[serde(default)]
    pub columns: Vec<String>,
}

/// Surrogate-key dimension table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub table: String,
    pub natural_key: String,
    pub surrogate_key: String,
}

impl DimensionConfig {
    fn named(table: &str, natural_key: &str, surrogate_key: &str) -> Self {
        Self {
            table: table.to_string(),
            natural_key: natural_key.to_string(),
            surrogate_key: surrogate_key.to_string(),
        }
    }
}

/// Dimension lookups used by the final stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionsConfig {
    pub customer: DimensionConfig,
    pub product: DimensionConfig,
    pub store: DimensionConfig,
    pub supplier: DimensionConfig,
    /// When set, every fact's date key must exist in this dimension.
    pub date: Option<DimensionConfig>,
}

impl Default for DimensionsConfig {
    fn default() -> Self {
        Self {
            customer: DimensionConfig::named("Dim_Customer", "Customer_ID", "Customer_Key"),
            product: DimensionConfig::named("Dim_Product", "Product_ID", "Product_Key"),
            store: DimensionConfig::named("Dim_Store", "Store_ID", "Store_Key"),
            supplier: DimensionConfig::named("Dim_Supplier", "Supplier_ID", "Supplier_Key"),
            date: None,
        }
    }
}

/// Fixed capacities and pacing. All sizes are counted in tuples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Per-stage join window capacity (hS).
    pub window_capacity: usize,
    /// Relation rows read per probe (vP).
    pub partition_size: usize,
    /// Channel between the source and the first stage.
    pub stream_buffer: usize,
    /// Channel between the two join stages.
    pub intermediate_queue: usize,
    /// Facts written per sink transaction.
    pub batch_size: usize,
    pub report_interval_secs: u64,
    pub idle_backoff_ms: u64,
    pub drop_log_samples: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            partition_size: DEFAULT_PARTITION_SIZE,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            intermediate_queue: DEFAULT_INTERMEDIATE_QUEUE,
            batch_size: DEFAULT_BATCH_SIZE,
            report_interval_secs: DEFAULT_REPORT_INTERVAL_SECS,
            idle_backoff_ms: DEFAULT_IDLE_BACKOFF_MS,
            drop_log_samples: DEFAULT_DROP_LOG_SAMPLES,
        }
    }
}

impl ResourceConfig {
    /// Upper bound on tuples resident at once across both stages, both
    /// channels, both partition buffers and the sink batch.
    #[must_use]
    pub fn memory_bound(&self) -> usize {
        2 * self.window_capacity
            + 2 * self.partition_size
            + self.stream_buffer
            + self.intermediate_queue
            + self.batch_size
    }
}
