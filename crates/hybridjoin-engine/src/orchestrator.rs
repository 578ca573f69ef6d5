//! Pipeline orchestrator: wires the source, both join stages and the sink,
//! runs them on blocking tasks, and finalizes the run ledger.

use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use hybridjoin_state::{
    FactSink, PartitionLoader, RelationSpec, SqliteFactSink, SqliteRelation, SqliteWarehouse,
    StateError, Warehouse,
};
use hybridjoin_types::state::{PipelineId, RunStats, RunStatus};
use hybridjoin_types::JoinKey;
use tokio::task::JoinHandle;

use crate::channel::{bounded, completion};
use crate::config::types::{
    DimensionConfig, DimensionsConfig, PipelineConfig, RelationConfig, ResourceConfig,
};
use crate::error::PipelineError;
use crate::reader::CsvEventReader;
use crate::result::{CheckResult, PipelineResult, SourceReport, StageReport};
use crate::sink::{DimensionSet, SinkAdapter, SinkSettings};
use crate::source::{EventReader, SourceSettings, StreamSource};
use crate::stage::{Forward, JoinStage, StageSettings};

pub const CUSTOMER_STAGE: &str = "customer-join";
pub const PRODUCT_STAGE: &str = "product-join";
pub const FACT_TABLE: &str = "Fact_Sales";

/// Resolved runtime parameters of a two-stage pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub pipeline: PipelineId,
    pub source: SourceSettings,
    pub customer: StageSettings,
    pub product: StageSettings,
    pub sink: SinkSettings,
    pub stream_buffer: usize,
    pub intermediate_queue: usize,
}

impl PipelineSettings {
    /// Two stages keyed on `customer_key` then `product_key`, default sizes.
    #[must_use]
    pub fn new(
        pipeline: impl Into<PipelineId>,
        customer_key: impl Into<String>,
        product_key: impl Into<String>,
    ) -> Self {
        let defaults = ResourceConfig::default();
        Self {
            pipeline: pipeline.into(),
            source: SourceSettings::default(),
            customer: StageSettings::new(CUSTOMER_STAGE, customer_key),
            product: StageSettings::new(PRODUCT_STAGE, product_key),
            sink: SinkSettings::default(),
            stream_buffer: defaults.stream_buffer,
            intermediate_queue: defaults.intermediate_queue,
        }
    }

    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let res = &config.resources;
        let report_interval = Duration::from_secs(res.report_interval_secs);
        let stage = |name: &str, relation: &RelationConfig| {
            StageSettings::new(name, relation.key.clone())
                .window_capacity(res.window_capacity)
                .partition_size(res.partition_size)
                .idle_backoff(Duration::from_millis(res.idle_backoff_ms))
                .report_interval(report_interval)
        };

        Self {
            pipeline: PipelineId::new(config.pipeline.clone()),
            source: SourceSettings {
                emit_delay: Duration::from_micros(config.source.emit_delay_us),
                report_interval,
                ..SourceSettings::default()
            },
            customer: stage(CUSTOMER_STAGE, &config.stages.customer),
            product: stage(PRODUCT_STAGE, &config.stages.product),
            sink: SinkSettings {
                batch_size: res.batch_size,
                drop_log_samples: res.drop_log_samples,
            },
            stream_buffer: res.stream_buffer,
            intermediate_queue: res.intermediate_queue,
        }
    }

    /// Upper bound on tuples resident at once across the whole pipeline.
    #[must_use]
    pub fn memory_bound(&self) -> usize {
        self.customer.window_capacity
            + self.product.window_capacity
            + self.customer.partition_size
            + self.product.partition_size
            + self.stream_buffer
            + self.intermediate_queue
            + self.sink.batch_size
    }
}

/// Everything a run consumes: the event stream, one relation per stage,
/// the dimension lookups and the fact sink.
pub struct PipelineParts<R, C, P, S> {
    pub events: R,
    pub customer_relation: C,
    pub product_relation: P,
    pub dimensions: Arc<DimensionSet>,
    pub fact_sink: S,
}

async fn join_task<T>(
    what: &str,
    handle: JoinHandle<Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    handle.await.map_err(|e| {
        PipelineError::Infrastructure(anyhow::anyhow!("{what} task panicked: {e}"))
    })?
}

/// First error that is not merely a consequence of another stage failing.
fn root_cause(mut errors: Vec<PipelineError>) -> Option<PipelineError> {
    let idx = errors
        .iter()
        .position(|e| !e.is_secondary())
        .unwrap_or(0);
    (idx < errors.len()).then(|| errors.swap_remove(idx))
}

/// Run the source and both join stages to completion.
///
/// Every component runs on its own blocking task; they are connected only by
/// bounded channels and completion signals. The sink flushes its last batch
/// before the final stage reports.
///
/// # Errors
///
/// Returns the root-cause error when any component fails. Secondary
/// [`PipelineError::ChannelClosed`] errors are reported only when nothing
/// else failed.
pub async fn run_join_pipeline<R, C, P, S>(
    settings: PipelineSettings,
    parts: PipelineParts<R, C, P, S>,
) -> Result<PipelineResult, PipelineError>
where
    R: EventReader + 'static,
    C: PartitionLoader + 'static,
    P: PartitionLoader + 'static,
    S: FactSink + 'static,
{
    let start = Instant::now();
    let memory_bound = settings.memory_bound();

    let (stream_tx, stream_rx) = bounded(settings.stream_buffer);
    let (queue_tx, queue_rx) = bounded(settings.intermediate_queue);
    let (source_done, source_signal) = completion();
    let (customer_done, customer_signal) = completion();

    let source = StreamSource::new(settings.source.clone(), parts.events, stream_tx, source_done);
    let customer = JoinStage::new(
        settings.customer.clone(),
        stream_rx,
        source_signal,
        parts.customer_relation,
        Forward::new(settings.customer.name.clone(), queue_tx, customer_done),
    );
    let product = JoinStage::new(
        settings.product.clone(),
        queue_rx,
        customer_signal,
        parts.product_relation,
        SinkAdapter::new(parts.dimensions, parts.fact_sink, settings.sink.clone()),
    );

    let source_handle = tokio::task::spawn_blocking(move || source.run());
    let customer_handle = tokio::task::spawn_blocking(move || customer.run());
    let product_handle = tokio::task::spawn_blocking(move || product.run());

    let source_result = join_task("Stream source", source_handle).await;
    let customer_result = join_task("Customer stage", customer_handle).await;
    let product_result = join_task("Product stage", product_handle).await;

    let (source, customer, product): (SourceReport, StageReport, StageReport) =
        match (source_result, customer_result, product_result) {
            (Ok(s), Ok(c), Ok(p)) => (s, c, p),
            (s, c, p) => {
                let errors = [s.err(), c.err(), p.err()].into_iter().flatten().collect();
                let err = root_cause(errors).unwrap_or_else(|| {
                    PipelineError::Infrastructure(anyhow::anyhow!("pipeline failed without an error"))
                });
                tracing::error!(pipeline = %settings.pipeline, "Pipeline failed: {err}");
                return Err(err);
            }
        };

    let result = PipelineResult {
        pipeline: settings.pipeline.to_string(),
        source,
        stages: vec![customer, product],
        duration_secs: start.elapsed().as_secs_f64(),
        memory_bound_tuples: memory_bound,
    };

    tracing::info!(
        pipeline = %settings.pipeline,
        streamed = result.source.streamed,
        joined = result.records_joined(),
        loaded = result.records_loaded(),
        dropped = result.records_dropped(),
        efficiency_pct = result.efficiency(),
        throughput = result.throughput().round(),
        memory_bound_tuples = memory_bound,
        duration_secs = result.duration_secs,
        "Pipeline completed"
    );
    Ok(result)
}

fn relation_spec(relation: &RelationConfig) -> RelationSpec {
    RelationSpec::new(
        relation.table.clone(),
        relation.key.clone(),
        relation.columns.iter().cloned(),
    )
}

fn load_dimension(
    warehouse: &dyn Warehouse,
    dimension: &DimensionConfig,
) -> Result<hybridjoin_state::DimensionLookup, StateError> {
    let lookup = warehouse.load_dimension(
        &dimension.table,
        &dimension.natural_key,
        &dimension.surrogate_key,
    )?;
    tracing::debug!(dimension = dimension.table, keys = lookup.len(), "Dimension loaded");
    Ok(lookup)
}

/// Load every configured dimension into memory.
///
/// # Errors
///
/// Returns the first dimension that fails to load.
pub fn load_dimensions(
    warehouse: &dyn Warehouse,
    dims: &DimensionsConfig,
) -> Result<DimensionSet, StateError> {
    Ok(DimensionSet {
        customer: load_dimension(warehouse, &dims.customer)?,
        product: load_dimension(warehouse, &dims.product)?,
        store: load_dimension(warehouse, &dims.store)?,
        supplier: load_dimension(warehouse, &dims.supplier)?,
        date: dims
            .date
            .as_ref()
            .map(|d| load_dimension(warehouse, d))
            .transpose()?,
    })
}

type SqlitePipelineParts =
    PipelineParts<CsvEventReader<File>, SqliteRelation, SqliteRelation, SqliteFactSink>;

/// Open the warehouse and everything the run reads from or writes to.
fn prepare(
    config: &PipelineConfig,
) -> Result<(Arc<SqliteWarehouse>, SqlitePipelineParts), PipelineError> {
    let warehouse = Arc::new(SqliteWarehouse::open(&config.warehouse.path)?);
    let dimensions = load_dimensions(warehouse.as_ref(), &config.dimensions)?;
    let customer_relation =
        SqliteRelation::open(&config.warehouse.path, &relation_spec(&config.stages.customer))?;
    let product_relation =
        SqliteRelation::open(&config.warehouse.path, &relation_spec(&config.stages.product))?;
    let fact_sink = SqliteFactSink::open(&config.warehouse.path)?;
    let events = CsvEventReader::open(&config.source.path)?;

    Ok((
        warehouse,
        PipelineParts {
            events,
            customer_relation,
            product_relation,
            dimensions: Arc::new(dimensions),
            fact_sink,
        },
    ))
}

/// Run a configured pipeline against its `SQLite` warehouse and CSV event file,
/// recording the run in the warehouse ledger.
///
/// # Errors
///
/// Returns an error if setup fails or any pipeline component fails. A failed
/// run is still recorded with its error message.
pub async fn run_pipeline(config: &PipelineConfig) -> Result<PipelineResult, PipelineError> {
    let settings = PipelineSettings::from_config(config);
    let pipeline_id = settings.pipeline.clone();

    tracing::info!(
        pipeline = config.pipeline,
        window_capacity = config.resources.window_capacity,
        partition_size = config.resources.partition_size,
        memory_bound_tuples = settings.memory_bound(),
        "Starting pipeline run"
    );

    let config_for_prepare = config.clone();
    let (warehouse, parts) = tokio::task::spawn_blocking(move || prepare(&config_for_prepare))
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("prepare task panicked: {e}")))??;
    tracing::info!(
        customers = parts.dimensions.customer.len(),
        products = parts.dimensions.product.len(),
        stores = parts.dimensions.store.len(),
        suppliers = parts.dimensions.supplier.len(),
        "Dimensions loaded"
    );

    let state_for_run = warehouse.clone();
    let pipeline_id_for_run = pipeline_id.clone();
    let run_id = tokio::task::spawn_blocking(move || state_for_run.start_run(&pipeline_id_for_run))
        .await
        .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("start_run task panicked: {e}")))??;

    let outcome = run_join_pipeline(settings, parts).await;
    finalize_run(warehouse, run_id, outcome).await
}

async fn finalize_run(
    warehouse: Arc<SqliteWarehouse>,
    run_id: i64,
    outcome: Result<PipelineResult, PipelineError>,
) -> Result<PipelineResult, PipelineError> {
    let (status, stats) = match &outcome {
        Ok(result) => (RunStatus::Completed, result.run_stats()),
        Err(err) => (
            RunStatus::Failed,
            RunStats {
                error_message: Some(err.to_string()),
                ..RunStats::default()
            },
        ),
    };

    tokio::task::spawn_blocking(move || warehouse.complete_run(run_id, status, &stats))
        .await
        .map_err(|e| {
            PipelineError::Infrastructure(anyhow::anyhow!("complete_run task panicked: {e}"))
        })??;

    outcome
}

fn check_relation(path: &std::path::Path, relation: &RelationConfig) -> Result<String, String> {
    let mut loader =
        SqliteRelation::open(path, &relation_spec(relation)).map_err(|e| e.to_string())?;
    let rows = loader
        .fetch(&JoinKey::Int(i64::MIN), 1)
        .map_err(|e| e.to_string())?;
    if rows.is_empty() {
        Err(format!("{} has no rows", relation.table))
    } else {
        Ok(format!("{} readable, ordered by {}", relation.table, relation.key))
    }
}

fn check_all(config: &PipelineConfig) -> CheckResult {
    let mut result = CheckResult::default();

    let warehouse = SqliteWarehouse::open_existing(&config.warehouse.path);
    result.record(
        "warehouse",
        warehouse
            .as_ref()
            .map(|_| format!("opened {}", config.warehouse.path.display()))
            .map_err(ToString::to_string),
    );

    result.record(
        "relation customer",
        check_relation(&config.warehouse.path, &config.stages.customer),
    );
    result.record(
        "relation product",
        check_relation(&config.warehouse.path, &config.stages.product),
    );

    let unavailable = || -> Result<String, String> {
        Err(format!(
            "warehouse {} unavailable",
            config.warehouse.path.display()
        ))
    };
    let dims = &config.dimensions;
    let mut named: Vec<&DimensionConfig> =
        vec![&dims.customer, &dims.product, &dims.store, &dims.supplier];
    named.extend(dims.date.as_ref());
    for dim in named {
        result.record(
            format!("dimension {}", dim.table),
            match &warehouse {
                Ok(warehouse) => load_dimension(warehouse, dim)
                    .map(|lookup| format!("{} keys", lookup.len()))
                    .map_err(|e| e.to_string()),
                Err(_) => unavailable(),
            },
        );
    }
    result.record(
        "fact table",
        match &warehouse {
            Ok(warehouse) => warehouse
                .count_rows(FACT_TABLE)
                .map(|n| format!("{FACT_TABLE} holds {n} rows"))
                .map_err(|e| e.to_string()),
            Err(_) => unavailable(),
        },
    );

    let events = CsvEventReader::open(&config.source.path).and_then(|mut reader| {
        reader.next().transpose().map(|first| first.is_some())
    });
    result.record(
        "event file",
        match events {
            Ok(true) => Ok(format!("{} readable", config.source.path.display())),
            Ok(false) => Err(format!("{} holds no events", config.source.path.display())),
            Err(e) => Err(e.to_string()),
        },
    );

    result
}

/// Verify that the warehouse, both relations, every dimension and the
/// event file are reachable without running the pipeline.
///
/// # Errors
///
/// Returns an error only if the check task itself panics; individual
/// failures are reported in the [`CheckResult`].
pub async fn check_pipeline(config: &PipelineConfig) -> Result<CheckResult> {
    tracing::info!(pipeline = config.pipeline, "Checking pipeline configuration");

    let config = config.clone();
    let result = tokio::task::spawn_blocking(move || check_all(&config))
        .await
        .map_err(|e| anyhow::anyhow!("check task panicked: {e}"))?;

    for item in &result.items {
        if item.ok {
            tracing::debug!(check = item.name, detail = item.detail, "Check passed");
        } else {
            tracing::warn!(check = item.name, detail = item.detail, "Check failed");
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;
    use hybridjoin_state::{DimensionLookup, MemoryFactSink, MemoryRelation};
    use hybridjoin_types::state::StageName;
    use hybridjoin_types::{PartitionRow, Record, StreamTuple};

    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn event(order: i64, customer: i64, product: &str) -> Result<StreamTuple, PipelineError> {
        Ok(StreamTuple::new(
            Record::new()
                .with("Order_ID", order)
                .with("Customer_ID", customer)
                .with("Product_ID", product)
                .with("quantity", 1),
            NaiveDateTime::default(),
        ))
    }

    fn customers() -> MemoryRelation {
        MemoryRelation::new((1..=3).map(|id| {
            PartitionRow::new(JoinKey::Int(id), Record::new().with("Gender", "F"))
        }))
    }

    fn products() -> MemoryRelation {
        MemoryRelation::new(["P1", "P2"].into_iter().map(|id| {
            PartitionRow::new(
                JoinKey::from(id),
                Record::new()
                    .with("Price", 2.5)
                    .with("StoreID", "S1")
                    .with("SupplierID", 9),
            )
        }))
    }

    fn dimensions() -> Arc<DimensionSet> {
        Arc::new(DimensionSet {
            customer: DimensionLookup::from_pairs("Dim_Customer", [(1, 10_i64), (2, 20), (3, 30)]),
            product: DimensionLookup::from_pairs("Dim_Product", [("P1", 100_i64), ("P2", 200)]),
            store: DimensionLookup::from_pairs("Dim_Store", [("S1", 1_i64)]),
            supplier: DimensionLookup::from_pairs("Dim_Supplier", [(9, 90_i64)]),
            date: None,
        })
    }

    fn settings() -> PipelineSettings {
        let mut settings = PipelineSettings::new("unit", "Customer_ID", "Product_ID");
        for stage in [&mut settings.customer, &mut settings.product] {
            stage.window_capacity = 4;
            stage.partition_size = 2;
            stage.idle_backoff = Duration::from_millis(1);
        }
        settings.stream_buffer = 2;
        settings.intermediate_queue = 2;
        settings.sink.batch_size = 3;
        settings
    }

    #[tokio::test]
    async fn joins_through_both_stages() {
        let sink = MemoryFactSink::new();
        let events = vec![
            event(1, 1, "P1"),
            event(2, 2, "P2"),
            event(3, 7, "P1"),
            event(4, 3, "P9"),
            event(5, 3, "P1"),
        ];
        let result = run_join_pipeline(
            settings(),
            PipelineParts {
                events: events.into_iter(),
                customer_relation: customers(),
                product_relation: products(),
                dimensions: dimensions(),
                fact_sink: sink.clone(),
            },
        )
        .await
        .unwrap();

        assert_eq!(result.source.streamed, 5);
        assert_eq!(result.stages[0].joined, 4);
        assert_eq!(result.stages[0].flushed, 1);
        assert_eq!(result.stages[1].joined, 3);
        assert_eq!(result.records_loaded(), 3);

        let mut orders: Vec<i64> = sink.records().iter().map(|f| f.order_id).collect();
        orders.sort_unstable();
        assert_eq!(orders, vec![1, 2, 5]);
    }

    #[tokio::test]
    async fn sink_failure_wins_over_channel_closed() {
        let sink = MemoryFactSink::new().fail_after(0);
        let events: Vec<_> = (1..=40).map(|i| event(i, 1 + i % 3, "P1")).collect();
        let mut settings = settings();
        settings.sink.batch_size = 1;
        let err = run_join_pipeline(
            settings,
            PipelineParts {
                events: events.into_iter(),
                customer_relation: customers(),
                product_relation: products(),
                dimensions: dimensions(),
                fact_sink: sink,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Sink(_)), "got {err:?}");
    }

    #[test]
    fn root_cause_skips_secondary_errors() {
        let errors = vec![
            PipelineError::ChannelClosed {
                stage: StageName::new("stream-source"),
            },
            PipelineError::Source("row 3: bad".into()),
        ];
        assert!(matches!(root_cause(errors), Some(PipelineError::Source(_))));

        let only_secondary = vec![PipelineError::ChannelClosed {
            stage: StageName::new("customer-join"),
        }];
        assert!(matches!(
            root_cause(only_secondary),
            Some(PipelineError::ChannelClosed { .. })
        ));
        assert!(root_cause(Vec::new()).is_none());
    }

    #[test]
    fn settings_from_config_apply_resources() {
        let config = parse_pipeline_str(
            r#"
version: "1.0"
pipeline: walmart
warehouse:
  path: dw.sqlite
source:
  path: tx.csv
  emit_delay_us: 250
stages:
  customer:
    table: Master_Customer
    key: Customer_ID
  product:
    table: Master_Product
    key: Product_ID
resources:
  window_capacity: 100
  partition_size: 10
  stream_buffer: 7
  intermediate_queue: 8
  batch_size: 9
"#,
        )
        .unwrap();
        let settings = PipelineSettings::from_config(&config);
        assert_eq!(settings.pipeline.as_str(), "walmart");
        assert_eq!(settings.customer.join_key, "Customer_ID");
        assert_eq!(settings.product.join_key, "Product_ID");
        assert_eq!(settings.customer.window_capacity, 100);
        assert_eq!(settings.product.partition_size, 10);
        assert_eq!(settings.source.emit_delay, Duration::from_micros(250));
        assert_eq!(settings.sink.batch_size, 9);
        assert_eq!(settings.memory_bound(), 2 * 100 + 2 * 10 + 7 + 8 + 9);
        assert_eq!(settings.memory_bound(), config.resources.memory_bound());
    }
}
