//! Integration tests for the full pipeline path: YAML fixtures, a `SQLite`
//! warehouse built in a temp directory, and in-memory relations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use hybridjoin_engine::config::{parser, validator};
use hybridjoin_engine::orchestrator::{self, PipelineParts, PipelineSettings};
use hybridjoin_engine::sink::DimensionSet;
use hybridjoin_engine::PipelineError;
use hybridjoin_state::{DimensionLookup, MemoryFactSink, MemoryRelation};
use hybridjoin_types::{JoinKey, PartitionRow, Record, StreamTuple};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/fixtures/pipelines")
        .join(name)
}

const WAREHOUSE_SQL: &str = r"
CREATE TABLE Master_Customer (
    Customer_ID INTEGER NOT NULL,
    Gender TEXT,
    Age TEXT
);
INSERT INTO Master_Customer VALUES (1002, 'M', '26-35');
INSERT INTO Master_Customer VALUES (1000, 'F', '0-17');
INSERT INTO Master_Customer VALUES (1001, 'F', '55+');

CREATE TABLE Master_Product (
    Product_ID TEXT NOT NULL,
    Product_Category TEXT,
    Price REAL,
    StoreID INTEGER,
    StoreName TEXT,
    SupplierID INTEGER,
    SupplierName TEXT
);
INSERT INTO Master_Product VALUES ('P1', 'Grocery', 2.5, 1, 'Uptown', 11, 'Acme');
INSERT INTO Master_Product VALUES ('P2', 'Toys', 10.0, 2, 'Downtown', 12, 'Globex');
INSERT INTO Master_Product VALUES ('P3', 'Toys', 4.0, 2, 'Downtown', 12, 'Globex');

CREATE TABLE Dim_Customer (Customer_ID INTEGER, Customer_Key INTEGER);
INSERT INTO Dim_Customer VALUES (1000, 1), (1001, 2), (1002, 3);
CREATE TABLE Dim_Product (Product_ID TEXT, Product_Key INTEGER);
INSERT INTO Dim_Product VALUES ('P1', 101), ('P2', 102);
CREATE TABLE Dim_Store (Store_ID INTEGER, Store_Key INTEGER);
INSERT INTO Dim_Store VALUES (1, 201), (2, 202);
CREATE TABLE Dim_Supplier (Supplier_ID INTEGER, Supplier_Key INTEGER);
INSERT INTO Dim_Supplier VALUES (11, 311), (12, 312);
";

// Order 3: unknown customer, flushed by the first stage.
// Order 4: unknown product, flushed by the second stage.
// Order 5: product joins but has no Dim_Product row, dropped by the sink.
const EVENTS_CSV: &str = "\
,orderID,Customer_ID,Product_ID,quantity,date
0,1,1000,P1,2,2019-03-02
1,2,1001,P2,1,2019-03-04
2,3,9999,P1,1,2019-03-04
3,4,1002,P404,1,2019-03-05
4,5,1002,P3,1,2019-03-05
5,6,1000,P1,3,2019-03-09
";

fn pipeline_yaml(warehouse: &str, events: &str) -> String {
    format!(
        r#"
version: "1.0"
pipeline: walmart_it
warehouse:
  path: {warehouse}
source:
  path: {events}
stages:
  customer:
    table: Master_Customer
    key: Customer_ID
    columns: [Gender, Age]
  product:
    table: Master_Product
    key: Product_ID
    columns: [Price, StoreID, SupplierID]
resources:
  window_capacity: 4
  partition_size: 2
  stream_buffer: 2
  intermediate_queue: 2
  batch_size: 2
  idle_backoff_ms: 1
"#
    )
}

/// Build a warehouse and event file in `dir`, returning the pipeline file path.
fn prepare_workspace(dir: &Path, events_csv: &str) -> PathBuf {
    let warehouse = hybridjoin_state::SqliteWarehouse::open(&dir.join("dw.sqlite")).unwrap();
    warehouse.execute_batch(WAREHOUSE_SQL).unwrap();
    drop(warehouse);

    std::fs::write(dir.join("events.csv"), events_csv).unwrap();
    let pipeline = dir.join("pipeline.yaml");
    std::fs::write(&pipeline, pipeline_yaml("dw.sqlite", "events.csv")).unwrap();
    pipeline
}

fn run_rows(dir: &Path) -> Vec<(String, i64, Option<String>)> {
    let conn = rusqlite::Connection::open(dir.join("dw.sqlite")).unwrap();
    let mut stmt = conn
        .prepare("SELECT status, records_loaded, error_message FROM etl_runs ORDER BY id")
        .unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

#[test]
fn test_parse_and_validate_fixture_pipeline() {
    std::env::set_var("HJ_FIXTURE_WAREHOUSE", "/var/lib/hybridjoin/walmart.sqlite");

    let config = parser::parse_pipeline(&fixture("walmart_pipeline.yaml"))
        .expect("Failed to parse fixture pipeline");

    assert_eq!(config.pipeline, "walmart_dw");
    assert_eq!(
        config.warehouse.path,
        PathBuf::from("/var/lib/hybridjoin/walmart.sqlite")
    );
    assert!(config.source.path.is_absolute());
    assert!(config.source.path.ends_with("data/transactional_data.csv"));
    assert_eq!(config.stages.customer.columns.len(), 6);
    assert_eq!(config.stages.product.key, "Product_ID");
    assert_eq!(config.dimensions.store.table, "Dim_Store");
    assert_eq!(
        config.dimensions.date.as_ref().map(|d| d.table.as_str()),
        Some("Dim_Date")
    );
    assert_eq!(config.resources.memory_bound(), 32_000);

    validator::validate_pipeline(&config).expect("Validation should pass");

    std::env::remove_var("HJ_FIXTURE_WAREHOUSE");
}

#[test]
fn test_parse_invalid_fixture() {
    let result = parser::parse_pipeline(&fixture("invalid_pipeline.yaml"));
    let err = format!("{:#}", result.unwrap_err());
    assert!(
        err.contains("Failed to parse pipeline YAML"),
        "Expected YAML parse error, got: {err}"
    );
}

#[tokio::test]
async fn test_run_pipeline_against_sqlite_warehouse() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = prepare_workspace(dir.path(), EVENTS_CSV);
    let config = parser::parse_pipeline(&pipeline).unwrap();
    validator::validate_pipeline(&config).unwrap();

    let result = orchestrator::run_pipeline(&config).await.unwrap();

    assert_eq!(result.source.streamed, 6);
    let customer = &result.stages[0];
    assert_eq!(customer.processed, 6);
    assert_eq!(customer.joined, 5);
    assert_eq!(customer.flushed, 1);
    assert_eq!(customer.forwarded, 5);
    let product = &result.stages[1];
    assert_eq!(product.joined, 4);
    assert_eq!(product.flushed, 1);
    assert_eq!(product.loaded, 3);
    assert_eq!(product.dropped, 1);
    assert!(customer.peak_window <= 4 && product.peak_window <= 4);
    assert_eq!(result.memory_bound_tuples, 2 * 4 + 2 * 2 + 2 + 2 + 2);

    let conn = rusqlite::Connection::open(dir.path().join("dw.sqlite")).unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT Order_ID, Customer_Key, Product_Key, Store_Key, Supplier_Key, Date_Key, \
             Total_Purchase_Amount, Weekend_Flag, Order_Channel FROM Fact_Sales ORDER BY Order_ID",
        )
        .unwrap();
    let facts: Vec<(i64, i64, i64, i64, i64, i64, f64, i64, String)> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        })
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(facts.len(), 3);
    assert_eq!(
        facts[0],
        (1, 1, 101, 201, 311, 20_190_302, 5.0, 1, "In-Store".to_string())
    );
    assert_eq!(facts[1].0, 2);
    assert_eq!(facts[1].6, 10.0);
    assert_eq!(facts[1].7, 0);
    assert_eq!(facts[2].0, 6);
    assert_eq!(facts[2].5, 20_190_309);
    assert_eq!(facts[2].6, 7.5);

    let runs = run_rows(dir.path());
    assert_eq!(runs, vec![("completed".to_string(), 3, None)]);

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["pipeline"], "walmart_it");
    assert_eq!(json["stages"][1]["loaded"], 3);
}

#[tokio::test]
async fn test_malformed_event_fails_run_and_records_it() {
    let dir = tempfile::tempdir().unwrap();
    let events = "orderID,Customer_ID,Product_ID,quantity,date\n\
                  1,1000,P1,2,2019-03-02\n\
                  2,1001,P2,1,not-a-date\n";
    let pipeline = prepare_workspace(dir.path(), events);
    let config = parser::parse_pipeline(&pipeline).unwrap();

    let err = orchestrator::run_pipeline(&config).await.unwrap_err();
    assert!(matches!(err, PipelineError::Source(_)), "got {err:?}");

    let runs = run_rows(dir.path());
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].0, "failed");
    assert!(runs[0].2.as_deref().unwrap_or_default().contains("not-a-date"));
}

#[tokio::test]
async fn test_check_pipeline_reports_each_component() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = prepare_workspace(dir.path(), EVENTS_CSV);
    let mut config = parser::parse_pipeline(&pipeline).unwrap();

    let result = orchestrator::check_pipeline(&config).await.unwrap();
    assert!(result.all_ok(), "{:?}", result.items);
    assert!(result.items.iter().any(|i| i.name == "dimension Dim_Supplier"));
    assert!(result
        .items
        .iter()
        .any(|i| i.name == "fact table" && i.detail.contains("0 rows")));

    config.source.path = dir.path().join("missing.csv");
    config.stages.product.table = "Master_Missing".to_string();
    let result = orchestrator::check_pipeline(&config).await.unwrap();
    assert!(!result.all_ok());
    let failed: Vec<&str> = result
        .items
        .iter()
        .filter(|i| !i.ok)
        .map(|i| i.name.as_str())
        .collect();
    assert_eq!(failed, vec!["relation product", "event file"]);
}

#[tokio::test]
async fn test_check_pipeline_never_writes_the_warehouse() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = prepare_workspace(dir.path(), EVENTS_CSV);
    let mut config = parser::parse_pipeline(&pipeline).unwrap();

    let missing = dir.path().join("absent").join("dw.sqlite");
    config.warehouse.path = missing.clone();
    let result = orchestrator::check_pipeline(&config).await.unwrap();
    let failed: Vec<&str> = result
        .items
        .iter()
        .filter(|i| !i.ok)
        .map(|i| i.name.as_str())
        .collect();
    assert!(failed.contains(&"warehouse"), "{failed:?}");
    assert!(failed.contains(&"fact table"), "{failed:?}");
    assert!(failed.contains(&"dimension Dim_Customer"), "{failed:?}");
    assert!(!failed.contains(&"event file"), "{failed:?}");
    assert!(!missing.exists());
    assert!(!missing.parent().unwrap().exists());

    // Master data present but the fact table was never created.
    let bare = dir.path().join("bare.sqlite");
    rusqlite::Connection::open(&bare)
        .unwrap()
        .execute_batch(WAREHOUSE_SQL)
        .unwrap();
    config.warehouse.path = bare.clone();
    let result = orchestrator::check_pipeline(&config).await.unwrap();
    let failed: Vec<&str> = result
        .items
        .iter()
        .filter(|i| !i.ok)
        .map(|i| i.name.as_str())
        .collect();
    assert_eq!(failed, vec!["fact table"]);

    let conn = rusqlite::Connection::open(&bare).unwrap();
    let etl_tables: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name IN ('etl_runs', 'Fact_Sales')",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(etl_tables, 0);
}

fn event(order: i64, customer: i64, product: i64) -> Result<StreamTuple, PipelineError> {
    Ok(StreamTuple::new(
        Record::new()
            .with("Order_ID", order)
            .with("Customer_ID", customer)
            .with("Product_ID", format!("P{product:03}"))
            .with("quantity", 1),
        NaiveDateTime::default(),
    ))
}

/// Every streamed tuple ends up loaded, dropped, or flushed by exactly one stage.
#[tokio::test]
async fn test_every_event_is_accounted_for_in_memory() {
    let customers = MemoryRelation::new(
        (0..50)
            .filter(|c| c % 5 != 0)
            .map(|c| PartitionRow::new(JoinKey::Int(c), Record::new().with("Gender", "M"))),
    );
    let products = MemoryRelation::new((0..30).filter(|p| p % 7 != 0).map(|p| {
        PartitionRow::new(
            JoinKey::from(format!("P{p:03}")),
            Record::new()
                .with("Price", 1.25)
                .with("StoreID", p % 3)
                .with("SupplierID", p % 4),
        )
    }));
    let dims = DimensionSet {
        customer: DimensionLookup::from_pairs("Dim_Customer", (0..50_i64).map(|c| (c, c + 1))),
        product: DimensionLookup::from_pairs(
            "Dim_Product",
            (0..30_i64)
                .filter(|p| p % 11 != 0)
                .map(|p| (format!("P{p:03}"), p + 1)),
        ),
        store: DimensionLookup::from_pairs("Dim_Store", (0..3_i64).map(|s| (s, s + 1))),
        supplier: DimensionLookup::from_pairs("Dim_Supplier", (0..4_i64).map(|s| (s, s + 1))),
        date: None,
    };

    let events: Vec<_> = (0..2_000_i64)
        .map(|i| event(i, (i * 17) % 50, (i * 13) % 30))
        .collect();
    let sink = MemoryFactSink::new();

    let mut settings = PipelineSettings::new("accounting", "Customer_ID", "Product_ID");
    for stage in [&mut settings.customer, &mut settings.product] {
        stage.window_capacity = 64;
        stage.partition_size = 8;
        stage.idle_backoff = Duration::from_millis(1);
    }
    settings.stream_buffer = 16;
    settings.intermediate_queue = 16;
    settings.sink.batch_size = 50;

    let result = orchestrator::run_join_pipeline(
        settings,
        PipelineParts {
            events: events.into_iter(),
            customer_relation: customers,
            product_relation: products,
            dimensions: Arc::new(dims),
            fact_sink: sink.clone(),
        },
    )
    .await
    .unwrap();

    let [customer, product] = [&result.stages[0], &result.stages[1]];
    assert_eq!(result.source.streamed, 2_000);
    assert_eq!(customer.processed, 2_000);
    assert_eq!(customer.joined + customer.flushed, customer.processed);
    assert_eq!(product.processed, customer.forwarded);
    assert_eq!(product.joined + product.flushed, product.processed);
    assert_eq!(product.loaded + product.dropped, product.joined);
    assert!(customer.flushed > 0 && product.flushed > 0 && product.dropped > 0);
    assert!(customer.peak_window <= 64 && product.peak_window <= 64);

    let records = sink.records();
    assert_eq!(records.len() as u64, product.loaded);
    assert!(sink.batch_sizes().iter().all(|&n| n <= 50));

    let mut orders: Vec<i64> = records.iter().map(|f| f.order_id).collect();
    orders.sort_unstable();
    orders.dedup();
    assert_eq!(orders.len(), records.len(), "no fact is loaded twice");
}
