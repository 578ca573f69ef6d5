//! `SQLite`-backed relations, fact sink, and warehouse.
//!
//! Every component opens its own connection so that the two join stages and
//! the final loader never contend for a shared handle.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use hybridjoin_types::state::{PipelineId, RunStats, RunStatus};
use hybridjoin_types::{FactRecord, JoinKey, PartitionRow, Record, Value};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use crate::backend::{FactSink, PartitionLoader, Warehouse};
use crate::error::{self, StateError};
use crate::lookup::DimensionLookup;

/// Idempotent DDL for the tables this crate writes to. Dimension and master
/// tables belong to the loading layer and are never created here.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS etl_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_streamed INTEGER DEFAULT 0,
    records_joined INTEGER DEFAULT 0,
    records_loaded INTEGER DEFAULT 0,
    records_dropped INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS Fact_Sales (
    Fact_Key INTEGER PRIMARY KEY AUTOINCREMENT,
    Order_ID INTEGER NOT NULL,
    Order_Line_Number INTEGER NOT NULL,
    Customer_Key INTEGER NOT NULL,
    Product_Key INTEGER NOT NULL,
    Store_Key INTEGER NOT NULL,
    Supplier_Key INTEGER NOT NULL,
    Date_Key INTEGER NOT NULL,
    Quantity INTEGER NOT NULL,
    Unit_Price REAL NOT NULL,
    Total_Purchase_Amount REAL NOT NULL,
    Discount_Amount REAL NOT NULL,
    Weekend_Flag INTEGER NOT NULL,
    Order_Channel TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fact_sales_order ON Fact_Sales (Order_ID);
";

const INSERT_FACT: &str = "INSERT INTO Fact_Sales \
     (Order_ID, Order_Line_Number, Customer_Key, Product_Key, Store_Key, Supplier_Key, \
      Date_Key, Quantity, Unit_Price, Total_Purchase_Amount, Discount_Amount, \
      Weekend_Flag, Order_Channel) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

/// Reject anything but `[A-Za-z_][A-Za-z0-9_]*`; identifiers are spliced
/// into SQL text because they cannot be bound as parameters.
///
/// # Errors
///
/// Returns [`StateError::InvalidIdentifier`] for any other input.
pub fn validate_identifier(name: &str) -> error::Result<&str> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StateError::InvalidIdentifier(name.to_string()))
    }
}

fn key_param(key: &JoinKey) -> rusqlite::types::Value {
    match key {
        JoinKey::Int(v) => rusqlite::types::Value::Integer(*v),
        JoinKey::Text(s) => rusqlite::types::Value::Text(s.clone()),
    }
}

fn decode_value(column: &str, raw: ValueRef<'_>) -> error::Result<Value> {
    match raw {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(v) => Ok(Value::Int(v)),
        ValueRef::Real(v) => Ok(Value::Float(v)),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .map(|s| Value::Text(s.to_owned()))
            .map_err(|e| StateError::Decode {
                column: column.to_string(),
                reason: e.to_string(),
            }),
        ValueRef::Blob(_) => Err(StateError::Decode {
            column: column.to_string(),
            reason: "blob values are not supported".to_string(),
        }),
    }
}

fn decode_key(column: &str, raw: ValueRef<'_>) -> error::Result<JoinKey> {
    let value = decode_value(column, raw)?;
    JoinKey::from_value(&value).ok_or_else(|| StateError::Decode {
        column: column.to_string(),
        reason: format!("'{value}' is not a valid join key"),
    })
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

/// Which table a join stage probes and which columns it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSpec {
    pub table: String,
    pub key_column: String,
    /// Enrichment columns. The key column is always read as well.
    pub columns: Vec<String>,
}

impl RelationSpec {
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        key_column: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate every identifier in the spec.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidIdentifier`] for the first bad name.
    pub fn validate(&self) -> error::Result<()> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.key_column)?;
        for column in &self.columns {
            validate_identifier(column)?;
        }
        Ok(())
    }

    /// Selected columns, key first, without duplicates.
    fn selected_columns(&self) -> Vec<&str> {
        let mut selected = vec![self.key_column.as_str()];
        for column in &self.columns {
            if !selected.contains(&column.as_str()) {
                selected.push(column);
            }
        }
        selected
    }

    fn partition_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {key} >= ?1 ORDER BY {key} LIMIT ?2",
            self.selected_columns().join(", "),
            self.table,
            key = self.key_column,
        )
    }
}

/// A master-data table read through its own connection, one sorted
/// partition per [`PartitionLoader::fetch`] call.
pub struct SqliteRelation {
    conn: Connection,
    columns: Vec<String>,
    sql: String,
}

impl SqliteRelation {
    /// Open a read-only handle on the relation stored in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec holds invalid identifiers or the
    /// database cannot be opened.
    pub fn open(path: &Path, spec: &RelationSpec) -> error::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StateError::context("open relation", e))?;
        Self::with_connection(conn, spec)
    }

    /// Wrap an existing connection (e.g. an in-memory database in tests).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidIdentifier`] if the spec is invalid.
    pub fn with_connection(conn: Connection, spec: &RelationSpec) -> error::Result<Self> {
        spec.validate()?;
        Ok(Self {
            conn,
            columns: spec
                .selected_columns()
                .into_iter()
                .map(str::to_string)
                .collect(),
            sql: spec.partition_sql(),
        })
    }
}

impl PartitionLoader for SqliteRelation {
    fn fetch(
        &mut self,
        resume_key: &JoinKey,
        max_rows: usize,
    ) -> error::Result<Vec<PartitionRow>> {
        let limit = i64::try_from(max_rows).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare_cached(&self.sql)
            .map_err(|e| StateError::context("fetch_partition: prepare", e))?;
        let mut rows = stmt
            .query(rusqlite::params![key_param(resume_key), limit])
            .map_err(|e| StateError::context("fetch_partition: query", e))?;

        let mut partition = Vec::with_capacity(max_rows.min(1024));
        while let Some(row) = rows
            .next()
            .map_err(|e| StateError::context("fetch_partition: step", e))?
        {
            let key = decode_key(&self.columns[0], row.get_ref(0)?)?;
            let mut fields = Record::new();
            for (idx, column) in self.columns.iter().enumerate() {
                fields.insert(column.clone(), decode_value(column, row.get_ref(idx)?)?);
            }
            partition.push(PartitionRow { key, fields });
        }
        Ok(partition)
    }
}

// ---------------------------------------------------------------------------
// Fact sink
// ---------------------------------------------------------------------------

/// Batched writer for `Fact_Sales`, one transaction per batch.
pub struct SqliteFactSink {
    conn: Connection,
}

impl SqliteFactSink {
    /// Open a write handle on the warehouse at `path`, creating the fact
    /// table if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> error::Result<Self> {
        let conn = Connection::open(path).map_err(|e| StateError::context("open fact sink", e))?;
        Self::with_connection(conn)
    }

    /// Wrap an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn with_connection(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::context("fact sink schema", e))?;
        Ok(Self { conn })
    }
}

impl FactSink for SqliteFactSink {
    fn store(&mut self, batch: &[FactRecord]) -> error::Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|e| StateError::context("store_facts: begin tx", e))?;
        let mut count = 0u64;
        {
            let mut stmt = tx
                .prepare_cached(INSERT_FACT)
                .map_err(|e| StateError::context("store_facts: prepare", e))?;
            for fact in batch {
                stmt.execute(rusqlite::params![
                    fact.order_id,
                    fact.order_line_number,
                    fact.customer_key,
                    fact.product_key,
                    fact.store_key,
                    fact.supplier_key,
                    fact.date_key,
                    fact.quantity,
                    fact.unit_price,
                    fact.total_purchase_amount,
                    fact.discount_amount,
                    fact.weekend_flag,
                    fact.order_channel,
                ])
                .map_err(|e| StateError::context("store_facts: execute", e))?;
                count += 1;
            }
        }
        tx.commit()
            .map_err(|e| StateError::context("store_facts: commit", e))?;

        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Warehouse
// ---------------------------------------------------------------------------

/// `SQLite` warehouse: dimension lookups, table checks, and the run ledger.
///
/// Create with [`SqliteWarehouse::open`] for file-backed storage or
/// [`SqliteWarehouse::in_memory`] for tests.
pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
}

impl SqliteWarehouse {
    /// Open or create a warehouse database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created, or a
    /// `SQLite` error if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn =
            Connection::open(path).map_err(|e| StateError::context("open warehouse", e))?;
        Self::with_connection(conn)
    }

    /// Open an existing warehouse read-only. Nothing is created on disk and
    /// no schema is applied, so ledger writes through this handle fail.
    ///
    /// # Errors
    ///
    /// Returns a `SQLite` error if the file is missing or unreadable.
    pub fn open_existing(path: &Path) -> error::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StateError::context("open warehouse", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory warehouse (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database can't be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StateError::context("open warehouse", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::context("warehouse schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Run arbitrary DDL/DML on the warehouse connection. Used by tooling and
    /// tests that prepare master and dimension tables.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub fn execute_batch(&self, sql: &str) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(sql)
            .map_err(|e| StateError::context("execute_batch", e))
    }

    #[cfg(test)]
    fn get_run_row(&self, run_id: i64) -> error::Result<(String, i64, Option<String>, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status, records_loaded, finished_at, error_message FROM etl_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(StateError::from)
    }
}

impl Warehouse for SqliteWarehouse {
    fn load_dimension(
        &self,
        table: &str,
        natural_key: &str,
        surrogate_key: &str,
    ) -> error::Result<DimensionLookup> {
        let sql = format!(
            "SELECT {}, {} FROM {}",
            validate_identifier(natural_key)?,
            validate_identifier(surrogate_key)?,
            validate_identifier(table)?,
        );
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StateError::context("load_dimension: prepare", e))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| StateError::context("load_dimension: query", e))?;

        let mut pairs = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| StateError::context("load_dimension: step", e))?
        {
            let natural = decode_key(natural_key, row.get_ref(0)?)?;
            let surrogate = match decode_value(surrogate_key, row.get_ref(1)?)? {
                Value::Int(v) => v,
                other => {
                    return Err(StateError::Decode {
                        column: surrogate_key.to_string(),
                        reason: format!("surrogate key '{other}' is not an integer"),
                    })
                }
            };
            pairs.push((natural, surrogate));
        }

        tracing::debug!(table, keys = pairs.len(), "Loaded dimension lookup");
        Ok(DimensionLookup::from_pairs(table, pairs))
    }

    fn count_rows(&self, table: &str) -> error::Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", validate_identifier(table)?);
        let conn = self.lock_conn()?;
        let count: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| StateError::context("count_rows", e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO etl_runs (pipeline, status) VALUES (?1, ?2)",
            rusqlite::params![pipeline.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::context("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE etl_runs SET status = ?1, finished_at = datetime('now'), \
             records_streamed = ?2, records_joined = ?3, records_loaded = ?4, \
             records_dropped = ?5, error_message = ?6 \
             WHERE id = ?7",
            rusqlite::params![
                status.as_str(),
                stats.records_streamed as i64,
                stats.records_joined as i64,
                stats.records_loaded as i64,
                stats.records_dropped as i64,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::context("complete_run", e))?;
        Ok(())
    }
}
