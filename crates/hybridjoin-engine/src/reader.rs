//! CSV reader for the transactional event file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use hybridjoin_types::{Record, StreamTuple};
use serde::Deserialize;

use crate::error::PipelineError;

/// Stream field names produced by [`CsvEventReader`].
pub mod fields {
    pub const ORDER_ID: &str = "Order_ID";
    pub const CUSTOMER_ID: &str = "Customer_ID";
    pub const PRODUCT_ID: &str = "Product_ID";
    pub const QUANTITY: &str = "quantity";
}

#[derive(Debug, Deserialize)]
struct CsvEvent {
    #[serde(rename = "orderID", alias = "Order_ID")]
    order_id: i64,
    #[serde(rename = "Customer_ID")]
    customer_id: i64,
    #[serde(rename = "Product_ID")]
    product_id: String,
    quantity: i64,
    date: String,
}

fn parse_event_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Reads transaction rows in file order. Unknown columns (such as a leading
/// unnamed index) are ignored.
pub struct CsvEventReader<R> {
    records: csv::DeserializeRecordsIntoIter<R, CsvEvent>,
    row: u64,
}

impl CsvEventReader<File> {
    /// Open the event file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Source`] if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| {
            PipelineError::Source(format!("cannot open event file {}: {e}", path.display()))
        })?;
        Ok(Self::from_reader(file))
    }
}

impl<R: Read> CsvEventReader<R> {
    pub fn from_reader(reader: R) -> Self {
        let records = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader)
            .into_deserialize();
        Self { records, row: 0 }
    }

    fn to_tuple(&self, event: CsvEvent) -> Result<StreamTuple, PipelineError> {
        let event_time = parse_event_time(&event.date).ok_or_else(|| {
            PipelineError::Source(format!(
                "row {}: unparseable date '{}'",
                self.row, event.date
            ))
        })?;
        Ok(StreamTuple::new(
            Record::new()
                .with(fields::ORDER_ID, event.order_id)
                .with(fields::CUSTOMER_ID, event.customer_id)
                .with(fields::PRODUCT_ID, event.product_id)
                .with(fields::QUANTITY, event.quantity),
            event_time,
        ))
    }
}

impl<R: Read> Iterator for CsvEventReader<R> {
    type Item = Result<StreamTuple, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        self.row += 1;
        Some(
            record
                .map_err(|e| PipelineError::Source(format!("row {}: {e}", self.row)))
                .and_then(|event| self.to_tuple(event)),
        )
    }
}
