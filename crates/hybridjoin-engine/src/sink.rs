//! Final-stage output: surrogate-key resolution and batched fact persistence.

use std::sync::Arc;

use chrono::{Datelike, NaiveDateTime, Weekday};
use hybridjoin_state::{DimensionLookup, FactSink};
use hybridjoin_types::fact::IN_STORE_CHANNEL;
use hybridjoin_types::{EnrichedTuple, FactRecord, Value};

use crate::config::types::{DEFAULT_BATCH_SIZE, DEFAULT_DROP_LOG_SAMPLES};
use crate::error::PipelineError;
use crate::reader::fields;
use crate::stage::{OutputStats, StageOutput};

/// Enrichment fields the product relation contributes.
pub mod enrichment {
    pub const STORE_ID: &str = "StoreID";
    pub const SUPPLIER_ID: &str = "SupplierID";
    pub const PRICE: &str = "Price";
}

/// Read-only surrogate-key lookups, loaded once before the run starts.
#[derive(Debug, Clone, Default)]
pub struct DimensionSet {
    pub customer: DimensionLookup,
    pub product: DimensionLookup,
    pub store: DimensionLookup,
    pub supplier: DimensionLookup,
    /// When present, a fact's date key must exist here.
    pub date: Option<DimensionLookup>,
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub batch_size: usize,
    /// Drops logged individually before switching to counting only.
    pub drop_log_samples: u64,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            drop_log_samples: DEFAULT_DROP_LOG_SAMPLES,
        }
    }
}

/// Why an enriched tuple could not become a fact.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DropCause {
    #[error("field '{0}' is missing")]
    MissingField(&'static str),
    #[error("field '{field}' has unusable value '{value}'")]
    InvalidField { field: &'static str, value: String },
    #[error("no {dimension} surrogate key for '{key}'")]
    UnknownKey { dimension: String, key: String },
}

fn field<'a>(tuple: &'a EnrichedTuple, name: &'static str) -> Result<&'a Value, DropCause> {
    match tuple.get(name) {
        None | Some(Value::Null) => Err(DropCause::MissingField(name)),
        Some(value) => Ok(value),
    }
}

fn resolve(
    lookup: &DimensionLookup,
    tuple: &EnrichedTuple,
    name: &'static str,
) -> Result<i64, DropCause> {
    let value = field(tuple, name)?;
    lookup
        .resolve_value(value)
        .ok_or_else(|| DropCause::UnknownKey {
            dimension: lookup.name().to_string(),
            key: value.to_string(),
        })
}

fn int_field(tuple: &EnrichedTuple, name: &'static str) -> Result<i64, DropCause> {
    let value = field(tuple, name)?;
    value.as_i64().ok_or_else(|| DropCause::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

fn float_field(tuple: &EnrichedTuple, name: &'static str) -> Result<f64, DropCause> {
    let value = field(tuple, name)?;
    value.as_f64().ok_or_else(|| DropCause::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

/// Calendar key in `YYYYMMDD` form.
#[must_use]
pub fn date_key(at: &NaiveDateTime) -> i64 {
    let date = at.date();
    i64::from(date.year()) * 10_000 + i64::from(date.month()) * 100 + i64::from(date.day())
}

/// `1` for Saturday and Sunday, `0` otherwise.
#[must_use]
pub fn weekend_flag(at: &NaiveDateTime) -> i64 {
    i64::from(matches!(at.weekday(), Weekday::Sat | Weekday::Sun))
}

/// Turns enriched tuples into facts and persists them in fixed-size batches.
pub struct SinkAdapter<S> {
    dims: Arc<DimensionSet>,
    sink: S,
    settings: SinkSettings,
    batch: Vec<FactRecord>,
    loaded: u64,
    dropped: u64,
    batches: u64,
}

impl<S: FactSink> SinkAdapter<S> {
    pub fn new(dims: Arc<DimensionSet>, sink: S, settings: SinkSettings) -> Self {
        let batch_size = settings.batch_size.max(1);
        Self {
            dims,
            sink,
            settings: SinkSettings {
                batch_size,
                ..settings
            },
            batch: Vec::with_capacity(batch_size),
            loaded: 0,
            dropped: 0,
            batches: 0,
        }
    }

    /// Facts waiting in the current batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Resolve surrogate keys and derive the fact's computed fields.
    ///
    /// # Errors
    ///
    /// Returns the [`DropCause`] for the first missing field or lookup miss.
    pub fn to_fact(&self, tuple: &EnrichedTuple) -> Result<FactRecord, DropCause> {
        let dims = &*self.dims;
        let customer_key = resolve(&dims.customer, tuple, fields::CUSTOMER_ID)?;
        let product_key = resolve(&dims.product, tuple, fields::PRODUCT_ID)?;
        let store_key = resolve(&dims.store, tuple, enrichment::STORE_ID)?;
        let supplier_key = resolve(&dims.supplier, tuple, enrichment::SUPPLIER_ID)?;

        let date_key = date_key(&tuple.event_time);
        if let Some(dates) = &dims.date {
            if dates.resolve_value(&Value::Int(date_key)).is_none() {
                return Err(DropCause::UnknownKey {
                    dimension: dates.name().to_string(),
                    key: date_key.to_string(),
                });
            }
        }

        let order_id = int_field(tuple, fields::ORDER_ID)?;
        let quantity = int_field(tuple, fields::QUANTITY)?;
        let unit_price = float_field(tuple, enrichment::PRICE)?;

        #[allow(clippy::cast_precision_loss)]
        let total_purchase_amount = quantity as f64 * unit_price;

        Ok(FactRecord {
            order_id,
            order_line_number: 1,
            customer_key,
            product_key,
            store_key,
            supplier_key,
            date_key,
            quantity,
            unit_price,
            total_purchase_amount,
            discount_amount: 0.0,
            weekend_flag: weekend_flag(&tuple.event_time),
            order_channel: IN_STORE_CHANNEL.to_string(),
        })
    }

    /// Append `fact` and persist the batch once it reaches the batch size.
    /// Takes `&mut self`, so append and flush form one exclusive unit.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Sink`] if persisting the batch fails.
    pub fn append_or_flush(&mut self, fact: FactRecord) -> Result<(), PipelineError> {
        self.batch.push(fact);
        if self.batch.len() >= self.settings.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Persist and clear the current batch, if non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Sink`] if the store fails. The batch is kept.
    pub fn flush(&mut self) -> Result<(), PipelineError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let stored = self.sink.store(&self.batch).map_err(PipelineError::Sink)?;
        self.loaded += stored;
        self.batches += 1;
        tracing::debug!(batch = self.batches, stored, total = self.loaded, "Fact batch persisted");
        self.batch.clear();
        Ok(())
    }

    fn record_drop(&mut self, tuple: &EnrichedTuple, cause: &DropCause) {
        self.dropped += 1;
        if self.dropped <= self.settings.drop_log_samples {
            let order_id = tuple.get(fields::ORDER_ID).cloned().unwrap_or(Value::Null);
            tracing::warn!(
                order_id = %order_id,
                cause = %cause,
                dropped = self.dropped,
                "Dropping enriched tuple"
            );
        }
    }
}

impl<S: FactSink> StageOutput for SinkAdapter<S> {
    fn emit(&mut self, tuple: EnrichedTuple) -> Result<(), PipelineError> {
        match self.to_fact(&tuple) {
            Ok(fact) => self.append_or_flush(fact),
            Err(cause) => {
                self.record_drop(&tuple, &cause);
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        self.flush()?;
        if self.dropped > self.settings.drop_log_samples {
            tracing::warn!(
                dropped = self.dropped,
                logged = self.settings.drop_log_samples,
                "Further dropped tuples were counted without logging"
            );
        }
        tracing::info!(loaded = self.loaded, dropped = self.dropped, batches = self.batches, "Fact sink flushed");
        Ok(())
    }

    fn stats(&self) -> OutputStats {
        OutputStats {
            forwarded: 0,
            loaded: self.loaded,
            dropped: self.dropped,
        }
    }
}
