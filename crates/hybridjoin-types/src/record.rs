//! Stream tuples, relation rows, and the enriched result of joining them.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::value::{JoinKey, Value};

/// Ordered field-name to value map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlay `other` onto this record; fields present in both take `other`'s value.
    pub fn merge(&mut self, other: &Record) {
        for (field, value) in &other.0 {
            self.0.insert(field.clone(), value.clone());
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One incoming transactional event.
///
/// A tuple carries the join keys of every stage it passes through as
/// ordinary fields; each stage extracts its own key by field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTuple {
    pub fields: Record,
    pub event_time: NaiveDateTime,
}

/// A stream tuple after a successful join. It is itself a stream tuple so it
/// can feed the next stage unchanged.
pub type EnrichedTuple = StreamTuple;

impl StreamTuple {
    #[must_use]
    pub fn new(fields: Record, event_time: NaiveDateTime) -> Self {
        Self { fields, event_time }
    }

    /// Join key stored under `field`, if present and key-typed.
    #[must_use]
    pub fn key(&self, field: &str) -> Option<JoinKey> {
        self.fields.get(field).and_then(JoinKey::from_value)
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Merge a matching relation row into this tuple. Relation fields win on
    /// name clashes; the event time is kept.
    #[must_use]
    pub fn enrich(mut self, row: &PartitionRow) -> EnrichedTuple {
        self.fields.merge(&row.fields);
        self
    }
}

/// A row fetched from a disk-resident relation, ordered by `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRow {
    pub key: JoinKey,
    pub fields: Record,
}

impl PartitionRow {
    #[must_use]
    pub fn new(key: impl Into<JoinKey>, fields: Record) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2019, 3, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn enrich_unions_fields_and_keeps_event_time() {
        let tuple = StreamTuple::new(
            Record::new()
                .with("Order_ID", 1)
                .with("Customer_ID", 1000)
                .with("note", "stream"),
            ts(),
        );
        let row = PartitionRow::new(
            1000,
            Record::new()
                .with("Customer_ID", 1000)
                .with("Gender", "F")
                .with("note", "disk"),
        );

        let enriched = tuple.enrich(&row);
        assert_eq!(enriched.get("Order_ID"), Some(&Value::Int(1)));
        assert_eq!(enriched.get("Gender"), Some(&Value::from("F")));
        assert_eq!(enriched.get("note"), Some(&Value::from("disk")));
        assert_eq!(enriched.event_time, ts());
        assert_eq!(enriched.fields.len(), 4);
    }

    #[test]
    fn key_extracts_by_field_name() {
        let tuple = StreamTuple::new(
            Record::new()
                .with("Customer_ID", 7)
                .with("Product_ID", "P0042")
                .with("Price", 9.5),
            ts(),
        );
        assert_eq!(tuple.key("Customer_ID"), Some(JoinKey::Int(7)));
        assert_eq!(tuple.key("Product_ID"), Some(JoinKey::from("P0042")));
        assert_eq!(tuple.key("Price"), None);
        assert_eq!(tuple.key("missing"), None);
    }

    #[test]
    fn record_collects_from_pairs() {
        let record: Record = vec![("a", Value::Int(1)), ("b", Value::Null)]
            .into_iter()
            .collect();
        assert_eq!(record.len(), 2);
        assert!(record.contains("b"));
        assert!(record.get("b").is_some_and(Value::is_null));
    }
}
