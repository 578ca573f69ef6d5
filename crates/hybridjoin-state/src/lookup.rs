//! Read-only natural-key to surrogate-key mapping.

use std::collections::HashMap;

use hybridjoin_types::{JoinKey, Value};

/// Surrogate-key lookup for one dimension, populated once before the
/// pipeline starts and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct DimensionLookup {
    name: String,
    keys: HashMap<JoinKey, i64>,
}

impl DimensionLookup {
    #[must_use]
    pub fn new(name: impl Into<String>, keys: HashMap<JoinKey, i64>) -> Self {
        Self {
            name: name.into(),
            keys,
        }
    }

    /// Build from `(natural, surrogate)` pairs. Later duplicates win.
    pub fn from_pairs<K, I>(name: impl Into<String>, pairs: I) -> Self
    where
        K: Into<JoinKey>,
        I: IntoIterator<Item = (K, i64)>,
    {
        Self::new(
            name,
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )
    }

    #[must_use]
    pub fn resolve(&self, natural_key: &JoinKey) -> Option<i64> {
        self.keys.get(natural_key).copied()
    }

    /// Resolve a field value. Integer and canonical integer text share one
    /// key already; padded text such as `" 42"` is retried as an integer.
    #[must_use]
    pub fn resolve_value(&self, value: &Value) -> Option<i64> {
        let key = JoinKey::from_value(value)?;
        self.resolve(&key).or_else(|| match &key {
            JoinKey::Text(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|v| self.resolve(&JoinKey::Int(v))),
            JoinKey::Int(_) => None,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
