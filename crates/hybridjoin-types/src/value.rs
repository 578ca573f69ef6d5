//! Field values and join keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Dynamically typed field value carried by stream tuples and relation rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Integer view. Text is parsed, floats are not truncated.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Null | Self::Float(_) => None,
        }
    }

    /// Floating point view. Integers widen, text is parsed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Null => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<JoinKey> for Value {
    fn from(key: JoinKey) -> Self {
        match key {
            JoinKey::Int(v) => Self::Int(v),
            JoinKey::Text(s) => Self::Text(s),
        }
    }
}

/// Natural identifier used to match stream tuples against relation rows.
///
/// Text that spells a canonical integer (`"42"`, but not `"042"` or `"+42"`)
/// is stored as [`JoinKey::Int`] by every constructor except the variant
/// itself, so an INTEGER stream field and a TEXT relation column holding the
/// same identifier produce equal keys.
///
/// The derived ordering places every integer key before every text key,
/// which is the order SQLite uses when sorting a mixed-affinity column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinKey {
    Int(i64),
    Text(String),
}

impl JoinKey {
    /// Key view of a value. Only integers and text can act as join keys.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(Self::Int(*v)),
            Value::Text(s) => Some(Self::from_text(s.clone())),
            Value::Null | Value::Float(_) => None,
        }
    }

    fn from_text(text: String) -> Self {
        match text.parse::<i64>() {
            Ok(v) if v.to_string() == text => Self::Int(v),
            _ => Self::Text(text),
        }
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for JoinKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for JoinKey {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for JoinKey {
    fn from(value: &str) -> Self {
        Self::from_text(value.to_string())
    }
}

impl From<String> for JoinKey {
    fn from(value: String) -> Self {
        Self::from_text(value)
    }
}
