//! Cell values

use crate::node::Node;
use chrono::DateTime;
use chrono_tz::Tz;
use std::fmt;
use std::sync::Arc;

/// One cell of a table. `Null` is the missing marker.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Tz>),
    Node(Arc<Node>),
}

impl Value {
    /// Missing values, including NaN floats.
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if !f.is_nan() => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_time(&self) -> Option<&DateTime<Tz>> {
        match self {
            Value::Time(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_node(&self) -> Option<&Arc<Node>> {
        match self {
            Value::Node(n) => Some(n),
            _ => None,
        }
    }

    /// String form used when comparing rows; tolerates every cell type.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NaN"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) if x.is_nan() => f.write_str("NaN"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Node(n) => write!(f, "{}", n.path()),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Tz>> for Value {
    fn from(v: DateTime<Tz>) -> Self {
        Value::Time(v)
    }
}

impl From<Arc<Node>> for Value {
    fn from(v: Arc<Node>) -> Self {
        Value::Node(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Convert a text column to floats when every present cell parses.
///
/// Returns true when the column changed. Columns that are already numeric,
/// entirely missing or hold any unparsable cell are left alone.
pub fn cast_numeric(values: &mut [Value]) -> bool {
    let mut saw_text = false;
    for v in values.iter() {
        match v {
            v if v.is_null() => {}
            Value::Int(_) | Value::Float(_) => {}
            Value::Text(s) => {
                if s.trim().parse::<f64>().is_err() {
                    return false;
                }
                saw_text = true;
            }
            _ => return false,
        }
    }
    if !saw_text {
        return false;
    }
    for v in values.iter_mut() {
        if let Value::Text(s) = v {
            *v = s.trim().parse::<f64>().map_or(Value::Null, Value::Float);
        }
    }
    true
}
