use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single attribute value in a document's data map.
///
/// Tagged union rather than dynamic dispatch so that type fidelity survives
/// a persist/load round trip (see invariant 2 in the testable-properties
/// list). `Timestamp` is kept distinct from `Int` even though both carry an
/// `i64` — they sort and serialize in different buckets, and TTL field
/// parsing only recognizes `Timestamp`/ISO-8601 strings/epoch-millis ints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(i64),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Null,
}

impl Value {
    /// Discriminant rank used for total ordering across variants.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Timestamp(_) => 4,
            Value::String(_) => 5,
            Value::List(_) => 6,
            Value::Map(_) => 7,
        }
    }

    /// The zero value for a variant of the same shape as `self`. Used by the
    /// index key-selector when a document is missing the indexed field: the
    /// selector yields this sentinel instead of skipping the document, which
    /// keeps range scans total (spec §4.3, §9).
    pub fn zero_like(&self) -> Value {
        match self {
            Value::String(_) => Value::String(String::new()),
            Value::Int(_) => Value::Int(0),
            Value::Float(_) => Value::Float(0.0),
            Value::Bool(_) => Value::Bool(false),
            Value::Timestamp(_) => Value::Timestamp(0),
            Value::List(_) => Value::List(Vec::new()),
            Value::Map(_) => Value::Map(BTreeMap::new()),
            Value::Null => Value::Null,
        }
    }

    /// Zero value for a named kind, used when creating an index before any
    /// document has supplied a value to infer shape from.
    pub fn zero_of_kind(kind: ValueKind) -> Value {
        match kind {
            ValueKind::String => Value::String(String::new()),
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Timestamp => Value::Timestamp(0),
        }
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::String(_) => Some(ValueKind::String),
            Value::Int(_) => Some(ValueKind::Int),
            Value::Float(_) => Some(ValueKind::Float),
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Timestamp(_) => Some(ValueKind::Timestamp),
            Value::List(_) | Value::Map(_) | Value::Null => None,
        }
    }

    /// Promote integers to floating point for mixed numeric comparisons
    /// (spec §4.5: "Numeric comparisons promote integers to floating point
    /// when mixed").
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Strict comparison used by the filter engine: values of incompatible
    /// kinds are simply unordered (never an error — spec §4.5).
    pub fn partial_compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.partial_cmp(b),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            _ => None,
        }
    }

    pub fn values_equal(&self, other: &Value) -> bool {
        matches!(self.partial_compare(other), Some(Ordering::Equal))
    }
}

/// Declared key type for a secondary index. Determines the sentinel used
/// when a document's indexed field is missing or null, and the numeric
/// promotion applied when the actual value differs in numeric sub-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
}

/// A total order over `Value`, used as the key type of secondary B-tree
/// indexes and for multi-field sort. Unlike `partial_compare`, this never
/// returns `None`: values of different shapes simply sort by rank, which
/// is safe because every key inside one index is produced by a single
/// key-selector and therefore shares a declared `ValueKind`.
impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_like_matches_shape() {
        assert_eq!(Value::String("x".into()).zero_like(), Value::String(String::new()));
        assert_eq!(Value::Int(5).zero_like(), Value::Int(0));
    }

    #[test]
    fn mixed_numeric_comparison_promotes() {
        let a = Value::Int(5);
        let b = Value::Float(5.0);
        assert_eq!(a.partial_compare(&b), Some(Ordering::Equal));
    }

    #[test]
    fn incompatible_kinds_have_no_order() {
        let a = Value::String("5".into());
        let b = Value::Int(5);
        assert_eq!(a.partial_compare(&b), None);
    }

    #[test]
    fn total_order_is_stable_for_btree_keys() {
        let mut values = vec![Value::Int(3), Value::Int(1), Value::Int(2)];
        values.sort();
        assert_eq!(values, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }
}
