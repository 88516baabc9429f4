//! Dynamic cell values for merge-time row processing.
//!
//! The merge core moves rows between parts without a compiled-in schema, so
//! cells are carried as a small dynamic enum. Columns are homogeneous; the
//! cross-type ordering below only exists to keep comparisons total.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Physical column type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    UInt64,
    Int64,
    Float64,
    String,
}

/// A single cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    UInt64(u64),
    Int64(i64),
    Float64(f64),
    String(String),
}

impl Value {
    /// The default cell for a column type, used when a column is absent
    /// from a source part or has been expired by TTL.
    pub fn default_of(data_type: DataType) -> Value {
        match data_type {
            DataType::UInt64 => Value::UInt64(0),
            DataType::Int64 => Value::Int64(0),
            DataType::Float64 => Value::Float64(0.0),
            DataType::String => Value::String(String::new()),
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::UInt64(_) => Some(DataType::UInt64),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::String(_) => Some(DataType::String),
        }
    }

    pub fn is_default(&self) -> bool {
        match self {
            Value::Null => true,
            Value::UInt64(v) => *v == 0,
            Value::Int64(v) => *v == 0,
            Value::Float64(v) => *v == 0.0,
            Value::String(v) => v.is_empty(),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt64(v) => Some(*v),
            Value::Int64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::UInt64(v) if *v <= i64::MAX as u64 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Uncompressed in-memory weight, used for progress accounting only.
    pub fn byte_size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::String(v) => 4 + v.len(),
            _ => 8,
        }
    }

    /// Same-type addition for Summing groups. `Null` is the identity.
    pub fn plus(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Null, v) | (v, Value::Null) => Some(v.clone()),
            (Value::UInt64(a), Value::UInt64(b)) => Some(Value::UInt64(a.wrapping_add(*b))),
            (Value::Int64(a), Value::Int64(b)) => Some(Value::Int64(a.wrapping_add(*b))),
            (Value::Float64(a), Value::Float64(b)) => Some(Value::Float64(a + b)),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::UInt64(_) => 1,
            Value::Int64(_) => 2,
            Value::Float64(_) => 3,
            Value::String(_) => 4,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::UInt64(a), Value::UInt64(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// Combine discipline for partial-aggregate columns and Graphite rollup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunc {
    Sum,
    Min,
    Max,
    Avg,
    Any,
    Last,
}

impl AggregateFunc {
    /// Fold `values` into one cell. An empty input yields `Null`.
    pub fn combine<'a>(&self, values: impl Iterator<Item = &'a Value>) -> Value {
        let non_null: Vec<&Value> = values.filter(|v| !matches!(v, Value::Null)).collect();
        if non_null.is_empty() {
            return Value::Null;
        }
        match self {
            AggregateFunc::Sum => {
                let mut acc = Value::Null;
                for v in non_null {
                    match acc.plus(v) {
                        Some(next) => acc = next,
                        None => return Value::Null,
                    }
                }
                acc
            }
            AggregateFunc::Min => non_null.into_iter().min().cloned().unwrap_or(Value::Null),
            AggregateFunc::Max => non_null.into_iter().max().cloned().unwrap_or(Value::Null),
            AggregateFunc::Avg => {
                let count = non_null.len() as f64;
                let sum: f64 = non_null.iter().filter_map(|v| v.as_f64()).sum();
                Value::Float64(sum / count)
            }
            AggregateFunc::Any => (*non_null.first().unwrap()).clone(),
            AggregateFunc::Last => (*non_null.last().unwrap()).clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total_for_floats() {
        assert!(Value::Float64(f64::NAN) > Value::Float64(1.0));
        assert_eq!(Value::Float64(0.5), Value::Float64(0.5));
        assert!(Value::Null < Value::UInt64(0));
    }

    #[test]
    fn plus_treats_null_as_identity() {
        assert_eq!(
            Value::Null.plus(&Value::Int64(3)),
            Some(Value::Int64(3))
        );
        assert_eq!(
            Value::UInt64(2).plus(&Value::UInt64(5)),
            Some(Value::UInt64(7))
        );
        assert_eq!(Value::UInt64(2).plus(&Value::Int64(5)), None);
    }

    #[test]
    fn combine_disciplines() {
        let vals = vec![Value::Int64(4), Value::Int64(2), Value::Int64(6)];
        assert_eq!(AggregateFunc::Sum.combine(vals.iter()), Value::Int64(12));
        assert_eq!(AggregateFunc::Min.combine(vals.iter()), Value::Int64(2));
        assert_eq!(AggregateFunc::Max.combine(vals.iter()), Value::Int64(6));
        assert_eq!(AggregateFunc::Any.combine(vals.iter()), Value::Int64(4));
        assert_eq!(AggregateFunc::Last.combine(vals.iter()), Value::Int64(6));
        assert_eq!(AggregateFunc::Avg.combine(vals.iter()), Value::Float64(4.0));
    }
}
