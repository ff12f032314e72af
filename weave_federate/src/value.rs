//! Typed values carried on publications and inputs.
//!
//! Values are encoded with bincode on the wire; the declared type string of
//! an interface drives the defaults and the conversions applied on read.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use weave_core::{ErrorKind, WeaveError};

/// A published value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Double(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
    Vector(Vec<f64>),
    Bytes(Vec<u8>),
}

impl Value {
    /// The default a never-updated input reports, by declared type string.
    pub fn default_for(data_type: &str) -> Value {
        match data_type {
            "double" | "" => Value::Double(0.0),
            "int" | "integer" | "int64" => Value::Integer(0),
            "bool" | "boolean" => Value::Boolean(false),
            "string" => Value::String(String::new()),
            "vector" | "double_vector" => Value::Vector(Vec::new()),
            _ => Value::Bytes(Vec::new()),
        }
    }

    pub fn encode(&self) -> Result<Bytes, WeaveError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|err| WeaveError::new(ErrorKind::InvalidArgument, err.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Value, WeaveError> {
        bincode::deserialize(data)
            .map_err(|err| WeaveError::new(ErrorKind::Discarded, err.to_string()))
    }

    pub fn as_double(&self) -> f64 {
        match self {
            Value::Double(v) => *v,
            Value::Integer(v) => *v as f64,
            Value::Boolean(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            Value::String(s) => s.parse().unwrap_or(0.0),
            Value::Vector(v) => v.first().copied().unwrap_or(0.0),
            Value::Bytes(_) => 0.0,
        }
    }

    pub fn as_integer(&self) -> i64 {
        match self {
            Value::Integer(v) => *v,
            Value::Double(v) => *v as i64,
            Value::Boolean(v) => i64::from(*v),
            Value::String(s) => s.parse().unwrap_or(0),
            Value::Vector(v) => v.first().map(|f| *f as i64).unwrap_or(0),
            Value::Bytes(_) => 0,
        }
    }

    pub fn as_boolean(&self) -> bool {
        match self {
            Value::Boolean(v) => *v,
            Value::Double(v) => *v != 0.0,
            Value::Integer(v) => *v != 0,
            Value::String(s) => s == "true" || s == "1",
            Value::Vector(v) => !v.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Double(v) => v.to_string(),
            Value::Integer(v) => v.to_string(),
            Value::Boolean(v) => v.to_string(),
            Value::Vector(v) => format!("{v:?}"),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    pub fn as_vector(&self) -> Vec<f64> {
        match self {
            Value::Vector(v) => v.clone(),
            other => vec![other.as_double()],
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}

/// How a multi-sourced input folds its latest values into one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationMethod {
    #[default]
    None,
    Vectorize,
    And,
    Or,
    Sum,
    Diff,
    Max,
    Min,
    Average,
}

impl AggregationMethod {
    /// Fold values at read time. `None` keeps only the most recent.
    pub fn apply(self, values: &[Value]) -> Value {
        if values.is_empty() {
            return Value::Double(0.0);
        }
        match self {
            AggregationMethod::None => values.last().cloned().unwrap_or(Value::Double(0.0)),
            AggregationMethod::Vectorize => {
                Value::Vector(values.iter().map(Value::as_double).collect())
            }
            AggregationMethod::And => Value::Boolean(values.iter().all(Value::as_boolean)),
            AggregationMethod::Or => Value::Boolean(values.iter().any(Value::as_boolean)),
            AggregationMethod::Sum => {
                Value::Double(values.iter().map(Value::as_double).sum::<f64>())
            }
            AggregationMethod::Diff => {
                let first = values[0].as_double();
                let rest: f64 = values[1..].iter().map(Value::as_double).sum();
                Value::Double(first - rest)
            }
            AggregationMethod::Max => Value::Double(
                values
                    .iter()
                    .map(Value::as_double)
                    .fold(f64::NEG_INFINITY, f64::max),
            ),
            AggregationMethod::Min => Value::Double(
                values
                    .iter()
                    .map(Value::as_double)
                    .fold(f64::INFINITY, f64::min),
            ),
            AggregationMethod::Average => {
                let sum: f64 = values.iter().map(Value::as_double).sum();
                Value::Double(sum / values.len() as f64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for value in [
            Value::Double(27.5),
            Value::Integer(-3),
            Value::Boolean(true),
            Value::String("hello".into()),
            Value::Vector(vec![1.0, 2.5]),
            Value::Bytes(vec![0, 1, 2]),
        ] {
            let encoded = value.encode().unwrap();
            assert_eq!(Value::decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn conversions() {
        assert_eq!(Value::Integer(3).as_double(), 3.0);
        assert_eq!(Value::Double(2.7).as_integer(), 2);
        assert!(Value::String("true".into()).as_boolean());
        assert_eq!(Value::Double(1.5).as_string(), "1.5");
        assert_eq!(Value::default_for("double"), Value::Double(0.0));
        assert_eq!(Value::default_for("string"), Value::String(String::new()));
    }

    #[test]
    fn aggregation() {
        let values = [Value::Double(1.0), Value::Double(3.0)];
        assert_eq!(AggregationMethod::Sum.apply(&values), Value::Double(4.0));
        assert_eq!(AggregationMethod::Max.apply(&values), Value::Double(3.0));
        assert_eq!(AggregationMethod::Average.apply(&values), Value::Double(2.0));
        assert_eq!(
            AggregationMethod::Vectorize.apply(&values),
            Value::Vector(vec![1.0, 3.0])
        );
        assert_eq!(AggregationMethod::None.apply(&values), Value::Double(3.0));
    }
}
