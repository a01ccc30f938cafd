//! Typed values and tuples

use crate::types::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One row flowing through a pipeline. Its length always equals the column
/// count of the schema of the channel it travels on.
pub type Tuple = Vec<Value>;

/// A single column value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Decimal128(i128),
    Utf8(String),
    Binary(Vec<u8>),
    Date32(i32),
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may be stored in a column of `data_type`.
    /// `Null` matches every type; nullability is checked by the schema.
    pub fn matches(&self, data_type: &DataType) -> bool {
        matches!(
            (self, data_type),
            (Value::Null, _)
                | (Value::Boolean(_), DataType::Boolean)
                | (Value::Int8(_), DataType::Int8)
                | (Value::Int16(_), DataType::Int16)
                | (Value::Int32(_), DataType::Int32)
                | (Value::Int64(_), DataType::Int64)
                | (Value::Float32(_), DataType::Float32)
                | (Value::Float64(_), DataType::Float64)
                | (Value::Decimal128(_), DataType::Decimal128 { .. })
                | (Value::Utf8(_), DataType::Utf8)
                | (Value::Binary(_), DataType::Binary)
                | (Value::Date32(_), DataType::Date32)
                | (Value::Timestamp(_), DataType::Timestamp)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Boolean(_) => "Boolean",
            Value::Int8(_) => "Int8",
            Value::Int16(_) => "Int16",
            Value::Int32(_) => "Int32",
            Value::Int64(_) => "Int64",
            Value::Float32(_) => "Float32",
            Value::Float64(_) => "Float64",
            Value::Decimal128(_) => "Decimal128",
            Value::Utf8(_) => "Utf8",
            Value::Binary(_) => "Binary",
            Value::Date32(_) => "Date32",
            Value::Timestamp(_) => "Timestamp",
        }
    }
}

// Floats compare by bit pattern so that a value survives an encode/decode
// round trip as an equal value, NaN included.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int8(a), Value::Int8(b)) => a == b,
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Decimal128(a), Value::Decimal128(b)) => a == b,
            (Value::Utf8(a), Value::Utf8(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Date32(a), Value::Date32(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Decimal128(v) => write!(f, "{}", v),
            Value::Utf8(v) => write!(f, "{}", v),
            Value::Binary(v) => {
                write!(f, "0x")?;
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Value::Date32(v) => write!(f, "{}d", v),
            Value::Timestamp(v) => write!(f, "{}us", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
