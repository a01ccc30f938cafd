use arrow::datatypes::{DataType as ArrowDataType, TimeUnit};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column types that can travel between operator instances.
///
/// The set is deliberately closed: every variant has a fixed wire layout in the
/// tuple codec and a matching Arrow type for result consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal128 { precision: u8, scale: i8 }, // NUMERIC/DECIMAL, unscaled i128
    Utf8,
    Binary,
    Date32,    // days since epoch
    Timestamp, // microseconds since epoch, no time zone
}

impl DataType {
    pub fn to_arrow(&self) -> ArrowDataType {
        match self {
            DataType::Boolean => ArrowDataType::Boolean,
            DataType::Int8 => ArrowDataType::Int8,
            DataType::Int16 => ArrowDataType::Int16,
            DataType::Int32 => ArrowDataType::Int32,
            DataType::Int64 => ArrowDataType::Int64,
            DataType::Float32 => ArrowDataType::Float32,
            DataType::Float64 => ArrowDataType::Float64,
            DataType::Decimal128 { precision, scale } => {
                ArrowDataType::Decimal128(*precision, *scale)
            }
            DataType::Utf8 => ArrowDataType::Utf8,
            DataType::Binary => ArrowDataType::Binary,
            DataType::Date32 => ArrowDataType::Date32,
            DataType::Timestamp => ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }

    /// Map an Arrow type back, if it has a transport counterpart.
    pub fn from_arrow(dt: &ArrowDataType) -> Option<Self> {
        let data_type = match dt {
            ArrowDataType::Boolean => DataType::Boolean,
            ArrowDataType::Int8 => DataType::Int8,
            ArrowDataType::Int16 => DataType::Int16,
            ArrowDataType::Int32 => DataType::Int32,
            ArrowDataType::Int64 => DataType::Int64,
            ArrowDataType::Float32 => DataType::Float32,
            ArrowDataType::Float64 => DataType::Float64,
            ArrowDataType::Decimal128(p, s) => DataType::Decimal128 {
                precision: *p,
                scale: *s,
            },
            ArrowDataType::Utf8 | ArrowDataType::LargeUtf8 => DataType::Utf8,
            ArrowDataType::Binary | ArrowDataType::LargeBinary => DataType::Binary,
            ArrowDataType::Date32 => DataType::Date32,
            ArrowDataType::Timestamp(TimeUnit::Microsecond, None) => DataType::Timestamp,
            _ => return None,
        };
        Some(data_type)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Decimal128 { precision, scale } => {
                write!(f, "Decimal128({}, {})", precision, scale)
            }
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrow_mapping_is_reversible() {
        let types = [
            DataType::Boolean,
            DataType::Int8,
            DataType::Int16,
            DataType::Int32,
            DataType::Int64,
            DataType::Float32,
            DataType::Float64,
            DataType::Decimal128 {
                precision: 10,
                scale: 2,
            },
            DataType::Utf8,
            DataType::Binary,
            DataType::Date32,
            DataType::Timestamp,
        ];
        for dt in types {
            assert_eq!(DataType::from_arrow(&dt.to_arrow()), Some(dt));
        }
    }

    #[test]
    fn test_unsupported_arrow_type() {
        assert_eq!(DataType::from_arrow(&ArrowDataType::Float16), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(DataType::Int64.to_string(), "Int64");
        let dec = DataType::Decimal128 {
            precision: 12,
            scale: 3,
        };
        assert_eq!(dec.to_string(), "Decimal128(12, 3)");
    }
}
