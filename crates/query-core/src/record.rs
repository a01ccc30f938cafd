//! Conversion of tuple streams into Arrow record batches
//!
//! Front-ends consume final result rows as Arrow data; the transport itself
//! never sees Arrow.

use crate::error::{QueryError, Result};
use crate::schema::Schema;
use crate::types::DataType;
use crate::value::{Tuple, Value};
use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float32Array,
    Float64Array, Int16Array, Int32Array, Int64Array, Int8Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use std::sync::Arc;

macro_rules! column {
    ($rows:expr, $idx:expr, $field:expr, $variant:ident, $array:ty) => {{
        let values = $rows
            .iter()
            .map(|row| match &row[$idx] {
                Value::Null => Ok(None),
                Value::$variant(v) => Ok(Some(v.clone())),
                other => Err(mismatch($field.data_type(), other)),
            })
            .collect::<Result<Vec<_>>>()?;
        Arc::new(<$array>::from(values)) as ArrayRef
    }};
}

fn mismatch(expected: &DataType, found: &Value) -> QueryError {
    QueryError::TypeMismatch {
        expected: expected.to_string(),
        found: found.type_name().to_string(),
    }
}

/// Build a record batch from tuples conforming to `schema`.
pub fn tuples_to_record_batch(schema: &Schema, rows: &[Tuple]) -> Result<RecordBatch> {
    for row in rows {
        if row.len() != schema.len() {
            return Err(QueryError::SchemaError(format!(
                "Tuple has {} values but schema has {} columns",
                row.len(),
                schema.len()
            )));
        }
    }

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.len());
    for (idx, field) in schema.fields().iter().enumerate() {
        let array = match field.data_type() {
            DataType::Boolean => column!(rows, idx, field, Boolean, BooleanArray),
            DataType::Int8 => column!(rows, idx, field, Int8, Int8Array),
            DataType::Int16 => column!(rows, idx, field, Int16, Int16Array),
            DataType::Int32 => column!(rows, idx, field, Int32, Int32Array),
            DataType::Int64 => column!(rows, idx, field, Int64, Int64Array),
            DataType::Float32 => column!(rows, idx, field, Float32, Float32Array),
            DataType::Float64 => column!(rows, idx, field, Float64, Float64Array),
            DataType::Utf8 => column!(rows, idx, field, Utf8, StringArray),
            DataType::Date32 => column!(rows, idx, field, Date32, Date32Array),
            DataType::Timestamp => {
                column!(rows, idx, field, Timestamp, TimestampMicrosecondArray)
            }
            DataType::Decimal128 { precision, scale } => {
                let values = rows
                    .iter()
                    .map(|row| match &row[idx] {
                        Value::Null => Ok(None),
                        Value::Decimal128(v) => Ok(Some(*v)),
                        other => Err(mismatch(field.data_type(), other)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let array =
                    Decimal128Array::from(values).with_precision_and_scale(*precision, *scale)?;
                Arc::new(array) as ArrayRef
            }
            DataType::Binary => {
                let values = rows
                    .iter()
                    .map(|row| match &row[idx] {
                        Value::Null => Ok(None),
                        Value::Binary(v) => Ok(Some(v.as_slice())),
                        other => Err(mismatch(field.data_type(), other)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(BinaryArray::from_opt_vec(values)) as ArrayRef
            }
        };
        columns.push(array);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    let batch =
        RecordBatch::try_new_with_options(Arc::new(schema.to_arrow()), columns, &options)?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use arrow::array::Array;

    #[test]
    fn test_build_batch() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new(
                "price",
                DataType::Decimal128 {
                    precision: 10,
                    scale: 2,
                },
                true,
            ),
        ]);
        let rows = vec![
            vec![Value::Int64(1), Value::from("a"), Value::Decimal128(1050)],
            vec![Value::Int64(2), Value::Null, Value::Null],
        ];

        let batch = tuples_to_record_batch(&schema, &rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 3);

        let names = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "a");
        assert!(names.is_null(1));
    }

    #[test]
    fn test_type_mismatch() {
        let schema = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        let rows = vec![vec![Value::Int32(1)]];
        assert!(matches!(
            tuples_to_record_batch(&schema, &rows),
            Err(QueryError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_schema_keeps_row_count() {
        let batch = tuples_to_record_batch(&Schema::empty(), &[vec![], vec![]]).unwrap();
        assert_eq!(batch.num_rows(), 2);
    }
}
