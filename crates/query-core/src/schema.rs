use crate::error::{QueryError, Result};
use crate::types::DataType;
use crate::value::{Tuple, Value};
use arrow::datatypes::{Field as ArrowField, Schema as ArrowSchema};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    data_type: DataType,
    #[serde(default = "default_nullable")]
    nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn to_arrow(&self) -> ArrowField {
        ArrowField::new(self.name.clone(), self.data_type.to_arrow(), self.nullable)
    }
}

/// Ordered column descriptor shared by every tuple on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self { fields: vec![] }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| QueryError::ColumnNotFound(name.to_string()))
    }

    /// Schema made of the given column indices, in that order.
    pub fn project(&self, indices: &[usize]) -> Result<Schema> {
        let fields = indices
            .iter()
            .map(|&i| {
                self.fields.get(i).cloned().ok_or_else(|| {
                    QueryError::SchemaError(format!(
                        "Column index {} out of bounds for {} columns",
                        i,
                        self.fields.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Schema::new(fields))
    }

    /// Check that a tuple conforms: arity, per-column type and nullability.
    pub fn validate(&self, tuple: &[Value]) -> Result<()> {
        if tuple.len() != self.fields.len() {
            return Err(QueryError::SchemaError(format!(
                "Tuple has {} values but schema has {} columns",
                tuple.len(),
                self.fields.len()
            )));
        }
        for (field, value) in self.fields.iter().zip(tuple) {
            if value.is_null() {
                if !field.nullable() {
                    return Err(QueryError::SchemaError(format!(
                        "Column {} is not nullable",
                        field.name()
                    )));
                }
            } else if !value.matches(field.data_type()) {
                return Err(QueryError::TypeMismatch {
                    expected: field.data_type().to_string(),
                    found: value.type_name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Render a tuple for trace logs, e.g. `[id: 1, name: a]`.
    pub fn format(&self, tuple: &Tuple) -> String {
        let cols: Vec<String> = self
            .fields
            .iter()
            .zip(tuple)
            .map(|(f, v)| format!("{}: {}", f.name(), v))
            .collect();
        format!("[{}]", cols.join(", "))
    }

    pub fn to_arrow(&self) -> ArrowSchema {
        let fields: Vec<ArrowField> = self.fields.iter().map(|f| f.to_arrow()).collect();
        ArrowSchema::new(fields)
    }

    pub fn from_arrow(schema: &ArrowSchema) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| {
                let data_type = DataType::from_arrow(f.data_type()).ok_or_else(|| {
                    QueryError::SchemaError(format!(
                        "Unsupported Arrow type {} for column {}",
                        f.data_type(),
                        f.name()
                    ))
                })?;
                Ok(Field::new(f.name(), data_type, f.is_nullable()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { fields })
    }
}
