use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),
}

pub type Result<T> = std::result::Result<T, QueryError>;
