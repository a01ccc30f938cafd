//! Error types for distributed execution

use crate::fin::Failure;
use thiserror::Error;

/// Errors that can occur while building, initializing or driving a fragment
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Operator configuration is missing a required field or is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A runtime resource (listener, connection, tag) could not be acquired
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Wire bytes could not be decoded, or a value could not be encoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// An upstream fragment terminated its stream with a failure
    #[error("Upstream failure from {}: {}", .0.origin, .0.message)]
    UpstreamFailure(Failure),

    /// Network communication error on an established channel
    #[error("Network error: {0}")]
    Network(String),

    /// The completion protocol was broken (duplicate or missing Fin)
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The bounded queue was closed while an operator still used it
    #[error("Queue closed")]
    QueueClosed,

    /// Data-path failure inside an operator
    #[error("Execution error: {0}")]
    Execution(String),

    /// Tuple model error
    #[error("Query error: {0}")]
    Query(#[from] query_core::QueryError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for distributed operations
pub type Result<T> = std::result::Result<T, DistributedError>;
