//! Error types for Eddy.
//!
//! Two families of errors exist. [`Error`] covers structural and consistency
//! failures that abort a batch or reject an ingress change. [`DataError`] covers
//! per-row expression failures which never abort a batch; the affected cell
//! becomes [`Value::Error`](crate::Value::Error) instead.

use crate::key::Key;
use crate::time::Timestamp;
use crate::types::DataType;

/// Result type alias for structural operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for row-level computations.
pub type DataResult<T> = std::result::Result<T, DataError>;

/// Structural and consistency errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A change arrived for a time that is already closed.
    #[error("change at time {time} is older than the last closed time {last_closed}")]
    LateChange { time: Timestamp, last_closed: Timestamp },

    /// A key would be present more than once, or removed while absent.
    #[error("multiplicity violation for key {key}: count would become {count}")]
    MultiplicityViolation { key: Key, count: i64 },

    /// Two inputs of a concat produced the same key.
    #[error("duplicate key {key} in {operator}")]
    DuplicateKey { operator: String, key: Key },

    #[error("column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("table not found: {name}")]
    TableNotFound { name: String },

    #[error("invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("type mismatch in column {column}: expected {expected:?}, got {got}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        got: String,
    },

    /// An iteration exceeded its step limit without reaching a fixed point.
    #[error("iteration did not converge within {limit} steps")]
    IterationLimit { limit: usize },

    /// An iteration body changed the key set of an iterated table.
    #[error("iteration changed the key set of table {table} without allow_key_growth")]
    IterationKeySetChanged { table: usize },

    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    /// A previous batch failed; the executor state is no longer trustworthy.
    #[error("executor is poisoned by an earlier failure")]
    ExecutorPoisoned,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl Error {
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Error::InvalidSchema {
            message: message.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn column_not_found(column: impl Into<String>) -> Self {
        Error::ColumnNotFound {
            column: column.into(),
        }
    }
}

/// Row-level expression errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("cannot coerce {value} to {target:?}")]
    TypeCoercion { value: String, target: DataType },

    #[error("missing column {index}")]
    MissingColumn { index: usize },

    #[error("integer overflow in {0}")]
    Overflow(&'static str),

    #[error("{0}")]
    Custom(String),
}

impl DataError {
    pub fn custom(message: impl Into<String>) -> Self {
        DataError::Custom(message.into())
    }

    pub fn coercion(value: &crate::Value, target: DataType) -> Self {
        DataError::TypeCoercion {
            value: value.to_string(),
            target,
        }
    }
}
