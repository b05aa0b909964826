//! Error types for Stowage

use crate::types::Shape;
use thiserror::Error;

/// Main error type for Stowage
///
/// Every backend translates its engine-specific failures into one of these
/// four kinds, so callers can branch on them without knowing which backend
/// is configured.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("WRONGTYPE key '{key}' holds a {actual} value, operation expects a {expected}")]
    TypeMismatch {
        key: String,
        expected: Shape,
        actual: Shape,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn type_mismatch(key: impl Into<String>, expected: Shape, actual: Shape) -> Self {
        StoreError::TypeMismatch {
            key: key.into(),
            expected,
            actual,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        StoreError::Connection(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        StoreError::Storage(msg.into())
    }

    /// Only connection failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, StoreError::TypeMismatch { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Validation(format!("invalid configuration: {}", err))
    }
}
