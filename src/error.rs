//! Error types for the store collaborator, the loaders, and configuration.

use std::time::Duration;

use thiserror::Error;

use crate::data::IntoValuesError;

/// Result type for bulk reads.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for loader calls.
pub type LoadResult<T> = Result<T, LoadError>;

/// A failed bulk read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("store rejected the query: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether retrying the same read could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(..) | StoreError::Timeout(..))
    }
}

/// The error every caller of a failed batch receives. It is `Clone` because
/// one failure is shared by all the keys of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("bulk read failed: {0}")]
    Store(#[from] StoreError),

    /// The batch function broke the one-value-per-key contract.
    #[error("batch result does not line up with its keys: {0}")]
    Integrity(#[from] IntoValuesError),

    /// Raised under [`ProjectionPolicy::Reject`][crate::ProjectionPolicy::Reject]
    /// when callers in one batch asked for different fields.
    #[error("batch for `{collection}` mixes {distinct} different projections")]
    HeterogeneousProjection { collection: String, distinct: usize },
}

impl LoadError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, LoadError::Integrity(..))
    }
}

/// A loader configuration that couldn't be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid loader configuration: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err.to_string())
    }
}
