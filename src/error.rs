//! Error types for trueno-ab
//!
//! Administrative operations return these explicitly. The request-path hooks
//! (`Engine::resolve`, `Engine::record`) never surface them: they degrade to
//! "no experiment" instead.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// trueno-ab error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed experiment definition, rejected before it can run
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Racing lifecycle transition or a second active experiment on a target
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown experiment, variant or metric
    #[error("{kind} not found: '{id}'")]
    NotFound {
        /// Kind of entity that was looked up
        kind: &'static str,
        /// Identifier that was not found
        id: String,
    },

    /// Transient write failure in the observation store
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Promotion could not be applied; the previous baseline is still live
    #[error("Promotion failed for experiment '{experiment_id}': {reason}\nLast-known-good configuration retained")]
    PromotionFailed {
        /// Experiment being promoted
        experiment_id: String,
        /// Why the promotion was rejected
        reason: String,
    },

    /// Engine configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Storage error (Arrow/Parquet observation log)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn experiment_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Experiment",
            id: id.into(),
        }
    }

    pub(crate) fn variant_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Variant",
            id: id.into(),
        }
    }
}
