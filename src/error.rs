//! Error taxonomy shared by every pipeline component.
//!
//! Format helpers in [`crate::io`] return `anyhow::Result` with context attached;
//! the component boundary folds those into the typed [`PipelineError`] so the
//! stage runner can decide which terminal state a failure surfaces as.

use crate::engine::EngineError;
use crate::io::cloud::CloudIOError;
use thiserror::Error;

/// Result alias used by the pipeline components.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Every failure a pipeline stage can raise.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The source table could not be opened or decoded.
    #[error("failed to read source {key}: {message}")]
    SourceRead { key: String, message: String },

    /// A shard (or report/marker) upload failed.
    #[error("failed to write {key}: {message}")]
    ShardWrite { key: String, message: String },

    /// The rule engine failed or signalled malformed input.
    #[error("validation engine error: {0}")]
    ValidationEngine(#[from] EngineError),

    /// A result shard is missing or cannot be decoded during aggregation.
    #[error("invalid aggregation input {key}: {message}")]
    AggregationInput { key: String, message: String },

    /// A storage collaborator call failed outside of shard writes.
    #[error("storage error: {0}")]
    Storage(#[from] CloudIOError),

    /// The relational store rejected a read or a transactional write.
    #[error("repository error during {operation}: {message}")]
    Repository { operation: String, message: String },

    /// No submission row matches the identity derived from the key.
    #[error("submission not found: {0}")]
    SubmissionNotFound(String),

    /// A storage key does not follow the expected layout.
    #[error("invalid key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("secret error: {0}")]
    Secret(String),
}

impl PipelineError {
    pub fn source_read(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::SourceRead {
            key: key.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn shard_write(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ShardWrite {
            key: key.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn aggregation_input(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::AggregationInput {
            key: key.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn repository(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Repository {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether this failure means the upload itself is unusable.
    ///
    /// Malformed failures surface as `SubmissionUploadMalformed`; every other
    /// failure surfaces as `ValidationError` and stays eligible for retry.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        match self {
            Self::SourceRead { .. } => true,
            Self::ValidationEngine(e) => e.is_malformed(),
            _ => false,
        }
    }
}
