//! The seam between the pipeline and the rule engine.
//!
//! The pipeline never evaluates rules itself. It hands the engine a
//! [`TableSource`] that can be scanned lazily, window by window, plus a small
//! [`ValidationContext`], and consumes the [`FindingStream`] the engine
//! returns. Phase ordering and the Syntactical short-circuit are the engine's
//! business; how much of its output gets persisted is the pipeline's.

use crate::findings::FindingBatch;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use thiserror::Error;

/// A forward-only pass over a table, one window at a time.
pub type BatchStream<'a> = Box<dyn Iterator<Item = anyhow::Result<RecordBatch>> + Send + 'a>;

/// Lazily produced finding batches.
pub type FindingStream<'a> = Box<dyn Iterator<Item = Result<FindingBatch, EngineError>> + Send + 'a>;

/// Errors raised by a rule engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The input cannot be validated at all (missing columns, unparseable
    /// structure). Surfaces as a malformed upload.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Any other engine failure.
    #[error("rule engine failure: {0}")]
    Failed(String),
}

impl EngineError {
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// A table that can be scanned repeatedly without being materialized.
pub trait TableSource: Send + Sync {
    /// Column layout shared by every window, if known before scanning.
    fn schema(&self) -> Option<SchemaRef>;

    /// Start a new forward pass yielding windows of at most `batch_size` rows.
    ///
    /// # Errors
    /// Returns an error if the underlying data cannot be opened.
    fn scan(&self, batch_size: usize) -> anyhow::Result<BatchStream<'_>>;
}

/// Opaque key/value context handed to the rule engine (e.g. the filer's LEI).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationContext {
    values: HashMap<String, String>,
}

impl ValidationContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// A validation rule set.
pub trait RuleEngine: Send + Sync {
    /// Version of the rule set, recorded on the submission it validated.
    fn ruleset_version(&self) -> String;

    /// Validate `source`, producing findings lazily.
    ///
    /// Each item covers at most one window of `batch_size` rows of one phase
    /// and may be empty. `max_errors` is advisory: the caller enforces its own
    /// cap on what it keeps, so an engine that stops early only loses the
    /// caller its true totals.
    ///
    /// # Errors
    /// Returns an error if validation cannot start; failures during the scan
    /// are yielded as stream items.
    fn validate<'a>(
        &'a self,
        source: &'a dyn TableSource,
        context: &'a ValidationContext,
        batch_size: usize,
        max_errors: u64,
    ) -> Result<FindingStream<'a>, EngineError>;
}
