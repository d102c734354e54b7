//! Capped, batched validation of a conversion shard set.
//!
//! The shard set is exposed to the rule engine as a lazy [`ShardSetSource`]:
//! one shard's bytes are fetched at a time and decoded window by window, so
//! peak memory is bounded by the batch size rather than by the submission.
//!
//! [`CappedFindings`] sits between the engine and storage. It counts every
//! finding the engine yields, but only lets findings through until the error
//! cap is reached; after that it keeps draining the engine so the counts stay
//! true. [`BatchedValidator::run`] persists what gets through as result
//! shards and records the true counts in the `.done_res` marker.

use crate::engine::{BatchStream, EngineError, FindingStream, RuleEngine, TableSource, ValidationContext};
use crate::error::{PipelineError, Result};
use crate::findings::{FindingBatch, FindingTotals, PHASE, SUBMISSION_ID};
use crate::io::cloud::ObjectIO;
use crate::io::parquet::{encode_batch, read_batches, with_constant_columns};
use crate::keys;
use crate::locator::ShardLocator;
use anyhow::Context;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use parquet::arrow::arrow_reader::ParquetRecordBatchReader;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ============================================================================
// Lazy shard-set source
// ============================================================================

/// A set of Parquet shards scanned in key order as one table.
pub struct ShardSetSource<'a> {
    storage: &'a dyn ObjectIO,
    bucket: String,
    keys: Vec<String>,
}

impl<'a> ShardSetSource<'a> {
    pub fn new(storage: &'a dyn ObjectIO, bucket: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            keys,
        }
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl TableSource for ShardSetSource<'_> {
    /// Schema of the first shard. Unreadable shards report `None` here and
    /// fail properly once scanned.
    fn schema(&self) -> Option<SchemaRef> {
        let first = self.keys.first()?;
        let bytes = self.storage.get_object(&self.bucket, first).ok()?;
        read_batches(bytes, 1).ok().map(|reader| reader.schema())
    }

    fn scan(&self, batch_size: usize) -> anyhow::Result<BatchStream<'_>> {
        Ok(Box::new(ShardScan {
            source: self,
            batch_size,
            next_shard: 0,
            current: None,
        }))
    }
}

struct ShardScan<'s> {
    source: &'s ShardSetSource<'s>,
    batch_size: usize,
    next_shard: usize,
    current: Option<ParquetRecordBatchReader>,
}

impl ShardScan<'_> {
    fn open_next(&mut self) -> anyhow::Result<bool> {
        let Some(key) = self.source.keys.get(self.next_shard) else {
            return Ok(false);
        };
        self.next_shard += 1;
        let bytes = self
            .source
            .storage
            .get_object(&self.source.bucket, key)
            .with_context(|| format!("fetch shard {key}"))?;
        self.current = Some(read_batches(bytes, self.batch_size).with_context(|| format!("open shard {key}"))?);
        Ok(true)
    }
}

impl Iterator for ShardScan<'_> {
    type Item = anyhow::Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = &mut self.current {
                match reader.next() {
                    Some(Ok(batch)) if batch.num_rows() == 0 => continue,
                    Some(Ok(batch)) => return Some(Ok(batch)),
                    Some(Err(e)) => {
                        self.current = None;
                        self.next_shard = self.source.keys.len();
                        return Some(Err(e.into()));
                    }
                    None => self.current = None,
                }
            }
            match self.open_next() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    self.next_shard = self.source.keys.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

// ============================================================================
// Error cap
// ============================================================================

/// Engine output with the error cap applied.
///
/// Yields only non-empty batches, truncating the batch that crosses the cap
/// so exactly `max_errors` findings get through in total. Counting continues
/// past the cap; [`CappedFindings::totals`] is the uncapped tally once the
/// iterator is exhausted.
pub struct CappedFindings<'a> {
    inner: FindingStream<'a>,
    max_errors: u64,
    passed: u64,
    totals: FindingTotals,
    cap_logged: bool,
}

impl<'a> CappedFindings<'a> {
    pub fn new(inner: FindingStream<'a>, max_errors: u64) -> Self {
        Self {
            inner,
            max_errors,
            passed: 0,
            totals: FindingTotals::default(),
            cap_logged: false,
        }
    }

    #[must_use]
    pub fn totals(&self) -> &FindingTotals {
        &self.totals
    }

    /// Findings let through so far.
    #[must_use]
    pub fn passed(&self) -> u64 {
        self.passed
    }

    /// Whether findings have been withheld because of the cap.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.totals.syntax_errors.total_count
            + self.totals.logic_errors.total_count
            + self.totals.logic_warnings.total_count
            > self.passed
    }
}

impl Iterator for CappedFindings<'_> {
    type Item = std::result::Result<FindingBatch, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let batch = match self.inner.next()? {
                Ok(batch) => batch,
                Err(e) => return Some(Err(e)),
            };
            self.totals.record_batch(batch.phase, &batch.findings);

            let remaining = self.max_errors.saturating_sub(self.passed);
            if batch.is_empty() {
                continue;
            }
            if remaining == 0 {
                if !self.cap_logged {
                    self.cap_logged = true;
                    debug!(max_errors = self.max_errors, "error cap reached; counting remaining findings only");
                }
                continue;
            }

            let rows = batch.findings.num_rows();
            let take = usize::try_from(remaining).map_or(rows, |r| r.min(rows));
            self.passed += take as u64;
            let findings = if take < rows {
                batch.findings.slice(0, take)
            } else {
                batch.findings
            };
            return Some(Ok(FindingBatch {
                phase: batch.phase,
                findings,
            }));
        }
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Body of the `.done_res` marker: what one validation run found and kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub submission_id: String,
    pub ruleset_version: String,
    pub shards_written: usize,
    pub findings_persisted: u64,
    /// Uncapped counts over the full scan.
    pub totals: FindingTotals,
    pub truncated: bool,
}

/// Runs the rule engine over conversion shards and persists capped results.
pub struct BatchedValidator<'a> {
    storage: &'a dyn ObjectIO,
    engine: &'a dyn RuleEngine,
    batch_size: usize,
    max_errors: u64,
}

impl<'a> BatchedValidator<'a> {
    pub fn new(storage: &'a dyn ObjectIO, engine: &'a dyn RuleEngine, batch_size: usize, max_errors: u64) -> Self {
        Self {
            storage,
            engine,
            batch_size: batch_size.max(1),
            max_errors,
        }
    }

    /// Validate `source` lazily, applying the error cap.
    ///
    /// # Errors
    /// Returns [`PipelineError::ValidationEngine`] if the engine refuses to start.
    pub fn validate<'s>(
        &'s self,
        source: &'s dyn TableSource,
        context: &'s ValidationContext,
    ) -> Result<CappedFindings<'s>> {
        let stream = self
            .engine
            .validate(source, context, self.batch_size, self.max_errors)?;
        Ok(CappedFindings::new(stream, self.max_errors))
    }

    /// Validate the conversion shards under `shard_dir` and write result
    /// shards plus the completion marker for `submission_id`.
    ///
    /// Each non-empty batch that passes the cap becomes one result shard,
    /// stamped with its `phase` and `submission_id`.
    ///
    /// # Errors
    /// Returns [`PipelineError::ValidationEngine`] for engine failures and
    /// [`PipelineError::ShardWrite`] if a result shard or the marker cannot
    /// be stored.
    pub fn run(
        &self,
        bucket: &str,
        shard_dir: &str,
        submission_id: &str,
        context: &ValidationContext,
    ) -> Result<ValidationSummary> {
        let result_dir = keys::result_dir(shard_dir)?;
        let marker_key = keys::validation_marker(shard_dir)?;
        let shard_keys = ShardLocator::new(self.storage).list(bucket, shard_dir)?;
        info!(
            bucket,
            shards = shard_keys.len(),
            submission = submission_id,
            result_dir = %result_dir,
            "validating shard set"
        );

        let source = ShardSetSource::new(self.storage, bucket, shard_keys);
        let mut findings = self.validate(&source, context)?;
        let mut written = 0usize;

        for batch in &mut findings {
            let batch = batch?;
            let stamped = with_constant_columns(
                &batch.findings,
                &[(PHASE, batch.phase.as_str()), (SUBMISSION_ID, submission_id)],
            )
            .map_err(|e| PipelineError::shard_write(&result_dir, e))?;
            let shard_key = keys::shard_key(&result_dir, written + 1);
            let bytes = encode_batch(&stamped).map_err(|e| PipelineError::shard_write(&shard_key, e))?;
            self.storage
                .put_object(bucket, &shard_key, &bytes)
                .map_err(|e| PipelineError::shard_write(&shard_key, e))?;
            written += 1;
            debug!(key = %shard_key, findings = stamped.num_rows(), phase = %batch.phase, "wrote result shard");
        }

        ShardLocator::new(self.storage)
            .prune(bucket, &result_dir, written)
            .map_err(|e| PipelineError::shard_write(&result_dir, e))?;

        let summary = ValidationSummary {
            submission_id: submission_id.to_string(),
            ruleset_version: self.engine.ruleset_version(),
            shards_written: written,
            findings_persisted: findings.passed(),
            totals: *findings.totals(),
            truncated: findings.truncated(),
        };
        if summary.truncated {
            warn!(
                submission = submission_id,
                persisted = summary.findings_persisted,
                total = summary.totals.total(),
                "findings truncated at error cap"
            );
        }

        let body = serde_json::to_vec(&summary).map_err(|e| PipelineError::shard_write(&marker_key, e))?;
        self.storage
            .put_object(bucket, &marker_key, &body)
            .map_err(|e| PipelineError::shard_write(&marker_key, e))?;
        info!(
            submission = submission_id,
            shards = written,
            findings = summary.findings_persisted,
            "validation complete"
        );
        Ok(summary)
    }
}
