//! Cross-shard aggregation of validation results.
//!
//! One aggregation run, in order:
//!
//! 1. gate on the submission's current state
//! 2. locate the result shards (none means no findings)
//! 3. merge them by column-name union
//! 4. take true totals, from the validator's marker when present and from
//!    the merged table otherwise
//! 5. write the report capped at `max_errors` rows
//! 6. group findings for the payload, capped per group
//! 7. derive the final state from the true totals
//! 8. commit state and payload together
//!
//! The merged table is the one place the pipeline materializes a whole
//! submission's findings; its size follows the persisted finding volume.

use crate::error::{PipelineError, Result};
use crate::findings::FindingTotals;
use crate::gate::{GateDecision, StateGate};
use crate::io::cloud::ObjectIO;
use crate::io::parquet::{decode_all, diagonal_concat};
use crate::keys;
use crate::locator::ShardLocator;
use crate::report::{ValidationResults, group_findings, render_report, validation_ids};
use crate::submission::{CommitOutcome, SubmissionKey, SubmissionRepository, SubmissionState, SubmissionUpdate};
use crate::validator::ValidationSummary;
use arrow::record_batch::RecordBatch;
use tracing::{info, warn};

/// Caps and layout options for aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorSettings {
    pub max_errors: usize,
    pub max_group_size: usize,
    /// Pick payload groups from the report slice instead of the full merge.
    pub use_max_error_slice: bool,
    /// Replaces the first key segment of the report key when set.
    pub report_root: Option<String>,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            max_errors: 1_000_000,
            max_group_size: 200,
            use_max_error_slice: false,
            report_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationOutcome {
    /// The submission is in an excluded state; nothing was committed.
    Skipped { state: SubmissionState },
    /// State and results were committed.
    Committed {
        state: SubmissionState,
        report_key: String,
        totals: FindingTotals,
        rows_shown: usize,
    },
}

pub struct ResultAggregator<'a> {
    storage: &'a dyn ObjectIO,
    repository: &'a dyn SubmissionRepository,
    settings: AggregatorSettings,
}

impl<'a> ResultAggregator<'a> {
    pub fn new(
        storage: &'a dyn ObjectIO,
        repository: &'a dyn SubmissionRepository,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            storage,
            repository,
            settings,
        }
    }

    /// Aggregate the results stored under `result_dir`.
    ///
    /// # Errors
    /// Returns [`PipelineError::AggregationInput`] if a result shard or the
    /// validator's marker cannot be read; the run aborts instead of counting
    /// short. Storage and repository failures propagate unchanged.
    pub fn aggregate(&self, bucket: &str, result_dir: &str) -> Result<AggregationOutcome> {
        let key = SubmissionKey::from_key(result_dir)?;
        let submission = match StateGate::new(self.repository).check(&key)? {
            GateDecision::Proceed(submission) => submission,
            GateDecision::Skip(state) => return Ok(AggregationOutcome::Skipped { state }),
        };

        let shard_keys = ShardLocator::new(self.storage).list(bucket, result_dir)?;
        let merged = self.merge(bucket, &shard_keys)?;
        let summary = self.load_summary(bucket, result_dir)?;
        let totals = match &summary {
            Some(summary) => summary.totals,
            None => FindingTotals::from_table(&merged),
        };
        info!(
            submission = %key,
            shards = shard_keys.len(),
            merged_rows = merged.num_rows(),
            errors = totals.errors(),
            warnings = totals.warnings(),
            "merged result shards"
        );

        let report_key = keys::report_key(result_dir, self.settings.report_root.as_deref())?;
        let (report, rows_shown) = render_report(&merged, &totals, self.settings.max_errors)
            .map_err(|e| PipelineError::shard_write(&report_key, e))?;
        self.storage
            .put_object(bucket, &report_key, &report)
            .map_err(|e| PipelineError::shard_write(&report_key, e))?;

        let groups = if self.settings.use_max_error_slice {
            let ids = validation_ids(&merged.slice(0, rows_shown));
            group_findings(&merged, self.settings.max_group_size, Some(ids.as_slice()))
        } else {
            group_findings(&merged, self.settings.max_group_size, None)
        };
        let results = ValidationResults::assemble(&totals, groups);

        let state = SubmissionState::from_totals(totals.errors(), totals.warnings());
        let update = SubmissionUpdate {
            state,
            validation_results: Some(results),
            ruleset_version: summary
                .map(|s| s.ruleset_version)
                .or(submission.ruleset_version),
        };
        if let CommitOutcome::Refused(current) = self.repository.commit(&key, &update)? {
            warn!(submission = %key, state = %current, "submission left its gate state during aggregation; not committed");
            return Ok(AggregationOutcome::Skipped { state: current });
        }
        info!(submission = %key, state = %state, report = %report_key, "aggregation committed");

        Ok(AggregationOutcome::Committed {
            state,
            report_key,
            totals,
            rows_shown,
        })
    }

    fn merge(&self, bucket: &str, shard_keys: &[String]) -> Result<RecordBatch> {
        let mut batches = Vec::new();
        for shard_key in shard_keys {
            let bytes = self
                .storage
                .get_object(bucket, shard_key)
                .map_err(|e| PipelineError::aggregation_input(shard_key, e))?;
            let decoded = decode_all(bytes).map_err(|e| PipelineError::aggregation_input(shard_key, e))?;
            batches.extend(decoded);
        }
        diagonal_concat(&batches).map_err(|e| PipelineError::aggregation_input(bucket, e))
    }

    fn load_summary(&self, bucket: &str, result_dir: &str) -> Result<Option<ValidationSummary>> {
        let marker_key = keys::validation_marker(result_dir)?;
        match self.storage.get_object(bucket, &marker_key) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PipelineError::aggregation_input(&marker_key, e)),
            Err(e) if e.is_not_found() => {
                warn!(marker = %marker_key, "no validation summary; counting persisted findings only");
                Ok(None)
            }
            Err(e) => Err(PipelineError::aggregation_input(&marker_key, e)),
        }
    }
}
