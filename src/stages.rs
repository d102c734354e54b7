//! The three pipeline stages behind one [`Stage`] interface.
//!
//! A stage turns one [`StorageEvent`] into its durable output and, when
//! another stage should follow, names that stage's input. Stages never call
//! each other; the trigger carries the next event.
//!
//! On failure a stage marks the submission (`SubmissionUploadMalformed` for
//! unusable uploads, `ValidationError` otherwise) unless the submission sits
//! in an excluded state, logs the failure with the submission identity, and
//! returns the error so the trigger leaves the delivery for redelivery.

use crate::aggregator::{AggregationOutcome, AggregatorSettings, ResultAggregator};
use crate::convert::ShardWriter;
use crate::engine::{RuleEngine, ValidationContext};
use crate::error::{PipelineError, Result};
use crate::gate::{GateDecision, StateGate};
use crate::io::cloud::ObjectIO;
use crate::keys;
use crate::submission::{CommitOutcome, SubmissionKey, SubmissionRepository, SubmissionState, SubmissionUpdate};
use crate::validator::BatchedValidator;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

// ============================================================================
// Storage events
// ============================================================================

/// A `(bucket, key)` pair naming a stage input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub bucket: String,
    pub key: String,
}

#[derive(Deserialize)]
struct Notification {
    #[serde(rename = "Records", default)]
    records: Vec<NotificationRecord>,
    #[serde(rename = "responsePayload")]
    response_payload: Option<Box<Notification>>,
}

#[derive(Deserialize)]
struct NotificationRecord {
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: NamedRef,
    object: KeyRef,
}

#[derive(Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Deserialize)]
struct KeyRef {
    key: String,
}

impl StorageEvent {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Events carried by a storage notification body, possibly wrapped in a
    /// `responsePayload` envelope. Keys are URL-decoded.
    ///
    /// Returns `None` if the body is not a notification or carries no records.
    #[must_use]
    pub fn parse_notification(body: &str) -> Option<Vec<Self>> {
        let mut notification: Notification = serde_json::from_str(body).ok()?;
        while notification.records.is_empty() {
            notification = *notification.response_payload?;
        }
        Some(
            notification
                .records
                .into_iter()
                .map(|r| Self::new(r.s3.bucket.name, keys::decode_event_key(&r.s3.object.key)))
                .collect(),
        )
    }

    /// Render as a single-record notification body.
    #[must_use]
    pub fn to_notification(&self) -> String {
        json!({
            "Records": [{
                "s3": {
                    "bucket": { "name": self.bucket },
                    "object": { "key": keys::encode_event_key(&self.key) }
                }
            }]
        })
        .to_string()
    }
}

// ============================================================================
// Stage trait
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Output written; `next` is the input of the following stage.
    Forward(StorageEvent),
    /// Output written; nothing follows.
    Finished,
    /// The event was not this stage's business (or the gate refused it).
    Skipped(String),
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns the failure after the submission has been marked.
    fn process(&self, event: &StorageEvent) -> Result<StageOutcome>;
}

/// Mark the submission behind `key` as failed, then hand `err` back.
fn fail(stage: &str, repository: &dyn SubmissionRepository, key: &str, err: PipelineError) -> PipelineError {
    let state = if err.is_malformed() {
        SubmissionState::SubmissionUploadMalformed
    } else {
        SubmissionState::ValidationError
    };
    let Ok(sub_key) = SubmissionKey::from_key(key) else {
        error!(stage, key, error = %err, "stage failed for a key without submission identity");
        return err;
    };
    error!(stage, submission = %sub_key, key, error = %err, marking = %state, "stage failed");

    match StateGate::new(repository).check(&sub_key) {
        Ok(GateDecision::Proceed(_)) => {
            match repository.commit(&sub_key, &SubmissionUpdate::state(state)) {
                Ok(CommitOutcome::Applied) => {}
                Ok(CommitOutcome::Refused(current)) => {
                    info!(submission = %sub_key, state = %current, "submission became excluded; left unmarked");
                }
                Err(mark_err) => {
                    warn!(submission = %sub_key, error = %mark_err, "could not mark submission as failed");
                }
            }
        }
        Ok(GateDecision::Skip(current)) => {
            info!(submission = %sub_key, state = %current, "leaving excluded submission unmarked");
        }
        Err(load_err) => {
            warn!(submission = %sub_key, error = %load_err, "could not load submission to mark it failed");
        }
    }
    err
}

// ============================================================================
// Stages
// ============================================================================

pub struct ConvertStage {
    storage: Arc<dyn ObjectIO>,
    repository: Arc<dyn SubmissionRepository>,
    batch_size: usize,
}

impl ConvertStage {
    pub fn new(storage: Arc<dyn ObjectIO>, repository: Arc<dyn SubmissionRepository>, batch_size: usize) -> Self {
        Self {
            storage,
            repository,
            batch_size,
        }
    }
}

impl Stage for ConvertStage {
    fn name(&self) -> &'static str {
        "convert"
    }

    fn process(&self, event: &StorageEvent) -> Result<StageOutcome> {
        let key = event.key.as_str();
        if keys::is_report_key(key)
            || keys::is_shard_key(key)
            || key.ends_with(keys::CONVERSION_MARKER)
            || key.ends_with(keys::VALIDATION_MARKER)
        {
            return Ok(StageOutcome::Skipped(format!("{key} is a pipeline artifact")));
        }

        ShardWriter::new(self.storage.as_ref(), self.batch_size)
            .convert(&event.bucket, key)
            .map(|output| StageOutcome::Forward(StorageEvent::new(&event.bucket, output.marker_key)))
            .map_err(|e| fail(self.name(), self.repository.as_ref(), key, e))
    }
}

pub struct ValidateStage {
    storage: Arc<dyn ObjectIO>,
    repository: Arc<dyn SubmissionRepository>,
    engine: Arc<dyn RuleEngine>,
    batch_size: usize,
    max_errors: u64,
}

impl ValidateStage {
    pub fn new(
        storage: Arc<dyn ObjectIO>,
        repository: Arc<dyn SubmissionRepository>,
        engine: Arc<dyn RuleEngine>,
        batch_size: usize,
        max_errors: u64,
    ) -> Self {
        Self {
            storage,
            repository,
            engine,
            batch_size,
            max_errors,
        }
    }

    fn run(&self, event: &StorageEvent) -> Result<StageOutcome> {
        let shard_dir = keys::conversion_dir_for(&event.key)?;
        let sub_key = SubmissionKey::from_key(&shard_dir)?;
        if let GateDecision::Skip(state) = StateGate::new(self.repository.as_ref()).check(&sub_key)? {
            return Ok(StageOutcome::Skipped(format!("submission {sub_key} is {state}")));
        }

        let context = ValidationContext::new().with("lei", sub_key.lei.clone());
        BatchedValidator::new(self.storage.as_ref(), self.engine.as_ref(), self.batch_size, self.max_errors)
            .run(&event.bucket, &shard_dir, &sub_key.counter.to_string(), &context)?;
        Ok(StageOutcome::Forward(StorageEvent::new(
            &event.bucket,
            keys::validation_marker(&shard_dir)?,
        )))
    }
}

impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn process(&self, event: &StorageEvent) -> Result<StageOutcome> {
        if keys::is_shard_key(&event.key) || keys::is_report_key(&event.key) {
            return Ok(StageOutcome::Skipped(format!("{} is not a shard set", event.key)));
        }
        self.run(event)
            .map_err(|e| fail(self.name(), self.repository.as_ref(), &event.key, e))
    }
}

pub struct AggregateStage {
    storage: Arc<dyn ObjectIO>,
    repository: Arc<dyn SubmissionRepository>,
    settings: AggregatorSettings,
}

impl AggregateStage {
    pub fn new(
        storage: Arc<dyn ObjectIO>,
        repository: Arc<dyn SubmissionRepository>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            storage,
            repository,
            settings,
        }
    }

    fn run(&self, event: &StorageEvent) -> Result<StageOutcome> {
        let result_dir = keys::result_dir(&event.key)?;
        let aggregator = ResultAggregator::new(self.storage.as_ref(), self.repository.as_ref(), self.settings.clone());
        match aggregator.aggregate(&event.bucket, &result_dir)? {
            AggregationOutcome::Skipped { state } => Ok(StageOutcome::Skipped(format!(
                "submission behind {result_dir} is {state}"
            ))),
            AggregationOutcome::Committed { .. } => Ok(StageOutcome::Finished),
        }
    }
}

impl Stage for AggregateStage {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn process(&self, event: &StorageEvent) -> Result<StageOutcome> {
        if keys::is_shard_key(&event.key) || keys::is_report_key(&event.key) {
            return Ok(StageOutcome::Skipped(format!("{} is not a result set", event.key)));
        }
        self.run(event)
            .map_err(|e| fail(self.name(), self.repository.as_ref(), &event.key, e))
    }
}
