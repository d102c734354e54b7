//! # Filing Pipeline
//!
//! A **batch validation pipeline** for regulatory filing submissions. An uploaded
//! delimited-text submission is converted into Parquet shards, validated by a
//! pluggable rule engine in bounded memory, and the findings are aggregated into
//! a downloadable report, a grouped JSON payload and a final submission state.
//!
//! ## Key Features
//!
//! - **Chunked conversion** - CSV uploads become fixed-size Parquet shards; blank
//!   cells stay blank and only one chunk is ever held in memory
//! - **Capped validation** - findings persist up to a configurable error cap while
//!   the true totals keep counting over the whole submission
//! - **Schema-union aggregation** - result shards with different column sets merge
//!   into one table, missing columns filled with nulls
//! - **State gate** - submissions already accepted, expired or malformed are never
//!   touched again
//! - **At-least-once workers** - deliveries are acknowledged only after the stage's
//!   output is durable; every stage is safe to repeat
//!
//! ## Quick Start
//!
//! ```
//! use filing_pipeline::io::cloud::FakeObjectIO;
//! use filing_pipeline::testing::*;
//! use filing_pipeline::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let storage = FakeObjectIO::new();
//! let key = sample_submission_key();
//! let repository = seeded_repository(&key, SubmissionState::SubmissionUploaded);
//! put_csv(&storage, "filings", &upload_key(&key), &sample_csv(8))?;
//!
//! let converted = ShardWriter::new(&storage, 5).convert("filings", &upload_key(&key))?;
//! let engine = sample_rule_engine();
//! let context = ValidationContext::new().with("lei", key.lei.clone());
//! BatchedValidator::new(&storage, &engine, 5, 100).run("filings", &converted.shard_dir, "1", &context)?;
//!
//! let result_dir = keys::result_dir(&converted.shard_dir)?;
//! let outcome = ResultAggregator::new(&storage, &repository, AggregatorSettings::default())
//!     .aggregate("filings", &result_dir)?;
//! assert!(matches!(
//!     outcome,
//!     AggregationOutcome::Committed { state: SubmissionState::ValidationWithWarnings, .. }
//! ));
//! # Ok(())
//! # }
//! ```
//!
//! ## Stages
//!
//! | stage                         | input                  | output                                  |
//! |-------------------------------|------------------------|-----------------------------------------|
//! | [`ConvertStage`]              | upload key             | `_pqs/` shards, `.done_pqs` marker      |
//! | [`ValidateStage`]             | `.done_pqs` marker     | `_res/` shards, `.done_res` marker      |
//! | [`AggregateStage`]            | `.done_res` marker     | report, payload and state commit        |
//!
//! Each stage runs behind a [`Worker`] fed by a [`Trigger`]: a queue of storage
//! notifications ([`QueueTrigger`]) or in-process deliveries ([`DirectTrigger`]).
//! [`keys`] documents the layout every stage derives its keys from.
//!
//! ## Feature Flags
//!
//! - `parallel-workers` - handle a batch of deliveries concurrently on rayon
//! - `json-logs` - allow `LOG_FORMAT=json` structured log output
//!
//! ## Module Overview
//!
//! - [`convert`] - CSV to Parquet shards
//! - [`engine`] - the rule-engine seam and the table it validates
//! - [`validator`] - capped, batched validation of a shard set
//! - [`aggregator`] - merge, report, payload and final state
//! - [`gate`] / [`submission`] - submission states and their store
//! - [`stages`] / [`worker`] - stage wiring and delivery handling
//! - [`config`] / [`logging`] / [`secrets`] - process setup
//! - [`io`] - storage collaborators and the CSV and Parquet codecs
//! - [`testing`] - fixtures and a reference rule engine for tests

pub mod aggregator;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod findings;
pub mod gate;
pub mod io;
pub mod keys;
pub mod locator;
pub mod logging;
pub mod report;
pub mod secrets;
pub mod stages;
pub mod submission;
pub mod testing;
pub mod validator;
pub mod worker;

pub use aggregator::{AggregationOutcome, AggregatorSettings, ResultAggregator};
pub use config::{PipelineConfig, StorageMode};
pub use convert::{ConversionOutput, ConversionSummary, ShardWriter};
pub use engine::{EngineError, RuleEngine, TableSource, ValidationContext};
pub use error::{PipelineError, Result};
pub use findings::{Finding, FindingBatch, FindingTotals, Phase, Scope, ScopeCounts, Severity};
pub use gate::{GateDecision, StateGate};
pub use locator::ShardLocator;
pub use logging::{LogFormat, LoggingConfig, init_logging};
pub use report::ValidationResults;
pub use secrets::DbCredentials;
pub use stages::{AggregateStage, ConvertStage, Stage, StageOutcome, StorageEvent, ValidateStage};
pub use submission::{
    CommitOutcome, InMemorySubmissionRepository, SqlSubmissionRepository, Submission, SubmissionKey,
    SubmissionRepository, SubmissionState, SubmissionUpdate,
};
pub use validator::{BatchedValidator, CappedFindings, ShardSetSource, ValidationSummary};
pub use worker::{Delivery, DeliveryReport, DirectTrigger, QueueTrigger, Trigger, Worker, WorkerMode};
