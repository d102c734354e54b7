//! Read-back helpers and assertions over stored pipeline outputs.

use crate::io::cloud::ObjectIO;
use crate::io::parquet::{cell, decode_all, diagonal_concat, string_column};
use crate::locator::ShardLocator;
use crate::submission::{SubmissionKey, SubmissionRepository, SubmissionState};
use anyhow::Context;
use arrow::record_batch::RecordBatch;

/// Every shard under `dir`, merged in key order.
///
/// # Errors
/// Returns an error if a shard cannot be listed, fetched or decoded.
pub fn read_table(storage: &dyn ObjectIO, bucket: &str, dir: &str) -> anyhow::Result<RecordBatch> {
    let mut batches = Vec::new();
    for key in ShardLocator::new(storage).list(bucket, dir)? {
        let bytes = storage
            .get_object(bucket, &key)
            .with_context(|| format!("fetch {key}"))?;
        batches.extend(decode_all(bytes)?);
    }
    diagonal_concat(&batches)
}

/// Values of string column `name`, nulls as `None`.
#[must_use]
pub fn column_values(table: &RecordBatch, name: &str) -> Vec<Option<String>> {
    let column = string_column(table, name);
    (0..table.num_rows())
        .map(|row| cell(column, row).map(ToString::to_string))
        .collect()
}

/// A stored report split into its annotation and its header plus rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReport {
    pub annotation: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Fetch and parse the report at `bucket/key`.
///
/// # Errors
/// Returns an error if the report is missing or not valid CSV.
pub fn read_report(storage: &dyn ObjectIO, bucket: &str, key: &str) -> anyhow::Result<StoredReport> {
    let bytes = storage
        .get_object(bucket, key)
        .with_context(|| format!("fetch report {key}"))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes.as_slice());
    let mut records = reader
        .records()
        .map(|r| r.map(|rec| rec.iter().map(ToString::to_string).collect::<Vec<_>>()))
        .collect::<Result<Vec<_>, _>>()
        .context("parse report")?
        .into_iter();
    let annotation = records
        .next()
        .and_then(|r| r.into_iter().next())
        .context("report has no annotation")?;
    let header = records.next().unwrap_or_default();
    Ok(StoredReport {
        annotation,
        header,
        rows: records.collect(),
    })
}

/// Assert the stored state of submission `key`.
///
/// # Panics
///
/// Panics if the submission cannot be loaded or is in another state.
pub fn assert_state(repository: &dyn SubmissionRepository, key: &SubmissionKey, expected: SubmissionState) {
    let submission = repository
        .load(key)
        .unwrap_or_else(|e| panic!("submission {key} could not be loaded: {e}"));
    assert_eq!(
        submission.state, expected,
        "submission {key} state mismatch:\n  Expected: {expected}\n  Actual: {}",
        submission.state
    );
}
