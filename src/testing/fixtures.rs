//! Pre-built submissions, uploads and rule sets for common testing scenarios.

use crate::engine::ValidationContext;
use crate::findings::{Phase, Severity};
use crate::io::cloud::ObjectIO;
use crate::submission::{InMemorySubmissionRepository, Submission, SubmissionKey, SubmissionState};
use crate::testing::rule_engine::{RowRule, RowRuleEngine};
use anyhow::Context;
use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// Header of every sample upload.
pub const SAMPLE_HEADER: [&str; 3] = ["uid", "loan_amount", "units"];

/// Version reported by [`sample_rule_engine`].
pub const SAMPLE_RULESET_VERSION: &str = "2024.1";

/// The submission every fixture refers to: `2024/TESTLEI0001/1`.
#[must_use]
pub fn sample_submission_key() -> SubmissionKey {
    SubmissionKey::new("2024", "TESTLEI0001", 1)
}

/// Upload key of `key`, as the filing front end stores it.
#[must_use]
pub fn upload_key(key: &SubmissionKey) -> String {
    format!("upload/{}/{}/{}.csv", key.period, key.lei, key.counter)
}

/// A repository holding the single submission `key` in `state`.
#[must_use]
pub fn seeded_repository(key: &SubmissionKey, state: SubmissionState) -> InMemorySubmissionRepository {
    let repository = InMemorySubmissionRepository::new();
    repository.insert(Submission::new(key.clone(), state));
    repository
}

/// A clean upload body of `rows` rows.
///
/// Every fourth row (rows 4, 8, ...) leaves `loan_amount` blank, which
/// [`sample_rule_engine`] reports as a warning and nothing else.
///
/// # Example
///
/// ```
/// use filing_pipeline::testing::sample_csv;
///
/// let body = sample_csv(4);
/// assert!(body.starts_with("uid,loan_amount,units\n"));
/// assert!(body.ends_with("UID00004,,1\n"));
/// ```
#[must_use]
pub fn sample_csv(rows: usize) -> String {
    let mut body = format!("{}\n", SAMPLE_HEADER.join(","));
    for i in 1..=rows {
        let amount = if i % 4 == 0 { String::new() } else { (i * 1000).to_string() };
        body.push_str(&format!("UID{i:05},{amount},1\n"));
    }
    body
}

/// An upload body from explicit `(uid, loan_amount, units)` rows.
#[must_use]
pub fn csv_body(rows: &[(&str, &str, &str)]) -> String {
    let mut body = format!("{}\n", SAMPLE_HEADER.join(","));
    for (uid, amount, units) in rows {
        body.push_str(&format!("{uid},{amount},{units}\n"));
    }
    body
}

/// Store a CSV body under `bucket/key`.
///
/// # Errors
/// Returns an error if the storage rejects the write.
pub fn put_csv(storage: &dyn ObjectIO, bucket: &str, key: &str, body: &str) -> anyhow::Result<()> {
    storage
        .put_object(bucket, key, body.as_bytes())
        .with_context(|| format!("store {bucket}/{key}"))
}

/// A `Utf8` batch from named columns of equal length.
///
/// # Panics
///
/// Panics if the columns differ in length.
#[must_use]
pub fn string_batch(columns: &[(&str, Vec<&str>)]) -> RecordBatch {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, _)| Field::new(*name, DataType::Utf8, false))
        .collect();
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|(_, values)| Arc::new(StringArray::from(values.clone())) as ArrayRef)
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).expect("columns have equal length")
}

/// A batch in the sample upload layout.
#[must_use]
pub fn sample_batch(rows: &[(&str, &str, &str)]) -> RecordBatch {
    string_batch(&[
        (SAMPLE_HEADER[0], rows.iter().map(|r| r.0).collect()),
        (SAMPLE_HEADER[1], rows.iter().map(|r| r.1).collect()),
        (SAMPLE_HEADER[2], rows.iter().map(|r| r.2).collect()),
    ])
}

fn is_number(value: &str) -> bool {
    value.parse::<f64>().is_ok_and(f64::is_finite)
}

/// Rules over the sample layout:
///
/// | id    | phase       | severity | fields               | passes when                          |
/// |-------|-------------|----------|----------------------|--------------------------------------|
/// | S0001 | Syntactical | Error    | uid                  | uid is not blank                     |
/// | E0100 | Logical     | Error    | loan_amount          | blank or numeric                     |
/// | W0200 | Logical     | Warning  | loan_amount          | not blank                            |
/// | E0300 | Logical     | Error    | units, loan_amount   | units is a positive integer, or the amount is blank |
#[must_use]
pub fn sample_rule_engine() -> RowRuleEngine {
    RowRuleEngine::new(SAMPLE_RULESET_VERSION)
        .with_rule(RowRule::new(
            "S0001",
            Phase::Syntactical,
            Severity::Error,
            &["uid"],
            |v: &[&str], _: &ValidationContext| !v[0].trim().is_empty(),
        ))
        .with_rule(RowRule::new(
            "E0100",
            Phase::Logical,
            Severity::Error,
            &["loan_amount"],
            |v: &[&str], _: &ValidationContext| v[0].is_empty() || is_number(v[0]),
        ))
        .with_rule(RowRule::new(
            "W0200",
            Phase::Logical,
            Severity::Warning,
            &["loan_amount"],
            |v: &[&str], _: &ValidationContext| !v[0].is_empty(),
        ))
        .with_rule(RowRule::new(
            "E0300",
            Phase::Logical,
            Severity::Error,
            &["units", "loan_amount"],
            |v: &[&str], _: &ValidationContext| v[1].is_empty() || v[0].parse::<u32>().is_ok_and(|u| u > 0),
        ))
}
