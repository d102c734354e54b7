// Integration tests for result aggregation: merge, report, payload and state

use anyhow::Result;
use filing_pipeline::findings::{Finding, findings_to_batch};
use filing_pipeline::io::cloud::{FakeObjectIO, ObjectIO};
use filing_pipeline::io::parquet::{encode_batch, with_constant_columns};
use filing_pipeline::testing::*;
use filing_pipeline::{
    AggregationOutcome, AggregatorSettings, BatchedValidator, InMemorySubmissionRepository, Phase,
    PipelineError, ResultAggregator, Scope, Severity, ShardWriter, SubmissionRepository, SubmissionState,
    ValidationContext, keys,
};

const BUCKET: &str = "filings";
const RESULT_DIR: &str = "upload/2024/TESTLEI0001/1_res/";
const REPORT_KEY: &str = "upload/2024/TESTLEI0001/1_report.csv";

fn validated(storage: &FakeObjectIO, body: &str, max_errors: u64) -> Result<()> {
    let key = upload_key(&sample_submission_key());
    put_csv(storage, BUCKET, &key, body)?;
    let shard_dir = ShardWriter::new(storage, 4).convert(BUCKET, &key)?.shard_dir;
    let engine = sample_rule_engine();
    let context = ValidationContext::new().with("lei", "TESTLEI0001");
    BatchedValidator::new(storage, &engine, 4, max_errors).run(BUCKET, &shard_dir, "1", &context)?;
    Ok(())
}

fn bad_amounts(n: usize) -> String {
    let uids: Vec<String> = (1..=n).map(|i| format!("U{i}")).collect();
    let rows: Vec<(&str, &str, &str)> = uids.iter().map(|u| (u.as_str(), "x", "1")).collect();
    csv_body(&rows)
}

fn finding(id: &str, severity: Severity, record_no: u64, fields: &[(&str, &str)]) -> Finding {
    Finding {
        validation_id: id.to_string(),
        severity,
        scope: if fields.len() == 1 { Scope::SingleField } else { Scope::MultiField },
        record_no,
        fields: fields.iter().map(|(n, v)| ((*n).to_string(), (*v).to_string())).collect(),
    }
}

fn put_findings(storage: &FakeObjectIO, index: usize, phase: Phase, findings: &[Finding]) -> Result<()> {
    let batch = with_constant_columns(
        &findings_to_batch(findings)?,
        &[("phase", phase.as_str()), ("submission_id", "1")],
    )?;
    storage.put_object(BUCKET, &keys::shard_key(RESULT_DIR, index), &encode_batch(&batch)?)?;
    Ok(())
}

fn settings(max_errors: usize, max_group_size: usize) -> AggregatorSettings {
    AggregatorSettings {
        max_errors,
        max_group_size,
        ..AggregatorSettings::default()
    }
}

fn uploaded() -> InMemorySubmissionRepository {
    seeded_repository(&sample_submission_key(), SubmissionState::ValidationInProgress)
}

#[test]
fn report_is_capped_but_annotated_with_true_totals() -> Result<()> {
    let storage = FakeObjectIO::new();
    let repository = uploaded();
    validated(&storage, &bad_amounts(15), 10)?;

    let outcome = ResultAggregator::new(&storage, &repository, settings(10, 200)).aggregate(BUCKET, RESULT_DIR)?;

    let AggregationOutcome::Committed { state, report_key, totals, rows_shown } = outcome else {
        panic!("aggregation was skipped");
    };
    assert_eq!(state, SubmissionState::ValidationWithErrors);
    assert_eq!(report_key, REPORT_KEY);
    assert_eq!(totals.errors(), 15);
    assert_eq!(rows_shown, 10);

    let report = read_report(&storage, BUCKET, REPORT_KEY)?;
    assert_eq!(report.annotation, "Showing 10 of 15 findings (15 errors, 0 warnings)");
    assert_eq!(report.rows.len(), 10);
    assert_eq!(&report.header[..4], &["validation_id", "validation_type", "scope", "record_no"]);
    Ok(())
}

#[test]
fn report_cap_applies_to_fully_persisted_results() -> Result<()> {
    let storage = FakeObjectIO::new();
    let repository = uploaded();
    validated(&storage, &bad_amounts(15), 1_000)?;

    ResultAggregator::new(&storage, &repository, settings(10, 200)).aggregate(BUCKET, RESULT_DIR)?;

    let report = read_report(&storage, BUCKET, REPORT_KEY)?;
    assert_eq!(report.rows.len(), 10);
    assert!(report.annotation.starts_with("Showing 10 of 15 findings"));
    Ok(())
}

#[test]
fn payload_groups_are_capped_while_counts_stay_true() -> Result<()> {
    let storage = FakeObjectIO::new();
    let repository = uploaded();
    validated(&storage, &bad_amounts(15), 1_000)?;

    ResultAggregator::new(&storage, &repository, settings(100, 3)).aggregate(BUCKET, RESULT_DIR)?;

    let stored = repository.load(&sample_submission_key())?;
    let results = stored.validation_results.expect("payload committed");
    assert_eq!(results.logic_errors.counts.total_count, 15);
    assert_eq!(results.logic_errors.counts.single_field_count, 15);
    assert_eq!(results.logic_errors.details.len(), 1);
    let group = &results.logic_errors.details[0];
    assert_eq!(group.validation.id, "E0100");
    assert_eq!(group.records.len(), 3);
    assert_eq!(group.records[0].record_no, Some(1));
    assert_eq!(group.records[0].fields[0].name, "loan_amount");
    assert_eq!(group.records[0].fields[0].value, "x");
    assert_eq!(stored.ruleset_version.as_deref(), Some(SAMPLE_RULESET_VERSION));
    Ok(())
}

#[test]
fn state_follows_the_findings() -> Result<()> {
    let cases = [
        (csv_body(&[("U1", "10", "1"), ("U2", "20", "1")]), SubmissionState::ValidationSuccessful),
        (sample_csv(8), SubmissionState::ValidationWithWarnings),
        (csv_body(&[("U1", "", "1"), ("U2", "x", "1")]), SubmissionState::ValidationWithErrors),
        (csv_body(&[("", "x", "1")]), SubmissionState::ValidationWithErrors),
    ];
    for (body, expected) in cases {
        let storage = FakeObjectIO::new();
        let repository = uploaded();
        validated(&storage, &body, 1_000)?;

        ResultAggregator::new(&storage, &repository, AggregatorSettings::default()).aggregate(BUCKET, RESULT_DIR)?;

        assert_state(&repository, &sample_submission_key(), expected);
    }
    Ok(())
}

#[test]
fn clean_submissions_get_an_empty_report() -> Result<()> {
    let storage = FakeObjectIO::new();
    let repository = uploaded();
    validated(&storage, &csv_body(&[("U1", "10", "1")]), 10)?;

    let outcome = ResultAggregator::new(&storage, &repository, AggregatorSettings::default())
        .aggregate(BUCKET, RESULT_DIR)?;

    assert!(matches!(
        outcome,
        AggregationOutcome::Committed { state: SubmissionState::ValidationSuccessful, rows_shown: 0, .. }
    ));
    let report = read_report(&storage, BUCKET, REPORT_KEY)?;
    assert_eq!(report.annotation, "Showing 0 of 0 findings (0 errors, 0 warnings)");
    assert!(report.rows.is_empty());
    Ok(())
}

#[test]
fn syntax_findings_land_in_the_syntax_section_only() -> Result<()> {
    let storage = FakeObjectIO::new();
    let repository = uploaded();
    validated(&storage, &csv_body(&[("", "x", "1"), ("U2", "", "1"), ("", "", "")]), 1_000)?;

    ResultAggregator::new(&storage, &repository, AggregatorSettings::default()).aggregate(BUCKET, RESULT_DIR)?;

    let results = repository
        .load(&sample_submission_key())?
        .validation_results
        .expect("payload committed");
    assert_eq!(results.syntax_errors.counts.total_count, 2);
    assert_eq!(results.syntax_errors.details[0].validation.id, "S0001");
    assert_eq!(results.syntax_errors.details[0].validation.phase, Phase::Syntactical);
    assert!(results.logic_warnings.details.is_empty());
    assert_eq!(results.logic_warnings.counts.total_count, 0);
    Ok(())
}

#[test]
fn shards_with_different_columns_merge_by_name() -> Result<()> {
    let storage = FakeObjectIO::new();
    let repository = uploaded();
    put_findings(
        &storage,
        1,
        Phase::Logical,
        &[finding("E0100", Severity::Error, 2, &[("loan_amount", "x")])],
    )?;
    put_findings(
        &storage,
        2,
        Phase::Logical,
        &[
            finding("E0300", Severity::Error, 5, &[("units", "0"), ("loan_amount", "10")]),
            finding("W0200", Severity::Warning, 6, &[("loan_amount", "")]),
        ],
    )?;

    let outcome = ResultAggregator::new(&storage, &repository, AggregatorSettings::default())
        .aggregate(BUCKET, RESULT_DIR)?;
    let AggregationOutcome::Committed { totals, rows_shown, .. } = outcome else {
        panic!("aggregation was skipped");
    };
    assert_eq!(rows_shown, 3);
    assert_eq!(totals.logic_errors.total_count, 2);
    assert_eq!(totals.logic_errors.multi_field_count, 1);
    assert_eq!(totals.logic_warnings.total_count, 1);

    let report = read_report(&storage, BUCKET, REPORT_KEY)?;
    for column in ["field_name", "field_value", "field_1", "value_1", "field_2", "value_2", "phase"] {
        assert!(report.header.iter().any(|h| h == column), "missing report column {column}");
    }
    let field_1 = report.header.iter().position(|h| h == "field_1").expect("field_1 column");
    assert_eq!(report.rows[0][field_1], "");
    assert_eq!(report.rows[1][field_1], "units");

    let results = repository
        .load(&sample_submission_key())?
        .validation_results
        .expect("payload committed");
    let multi = results
        .logic_errors
        .details
        .iter()
        .find(|g| g.validation.id == "E0300")
        .expect("multi-field group");
    let names: Vec<&str> = multi.records[0].fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["units", "loan_amount"]);
    assert_eq!(results.logic_warnings.details[0].records[0].fields[0].value, "");
    Ok(())
}

#[test]
fn error_slice_restricts_payload_groups() -> Result<()> {
    let storage = FakeObjectIO::new();
    let errors: Vec<Finding> = (1..=5)
        .map(|n| finding("E0100", Severity::Error, n, &[("loan_amount", "x")]))
        .collect();
    let warnings: Vec<Finding> = (6..=8)
        .map(|n| finding("W0200", Severity::Warning, n, &[("loan_amount", "")]))
        .collect();
    put_findings(&storage, 1, Phase::Logical, &errors)?;
    put_findings(&storage, 2, Phase::Logical, &warnings)?;

    let full = uploaded();
    ResultAggregator::new(&storage, &full, settings(5, 200)).aggregate(BUCKET, RESULT_DIR)?;
    let results = full.load(&sample_submission_key())?.validation_results.expect("payload");
    assert_eq!(results.logic_warnings.details.len(), 1);

    let sliced = uploaded();
    let sliced_settings = AggregatorSettings {
        use_max_error_slice: true,
        ..settings(5, 200)
    };
    ResultAggregator::new(&storage, &sliced, sliced_settings).aggregate(BUCKET, RESULT_DIR)?;
    let results = sliced.load(&sample_submission_key())?.validation_results.expect("payload");
    assert!(results.logic_warnings.details.is_empty());
    assert_eq!(results.logic_warnings.counts.total_count, 3);
    assert_eq!(results.logic_errors.details[0].records.len(), 5);
    Ok(())
}

#[test]
fn report_root_replaces_the_first_segment() -> Result<()> {
    let storage = FakeObjectIO::new();
    let repository = uploaded();
    validated(&storage, &bad_amounts(2), 10)?;
    let settings = AggregatorSettings {
        report_root: Some("reports".to_string()),
        ..AggregatorSettings::default()
    };

    let outcome = ResultAggregator::new(&storage, &repository, settings).aggregate(BUCKET, RESULT_DIR)?;

    assert!(matches!(
        outcome,
        AggregationOutcome::Committed { ref report_key, .. } if report_key == "reports/2024/TESTLEI0001/1_report.csv"
    ));
    assert!(storage.object_exists(BUCKET, "reports/2024/TESTLEI0001/1_report.csv")?);
    Ok(())
}

#[test]
fn excluded_submissions_are_left_untouched() -> Result<()> {
    for state in [
        SubmissionState::SubmissionAccepted,
        SubmissionState::ValidationExpired,
        SubmissionState::SubmissionUploadMalformed,
    ] {
        let storage = FakeObjectIO::new();
        let repository = seeded_repository(&sample_submission_key(), state);
        validated(&storage, &bad_amounts(3), 10)?;

        let outcome = ResultAggregator::new(&storage, &repository, AggregatorSettings::default())
            .aggregate(BUCKET, RESULT_DIR)?;

        assert_eq!(outcome, AggregationOutcome::Skipped { state });
        assert!(repository.commits().is_empty());
        assert!(!storage.object_exists(BUCKET, REPORT_KEY)?);
    }
    Ok(())
}

#[test]
fn repeated_aggregation_is_idempotent() -> Result<()> {
    let storage = FakeObjectIO::new();
    let repository = uploaded();
    validated(&storage, &bad_amounts(6), 10)?;
    let aggregator = ResultAggregator::new(&storage, &repository, settings(4, 2));

    let first = aggregator.aggregate(BUCKET, RESULT_DIR)?;
    let report = storage.get_object(BUCKET, REPORT_KEY)?;
    let second = aggregator.aggregate(BUCKET, RESULT_DIR)?;

    assert_eq!(first, second);
    assert_eq!(storage.get_object(BUCKET, REPORT_KEY)?, report);
    let commits = repository.commits();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].1, commits[1].1);
    Ok(())
}

#[test]
fn corrupt_result_shards_abort_aggregation() -> Result<()> {
    let storage = FakeObjectIO::new();
    let repository = uploaded();
    validated(&storage, &bad_amounts(6), 10)?;
    storage.put_object(BUCKET, &keys::shard_key(RESULT_DIR, 2), b"truncated")?;

    let err = ResultAggregator::new(&storage, &repository, AggregatorSettings::default())
        .aggregate(BUCKET, RESULT_DIR)
        .expect_err("second result shard is corrupt");

    match err {
        PipelineError::AggregationInput { key, .. } => assert!(key.ends_with("1_res/00002.parquet")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(repository.commits().is_empty());
    assert_state(&repository, &sample_submission_key(), SubmissionState::ValidationInProgress);
    Ok(())
}

#[test]
fn unknown_submissions_are_reported() {
    let storage = FakeObjectIO::new();
    let repository = InMemorySubmissionRepository::new();

    let result = ResultAggregator::new(&storage, &repository, AggregatorSettings::default()).aggregate(BUCKET, RESULT_DIR);

    assert!(matches!(result, Err(PipelineError::SubmissionNotFound(_))));
}
