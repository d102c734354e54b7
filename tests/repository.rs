// Integration tests for the submission repositories and the state gate

use anyhow::Result;
use filing_pipeline::io::cloud::{FakeDatabaseIO, Row};
use filing_pipeline::report::ValidationResults;
use filing_pipeline::testing::*;
use filing_pipeline::io::cloud::FakeObjectIO;
use filing_pipeline::{
    AggregationOutcome, AggregatorSettings, CommitOutcome, GateDecision, InMemorySubmissionRepository,
    PipelineError, ResultAggregator, SqlSubmissionRepository, StateGate, Submission, SubmissionKey,
    SubmissionRepository, SubmissionState, SubmissionUpdate,
};

fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn db_with_state(state: &'static str) -> FakeDatabaseIO {
    let db = FakeDatabaseIO::new();
    db.on_query(move |_, params| {
        if params == ["TESTLEI0001", "2024", "1"] {
            vec![row(&[
                ("state", state),
                ("validation_ruleset_version", "2023.4"),
                ("validation_results", ""),
            ])]
        } else {
            Vec::new()
        }
    });
    db
}

#[test]
fn sql_load_resolves_the_submission_through_its_filing() -> Result<()> {
    let db = db_with_state("VALIDATION_IN_PROGRESS");
    let repository = SqlSubmissionRepository::new(db);

    let submission = repository.load(&sample_submission_key())?;

    assert_eq!(submission.state, SubmissionState::ValidationInProgress);
    assert_eq!(submission.ruleset_version.as_deref(), Some("2023.4"));
    assert!(submission.validation_results.is_none());

    let missing = repository.load(&SubmissionKey::new("2024", "TESTLEI0001", 2));
    assert!(matches!(missing, Err(PipelineError::SubmissionNotFound(_))));
    Ok(())
}

#[test]
fn stored_results_are_parsed_on_load() -> Result<()> {
    let db = FakeDatabaseIO::new();
    let json = serde_json::to_string(&ValidationResults::default())?;
    db.on_query(move |_, _| vec![row(&[("state", "VALIDATION_SUCCESSFUL"), ("validation_results", json.as_str())])]);

    let submission = SqlSubmissionRepository::new(db).load(&sample_submission_key())?;

    assert_eq!(submission.validation_results, Some(ValidationResults::default()));
    assert_eq!(submission.ruleset_version, None);
    Ok(())
}

#[test]
fn unknown_stored_states_are_repository_errors() {
    let repository = SqlSubmissionRepository::new(db_with_state("ARCHIVED"));
    assert!(matches!(
        repository.load(&sample_submission_key()),
        Err(PipelineError::Repository { .. })
    ));
}

#[test]
fn results_commit_writes_state_payload_and_version_together() -> Result<()> {
    let db = FakeDatabaseIO::new();
    let repository = SqlSubmissionRepository::new(db.clone());
    let update = SubmissionUpdate {
        state: SubmissionState::ValidationWithWarnings,
        validation_results: Some(ValidationResults::default()),
        ruleset_version: Some("2024.1".to_string()),
    };

    assert_eq!(repository.commit(&sample_submission_key(), &update)?, CommitOutcome::Applied);

    let journal = db.journal();
    assert_eq!(journal.len(), 1);
    let (sql, params) = &journal[0];
    assert!(sql.starts_with("UPDATE submission SET state = $1, validation_results"));
    assert_eq!(params[0], "VALIDATION_WITH_WARNINGS");
    let payload: ValidationResults = serde_json::from_str(&params[1])?;
    assert_eq!(payload, ValidationResults::default());
    assert_eq!(&params[2..], &["2024.1", "TESTLEI0001", "2024", "1"]);
    assert_eq!(db.commit_count(), 1);
    assert_eq!(db.rollback_count(), 0);
    Ok(())
}

#[test]
fn state_only_commit_leaves_results_alone() -> Result<()> {
    let db = FakeDatabaseIO::new();
    let repository = SqlSubmissionRepository::new(db.clone());

    repository.commit(
        &sample_submission_key(),
        &SubmissionUpdate::state(SubmissionState::ValidationError),
    )?;

    let journal = db.journal();
    assert!(!journal[0].0.contains("validation_results"));
    assert!(journal[0].0.contains("submission.state NOT IN ('SUBMISSION_ACCEPTED', 'VALIDATION_EXPIRED'"));
    assert_eq!(journal[0].1, vec!["VALIDATION_ERROR", "TESTLEI0001", "2024", "1"]);
    Ok(())
}

#[test]
fn commits_matching_no_row_roll_back() {
    let db = FakeDatabaseIO::new();
    db.set_rows_affected(0);
    let repository = SqlSubmissionRepository::new(db.clone());

    let result = repository.commit(
        &sample_submission_key(),
        &SubmissionUpdate::state(SubmissionState::ValidationError),
    );

    assert!(matches!(result, Err(PipelineError::SubmissionNotFound(_))));
    assert!(db.journal().is_empty());
    assert_eq!(db.rollback_count(), 1);
    assert_eq!(db.commit_count(), 0);
}

#[test]
fn gate_skips_excluded_states_only() -> Result<()> {
    let key = sample_submission_key();
    for state in [
        SubmissionState::SubmissionAccepted,
        SubmissionState::ValidationExpired,
        SubmissionState::SubmissionUploadMalformed,
    ] {
        let repository = seeded_repository(&key, state);
        assert_eq!(StateGate::new(&repository).check(&key)?, GateDecision::Skip(state));
    }
    for state in [
        SubmissionState::SubmissionUploaded,
        SubmissionState::ValidationInProgress,
        SubmissionState::ValidationWithErrors,
        SubmissionState::ValidationError,
    ] {
        let repository = seeded_repository(&key, state);
        assert!(matches!(
            StateGate::new(&repository).check(&key)?,
            GateDecision::Proceed(submission) if submission.state == state
        ));
    }
    Ok(())
}

#[test]
fn gate_reads_through_the_sql_repository() -> Result<()> {
    let repository = SqlSubmissionRepository::new(db_with_state("SUBMISSION_ACCEPTED"));
    assert_eq!(
        StateGate::new(&repository).check(&sample_submission_key())?,
        GateDecision::Skip(SubmissionState::SubmissionAccepted)
    );
    Ok(())
}

#[test]
fn sql_commits_leave_rows_that_became_excluded_untouched() -> Result<()> {
    let db = db_with_state("SUBMISSION_ACCEPTED");
    db.set_rows_affected(0);
    let repository = SqlSubmissionRepository::new(db.clone());

    let outcome = repository.commit(
        &sample_submission_key(),
        &SubmissionUpdate::state(SubmissionState::ValidationError),
    )?;

    assert_eq!(outcome, CommitOutcome::Refused(SubmissionState::SubmissionAccepted));
    assert!(db.journal().is_empty());
    assert_eq!(db.rollback_count(), 1);
    Ok(())
}

#[test]
fn sql_commits_matching_nothing_on_an_open_row_are_errors() {
    let db = db_with_state("VALIDATION_IN_PROGRESS");
    db.set_rows_affected(0);
    let repository = SqlSubmissionRepository::new(db);

    let result = repository.commit(
        &sample_submission_key(),
        &SubmissionUpdate::state(SubmissionState::ValidationError),
    );

    assert!(matches!(result, Err(PipelineError::Repository { .. })));
}

#[test]
fn in_memory_commits_refuse_excluded_rows() -> Result<()> {
    let key = sample_submission_key();
    let repository = seeded_repository(&key, SubmissionState::ValidationExpired);

    let outcome = repository.commit(&key, &SubmissionUpdate::state(SubmissionState::ValidationSuccessful))?;

    assert_eq!(outcome, CommitOutcome::Refused(SubmissionState::ValidationExpired));
    assert_state(&repository, &key, SubmissionState::ValidationExpired);
    assert!(repository.commits().is_empty());
    Ok(())
}

/// Serves every load in `loaded_as` while commits see the real row.
struct StaleReads {
    inner: InMemorySubmissionRepository,
    loaded_as: SubmissionState,
}

impl SubmissionRepository for StaleReads {
    fn load(&self, key: &SubmissionKey) -> filing_pipeline::Result<Submission> {
        let mut submission = self.inner.load(key)?;
        submission.state = self.loaded_as;
        Ok(submission)
    }

    fn commit(&self, key: &SubmissionKey, update: &SubmissionUpdate) -> filing_pipeline::Result<CommitOutcome> {
        self.inner.commit(key, update)
    }
}

#[test]
fn aggregation_skips_a_submission_accepted_after_the_gate() -> Result<()> {
    let key = sample_submission_key();
    let inner = seeded_repository(&key, SubmissionState::SubmissionAccepted);
    let repository = StaleReads {
        inner: inner.clone(),
        loaded_as: SubmissionState::ValidationInProgress,
    };
    let storage = FakeObjectIO::new();

    let outcome = ResultAggregator::new(&storage, &repository, AggregatorSettings::default())
        .aggregate("filings", "upload/2024/TESTLEI0001/1_res/")?;

    assert_eq!(
        outcome,
        AggregationOutcome::Skipped {
            state: SubmissionState::SubmissionAccepted
        }
    );
    assert_state(&inner, &key, SubmissionState::SubmissionAccepted);
    assert!(inner.commits().is_empty());
    Ok(())
}
