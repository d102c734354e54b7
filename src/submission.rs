//! Submission identity, lifecycle states and the repository that persists them.
//!
//! The pipeline touches a submission row twice per run at most: once to read
//! its state (the gate) and once to commit a new state together with its
//! validation results. [`SubmissionRepository`] is that narrow interface;
//! [`SqlSubmissionRepository`] implements it over any [`DatabaseIO`] and
//! [`InMemorySubmissionRepository`] backs tests.

use crate::error::{PipelineError, Result};
use crate::io::cloud::{DatabaseIO, Row};
use crate::keys;
use crate::report::ValidationResults;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// `(period, lei, counter)` identity of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubmissionKey {
    pub period: String,
    pub lei: String,
    pub counter: u64,
}

impl SubmissionKey {
    pub fn new(period: impl Into<String>, lei: impl Into<String>, counter: u64) -> Self {
        Self {
            period: period.into(),
            lei: lei.into(),
            counter,
        }
    }

    /// Derive the identity from a storage key laid out as
    /// `.../<period>/<lei>/<counter>...`. Shard file names after a `_pqs` or
    /// `_res` directory are ignored.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidKey`] if the key is too short or its
    /// submission segment does not start with a number.
    pub fn from_key(key: &str) -> Result<Self> {
        let segs = keys::segments(key);
        let end = segs
            .iter()
            .rposition(|s| s.ends_with(keys::CONVERSION_SUFFIX) || s.ends_with(keys::RESULT_SUFFIX))
            .map_or(segs.len(), |pos| pos + 1);
        if end < 3 {
            return Err(PipelineError::invalid_key(
                key,
                "expected <period>/<lei>/<submission> segments",
            ));
        }
        let anchor = segs[..end].join("/");
        let counter = keys::submission_id(&anchor)?
            .parse::<u64>()
            .map_err(|e| PipelineError::invalid_key(key, e.to_string()))?;
        Ok(Self::new(segs[end - 3], segs[end - 2], counter))
    }
}

impl fmt::Display for SubmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.period, self.lei, self.counter)
    }
}

/// Lifecycle states of a submission, stored by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionState {
    SubmissionStarted,
    UploadInProgress,
    SubmissionUploaded,
    ValidationInProgress,
    ValidationSuccessful,
    ValidationWithErrors,
    ValidationWithWarnings,
    SubmissionUploadMalformed,
    ValidationError,
    SubmissionSigned,
    SubmissionAccepted,
    ValidationExpired,
}

impl SubmissionState {
    const ALL: [Self; 12] = [
        Self::SubmissionStarted,
        Self::UploadInProgress,
        Self::SubmissionUploaded,
        Self::ValidationInProgress,
        Self::ValidationSuccessful,
        Self::ValidationWithErrors,
        Self::ValidationWithWarnings,
        Self::SubmissionUploadMalformed,
        Self::ValidationError,
        Self::SubmissionSigned,
        Self::SubmissionAccepted,
        Self::ValidationExpired,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SubmissionStarted => "SUBMISSION_STARTED",
            Self::UploadInProgress => "UPLOAD_IN_PROGRESS",
            Self::SubmissionUploaded => "SUBMISSION_UPLOADED",
            Self::ValidationInProgress => "VALIDATION_IN_PROGRESS",
            Self::ValidationSuccessful => "VALIDATION_SUCCESSFUL",
            Self::ValidationWithErrors => "VALIDATION_WITH_ERRORS",
            Self::ValidationWithWarnings => "VALIDATION_WITH_WARNINGS",
            Self::SubmissionUploadMalformed => "SUBMISSION_UPLOAD_MALFORMED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::SubmissionSigned => "SUBMISSION_SIGNED",
            Self::SubmissionAccepted => "SUBMISSION_ACCEPTED",
            Self::ValidationExpired => "VALIDATION_EXPIRED",
        }
    }

    /// States the pipeline must never move a submission out of.
    #[must_use]
    pub const fn is_excluded(self) -> bool {
        matches!(
            self,
            Self::SubmissionAccepted | Self::ValidationExpired | Self::SubmissionUploadMalformed
        )
    }

    /// Final state for a validation run with the given true totals.
    #[must_use]
    pub const fn from_totals(errors: u64, warnings: u64) -> Self {
        if errors + warnings == 0 {
            Self::ValidationSuccessful
        } else if errors > 0 {
            Self::ValidationWithErrors
        } else {
            Self::ValidationWithWarnings
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| PipelineError::repository("load", format!("unknown submission state {s:?}")))
    }
}

/// A submission row as the pipeline sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub key: SubmissionKey,
    pub state: SubmissionState,
    pub ruleset_version: Option<String>,
    pub validation_results: Option<ValidationResults>,
}

impl Submission {
    #[must_use]
    pub fn new(key: SubmissionKey, state: SubmissionState) -> Self {
        Self {
            key,
            state,
            ruleset_version: None,
            validation_results: None,
        }
    }
}

/// Fields written together by one commit. `None` leaves a column untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionUpdate {
    pub state: SubmissionState,
    pub validation_results: Option<ValidationResults>,
    pub ruleset_version: Option<String>,
}

impl SubmissionUpdate {
    /// A state-only update.
    #[must_use]
    pub fn state(state: SubmissionState) -> Self {
        Self {
            state,
            validation_results: None,
            ruleset_version: None,
        }
    }
}

/// What a commit did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The row sat in an excluded state and was left untouched.
    Refused(SubmissionState),
}

/// Narrow access to submission rows.
pub trait SubmissionRepository: Send + Sync {
    /// Load the submission identified by `key`.
    ///
    /// # Errors
    /// Returns [`PipelineError::SubmissionNotFound`] if no row matches, or a
    /// repository error if the store cannot be read.
    fn load(&self, key: &SubmissionKey) -> Result<Submission>;

    /// Apply `update` atomically: every field lands or none does. A row in an
    /// excluded state is never written, whatever state it was loaded in.
    ///
    /// # Errors
    /// Returns [`PipelineError::SubmissionNotFound`] if no row matches, or a
    /// repository error if the write is rejected.
    fn commit(&self, key: &SubmissionKey, update: &SubmissionUpdate) -> Result<CommitOutcome>;
}

// ============================================================================
// In-memory repository
// ============================================================================

/// Repository backed by a shared map, with a log of committed updates.
#[derive(Clone, Default)]
pub struct InMemorySubmissionRepository {
    rows: Arc<Mutex<HashMap<SubmissionKey, Submission>>>,
    commits: Arc<Mutex<Vec<(SubmissionKey, SubmissionUpdate)>>>,
}

impl InMemorySubmissionRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// Panics if the rows mutex is poisoned.
    pub fn insert(&self, submission: Submission) {
        self.rows
            .lock()
            .expect("rows mutex poisoned")
            .insert(submission.key.clone(), submission);
    }

    /// # Panics
    ///
    /// Panics if the rows mutex is poisoned.
    #[must_use]
    pub fn get(&self, key: &SubmissionKey) -> Option<Submission> {
        self.rows.lock().expect("rows mutex poisoned").get(key).cloned()
    }

    /// Every update committed so far, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the commits mutex is poisoned.
    #[must_use]
    pub fn commits(&self) -> Vec<(SubmissionKey, SubmissionUpdate)> {
        self.commits.lock().expect("commits mutex poisoned").clone()
    }
}

impl SubmissionRepository for InMemorySubmissionRepository {
    fn load(&self, key: &SubmissionKey) -> Result<Submission> {
        self.get(key)
            .ok_or_else(|| PipelineError::SubmissionNotFound(key.to_string()))
    }

    fn commit(&self, key: &SubmissionKey, update: &SubmissionUpdate) -> Result<CommitOutcome> {
        let mut rows = self.rows.lock().expect("rows mutex poisoned");
        let row = rows
            .get_mut(key)
            .ok_or_else(|| PipelineError::SubmissionNotFound(key.to_string()))?;
        if row.state.is_excluded() {
            return Ok(CommitOutcome::Refused(row.state));
        }
        row.state = update.state;
        if let Some(results) = &update.validation_results {
            row.validation_results = Some(results.clone());
        }
        if let Some(version) = &update.ruleset_version {
            row.ruleset_version = Some(version.clone());
        }
        drop(rows);
        self.commits
            .lock()
            .expect("commits mutex poisoned")
            .push((key.clone(), update.clone()));
        Ok(CommitOutcome::Applied)
    }
}

// ============================================================================
// SQL repository
// ============================================================================

pub(crate) const SELECT_SUBMISSION: &str = "SELECT s.state, s.validation_ruleset_version, s.validation_results \
     FROM submission s JOIN filing f ON s.filing = f.id \
     WHERE f.lei = $1 AND f.filing_period = $2 AND s.counter = $3";

pub(crate) const UPDATE_STATE: &str = "UPDATE submission SET state = $1 \
     FROM filing f WHERE submission.filing = f.id \
     AND f.lei = $2 AND f.filing_period = $3 AND submission.counter = $4 \
     AND submission.state NOT IN ('SUBMISSION_ACCEPTED', 'VALIDATION_EXPIRED', 'SUBMISSION_UPLOAD_MALFORMED')";

pub(crate) const UPDATE_RESULTS: &str = "UPDATE submission SET state = $1, validation_results = CAST($2 AS JSONB), \
     validation_ruleset_version = COALESCE(NULLIF($3, ''), validation_ruleset_version) \
     FROM filing f WHERE submission.filing = f.id \
     AND f.lei = $4 AND f.filing_period = $5 AND submission.counter = $6 \
     AND submission.state NOT IN ('SUBMISSION_ACCEPTED', 'VALIDATION_EXPIRED', 'SUBMISSION_UPLOAD_MALFORMED')";

/// [`SubmissionRepository`] over the filing database.
///
/// Submissions are joined to their filing to resolve `(lei, period)`; every
/// commit runs in its own transaction and is rolled back if it matched no row.
/// The updates only match rows outside the excluded states, so a submission
/// accepted after it was loaded stays accepted.
pub struct SqlSubmissionRepository<D: DatabaseIO> {
    db: D,
}

impl<D: DatabaseIO> SqlSubmissionRepository<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    fn parse_row(key: &SubmissionKey, row: &Row) -> Result<Submission> {
        let state = row
            .get("state")
            .ok_or_else(|| PipelineError::repository("load", "row has no state column"))?
            .parse::<SubmissionState>()?;
        let ruleset_version = row
            .get("validation_ruleset_version")
            .filter(|v| !v.is_empty())
            .cloned();
        let validation_results = match row.get("validation_results").map(String::as_str) {
            None | Some("" | "null") => None,
            Some(json) => Some(
                serde_json::from_str(json)
                    .map_err(|e| PipelineError::repository("load", format!("validation_results: {e}")))?,
            ),
        };
        Ok(Submission {
            key: key.clone(),
            state,
            ruleset_version,
            validation_results,
        })
    }
}

impl<D: DatabaseIO> SubmissionRepository for SqlSubmissionRepository<D> {
    fn load(&self, key: &SubmissionKey) -> Result<Submission> {
        let rows = self
            .db
            .query(
                SELECT_SUBMISSION,
                vec![key.lei.clone(), key.period.clone(), key.counter.to_string()],
            )
            .map_err(|e| PipelineError::repository("load", e))?;
        match rows.as_slice() {
            [] => Err(PipelineError::SubmissionNotFound(key.to_string())),
            [row] => Self::parse_row(key, row),
            _ => Err(PipelineError::repository(
                "load",
                format!("{} rows match submission {key}", rows.len()),
            )),
        }
    }

    fn commit(&self, key: &SubmissionKey, update: &SubmissionUpdate) -> Result<CommitOutcome> {
        let (sql, params) = match &update.validation_results {
            Some(results) => {
                let json = serde_json::to_string(results)
                    .map_err(|e| PipelineError::repository("commit", e))?;
                (
                    UPDATE_RESULTS,
                    vec![
                        update.state.as_str().to_string(),
                        json,
                        update.ruleset_version.clone().unwrap_or_default(),
                        key.lei.clone(),
                        key.period.clone(),
                        key.counter.to_string(),
                    ],
                )
            }
            None => (
                UPDATE_STATE,
                vec![
                    update.state.as_str().to_string(),
                    key.lei.clone(),
                    key.period.clone(),
                    key.counter.to_string(),
                ],
            ),
        };

        let mut tx = self
            .db
            .begin_transaction()
            .map_err(|e| PipelineError::repository("begin", e))?;
        let affected = match tx.execute(sql, params) {
            Ok(n) => n,
            Err(e) => {
                tx.rollback()
                    .map_err(|rb| PipelineError::repository("rollback", rb))?;
                return Err(PipelineError::repository("commit", e));
            }
        };
        if affected == 0 {
            let current = tx.query(
                SELECT_SUBMISSION,
                vec![key.lei.clone(), key.period.clone(), key.counter.to_string()],
            );
            tx.rollback()
                .map_err(|e| PipelineError::repository("rollback", e))?;
            let rows = current.map_err(|e| PipelineError::repository("commit", e))?;
            return match rows.first() {
                None => Err(PipelineError::SubmissionNotFound(key.to_string())),
                Some(row) => match Self::parse_row(key, row)?.state {
                    state if state.is_excluded() => Ok(CommitOutcome::Refused(state)),
                    state => Err(PipelineError::repository(
                        "commit",
                        format!("update of submission {key} in state {state} matched no row"),
                    )),
                },
            };
        }
        tx.commit().map_err(|e| PipelineError::repository("commit", e))?;
        Ok(CommitOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_comes_from_the_last_three_segments() -> Result<()> {
        let key = SubmissionKey::from_key("upload/2024/123456E/42.csv")?;
        assert_eq!(key, SubmissionKey::new("2024", "123456E", 42));
        let key = SubmissionKey::from_key("upload/2024/123456E/42_res/00003.parquet")?;
        assert_eq!(key, SubmissionKey::new("2024", "123456E", 42));
        Ok(())
    }

    #[test]
    fn short_keys_are_rejected() {
        assert!(SubmissionKey::from_key("LEI/42.csv").is_err());
        assert!(SubmissionKey::from_key("2024/LEI/report.csv").is_err());
    }

    #[test]
    fn state_is_derived_from_true_totals() {
        assert_eq!(SubmissionState::from_totals(0, 0), SubmissionState::ValidationSuccessful);
        assert_eq!(SubmissionState::from_totals(3, 9), SubmissionState::ValidationWithErrors);
        assert_eq!(SubmissionState::from_totals(0, 9), SubmissionState::ValidationWithWarnings);
    }

    #[test]
    fn states_round_trip_through_their_stored_names() -> Result<()> {
        for state in SubmissionState::ALL {
            assert_eq!(state.as_str().parse::<SubmissionState>()?, state);
            let json = serde_json::to_string(&state).map_err(|e| PipelineError::Config(e.to_string()))?;
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("NOT_A_STATE".parse::<SubmissionState>().is_err());
        Ok(())
    }

    #[test]
    fn only_terminal_external_states_are_excluded() {
        let excluded: Vec<_> = SubmissionState::ALL
            .into_iter()
            .filter(|s| s.is_excluded())
            .collect();
        assert_eq!(
            excluded,
            vec![
                SubmissionState::SubmissionUploadMalformed,
                SubmissionState::SubmissionAccepted,
                SubmissionState::ValidationExpired,
            ]
        );
    }
}
