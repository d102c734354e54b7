//! Guard against reprocessing submissions in an excluded state.

use crate::error::Result;
use crate::submission::{Submission, SubmissionKey, SubmissionRepository, SubmissionState};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// The submission may be processed.
    Proceed(Submission),
    /// The submission sits in an excluded state; leave it untouched.
    Skip(SubmissionState),
}

pub struct StateGate<'a> {
    repository: &'a dyn SubmissionRepository,
}

impl<'a> StateGate<'a> {
    pub fn new(repository: &'a dyn SubmissionRepository) -> Self {
        Self { repository }
    }

    /// # Errors
    /// Propagates repository failures, including a missing submission.
    pub fn check(&self, key: &SubmissionKey) -> Result<GateDecision> {
        let submission = self.repository.load(key)?;
        if submission.state.is_excluded() {
            info!(submission = %key, state = %submission.state, "submission is in an excluded state; skipping");
            return Ok(GateDecision::Skip(submission.state));
        }
        Ok(GateDecision::Proceed(submission))
    }
}
