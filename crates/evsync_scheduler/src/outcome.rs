//! Job outcomes.

use evsync_engine::{ProcessResult, SkipReason, SyncError, SyncResult};
use std::fmt;

/// What a job run reports to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOutcome {
    /// Run completed; wait for the next interval.
    Success,
    /// Retryable failure; wait for the backoff delay.
    Retry,
    /// Not retried; wait for the next interval.
    Failure,
}

impl JobOutcome {
    /// Maps the result of `SyncEngine::process`.
    ///
    /// A reset is reported as `Retry` so the stream re-establishes its
    /// baseline on the backoff schedule. A run skipped because the engine was
    /// busy did no work and is retried the same way. An `Err` is a defect and
    /// maps to `Failure`.
    pub fn from_process(result: &SyncResult<ProcessResult>) -> Self {
        match result {
            Ok(ProcessResult::Failed(error)) => Self::from_error(error),
            Ok(ProcessResult::Reset) => JobOutcome::Retry,
            Ok(ProcessResult::Skipped(SkipReason::Busy)) => JobOutcome::Retry,
            Ok(_) => JobOutcome::Success,
            Err(_) => JobOutcome::Failure,
        }
    }

    /// Maps an engine error. Cancellation is never retried.
    pub fn from_error(error: &SyncError) -> Self {
        if error.is_cancelled() {
            JobOutcome::Failure
        } else if error.is_retryable() {
            JobOutcome::Retry
        } else {
            JobOutcome::Failure
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobOutcome::Success => "success",
            JobOutcome::Retry => "retry",
            JobOutcome::Failure => "failure",
        };
        f.write_str(name)
    }
}
