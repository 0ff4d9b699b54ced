//! Job state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Job state.
///
/// State transitions:
/// - Pending -> Active -> Completed
/// - Pending -> Active -> Pending (handler failed, attempts remain; delayed by backoff)
/// - Pending -> Active -> Failed (attempts exhausted, or unknown job kind)
/// - Active -> Pending (lease expired; recovery, attempts untouched)
/// - Failed -> Pending (manual requeue only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for `next_run_at`.
    Pending,

    /// Leased by a worker.
    Active,

    /// Handler succeeded.
    Completed,

    /// Gave up. Kept for inspection.
    Failed,
}

impl JobState {
    /// Is this a terminal state (no further automatic transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct ParseJobStateError(String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}
