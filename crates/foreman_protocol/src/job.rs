//! Job records: one dispatch attempt of a request.

use crate::ids::{JobId, RequestId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Job lifecycle state.
///
/// A job is one attempt: it goes `Queued -> Running -> terminal`. Retries
/// create a new job with `attempt + 1`; a single job never re-enters the
/// queue after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Legal transitions. Terminal states accept nothing.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            JobState::Queued => matches!(next, JobState::Running | JobState::Cancelled),
            JobState::Running => matches!(
                next,
                JobState::Succeeded | JobState::Failed | JobState::Cancelled
            ),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" | "canceled" => Ok(JobState::Cancelled),
            _ => Err(format!("Invalid job state: '{}'", s)),
        }
    }
}

/// One dispatch attempt for a request on a chosen worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub owner: String,
    pub attempt: u32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Effective end-to-end deadline, seconds.
    pub deadline_secs: u64,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(
        request_id: RequestId,
        worker_id: WorkerId,
        owner: impl Into<String>,
        attempt: u32,
        deadline: Duration,
    ) -> Self {
        Self {
            id: JobId::new(),
            request_id,
            worker_id,
            owner: owner.into(),
            attempt,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            deadline_secs: deadline.as_secs(),
            last_error: None,
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        for terminal in [JobState::Succeeded, JobState::Failed, JobState::Cancelled] {
            for next in [
                JobState::Queued,
                JobState::Running,
                JobState::Succeeded,
                JobState::Failed,
                JobState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_queued_cannot_skip_to_succeeded() {
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Queued.can_transition_to(JobState::Failed));
    }
}
