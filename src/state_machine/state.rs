use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{Job, JobId};
use crate::error::EngineError;

/// Lifecycle status of a translation job.
///
/// Jobs flow: PENDING → PROCESSING → COMPLETED, or through
/// ERROR → QUEUED_FOR_RETRY → PROCESSING when an attempt fails and the
/// dead-letter queue still has budget. `Completed`, `Cancelled` and `Dead`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
    QueuedForRetry,
    Cancelled,
    Dead,
}

impl JobStatus {
    /// Returns true if no further transition is permitted from this status.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Dead)
    }

    /// Returns true for the statuses a client treats as a failed translation.
    #[inline]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Dead)
    }

    /// The transition table of the job state machine.
    pub const fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Error)
                | (Processing, Cancelled)
                | (Error, QueuedForRetry)
                | (Error, Dead)
                | (QueuedForRetry, Processing)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::QueuedForRetry => "queued_for_retry",
            Self::Cancelled => "cancelled",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change that was applied to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
}

/// Applies guarded transitions to a `Job`.
pub struct StateMachine;

impl StateMachine {
    /// Move `job` to `to`, or reject the change without touching the record.
    ///
    /// - Entering `Processing` counts a new attempt.
    /// - `error_message` is only kept for `Error` and `Dead`; `error` replaces the
    ///   previous message when given.
    /// - Entering a terminal status stamps `completed_at`.
    pub fn apply(
        job: &mut Job,
        to: JobStatus,
        error: Option<String>,
    ) -> Result<Transition, EngineError> {
        let from = job.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                job_id: job.id,
                from,
                to,
            });
        }

        let now = Utc::now();
        if to == JobStatus::Processing {
            job.attempt_count += 1;
        }
        job.error_message = if to.is_failure() {
            error.or_else(|| job.error_message.take())
        } else {
            None
        };
        if to.is_terminal() {
            job.completed_at = Some(now);
        }
        job.status = to;
        job.updated_at = now;

        Ok(Transition {
            job_id: job.id,
            from,
            to,
            at: now,
        })
    }
}
