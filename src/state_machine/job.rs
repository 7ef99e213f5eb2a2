use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::state::JobStatus;

pub type JobId = Uuid;

/// A translation job as persisted by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub source_language: String,
    pub target_language: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the job enters a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Only present while the status is `error` or `dead`.
    pub error_message: Option<String>,
    pub attempt_count: u32,
    /// Output of the successful attempt, if the translator produced one.
    pub result: Option<Value>,
}

impl Job {
    pub fn new(
        source_language: String,
        target_language: String,
        metadata: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            source_language,
            target_language,
            metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
            attempt_count: 0,
            result: None,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from_job(self)
    }
}

/// Read-only projection of a job, served by status queries and the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            error_message: job.error_message.clone(),
            attempt_count: job.attempt_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}
