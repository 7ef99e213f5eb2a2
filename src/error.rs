use std::time::Duration;

use thiserror::Error;

use crate::state_machine::{JobId, JobStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Duplicate(JobId),

    #[error("job {0} does not exist")]
    NotFound(JobId),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Failure reported by a translator for a single processing attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TranslateError(pub String);

impl TranslateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced by the polling client.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Timed out after {waited:?} waiting for job {job_id}")]
    Timeout { job_id: JobId, waited: Duration },

    #[error("Translation failed for job {job_id} ({status}): {message}")]
    Translation {
        job_id: JobId,
        status: JobStatus,
        message: String,
    },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("API returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for PollError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::JobNotFound(id) => PollError::JobNotFound(id),
            other => PollError::Engine(other),
        }
    }
}
