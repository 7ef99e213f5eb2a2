//! The work performed during a processing attempt.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::WorkerConfig;
use crate::error::TranslateError;
use crate::state_machine::Job;

/// Executes the translation for one attempt of a job.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Returns the attempt's output on success, or an error describing the failure.
    async fn translate(&self, job: &Job) -> Result<Option<Value>, TranslateError>;
}

/// Stand-in translator: sleeps a random processing time and fails at a fixed rate.
#[derive(Debug, Clone)]
pub struct SimulatedTranslator {
    min_processing: Duration,
    max_processing: Duration,
    error_rate: f64,
}

impl SimulatedTranslator {
    pub fn new(min_processing: Duration, max_processing: Duration, error_rate: f64) -> Self {
        Self {
            min_processing,
            max_processing: max_processing.max(min_processing),
            error_rate: error_rate.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_processing_ms),
            Duration::from_millis(config.max_processing_ms),
            config.error_rate,
        )
    }

    fn roll(&self) -> (Duration, bool) {
        let mut rng = rand::rng();
        let processing = if self.max_processing > self.min_processing {
            rng.random_range(self.min_processing..=self.max_processing)
        } else {
            self.min_processing
        };
        (processing, rng.random_bool(self.error_rate))
    }
}

#[async_trait]
impl Translator for SimulatedTranslator {
    async fn translate(&self, job: &Job) -> Result<Option<Value>, TranslateError> {
        let (processing, fails) = self.roll();
        debug!(job_id = %job.id, ?processing, "simulating translation");
        tokio::time::sleep(processing).await;

        if fails {
            return Err(TranslateError::new("random translation error occurred"));
        }
        Ok(Some(json!({
            "source_language": job.source_language,
            "target_language": job.target_language,
            "processing_ms": u64::try_from(processing.as_millis()).unwrap_or(u64::MAX),
        })))
    }
}
