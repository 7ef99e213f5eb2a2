//! Status polling for consumers that cannot take push notifications.
//!
//! [`StatusPoller`] waits for a job to settle by repeatedly asking a
//! [`StatusSource`]. The wait between polls grows while nothing changes and
//! snaps back to the minimum as soon as the status moves.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, trace};

use crate::api::{StatusResponse, SubmitRequest, SubmitResponse};
use crate::engine::JobEngine;
use crate::error::PollError;
use crate::state_machine::{JobId, JobSnapshot, JobStatus};

/// Something that can report the current status of a job.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, job_id: JobId) -> Result<JobSnapshot, PollError>;
}

#[async_trait]
impl StatusSource for JobEngine {
    async fn fetch_status(&self, job_id: JobId) -> Result<JobSnapshot, PollError> {
        Ok(self.get_status(job_id).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Total time allowed before giving up. Never affects the job itself.
    pub base_timeout: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub progressive_delay: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_secs(30),
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            progressive_delay: true,
        }
    }
}

/// Computes the wait before the next poll from the status just observed.
#[derive(Debug, Clone)]
pub struct DelaySchedule {
    config: PollConfig,
    current: Duration,
    last_status: Option<JobStatus>,
}

impl DelaySchedule {
    pub fn new(config: PollConfig) -> Self {
        Self {
            current: config.min_delay,
            config,
            last_status: None,
        }
    }

    pub fn next_delay(&mut self, observed: JobStatus) -> Duration {
        let min = self.config.min_delay;
        let max = self.config.max_delay.max(min);

        self.current = if !self.config.progressive_delay {
            min
        } else if self.last_status == Some(observed) {
            self.current.saturating_mul(2).clamp(min, max)
        } else {
            min
        };
        self.last_status = Some(observed);
        self.current
    }
}

/// Polls a [`StatusSource`] until the job reaches a terminal status.
#[derive(Debug, Clone)]
pub struct StatusPoller<S> {
    source: S,
    config: PollConfig,
}

impl<S: StatusSource> StatusPoller<S> {
    pub fn new(source: S, config: PollConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns the final snapshot for `completed` and `cancelled` jobs.
    ///
    /// `error` and `dead` become [`PollError::Translation`]; running out of
    /// `base_timeout` becomes [`PollError::Timeout`].
    pub async fn wait_for_completion(&self, job_id: JobId) -> Result<JobSnapshot, PollError> {
        let waited = self.config.base_timeout;
        match tokio::time::timeout(waited, self.poll_until_settled(job_id)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%job_id, ?waited, "gave up waiting for job");
                Err(PollError::Timeout { job_id, waited })
            }
        }
    }

    async fn poll_until_settled(&self, job_id: JobId) -> Result<JobSnapshot, PollError> {
        let mut schedule = DelaySchedule::new(self.config);
        loop {
            let snapshot = self.source.fetch_status(job_id).await?;
            match snapshot.status {
                JobStatus::Completed | JobStatus::Cancelled => return Ok(snapshot),
                JobStatus::Error | JobStatus::Dead => {
                    return Err(PollError::Translation {
                        job_id,
                        status: snapshot.status,
                        message: snapshot
                            .error_message
                            .unwrap_or_else(|| "translation failed".to_string()),
                    });
                }
                JobStatus::Pending | JobStatus::Processing | JobStatus::QueuedForRetry => {}
            }

            let delay = schedule.next_delay(snapshot.status);
            trace!(%job_id, status = %snapshot.status, ?delay, "job still running");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Talks to a remote relay over HTTP.
#[derive(Debug, Clone)]
pub struct HttpStatusClient {
    client: Client,
    base_url: String,
}

impl HttpStatusClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PollError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse, PollError> {
        let response = self
            .client
            .post(format!("{}/translate", self.base_url))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }
        Ok(response.json::<SubmitResponse>().await?)
    }

    pub async fn status(&self, job_id: JobId) -> Result<StatusResponse, PollError> {
        let response = self
            .client
            .get(format!("{}/status/{job_id}", self.base_url))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PollError::JobNotFound(job_id));
        }
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }
        Ok(response.json::<StatusResponse>().await?)
    }
}

async fn api_error(status: StatusCode, response: reqwest::Response) -> PollError {
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    PollError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl StatusSource for HttpStatusClient {
    async fn fetch_status(&self, job_id: JobId) -> Result<JobSnapshot, PollError> {
        self.status(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;
    use uuid::Uuid;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(progressive: bool) -> PollConfig {
        PollConfig {
            base_timeout: Duration::from_secs(30),
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            progressive_delay: progressive,
        }
    }

    fn snapshot(job_id: JobId, status: JobStatus, error: Option<&str>) -> JobSnapshot {
        let now = Utc::now();
        JobSnapshot {
            job_id,
            status,
            error_message: error.map(str::to_string),
            attempt_count: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Replays a list of statuses and records when each fetch happened.
    struct ScriptedSource {
        statuses: Mutex<VecDeque<JobStatus>>,
        fetched_at: Mutex<Vec<Instant>>,
        error: Option<String>,
    }

    impl ScriptedSource {
        fn new(statuses: &[JobStatus]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                fetched_at: Mutex::new(Vec::new()),
                error: None,
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let times = self.fetched_at.lock().unwrap();
            times.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn fetch_status(&self, job_id: JobId) -> Result<JobSnapshot, PollError> {
            self.fetched_at.lock().unwrap().push(Instant::now());
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                *statuses.front().unwrap()
            };
            Ok(snapshot(job_id, status, self.error.as_deref()))
        }
    }

    #[test]
    fn delay_doubles_while_unchanged_and_caps() {
        let mut schedule = DelaySchedule::new(config(true));
        let delays: Vec<_> = (0..4)
            .map(|_| schedule.next_delay(JobStatus::Processing))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(3000),
            ]
        );
    }

    #[test]
    fn delay_resets_on_change() {
        let mut schedule = DelaySchedule::new(config(true));
        schedule.next_delay(JobStatus::Pending);
        schedule.next_delay(JobStatus::Pending);
        assert_eq!(
            schedule.next_delay(JobStatus::Pending),
            Duration::from_millis(2000)
        );
        assert_eq!(
            schedule.next_delay(JobStatus::Processing),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn fixed_delay_when_not_progressive() {
        let mut schedule = DelaySchedule::new(config(false));
        for _ in 0..5 {
            assert_eq!(
                schedule.next_delay(JobStatus::Processing),
                Duration::from_millis(500)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_with_progressive_delays() {
        use JobStatus::*;
        let source = ScriptedSource::new(&[
            Processing, Processing, Processing, Processing, Completed,
        ]);
        let poller = StatusPoller::new(source, config(true));

        let snapshot = poller.wait_for_completion(Uuid::new_v4()).await.unwrap();
        assert_eq!(snapshot.status, Completed);
        assert_eq!(
            poller.source().gaps(),
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(3000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_is_returned_as_success() {
        let source = ScriptedSource::new(&[JobStatus::Pending, JobStatus::Cancelled]);
        let poller = StatusPoller::new(source, config(true));
        let snapshot = poller.wait_for_completion(Uuid::new_v4()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_job_is_a_translation_error() {
        let mut source = ScriptedSource::new(&[JobStatus::QueuedForRetry, JobStatus::Dead]);
        source.error = Some("engine down".into());
        let poller = StatusPoller::new(source, config(true));

        let err = poller.wait_for_completion(Uuid::new_v4()).await.unwrap_err();
        match err {
            PollError::Translation {
                status, message, ..
            } => {
                assert_eq!(status, JobStatus::Dead);
                assert_eq!(message, "engine down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_terminal_status() {
        let source = ScriptedSource::new(&[JobStatus::Processing]);
        let mut cfg = config(true);
        cfg.base_timeout = Duration::from_secs(5);
        let poller = StatusPoller::new(source, cfg);

        let start = Instant::now();
        let err = poller.wait_for_completion(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PollError::Timeout { waited, .. } if waited == Duration::from_secs(5)));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
        // 0s, 0.5s, 1.5s, 3.5s: every gap is at least min_delay.
        assert!(
            poller
                .source()
                .gaps()
                .iter()
                .all(|gap| *gap >= Duration::from_millis(500))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polls_the_engine_directly() {
        let engine = JobEngine::builder(InMemoryJobStore::new()).build().unwrap();
        let job_id = engine
            .submit(SubmitRequest::new("en", "pt"))
            .await
            .unwrap()
            .job_id;
        engine.begin_attempt(job_id).await.unwrap();

        let poller = StatusPoller::new(engine.clone(), config(true));
        let finisher = {
            let engine = engine.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                engine.complete(job_id, None).await.unwrap();
            })
        };

        let snapshot = poller.wait_for_completion(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        finisher.await.unwrap();
    }

    #[tokio::test]
    async fn engine_source_reports_not_found() {
        let engine = JobEngine::builder(InMemoryJobStore::new()).build().unwrap();
        let id = Uuid::new_v4();
        let err = engine.fetch_status(id).await.unwrap_err();
        assert!(matches!(err, PollError::JobNotFound(found) if found == id));
    }

    #[tokio::test]
    async fn http_client_submits_job() {
        let server = MockServer::start().await;
        let job_id = Uuid::new_v4();
        let request = SubmitRequest::new("en", "ja");

        Mock::given(method("POST"))
            .and(path("/translate"))
            .and(body_json(&request))
            .respond_with(ResponseTemplate::new(200).set_body_json(SubmitResponse {
                job_id,
                status: JobStatus::Pending,
            }))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpStatusClient::new(server.uri()).unwrap();
        let response = client.submit(&request).await.unwrap();
        assert_eq!(response.job_id, job_id);
        assert_eq!(response.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn http_client_fetches_status() {
        let server = MockServer::start().await;
        let job_id = Uuid::new_v4();
        let body = snapshot(job_id, JobStatus::Processing, None);

        Mock::given(method("GET"))
            .and(path(format!("/status/{job_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        let client = HttpStatusClient::new(format!("{}/", server.uri())).unwrap();
        let status = client.fetch_status(job_id).await.unwrap();
        assert_eq!(status, body);
    }

    #[tokio::test]
    async fn http_client_maps_404_to_not_found() {
        let server = MockServer::start().await;
        let job_id = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path(format!("/status/{job_id}")))
            .respond_with(ResponseTemplate::new(404).set_body_string("Job not found"))
            .mount(&server)
            .await;

        let client = HttpStatusClient::new(server.uri()).unwrap();
        let err = client.status(job_id).await.unwrap_err();
        assert!(matches!(err, PollError::JobNotFound(found) if found == job_id));
    }

    #[tokio::test]
    async fn http_client_surfaces_api_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/translate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = HttpStatusClient::new(server.uri()).unwrap();
        let err = client
            .submit(&SubmitRequest::new("en", "de"))
            .await
            .unwrap_err();
        match err {
            PollError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn http_poller_waits_for_remote_completion() {
        let server = MockServer::start().await;
        let job_id = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path(format!("/status/{job_id}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(snapshot(job_id, JobStatus::Completed, None)),
            )
            .mount(&server)
            .await;

        let client = HttpStatusClient::new(server.uri()).unwrap();
        let poller = StatusPoller::new(client, config(true));
        let snapshot = poller.wait_for_completion(job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
    }
}
