use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::api::{JobEvent, SubmitRequest, SubmitResponse};
use crate::cache::StatusCache;
use crate::config::RelayConfig;
use crate::dlq::{DlqEntry, DlqManager, FailureDecision, RetryPolicy};
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::registry::{SubscriberRegistry, Subscription, SubscriptionHandle};
use crate::state_machine::{Job, JobId, JobSnapshot, JobStatus, StateMachine};
use crate::store::JobStore;
use crate::translator::Translator;

/// Message recorded on jobs whose worker disappeared with the previous process.
const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Per-job-id critical sections. Different ids never wait on each other.
#[derive(Default)]
struct JobLocks {
    locks: DashMap<JobId, Arc<tokio::sync::Mutex<()>>>,
}

impl JobLocks {
    async fn acquire(&self, job_id: JobId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.locks.entry(job_id).or_default());
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on.
    fn prune(&self) -> usize {
        let before = self.locks.len();
        // Clones are only handed out under the shard lock, so a count of one is final.
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }
}

/// What `recover` found in the store after a restart.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `queued_for_retry` jobs put back in the dead-letter queue.
    pub requeued: usize,
    /// `processing` jobs failed because their worker was lost.
    pub interrupted: usize,
    /// `pending` jobs handed to the translator again.
    pub resumed: usize,
}

struct EngineInner {
    store: Arc<dyn JobStore>,
    translator: Option<Arc<dyn Translator>>,
    cache: StatusCache,
    registry: SubscriberRegistry,
    dlq: DlqManager,
    metrics: EngineMetrics,
    locks: JobLocks,
}

/// Drives translation jobs through their lifecycle.
///
/// Cloning is cheap; clones share the same store, cache, registry and queue.
#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEngine")
            .field("policy", self.inner.dlq.policy())
            .field("translator", &self.inner.translator.is_some())
            .finish_non_exhaustive()
    }
}

pub struct EngineBuilder {
    store: Arc<dyn JobStore>,
    translator: Option<Arc<dyn Translator>>,
    policy: RetryPolicy,
    cache_ttl: Duration,
    buffer_size: usize,
}

impl EngineBuilder {
    /// Worker run for every attempt. Without one, jobs wait for an external
    /// worker to call `begin_attempt` / `complete` / `fail`.
    pub fn translator(mut self, translator: impl Translator + 'static) -> Self {
        self.translator = Some(Arc::new(translator));
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Apply the `[dlq]`, `[cache]` and `[subscribers]` sections.
    pub fn with_config(self, config: &RelayConfig) -> Self {
        self.retry_policy(config.dlq.retry_policy())
            .cache_ttl(config.cache.ttl())
            .buffer_size(config.subscribers.buffer_size)
    }

    pub fn build(self) -> Result<JobEngine, EngineError> {
        let inner = EngineInner {
            store: self.store,
            translator: self.translator,
            cache: StatusCache::new(self.cache_ttl),
            registry: SubscriberRegistry::new(self.buffer_size),
            dlq: DlqManager::new(self.policy),
            metrics: EngineMetrics::new()?,
            locks: JobLocks::default(),
        };
        Ok(JobEngine {
            inner: Arc::new(inner),
        })
    }
}

impl JobEngine {
    pub fn builder(store: impl JobStore + 'static) -> EngineBuilder {
        EngineBuilder {
            store: Arc::new(store),
            translator: None,
            policy: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(3600),
            buffer_size: 16,
        }
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    pub fn dlq(&self) -> &DlqManager {
        &self.inner.dlq
    }

    pub fn cache(&self) -> &StatusCache {
        &self.inner.cache
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.inner.registry
    }

    async fn load(&self, job_id: JobId) -> Result<Job, EngineError> {
        self.inner
            .store
            .get(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Persist, then invalidate and repopulate the cache entry.
    async fn commit(&self, job: &Job) -> Result<(), EngineError> {
        self.inner.store.update(job).await?;
        self.inner.cache.invalidate(job.id);
        self.inner.cache.put_default(job.id, job.snapshot());
        Ok(())
    }

    /// Record and fan out the events of a committed change, in transition order.
    fn publish(&self, events: &[JobEvent]) {
        let metrics = &self.inner.metrics;
        for event in events {
            metrics.record_transition(event.status);
            let report = self.inner.registry.publish(event.job_id, event);
            metrics.channel_overruns.inc_by(report.overruns as u64);
        }
        self.refresh_gauges();
    }

    fn refresh_gauges(&self) {
        let metrics = &self.inner.metrics;
        metrics
            .active_subscriptions
            .set(self.inner.registry.active_subscriptions() as i64);
        metrics.dlq_depth.set(self.inner.dlq.depth() as i64);
    }

    /// Create a `pending` job and schedule its first attempt.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, EngineError> {
        let source = request.source_language.trim();
        let target = request.target_language.trim();
        if source.is_empty() {
            return Err(EngineError::Validation(
                "source_language must not be empty".into(),
            ));
        }
        if target.is_empty() {
            return Err(EngineError::Validation(
                "target_language must not be empty".into(),
            ));
        }

        let job = Job::new(source.to_owned(), target.to_owned(), request.metadata);
        self.inner.store.create(&job).await?;
        self.inner.cache.put_default(job.id, job.snapshot());
        self.inner.metrics.jobs_submitted.inc();
        self.inner.metrics.record_transition(JobStatus::Pending);
        info!(job_id = %job.id, source = %job.source_language, target = %job.target_language, "job submitted");

        if self.inner.translator.is_some() {
            self.spawn_attempt(job.id);
        }

        Ok(SubmitResponse {
            job_id: job.id,
            status: job.status,
        })
    }

    /// Start a processing attempt on a `pending` or `queued_for_retry` job.
    ///
    /// A job that is already `processing` is rejected, so an attempt can never
    /// run twice.
    pub async fn begin_attempt(&self, job_id: JobId) -> Result<Job, EngineError> {
        let _guard = self.inner.locks.acquire(job_id).await;
        let mut job = self.load(job_id).await?;

        if job.attempt_count >= self.inner.dlq.policy().max_attempts {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::Processing,
            });
        }
        StateMachine::apply(&mut job, JobStatus::Processing, None)?;
        let event = JobEvent::from_job(&job);
        self.commit(&job).await?;
        self.inner.dlq.remove(job_id);
        self.publish(&[event]);

        debug!(%job_id, attempt = job.attempt_count, "attempt started");
        Ok(job)
    }

    /// Finish the running attempt successfully.
    pub async fn complete(
        &self,
        job_id: JobId,
        result: Option<Value>,
    ) -> Result<JobSnapshot, EngineError> {
        let _guard = self.inner.locks.acquire(job_id).await;
        let mut job = self.load(job_id).await?;

        StateMachine::apply(&mut job, JobStatus::Completed, None)?;
        job.result = result;
        let event = JobEvent::from_job(&job);
        self.commit(&job).await?;
        self.inner.dlq.remove(job_id);
        self.publish(&[event]);

        info!(%job_id, attempts = job.attempt_count, "job completed");
        Ok(job.snapshot())
    }

    /// Record a failed attempt and let the dead-letter queue decide what follows.
    ///
    /// The job ends up `queued_for_retry` while budget remains, `dead` otherwise.
    pub async fn fail(&self, job_id: JobId, message: &str) -> Result<JobSnapshot, EngineError> {
        let _guard = self.inner.locks.acquire(job_id).await;
        let mut job = self.load(job_id).await?;

        StateMachine::apply(&mut job, JobStatus::Error, Some(message.to_owned()))?;
        let mut events = vec![JobEvent::from_job(&job)];

        let decision = self.inner.dlq.handle_failure(&job, message);
        let next = match decision {
            FailureDecision::Retry { .. } => JobStatus::QueuedForRetry,
            FailureDecision::Exhausted => JobStatus::Dead,
        };
        StateMachine::apply(&mut job, next, None)?;
        events.push(JobEvent::from_job(&job));

        if let Err(err) = self.commit(&job).await {
            // The store still holds `processing`; don't leave a retry pointing at it.
            self.inner.dlq.remove(job_id);
            return Err(err);
        }
        self.publish(&events);

        match next {
            JobStatus::Dead => {
                warn!(%job_id, attempts = job.attempt_count, error = message, "job is dead")
            }
            _ => info!(%job_id, attempts = job.attempt_count, error = message, "job queued for retry"),
        }
        Ok(job.snapshot())
    }

    /// Cancel a `pending` or `processing` job.
    ///
    /// A running attempt is left to finish; its `complete` or `fail` is then
    /// rejected and its result discarded.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobSnapshot, EngineError> {
        let _guard = self.inner.locks.acquire(job_id).await;
        let mut job = self.load(job_id).await?;

        StateMachine::apply(&mut job, JobStatus::Cancelled, None)?;
        let event = JobEvent::from_job(&job);
        self.commit(&job).await?;
        self.inner.dlq.remove(job_id);
        self.publish(&[event]);

        info!(%job_id, "job cancelled");
        Ok(job.snapshot())
    }

    /// Cache-first status read.
    ///
    /// A miss repopulates the cache from the store without taking the job's
    /// lock; the cache refuses the snapshot if a writer has meanwhile cached a
    /// newer one.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobSnapshot, EngineError> {
        if let Some(snapshot) = self.inner.cache.get(job_id) {
            self.inner.metrics.cache_hits.inc();
            return Ok(snapshot);
        }
        self.inner.metrics.cache_misses.inc();

        let job = self.load(job_id).await?;
        let snapshot = job.snapshot();
        if !self.inner.cache.put_default(job_id, snapshot.clone()) {
            debug!(%job_id, status = %snapshot.status, "stale read not cached");
        }
        Ok(snapshot)
    }

    /// Subscribe to a job's events.
    ///
    /// Reads the record from the store inside the job's critical section, so a
    /// terminal transition cannot land between the status check and the
    /// registration.
    pub async fn subscribe(&self, job_id: JobId) -> Result<Subscription, EngineError> {
        let _guard = self.inner.locks.acquire(job_id).await;
        let job = self.load(job_id).await?;
        let subscription = self
            .inner
            .registry
            .subscribe(job_id, &JobEvent::from_job(&job));
        self.refresh_gauges();
        Ok(subscription)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.inner.registry.unsubscribe(handle);
        self.refresh_gauges();
        removed
    }

    fn spawn_attempt(&self, job_id: JobId) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.begin_attempt(job_id).await {
                Ok(job) => engine.execute(job).await,
                Err(err) => debug!(%job_id, %err, "attempt not started"),
            }
        });
    }

    /// Run the translator for an attempt that is already `processing`.
    async fn execute(&self, job: Job) {
        let Some(translator) = self.inner.translator.clone() else {
            return;
        };
        let job_id = job.id;
        let timer = self.inner.metrics.processing_seconds.start_timer();
        let translated = translator.translate(&job).await;
        timer.observe_duration();
        let outcome = match translated {
            Ok(output) => self.complete(job_id, output).await,
            Err(err) => self.fail(job_id, &err.to_string()).await,
        };
        match outcome {
            Ok(snapshot) => debug!(%job_id, status = %snapshot.status, "attempt finished"),
            Err(EngineError::InvalidTransition { from, .. }) => {
                info!(%job_id, status = %from, "job left processing during the attempt, result discarded")
            }
            Err(err) => error!(%job_id, %err, "failed to record attempt outcome"),
        }
    }

    /// One scheduler pass at the current time.
    pub async fn redeliver_due(&self) -> usize {
        self.redeliver_due_at(Utc::now()).await
    }

    /// Redeliver every dead-letter entry due at `now`.
    ///
    /// Each entry is handled in its own task; a failing entry never holds up
    /// the others. Returns how many jobs were moved back to `processing`.
    pub async fn redeliver_due_at(&self, now: DateTime<Utc>) -> usize {
        let due = self.inner.dlq.take_due(now);
        if due.is_empty() {
            return 0;
        }

        let mut tasks = JoinSet::new();
        for entry in due {
            let engine = self.clone();
            tasks.spawn(async move { engine.redeliver(entry).await });
        }

        let mut redelivered = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => redelivered += 1,
                Ok(false) => {}
                Err(err) => error!(%err, "redelivery task panicked"),
            }
        }
        self.refresh_gauges();
        redelivered
    }

    async fn redeliver(&self, entry: DlqEntry) -> bool {
        let job_id = entry.job_id;
        match self.begin_attempt(job_id).await {
            Ok(job) => {
                info!(%job_id, attempt = job.attempt_count, retry = entry.retry_count, "job redelivered");
                if self.inner.translator.is_some() {
                    let engine = self.clone();
                    tokio::spawn(async move { engine.execute(job).await });
                }
                true
            }
            Err(EngineError::Store(err)) => {
                let entry = self.inner.dlq.reschedule(entry, &err.to_string());
                warn!(%job_id, %err, next_retry_at = %entry.next_retry_at, "redelivery failed, rescheduled");
                false
            }
            Err(err) => {
                warn!(%job_id, %err, "dropping dead-letter entry");
                false
            }
        }
    }

    /// Rebuild in-memory state from the store after a restart.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();
        let store = &self.inner.store;

        let now = Utc::now();
        for job in store.list_by_status(JobStatus::QueuedForRetry).await? {
            self.inner.dlq.restore(DlqEntry {
                job_id: job.id,
                last_error: "recovered after restart".into(),
                next_retry_at: now,
                retry_count: job.attempt_count,
            });
            report.requeued += 1;
        }

        for job in store.list_by_status(JobStatus::Processing).await? {
            match self.fail(job.id, INTERRUPTED_BY_RESTART).await {
                Ok(_) => report.interrupted += 1,
                Err(err) => warn!(job_id = %job.id, %err, "could not fail interrupted job"),
            }
        }

        if self.inner.translator.is_some() {
            for job in store.list_by_status(JobStatus::Pending).await? {
                self.spawn_attempt(job.id);
                report.resumed += 1;
            }
        }

        self.refresh_gauges();
        info!(
            requeued = report.requeued,
            interrupted = report.interrupted,
            resumed = report.resumed,
            "recovery finished"
        );
        Ok(report)
    }

    /// Periodic housekeeping: expired cache entries and idle job locks.
    pub fn maintenance(&self) {
        let purged = self.inner.cache.purge_expired();
        let pruned = self.inner.locks.prune();
        if purged > 0 || pruned > 0 {
            debug!(purged, pruned, "maintenance pass");
        }
        self.refresh_gauges();
    }
}
