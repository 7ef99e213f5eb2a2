//! Prometheus counters and gauges for an external scraper.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::state_machine::JobStatus;

const NAMESPACE: &str = "lingua_relay";

#[derive(Debug, Clone)]
pub struct EngineMetrics {
    registry: Registry,
    pub jobs_submitted: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_cancelled: IntCounter,
    pub jobs_dead: IntCounter,
    pub attempt_failures: IntCounter,
    pub retries_scheduled: IntCounter,
    pub channel_overruns: IntCounter,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub transitions: IntCounterVec,
    /// Wall time of each translator call, successful or not.
    pub processing_seconds: Histogram,
    pub dlq_depth: IntGauge,
    pub active_subscriptions: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let transitions = IntCounterVec::new(
            Opts::new("transitions_total", "Job status transitions by target status")
                .namespace(NAMESPACE),
            &["status"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "translation_processing_seconds",
                "Time spent processing translations",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(processing_seconds.clone()))?;

        Ok(Self {
            jobs_submitted: counter(&registry, "jobs_submitted_total", "Jobs accepted")?,
            jobs_completed: counter(&registry, "jobs_completed_total", "Jobs completed")?,
            jobs_cancelled: counter(&registry, "jobs_cancelled_total", "Jobs cancelled")?,
            jobs_dead: counter(&registry, "jobs_dead_total", "Jobs that exhausted their retries")?,
            attempt_failures: counter(
                &registry,
                "attempt_failures_total",
                "Processing attempts that failed",
            )?,
            retries_scheduled: counter(
                &registry,
                "retries_scheduled_total",
                "Retries scheduled through the dead-letter queue",
            )?,
            channel_overruns: counter(
                &registry,
                "channel_overruns_total",
                "Events dropped because a subscriber buffer was full",
            )?,
            cache_hits: counter(&registry, "cache_hits_total", "Status reads served by the cache")?,
            cache_misses: counter(
                &registry,
                "cache_misses_total",
                "Status reads that fell through to the store",
            )?,
            dlq_depth: gauge(&registry, "dlq_depth", "Jobs waiting in the dead-letter queue")?,
            active_subscriptions: gauge(
                &registry,
                "active_subscriptions",
                "Registered subscriber channels",
            )?,
            transitions,
            processing_seconds,
            registry,
        })
    }

    pub fn record_transition(&self, status: JobStatus) {
        self.transitions.with_label_values(&[status.as_str()]).inc();
        match status {
            JobStatus::Completed => self.jobs_completed.inc(),
            JobStatus::Cancelled => self.jobs_cancelled.inc(),
            JobStatus::Dead => self.jobs_dead.inc(),
            JobStatus::Error => self.attempt_failures.inc(),
            JobStatus::QueuedForRetry => self.retries_scheduled.inc(),
            JobStatus::Pending | JobStatus::Processing => {}
        }
    }

    /// Fraction of status reads served from the cache, 0.0 before any read.
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.get() as f64;
        let total = hits + self.cache_misses.get() as f64;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    /// Text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
