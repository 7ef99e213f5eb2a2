//! Dead-letter queue: retry policy and the set of jobs waiting for redelivery.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state_machine::{Job, JobId};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum processing attempts before a job is declared dead.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for the exponential part of the delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the backoff.
    /// delay = min(base_delay_ms * 2^retry_count, max_backoff_ms)
    pub fn base_backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    /// Random jitter in `[0, base_delay)`.
    pub fn jitter(&self) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..self.base_delay_ms))
    }

    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.base_backoff(retry_count) + self.jitter()
    }
}

/// A job parked in the dead-letter queue until its next retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job_id: JobId,
    pub last_error: String,
    pub next_retry_at: DateTime<Utc>,
    /// Retries scheduled for the job so far, this one included.
    pub retry_count: u32,
}

/// What the DLQ decided for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        next_retry_at: DateTime<Utc>,
        retry_count: u32,
    },
    Exhausted,
}

#[derive(Debug)]
pub struct DlqManager {
    policy: RetryPolicy,
    entries: DashMap<JobId, DlqEntry>,
}

impl DlqManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn retry_at(&self, retry_count: u32) -> DateTime<Utc> {
        let delay = self.policy.backoff(retry_count);
        let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Decide whether the attempt that just failed on `job` is retried.
    ///
    /// `job.attempt_count` already includes the failed attempt.
    pub fn handle_failure(&self, job: &Job, error: &str) -> FailureDecision {
        if job.attempt_count >= self.policy.max_attempts {
            self.entries.remove(&job.id);
            warn!(
                job_id = %job.id,
                attempts = job.attempt_count,
                max_attempts = self.policy.max_attempts,
                "retry budget exhausted"
            );
            return FailureDecision::Exhausted;
        }

        let retry_count = job.attempt_count;
        let next_retry_at = self.retry_at(retry_count.saturating_sub(1));
        let entry = DlqEntry {
            job_id: job.id,
            last_error: error.to_owned(),
            next_retry_at,
            retry_count,
        };
        self.entries.insert(job.id, entry);
        info!(
            job_id = %job.id,
            retry = retry_count,
            max_attempts = self.policy.max_attempts,
            %next_retry_at,
            "attempt failed, retry scheduled"
        );

        FailureDecision::Retry {
            next_retry_at,
            retry_count,
        }
    }

    /// Remove and return every entry due at `now`, earliest first.
    ///
    /// An entry re-armed for later between the scan and its removal stays queued.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<DlqEntry> {
        let due_ids: Vec<JobId> = self
            .entries
            .iter()
            .filter(|entry| entry.next_retry_at <= now)
            .map(|entry| entry.job_id)
            .collect();
        let mut due: Vec<DlqEntry> = due_ids
            .iter()
            .filter_map(|id| {
                self.entries
                    .remove_if(id, |_, entry| entry.next_retry_at <= now)
                    .map(|(_, entry)| entry)
            })
            .collect();
        due.sort_by_key(|entry| entry.next_retry_at);
        due
    }

    /// Put an entry back after a redelivery could not be dispatched.
    pub fn reschedule(&self, mut entry: DlqEntry, error: &str) -> DlqEntry {
        entry.next_retry_at = self.retry_at(entry.retry_count.saturating_sub(1));
        entry.last_error = error.to_owned();
        self.entries.insert(entry.job_id, entry.clone());
        entry
    }

    /// Insert an entry as-is (used when rebuilding the queue after a restart).
    pub fn restore(&self, entry: DlqEntry) {
        self.entries.insert(entry.job_id, entry);
    }

    pub fn remove(&self, job_id: JobId) -> Option<DlqEntry> {
        self.entries.remove(&job_id).map(|(_, entry)| entry)
    }

    pub fn entry(&self, job_id: JobId) -> Option<DlqEntry> {
        self.entries.get(&job_id).map(|entry| entry.value().clone())
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_backoff_ms: 5000,
        }
    }

    fn job_with_attempts(attempts: u32) -> Job {
        let mut job = Job::new("en".into(), "es".into(), Map::new());
        job.attempt_count = attempts;
        job
    }

    #[test]
    fn base_backoff_is_exponential_and_capped() {
        let policy = policy();
        assert_eq!(policy.base_backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.base_backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.base_backoff(3), Duration::from_millis(5000));
        assert_eq!(policy.base_backoff(64), Duration::from_millis(5000));
    }

    #[test]
    fn base_backoff_is_monotonic() {
        let policy = policy();
        let delays: Vec<Duration> = (0..20).map(|n| policy.base_backoff(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(5000)));
    }

    #[test]
    fn jitter_stays_below_base_delay() {
        let policy = policy();
        for n in 0..50 {
            let delay = policy.backoff(n % 4);
            let base = policy.base_backoff(n % 4);
            assert!(delay >= base);
            assert!(delay < base + Duration::from_millis(policy.base_delay_ms));
        }
        let no_base = RetryPolicy {
            base_delay_ms: 0,
            ..policy
        };
        assert_eq!(no_base.jitter(), Duration::ZERO);
    }

    #[test]
    fn failure_with_budget_schedules_retry_in_future() {
        let dlq = DlqManager::new(policy());
        let job = job_with_attempts(1);
        let before = Utc::now();

        let decision = dlq.handle_failure(&job, "boom");
        match decision {
            FailureDecision::Retry {
                next_retry_at,
                retry_count,
            } => {
                assert!(next_retry_at > before);
                assert_eq!(retry_count, 1);
            }
            FailureDecision::Exhausted => panic!("expected retry"),
        }

        let entry = dlq.entry(job.id).unwrap();
        assert_eq!(entry.last_error, "boom");
        assert_eq!(dlq.depth(), 1);
    }

    #[test]
    fn failure_upserts_existing_entry() {
        let dlq = DlqManager::new(policy());
        let mut job = job_with_attempts(1);
        dlq.handle_failure(&job, "first");

        job.attempt_count = 2;
        dlq.handle_failure(&job, "second");
        let entry = dlq.entry(job.id).unwrap();
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.last_error, "second");
        assert_eq!(dlq.depth(), 1);
    }

    #[test]
    fn exhausted_removes_entry() {
        let dlq = DlqManager::new(policy());
        let mut job = job_with_attempts(2);
        dlq.handle_failure(&job, "again");
        assert_eq!(dlq.depth(), 1);

        job.attempt_count = 3;
        assert_eq!(dlq.handle_failure(&job, "final"), FailureDecision::Exhausted);
        assert!(dlq.entry(job.id).is_none());
        assert_eq!(dlq.depth(), 0);
    }

    #[test]
    fn take_due_only_returns_elapsed_entries() {
        let dlq = DlqManager::new(policy());
        let now = Utc::now();
        let due = DlqEntry {
            job_id: uuid::Uuid::new_v4(),
            last_error: "x".into(),
            next_retry_at: now - TimeDelta::seconds(1),
            retry_count: 1,
        };
        let later = DlqEntry {
            job_id: uuid::Uuid::new_v4(),
            last_error: "y".into(),
            next_retry_at: now + TimeDelta::seconds(60),
            retry_count: 1,
        };
        dlq.restore(due.clone());
        dlq.restore(later.clone());

        let taken = dlq.take_due(now);
        assert_eq!(taken, vec![due]);
        assert_eq!(dlq.depth(), 1);
        assert!(dlq.entry(later.job_id).is_some());
        assert!(dlq.take_due(now).is_empty());
    }

    #[test]
    fn reschedule_pushes_entry_back() {
        let dlq = DlqManager::new(policy());
        let entry = DlqEntry {
            job_id: uuid::Uuid::new_v4(),
            last_error: "x".into(),
            next_retry_at: Utc::now(),
            retry_count: 1,
        };
        let before = Utc::now();
        let rescheduled = dlq.reschedule(entry, "store unavailable");
        assert!(rescheduled.next_retry_at > before);
        assert_eq!(rescheduled.last_error, "store unavailable");
        assert_eq!(dlq.depth(), 1);
    }
}
