//! Read-through status cache with per-entry TTL.
//!
//! The cache is never authoritative. The engine persists to the job store
//! first, then invalidates and repopulates the entry. A snapshot older than the
//! one already cached is never written back, so a reader that loaded the record
//! before a concurrent write cannot overwrite the fresher entry.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use crate::state_machine::{JobId, JobSnapshot};

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: JobSnapshot,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct StatusCache {
    entries: DashMap<JobId, CacheEntry>,
    default_ttl: Duration,
}

impl StatusCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the cached snapshot, evicting it if it has expired.
    pub fn get(&self, job_id: JobId) -> Option<JobSnapshot> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(&job_id) {
            if entry.expires_at > now {
                return Some(entry.snapshot.clone());
            }
        }
        self.entries
            .remove_if(&job_id, |_, entry| entry.expires_at <= now);
        None
    }

    /// Stores `snapshot` unless the cached one was updated more recently.
    /// Returns false when the write was refused.
    pub fn put(&self, job_id: JobId, snapshot: JobSnapshot, ttl: Duration) -> bool {
        let entry = CacheEntry {
            snapshot,
            expires_at: Instant::now() + ttl,
        };
        match self.entries.entry(job_id) {
            Entry::Occupied(mut occupied) => {
                let cached = occupied.get();
                if cached.expires_at > Instant::now()
                    && cached.snapshot.updated_at > entry.snapshot.updated_at
                {
                    return false;
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        true
    }

    /// `put` with the configured TTL.
    pub fn put_default(&self, job_id: JobId, snapshot: JobSnapshot) -> bool {
        self.put(job_id, snapshot, self.default_ttl)
    }

    /// Returns true if an entry was removed.
    pub fn invalidate(&self, job_id: JobId) -> bool {
        self.entries.remove(&job_id).is_some()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{Job, JobStatus};
    use serde_json::Map;

    fn snapshot() -> JobSnapshot {
        Job::new("en".into(), "es".into(), Map::new()).snapshot()
    }

    #[tokio::test]
    async fn put_then_get() {
        let cache = StatusCache::new(Duration::from_secs(60));
        let snap = snapshot();
        cache.put_default(snap.job_id, snap.clone());
        assert_eq!(cache.get(snap.job_id), Some(snap));
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = StatusCache::new(Duration::from_secs(60));
        let snap = snapshot();
        cache.put_default(snap.job_id, snap.clone());

        assert!(cache.invalidate(snap.job_id));
        assert!(cache.get(snap.job_id).is_none());
        // Second invalidation has nothing to remove.
        assert!(!cache.invalidate(snap.job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = StatusCache::new(Duration::from_secs(60));
        let snap = snapshot();
        cache.put(snap.job_id, snap.clone(), Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get(snap.job_id).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(snap.job_id).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let cache = StatusCache::new(Duration::from_secs(60));
        let short = snapshot();
        let mut long = snapshot();
        long.status = JobStatus::Processing;
        cache.put(short.job_id, short.clone(), Duration::from_secs(1));
        cache.put(long.job_id, long.clone(), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(long.job_id), Some(long));
    }

    #[tokio::test]
    async fn older_snapshot_does_not_replace_newer() {
        let cache = StatusCache::new(Duration::from_secs(60));
        let stale = snapshot();
        let mut fresh = stale.clone();
        fresh.status = JobStatus::Completed;
        fresh.updated_at = stale.updated_at + chrono::TimeDelta::milliseconds(5);

        assert!(cache.put_default(fresh.job_id, fresh.clone()));
        assert!(!cache.put_default(stale.job_id, stale.clone()));
        assert_eq!(cache.get(fresh.job_id), Some(fresh.clone()));

        // Once invalidated, any snapshot may fill the slot again.
        cache.invalidate(fresh.job_id);
        assert!(cache.put_default(stale.job_id, stale.clone()));
        assert_eq!(cache.get(stale.job_id), Some(stale));
    }
}
