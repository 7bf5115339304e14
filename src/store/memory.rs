//! In-memory implementation of the durable store for tests and development.
//!
//! All operations run against process-local maps guarded by an async lock,
//! and time is read from a [`MockClock`] so delayed promotion, visibility
//! timeouts and poison windows can be exercised deterministically and fast.

use super::{DurableStore, JobFilter, JobPage};
use crate::{
    job::{Job, JobHistoryEntry, JobId, JobStatus, WorkerHeartbeat},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::RwLock;

/// Controllable clock shared by the in-memory stores.
///
/// # Examples
///
/// ```rust
/// use conveyor::store::MockClock;
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let before = clock.now();
/// clock.advance(Duration::seconds(90));
/// assert_eq!((clock.now() - before).num_seconds(), 90);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self {
            current_time: Arc::new(Mutex::new(Utc::now())),
        }
    }

    /// Current instant according to this clock.
    pub fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock().unwrap()
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self.current_time.lock().unwrap();
        *time += duration;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.current_time.lock().unwrap() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct InMemoryState {
    jobs: HashMap<JobId, Job>,
    history: Vec<JobHistoryEntry>,
    heartbeats: HashMap<String, WorkerHeartbeat>,
}

/// Durable store kept entirely in process memory.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<InMemoryState>>,
    clock: MockClock,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(MockClock::new())
    }

    /// Create a store reading time from the given clock.
    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            state: Arc::new(RwLock::new(InMemoryState::default())),
            clock,
        }
    }

    /// The clock backing this store.
    pub fn clock(&self) -> &MockClock {
        &self.clock
    }

    async fn update_where<F>(&self, job_id: JobId, guard: F) -> Result<Option<Job>>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> bool,
    {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&job_id) {
            Some(job) => {
                if guard(job, now) {
                    Ok(Some(job.clone()))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn insert_job(&self, job: &Job) -> Result<bool> {
        let mut state = self.state.write().await;
        if let Some(key) = &job.idempotency_key {
            let duplicate = state
                .jobs
                .values()
                .any(|existing| existing.idempotency_key.as_deref() == Some(key));
            if duplicate {
                return Ok(false);
            }
        }
        state.jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .find(|job| job.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn claim_job(&self, job_id: JobId, worker_id: &str) -> Result<Option<Job>> {
        self.update_where(job_id, |job, now| {
            if !matches!(job.status, JobStatus::Pending | JobStatus::Failed) {
                return false;
            }
            job.status = JobStatus::Processing;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.attempts += 1;
            true
        })
        .await
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>> {
        self.update_where(job_id, |job, now| {
            if job.status != JobStatus::Processing || job.locked_by.as_deref() != Some(worker_id) {
                return false;
            }
            job.status = JobStatus::Completed;
            job.result = result;
            job.error = None;
            job.locked_by = None;
            job.locked_at = None;
            job.completed_at = Some(now);
            true
        })
        .await
    }

    async fn complete_job_external(&self, job_id: JobId) -> Result<Option<Job>> {
        self.update_where(job_id, |job, now| {
            if job.status != JobStatus::Processing {
                return false;
            }
            job.status = JobStatus::Completed;
            job.locked_by = None;
            job.locked_at = None;
            job.completed_at = Some(now);
            true
        })
        .await
    }

    async fn fail_job(&self, job_id: JobId, error: &str) -> Result<Option<Job>> {
        self.update_where(job_id, |job, _| {
            if job.status != JobStatus::Processing {
                return false;
            }
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.locked_by = None;
            job.locked_at = None;
            true
        })
        .await
    }

    async fn mark_job_dead(&self, job_id: JobId, error: &str) -> Result<Option<Job>> {
        self.update_where(job_id, |job, _| {
            if job.status != JobStatus::Processing {
                return false;
            }
            job.status = JobStatus::Dead;
            job.error = Some(error.to_string());
            job.locked_by = None;
            job.locked_at = None;
            true
        })
        .await
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.update_where(job_id, |job, now| {
            if !matches!(job.status, JobStatus::Pending | JobStatus::Scheduled) {
                return false;
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now);
            true
        })
        .await
    }

    async fn reset_for_retry(&self, job_id: JobId) -> Result<Option<Job>> {
        self.update_where(job_id, |job, _| {
            if !matches!(
                job.status,
                JobStatus::Failed | JobStatus::Dead | JobStatus::Cancelled
            ) {
                return false;
            }
            job.status = JobStatus::Pending;
            job.attempts = 0;
            job.error = None;
            job.locked_by = None;
            job.locked_at = None;
            job.completed_at = None;
            true
        })
        .await
    }

    async fn promote_scheduled(&self, job_id: JobId) -> Result<Option<Job>> {
        self.update_where(job_id, |job, _| {
            if job.status != JobStatus::Scheduled {
                return false;
            }
            job.status = JobStatus::Pending;
            job.scheduled_at = None;
            true
        })
        .await
    }

    async fn reclaim_job(
        &self,
        job_id: JobId,
        observed_locked_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.update_where(job_id, |job, _| {
            if job.status != JobStatus::Processing || job.locked_at != Some(observed_locked_at) {
                return false;
            }
            job.status = JobStatus::Pending;
            job.locked_by = None;
            job.locked_at = None;
            true
        })
        .await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        let state = self.state.read().await;
        let mut matching: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| {
                filter
                    .queue
                    .as_deref()
                    .map(|queue| job.queue == queue)
                    .unwrap_or(true)
                    && filter
                        .status
                        .map(|status| job.status == status)
                        .unwrap_or(true)
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let jobs = matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect();
        Ok(JobPage { jobs, total })
    }

    async fn pending_job_ids(&self, queue: &str) -> Result<Vec<JobId>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.status == JobStatus::Pending)
            .map(|job| job.id)
            .collect())
    }

    async fn append_history(&self, entry: &JobHistoryEntry) -> Result<()> {
        let mut state = self.state.write().await;
        state.history.push(entry.clone());
        Ok(())
    }

    async fn get_history(&self, job_id: JobId) -> Result<Vec<JobHistoryEntry>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .heartbeats
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>> {
        let state = self.state.read().await;
        Ok(state.heartbeats.values().cloned().collect())
    }

    async fn remove_heartbeat(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.heartbeats.remove(worker_id);
        Ok(())
    }

    async fn ping(&self) -> Result<Duration> {
        Ok(Duration::from_micros(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_claim_increments_attempts_and_locks() {
        let store = InMemoryStore::new();
        let job = Job::new("default", "echo", json!({}));
        store.insert_job(&job).await.unwrap();

        let claimed = store.claim_job(job.id, "w1").await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.locked_by.as_deref(), Some("w1"));

        // Second claim must fail: the job is already processing.
        assert!(store.claim_job(job.id, "w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_idempotency_key() {
        let store = InMemoryStore::new();
        let first = Job::new("default", "echo", json!({})).with_idempotency_key("k1");
        let second = Job::new("default", "echo", json!({})).with_idempotency_key("k1");
        assert!(store.insert_job(&first).await.unwrap());
        assert!(!store.insert_job(&second).await.unwrap());
        let found = store.find_by_idempotency_key("k1").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn test_reclaim_requires_observed_lock_instant() {
        let store = InMemoryStore::new();
        let job = Job::new("default", "echo", json!({}));
        store.insert_job(&job).await.unwrap();
        let claimed = store.claim_job(job.id, "w1").await.unwrap().unwrap();

        let stale = claimed.locked_at.unwrap() - chrono::Duration::seconds(1);
        assert!(store.reclaim_job(job.id, stale).await.unwrap().is_none());

        let reclaimed = store
            .reclaim_job(job.id, claimed.locked_at.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.status, JobStatus::Pending);
        assert!(reclaimed.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_complete_requires_owning_worker() {
        let store = InMemoryStore::new();
        let job = Job::new("default", "echo", json!({}));
        store.insert_job(&job).await.unwrap();
        store.claim_job(job.id, "w1").await.unwrap().unwrap();

        assert!(store
            .complete_job(job.id, "w2", None)
            .await
            .unwrap()
            .is_none());
        let done = store
            .complete_job(job.id, "w1", Some(json!({"ok": true})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_list_jobs_filters_and_paginates() {
        let clock = MockClock::new();
        let store = InMemoryStore::with_clock(clock.clone());
        for i in 0..5 {
            let mut job = Job::new("emails", "send", json!({"i": i}));
            job.created_at = clock.now() + chrono::Duration::milliseconds(i);
            store.insert_job(&job).await.unwrap();
        }
        let other = Job::new("reports", "build", json!({}));
        store.insert_job(&other).await.unwrap();

        let page = store
            .list_jobs(&JobFilter {
                queue: Some("emails".to_string()),
                status: Some(JobStatus::Pending),
                limit: 2,
                offset: 1,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 2);
        assert!(page.jobs.iter().all(|job| job.queue == "emails"));
    }
}
