//! Durable job storage.
//!
//! The durable store holds the canonical job record, the append-only history
//! log and worker heartbeats. It is the source of truth for job status: the
//! coordination-store indexes are hints reconciled against it. All mutating
//! operations that guard a state transition are conditional single-row
//! updates, so concurrent writers cannot clobber a transition they did not
//! observe.

use crate::{
    job::{Job, JobHistoryEntry, JobId, JobStatus, WorkerHeartbeat},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod memory;
pub mod postgres;

pub use self::memory::{InMemoryStore, MockClock};
pub use self::postgres::PostgresStore;

/// Filter and pagination for job listing.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: u32,
    pub offset: u64,
}

/// A page of jobs plus the total row count for the filter.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
}

/// Contract of the durable job store.
///
/// Conditional operations return `Ok(None)` when the guard did not match,
/// which callers treat as "the job moved on without us" and reconcile by
/// acking the coordination entry.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Current instant as this store observes it. In-memory stores back this
    /// with a controllable clock so time-dependent logic is testable.
    fn now(&self) -> DateTime<Utc>;

    /// Insert a new job row. Returns `false` when an idempotency-key
    /// uniqueness conflict prevented the insert.
    async fn insert_job(&self, job: &Job) -> Result<bool>;

    /// Fetch a job by id.
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Fetch the job owning the given idempotency key, if any.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>>;

    /// Claim a job for a worker: `PENDING`/`FAILED` → `PROCESSING`, locks
    /// recorded, attempts incremented. `Ok(None)` means the job was not
    /// eligible (cancelled, already claimed, gone) and the caller must ack
    /// the coordination pop.
    async fn claim_job(&self, job_id: JobId, worker_id: &str) -> Result<Option<Job>>;

    /// Success finalize by the claiming worker: `PROCESSING` (held by
    /// `worker_id`) → `COMPLETED` with the handler result.
    async fn complete_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>>;

    /// External finalize used by long-running hand-off handlers:
    /// `PROCESSING` → `COMPLETED`, whoever holds the claim.
    async fn complete_job_external(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Failure finalize: `PROCESSING` → `FAILED` with the error recorded and
    /// locks cleared. The job will be re-enqueued by the scheduler after its
    /// retry delay.
    async fn fail_job(&self, job_id: JobId, error: &str) -> Result<Option<Job>>;

    /// Terminal failure: `PROCESSING` → `DEAD` with the error recorded and
    /// locks cleared.
    async fn mark_job_dead(&self, job_id: JobId, error: &str) -> Result<Option<Job>>;

    /// Cancel: `PENDING`/`SCHEDULED` → `CANCELLED`.
    async fn cancel_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Re-open a terminal job: `FAILED`/`DEAD`/`CANCELLED` → `PENDING` with
    /// attempts reset and error cleared.
    async fn reset_for_retry(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Promotion by the scheduler: `SCHEDULED` → `PENDING`, `scheduled_at`
    /// cleared.
    async fn promote_scheduled(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Visibility-timeout reclaim: `PROCESSING` with the observed `locked_at`
    /// → `PENDING`, locks cleared. The `locked_at` guard keeps a concurrent
    /// finalize from being overwritten.
    async fn reclaim_job(
        &self,
        job_id: JobId,
        observed_locked_at: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// List jobs matching a filter, newest first, with the total count.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage>;

    /// Ids of all `PENDING` jobs in a queue. Used by the orphan sweep.
    async fn pending_job_ids(&self, queue: &str) -> Result<Vec<JobId>>;

    /// Append a history row.
    async fn append_history(&self, entry: &JobHistoryEntry) -> Result<()>;

    /// Full history for a job, oldest first.
    async fn get_history(&self, job_id: JobId) -> Result<Vec<JobHistoryEntry>>;

    /// Insert or refresh a worker heartbeat.
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()>;

    /// All known worker heartbeats.
    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>>;

    /// Drop a worker's heartbeat on clean shutdown.
    async fn remove_heartbeat(&self, worker_id: &str) -> Result<()>;

    /// Round-trip latency probe for health checks.
    async fn ping(&self) -> Result<Duration>;
}

/// Convenience constructor for history entries stamped with the store's time.
pub fn history_entry(
    store: &dyn DurableStore,
    job_id: JobId,
    status: JobStatus,
    message: Option<String>,
    worker_id: Option<String>,
) -> JobHistoryEntry {
    JobHistoryEntry {
        job_id,
        status,
        message,
        worker_id,
        created_at: store.now(),
    }
}
