//! Fast coordination storage for queue indexes.
//!
//! The coordination store holds the per-queue waiting index, processing set,
//! delayed index and dead-letter list, plus the per-job poison counters. Every
//! entry here is a hint; the durable row is truth. Multi-step transitions that
//! must not interleave (pop-and-claim, move-to-DLQ, due-promotion, poison
//! tracking) are executed as atomic scripts by the Redis backend and under a
//! single lock by the in-memory one.

use crate::{job::JobId, priority::JobPriority, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod keys;
pub mod memory;
pub mod redis;

pub use self::memory::InMemoryCoordination;
pub use self::redis::RedisCoordination;

/// Contract of the coordination store (queue indexes and poison counters).
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Add a job to the waiting index with a priority+FIFO score. Re-adding
    /// an id updates its score to the current instant.
    async fn enqueue(&self, queue: &str, job_id: JobId, priority: JobPriority) -> Result<()>;

    /// Atomically pop the lowest-scored waiting job and add it to the
    /// processing set. Returns `None` when the queue is empty.
    async fn dequeue(&self, queue: &str) -> Result<Option<JobId>>;

    /// Remove a job from the processing set. Called on every terminal
    /// transition (success, fail-retry, dead, cancel, skip).
    async fn ack(&self, queue: &str, job_id: JobId) -> Result<()>;

    /// Remove a job from the waiting index (cancellation path).
    async fn remove_waiting(&self, queue: &str, job_id: JobId) -> Result<()>;

    /// Whether a job currently has a score in the waiting index.
    async fn is_waiting(&self, queue: &str, job_id: JobId) -> Result<bool>;

    /// Add a job to the delayed index, keyed by its promotion instant.
    async fn schedule_at(&self, queue: &str, job_id: JobId, at: DateTime<Utc>) -> Result<()>;

    /// Remove a job from the delayed index (cancellation path).
    async fn remove_delayed(&self, queue: &str, job_id: JobId) -> Result<()>;

    /// Atomically pop every delayed job whose promotion instant has passed.
    async fn pop_due(&self, queue: &str) -> Result<Vec<JobId>>;

    /// Snapshot of the processing set.
    async fn processing_ids(&self, queue: &str) -> Result<Vec<JobId>>;

    /// Atomically remove a job from the processing set and append it to the
    /// dead-letter list.
    async fn move_to_dlq(&self, queue: &str, job_id: JobId) -> Result<()>;

    /// Jobs currently parked in the dead-letter list, FIFO.
    async fn dlq_ids(&self, queue: &str) -> Result<Vec<JobId>>;

    /// Remove a job from the dead-letter list (manual retry path).
    async fn remove_from_dlq(&self, queue: &str, job_id: JobId) -> Result<()>;

    /// Record a failure instant for a job, drop entries older than `window`,
    /// and return how many failures remain inside the window.
    async fn record_failure(&self, job_id: JobId, window: Duration) -> Result<u64>;

    /// Round-trip latency probe for health checks.
    async fn ping(&self) -> Result<Duration>;
}
