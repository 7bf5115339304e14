//! Job types and utilities for representing work units in the queue.
//!
//! This module provides the core [`Job`] struct and [`JobStatus`] enum that represent
//! individual units of work to be processed by workers. Jobs carry all the metadata
//! needed for scheduling, prioritization, retry accounting, and lifecycle management.

use crate::priority::JobPriority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job.
///
/// Each job gets a unique UUID when created to enable tracking and management
/// throughout its lifecycle.
pub type JobId = Uuid;

/// Minimum queue name length.
pub const QUEUE_NAME_MIN: usize = 1;
/// Maximum queue name length.
pub const QUEUE_NAME_MAX: usize = 100;
/// Maximum handler key length.
pub const JOB_TYPE_MAX: usize = 200;
/// Lower bound on a job's visibility timeout, in milliseconds.
pub const VISIBILITY_TIMEOUT_MIN_MS: i64 = 5_000;
/// Upper bound on a job's visibility timeout, in milliseconds.
pub const VISIBILITY_TIMEOUT_MAX_MS: i64 = 3_600_000;

/// Default number of retries before a failing job is dead-lettered.
pub const DEFAULT_MAX_RETRIES: i32 = 3;
/// Default visibility timeout, in milliseconds.
pub const DEFAULT_VISIBILITY_TIMEOUT_MS: i64 = 30_000;

/// The current status of a job in its lifecycle.
///
/// Jobs progress from creation to one of the terminal states. Only
/// [`retry`](crate::intake::Intake::retry) re-opens a terminal job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Job is waiting in its queue to be claimed by a worker.
    Pending,
    /// Job has a future `scheduled_at` and sits in the delayed index.
    Scheduled,
    /// Job is currently claimed and being executed by a worker.
    Processing,
    /// Job completed successfully.
    Completed,
    /// Job failed and is waiting for its retry delay to elapse.
    Failed,
    /// Job failed permanently and was routed to the dead-letter queue.
    Dead,
    /// Job was cancelled before a worker picked it up.
    Cancelled,
}

impl JobStatus {
    /// Stable lowercase form used for database storage and coordination keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the status is terminal. Terminal jobs are only re-opened by an
    /// explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Dead | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::ConveyorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "scheduled" => Ok(JobStatus::Scheduled),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(crate::error::ConveyorError::validation(
                "status",
                format!("unknown job status '{other}'"),
            )),
        }
    }
}

/// A unit of work to be processed by the queue.
///
/// The durable row is the source of truth for a job; the coordination-store
/// indexes only hold its id. Each job contains:
/// - A unique identifier for tracking
/// - Queue name for routing to appropriate workers
/// - A handler key (`job_type`) resolved against the worker's registry
/// - JSON payload containing the work data
/// - Retry, scheduling and visibility configuration
///
/// # Examples
///
/// ```rust
/// use conveyor::{Job, JobPriority};
/// use serde_json::json;
///
/// let job = Job::new("emails", "send_welcome", json!({"to": "user@example.com"}))
///     .with_priority(JobPriority::High)
///     .with_max_retries(5);
///
/// assert_eq!(job.queue, "emails");
/// assert_eq!(job.priority, JobPriority::High);
/// assert_eq!(job.attempts, 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Name of the queue this job belongs to.
    pub queue: String,
    /// Handler key used to resolve the function that executes this job.
    pub job_type: String,
    /// Priority level for queue ordering.
    pub priority: JobPriority,
    /// Current status of the job.
    pub status: JobStatus,
    /// JSON payload containing the work data.
    pub payload: serde_json::Value,
    /// Result produced by the handler, present only after terminal success.
    pub result: Option<serde_json::Value>,
    /// Error message from the most recent failure.
    pub error: Option<String>,
    /// Number of times a worker has claimed this job.
    pub attempts: i32,
    /// Retry cap; a job exceeding it is dead-lettered.
    pub max_retries: i32,
    /// How long a worker may hold a claim before the scheduler reclaims it.
    pub visibility_timeout_ms: i64,
    /// Caller-supplied token collapsing duplicate submissions into one job.
    pub idempotency_key: Option<String>,
    /// Future execution instant; null once the job has been promoted.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Identity of the worker holding the current claim.
    pub locked_by: Option<String>,
    /// Instant of the current claim.
    pub locked_at: Option<DateTime<Utc>>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new job with default settings: medium priority, three
    /// retries, the default visibility timeout, eligible immediately.
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            job_type: job_type.into(),
            priority: JobPriority::default(),
            status: JobStatus::Pending,
            payload,
            result: None,
            error: None,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            idempotency_key: None,
            scheduled_at: None,
            locked_by: None,
            locked_at: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Set the priority level.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry cap.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the visibility timeout.
    pub fn with_visibility_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.visibility_timeout_ms = timeout_ms;
        self
    }

    /// Attach an idempotency key. A second submission with the same key
    /// returns the original job instead of creating a new one.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Schedule the job for a future instant. Until then it sits in the
    /// delayed index with status [`JobStatus::Scheduled`].
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self.status = JobStatus::Scheduled;
        self
    }

    /// Whether the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Validate field ranges. Called by intake before the job is persisted.
    pub fn validate(&self) -> crate::Result<()> {
        let queue_len = self.queue.chars().count();
        if !(QUEUE_NAME_MIN..=QUEUE_NAME_MAX).contains(&queue_len) {
            return Err(crate::error::ConveyorError::validation(
                "queue",
                format!("queue name must be 1-{QUEUE_NAME_MAX} characters"),
            ));
        }
        let type_len = self.job_type.chars().count();
        if !(1..=JOB_TYPE_MAX).contains(&type_len) {
            return Err(crate::error::ConveyorError::validation(
                "type",
                format!("job type must be 1-{JOB_TYPE_MAX} characters"),
            ));
        }
        if self.max_retries < 0 {
            return Err(crate::error::ConveyorError::validation(
                "maxRetries",
                "maxRetries must be non-negative",
            ));
        }
        if !(VISIBILITY_TIMEOUT_MIN_MS..=VISIBILITY_TIMEOUT_MAX_MS)
            .contains(&self.visibility_timeout_ms)
        {
            return Err(crate::error::ConveyorError::validation(
                "visibilityTimeout",
                format!(
                    "visibility timeout must be {VISIBILITY_TIMEOUT_MIN_MS}-{VISIBILITY_TIMEOUT_MAX_MS} ms"
                ),
            ));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() {
                return Err(crate::error::ConveyorError::validation(
                    "idempotencyKey",
                    "idempotency key must not be empty",
                ));
            }
        }
        Ok(())
    }
}

/// Append-only history record for a job's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    /// Job this entry belongs to.
    pub job_id: JobId,
    /// Status the job entered.
    pub status: JobStatus,
    /// Free-text detail (error message, retry delay, cancellation reason).
    pub message: Option<String>,
    /// Worker that caused the transition, when one did.
    pub worker_id: Option<String>,
    /// When the transition happened.
    pub created_at: DateTime<Utc>,
}

/// Liveness record a worker upserts while it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub hostname: String,
    pub queues: Vec<String>,
    pub concurrency: u32,
    pub active_jobs: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}
