//! Job intake: create, retry, cancel, and external completion.
//!
//! Intake owns the write path into the engine. It validates input, persists
//! the canonical row first, and only then places the job id into the
//! coordination indexes; re-running a placement is idempotent, so a crash
//! between the two writes is recovered by the scheduler's sweeps.

use crate::{
    config::Config,
    coordination::CoordinationStore,
    error::ConveyorError,
    job::{Job, JobHistoryEntry, JobId, JobStatus},
    priority::JobPriority,
    store::{history_entry, DurableStore, JobFilter, JobPage},
    Result,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Submission request, mirroring the shape accepted by the HTTP surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJob {
    pub queue: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub visibility_timeout_ms: Option<i64>,
}

/// Outcome of a create call. `idempotent` is set when an existing job with
/// the same idempotency key was returned instead of a new row.
#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job: Job,
    pub idempotent: bool,
}

/// Entry point for producers and the admin surface.
pub struct Intake<D, C> {
    durable: Arc<D>,
    coordination: Arc<C>,
    config: Config,
}

impl<D, C> Intake<D, C>
where
    D: DurableStore,
    C: CoordinationStore,
{
    pub fn new(durable: Arc<D>, coordination: Arc<C>, config: Config) -> Self {
        Self {
            durable,
            coordination,
            config,
        }
    }

    /// Validate and persist a new job, then place it for execution.
    ///
    /// A job whose `scheduled_at` lies in the future lands in the delayed
    /// index as `SCHEDULED`; everything else is enqueued as `PENDING`.
    pub async fn create(&self, request: CreateJob) -> Result<CreatedJob> {
        let now = self.durable.now();
        let mut job = Job::new(request.queue, request.job_type, request.payload)
            .with_priority(request.priority)
            .with_max_retries(
                request
                    .max_retries
                    .unwrap_or(self.config.default_max_retries),
            )
            .with_visibility_timeout_ms(
                request
                    .visibility_timeout_ms
                    .unwrap_or(self.config.default_visibility_timeout_ms),
            );
        job.created_at = now;
        if let Some(key) = request.idempotency_key {
            job = job.with_idempotency_key(key);
        }
        if let Some(at) = request.scheduled_at {
            if at > now {
                job = job.scheduled_for(at);
            }
        }
        job.validate()?;

        if let Some(key) = job.idempotency_key.clone() {
            if let Some(existing) = self.durable.find_by_idempotency_key(&key).await? {
                debug!(job_id = %existing.id, key = %key, "idempotency key hit, returning existing job");
                return Ok(CreatedJob {
                    job: existing,
                    idempotent: true,
                });
            }
        }

        if !self.durable.insert_job(&job).await? {
            // Lost a concurrent race on the idempotency key; the winner's row
            // is the job.
            let key = job.idempotency_key.as_deref().unwrap_or_default();
            let existing = self
                .durable
                .find_by_idempotency_key(key)
                .await?
                .ok_or_else(|| ConveyorError::JobNotFound {
                    id: job.id.to_string(),
                })?;
            return Ok(CreatedJob {
                job: existing,
                idempotent: true,
            });
        }

        self.durable
            .append_history(&history_entry(
                self.durable.as_ref(),
                job.id,
                job.status,
                Some("Job created".to_string()),
                None,
            ))
            .await?;

        match (job.status, job.scheduled_at) {
            (JobStatus::Scheduled, Some(at)) => {
                self.coordination.schedule_at(&job.queue, job.id, at).await?;
                info!(job_id = %job.id, queue = %job.queue, scheduled_at = %at, "job scheduled");
            }
            _ => {
                self.coordination
                    .enqueue(&job.queue, job.id, job.priority)
                    .await?;
                info!(job_id = %job.id, queue = %job.queue, priority = %job.priority, "job enqueued");
            }
        }

        Ok(CreatedJob {
            job,
            idempotent: false,
        })
    }

    /// Re-open a failed, dead or cancelled job: attempts reset, error
    /// cleared, straight back into the waiting index.
    pub async fn retry(&self, job_id: JobId) -> Result<Job> {
        let job = match self.durable.reset_for_retry(job_id).await? {
            Some(job) => job,
            None => return Err(self.conflict_or_not_found(job_id, "retry").await),
        };

        self.durable
            .append_history(&history_entry(
                self.durable.as_ref(),
                job.id,
                JobStatus::Pending,
                Some("Job queued for retry".to_string()),
                None,
            ))
            .await?;

        // Harmless when the job was not dead-lettered.
        self.coordination.remove_from_dlq(&job.queue, job.id).await?;
        self.coordination
            .enqueue(&job.queue, job.id, job.priority)
            .await?;
        info!(job_id = %job.id, queue = %job.queue, "job re-queued by retry");
        Ok(job)
    }

    /// Cancel a job that has not started. Processing jobs cannot be
    /// interrupted; terminal jobs cannot be cancelled.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let job = match self.durable.cancel_job(job_id).await? {
            Some(job) => job,
            None => return Err(self.conflict_or_not_found(job_id, "cancel").await),
        };

        self.durable
            .append_history(&history_entry(
                self.durable.as_ref(),
                job.id,
                JobStatus::Cancelled,
                Some("Job cancelled".to_string()),
                None,
            ))
            .await?;

        self.coordination.remove_waiting(&job.queue, job.id).await?;
        self.coordination.remove_delayed(&job.queue, job.id).await?;
        info!(job_id = %job.id, queue = %job.queue, "job cancelled");
        Ok(job)
    }

    /// External finalization for hand-off handlers: mark a processing job
    /// completed on behalf of `completed_by`.
    pub async fn complete(&self, job_id: JobId, completed_by: &str) -> Result<Job> {
        let job = match self.durable.complete_job_external(job_id).await? {
            Some(job) => job,
            None => return Err(self.conflict_or_not_found(job_id, "complete").await),
        };

        self.durable
            .append_history(&history_entry(
                self.durable.as_ref(),
                job.id,
                JobStatus::Completed,
                Some(format!("Job completed by {completed_by}")),
                Some(completed_by.to_string()),
            ))
            .await?;

        self.coordination.ack(&job.queue, job.id).await?;
        info!(job_id = %job.id, completed_by, "job completed externally");
        Ok(job)
    }

    /// Fetch a job with its full history.
    pub async fn get_job(&self, job_id: JobId) -> Result<(Job, Vec<JobHistoryEntry>)> {
        let job = self
            .durable
            .get_job(job_id)
            .await?
            .ok_or_else(|| ConveyorError::JobNotFound {
                id: job_id.to_string(),
            })?;
        let history = self.durable.get_history(job_id).await?;
        Ok((job, history))
    }

    /// List jobs with filters and pagination.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        self.durable.list_jobs(filter).await
    }

    async fn conflict_or_not_found(&self, job_id: JobId, operation: &str) -> ConveyorError {
        match self.durable.get_job(job_id).await {
            Ok(Some(job)) => ConveyorError::conflict(job_id, job.status, operation),
            Ok(None) => ConveyorError::JobNotFound {
                id: job_id.to_string(),
            },
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordination;
    use crate::store::{InMemoryStore, MockClock};
    use serde_json::json;

    fn harness() -> (Arc<InMemoryStore>, Arc<InMemoryCoordination>, MockClock) {
        let clock = MockClock::new();
        let durable = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let coordination = Arc::new(InMemoryCoordination::with_clock(clock.clone()));
        (durable, coordination, clock)
    }

    fn intake(
        durable: &Arc<InMemoryStore>,
        coordination: &Arc<InMemoryCoordination>,
    ) -> Intake<InMemoryStore, InMemoryCoordination> {
        Intake::new(durable.clone(), coordination.clone(), Config::default())
    }

    fn request(queue: &str) -> CreateJob {
        CreateJob {
            queue: queue.to_string(),
            job_type: "echo".to_string(),
            priority: JobPriority::default(),
            payload: json!({"x": 1}),
            idempotency_key: None,
            max_retries: None,
            scheduled_at: None,
            visibility_timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_create_enqueues_pending_job() {
        let (durable, coordination, _) = harness();
        let intake = intake(&durable, &coordination);

        let created = intake.create(request("emails")).await.unwrap();
        assert!(!created.idempotent);
        assert_eq!(created.job.status, JobStatus::Pending);
        assert!(coordination
            .is_waiting("emails", created.job.id)
            .await
            .unwrap());

        let history = durable.get_history(created.job.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message.as_deref(), Some("Job created"));
    }

    #[tokio::test]
    async fn test_create_scheduled_job_lands_in_delayed_index() {
        let (durable, coordination, clock) = harness();
        let intake = intake(&durable, &coordination);

        let mut req = request("emails");
        req.scheduled_at = Some(clock.now() + chrono::Duration::seconds(30));
        let created = intake.create(req).await.unwrap();
        assert_eq!(created.job.status, JobStatus::Scheduled);
        assert!(!coordination
            .is_waiting("emails", created.job.id)
            .await
            .unwrap());

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(
            coordination.pop_due("emails").await.unwrap(),
            vec![created.job.id]
        );
    }

    #[tokio::test]
    async fn test_create_with_past_scheduled_at_enqueues_immediately() {
        let (durable, coordination, clock) = harness();
        let intake = intake(&durable, &coordination);

        let mut req = request("emails");
        req.scheduled_at = Some(clock.now() - chrono::Duration::seconds(5));
        let created = intake.create(req).await.unwrap();
        assert_eq!(created.job.status, JobStatus::Pending);
        assert!(coordination
            .is_waiting("emails", created.job.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_create_is_idempotent_on_key() {
        let (durable, coordination, _) = harness();
        let intake = intake(&durable, &coordination);

        let mut req = request("emails");
        req.idempotency_key = Some("k1".to_string());
        let first = intake.create(req.clone()).await.unwrap();
        let second = intake.create(req).await.unwrap();

        assert!(!first.idempotent);
        assert!(second.idempotent);
        assert_eq!(first.job.id, second.job.id);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let (durable, coordination, _) = harness();
        let intake = intake(&durable, &coordination);

        let mut req = request("emails");
        req.job_type = String::new();
        assert!(matches!(
            intake.create(req).await,
            Err(ConveyorError::Validation { .. })
        ));

        let mut req = request(&"q".repeat(101));
        req.job_type = "echo".to_string();
        assert!(intake.create(req).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let (durable, coordination, _) = harness();
        let intake = intake(&durable, &coordination);

        let created = intake.create(request("emails")).await.unwrap();
        let cancelled = intake.cancel(created.job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(!coordination
            .is_waiting("emails", created.job.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancel_scheduled_job_clears_delayed_index() {
        let (durable, coordination, clock) = harness();
        let intake = intake(&durable, &coordination);

        let mut req = request("emails");
        req.scheduled_at = Some(clock.now() + chrono::Duration::seconds(10));
        let created = intake.create(req).await.unwrap();

        intake.cancel(created.job.id).await.unwrap();
        clock.advance(chrono::Duration::seconds(11));
        assert!(coordination.pop_due("emails").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_processing_job_conflicts() {
        let (durable, coordination, _) = harness();
        let intake = intake(&durable, &coordination);

        let created = intake.create(request("emails")).await.unwrap();
        durable.claim_job(created.job.id, "w1").await.unwrap();

        assert!(matches!(
            intake.cancel(created.job.id).await,
            Err(ConveyorError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_resets_attempts_and_requeues() {
        let (durable, coordination, _) = harness();
        let intake = intake(&durable, &coordination);

        let created = intake.create(request("emails")).await.unwrap();
        durable.claim_job(created.job.id, "w1").await.unwrap();
        durable
            .mark_job_dead(created.job.id, "boom")
            .await
            .unwrap();
        coordination
            .move_to_dlq("emails", created.job.id)
            .await
            .unwrap();

        let retried = intake.retry(created.job.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 0);
        assert!(retried.error.is_none());
        assert!(coordination.dlq_ids("emails").await.unwrap().is_empty());
        assert!(coordination
            .is_waiting("emails", created.job.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_retry_of_pending_job_conflicts() {
        let (durable, coordination, _) = harness();
        let intake = intake(&durable, &coordination);

        let created = intake.create(request("emails")).await.unwrap();
        assert!(matches!(
            intake.retry(created.job.id).await,
            Err(ConveyorError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_complete_external_requires_processing() {
        let (durable, coordination, _) = harness();
        let intake = intake(&durable, &coordination);

        let created = intake.create(request("emails")).await.unwrap();
        assert!(matches!(
            intake.complete(created.job.id, "svc").await,
            Err(ConveyorError::Conflict { .. })
        ));

        durable.claim_job(created.job.id, "w1").await.unwrap();
        coordination.dequeue("emails").await.unwrap();
        let completed = intake.complete(created.job.id, "svc").await.unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(coordination
            .processing_ids("emails")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_operations_on_missing_job_return_not_found() {
        let (durable, coordination, _) = harness();
        let intake = intake(&durable, &coordination);
        let missing = uuid::Uuid::new_v4();

        assert!(matches!(
            intake.retry(missing).await,
            Err(ConveyorError::JobNotFound { .. })
        ));
        assert!(matches!(
            intake.cancel(missing).await,
            Err(ConveyorError::JobNotFound { .. })
        ));
        assert!(matches!(
            intake.get_job(missing).await,
            Err(ConveyorError::JobNotFound { .. })
        ));
    }
}
