//! PostgreSQL implementation of the durable job store.
//!
//! Jobs live in `conveyor_jobs`, history in `conveyor_job_history`, worker
//! heartbeats in `conveyor_workers` (see [`crate::migrations`] for the
//! schema). State-transition guards are expressed as conditional `UPDATE ...
//! WHERE status IN (...)` statements; a zero-row result surfaces as
//! `Ok(None)`.

use super::{DurableStore, JobFilter, JobPage};
use crate::{
    job::{Job, JobHistoryEntry, JobId, JobStatus, WorkerHeartbeat},
    priority::JobPriority,
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use std::time::{Duration, Instant};

const JOB_COLUMNS: &str = "id, queue, job_type, priority, status, payload, result, error, \
     attempts, max_retries, visibility_timeout_ms, idempotency_key, scheduled_at, \
     locked_by, locked_at, created_at, completed_at";

#[derive(FromRow)]
pub(crate) struct JobRow {
    pub id: uuid::Uuid,
    pub queue: String,
    pub job_type: String,
    pub priority: i32,
    pub status: String,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: i32,
    pub max_retries: i32,
    pub visibility_timeout_ms: i64,
    pub idempotency_key: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            queue: self.queue,
            job_type: self.job_type,
            priority: JobPriority::from_i32(self.priority).unwrap_or_default(),
            status: self.status.parse()?,
            payload: self.payload,
            result: self.result,
            error: self.error,
            attempts: self.attempts,
            max_retries: self.max_retries,
            visibility_timeout_ms: self.visibility_timeout_ms,
            idempotency_key: self.idempotency_key,
            scheduled_at: self.scheduled_at,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(FromRow)]
struct HistoryRow {
    job_id: uuid::Uuid,
    status: String,
    message: Option<String>,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
}

/// Durable store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Access the underlying pool (used by the migration runner).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_job_where(&self, sql: String, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_job).transpose()
    }
}

#[async_trait]
impl DurableStore for PostgresStore {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn insert_job(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO conveyor_jobs (
                id, queue, job_type, priority, status, payload, result, error,
                attempts, max_retries, visibility_timeout_ms, idempotency_key,
                scheduled_at, locked_by, locked_at, created_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(job.priority.as_i32())
        .bind(job.status.as_str())
        .bind(&job.payload)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.visibility_timeout_ms)
        .bind(&job.idempotency_key)
        .bind(job.scheduled_at)
        .bind(&job.locked_by)
        .bind(job.locked_at)
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.fetch_job_where(
            format!("SELECT {JOB_COLUMNS} FROM conveyor_jobs WHERE id = $1"),
            job_id,
        )
        .await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM conveyor_jobs WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn claim_job(&self, job_id: JobId, worker_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE conveyor_jobs
            SET status = 'processing', locked_by = $2, locked_at = $3, attempts = attempts + 1
            WHERE id = $1 AND status IN ('pending', 'failed')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn complete_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE conveyor_jobs
            SET status = 'completed', result = $3, error = NULL,
                locked_by = NULL, locked_at = NULL, completed_at = $4
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(result)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn complete_job_external(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE conveyor_jobs
            SET status = 'completed', locked_by = NULL, locked_at = NULL, completed_at = $2
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn fail_job(&self, job_id: JobId, error: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE conveyor_jobs
            SET status = 'failed', error = $2, locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn mark_job_dead(&self, job_id: JobId, error: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE conveyor_jobs
            SET status = 'dead', error = $2, locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE conveyor_jobs
            SET status = 'cancelled', completed_at = $2
            WHERE id = $1 AND status IN ('pending', 'scheduled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn reset_for_retry(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE conveyor_jobs
            SET status = 'pending', attempts = 0, error = NULL,
                locked_by = NULL, locked_at = NULL, completed_at = NULL
            WHERE id = $1 AND status IN ('failed', 'dead', 'cancelled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn promote_scheduled(&self, job_id: JobId) -> Result<Option<Job>> {
        self.fetch_job_where(
            format!(
                r#"
                UPDATE conveyor_jobs
                SET status = 'pending', scheduled_at = NULL
                WHERE id = $1 AND status = 'scheduled'
                RETURNING {JOB_COLUMNS}
                "#
            ),
            job_id,
        )
        .await
    }

    async fn reclaim_job(
        &self,
        job_id: JobId,
        observed_locked_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE conveyor_jobs
            SET status = 'pending', locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND status = 'processing' AND locked_at = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(observed_locked_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        let status = filter.status.map(|s| s.as_str().to_string());
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM conveyor_jobs
            WHERE ($1::text IS NULL OR queue = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(&filter.queue)
        .bind(&status)
        .bind(filter.limit as i64)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM conveyor_jobs
            WHERE ($1::text IS NULL OR queue = $1)
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(&filter.queue)
        .bind(&status)
        .fetch_one(&self.pool)
        .await?;

        let jobs = rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>>>()?;
        Ok(JobPage {
            jobs,
            total: total as u64,
        })
    }

    async fn pending_job_ids(&self, queue: &str) -> Result<Vec<JobId>> {
        let rows = sqlx::query("SELECT id FROM conveyor_jobs WHERE queue = $1 AND status = 'pending'")
            .bind(queue)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    async fn append_history(&self, entry: &JobHistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conveyor_job_history (job_id, status, message, worker_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.job_id)
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .bind(&entry.worker_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_history(&self, job_id: JobId) -> Result<Vec<JobHistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT job_id, status, message, worker_id, created_at
            FROM conveyor_job_history
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(JobHistoryEntry {
                    job_id: row.job_id,
                    status: row.status.parse::<JobStatus>()?,
                    message: row.message,
                    worker_id: row.worker_id,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conveyor_workers (
                worker_id, hostname, queues, concurrency, active_jobs, started_at, last_heartbeat
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (worker_id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                queues = EXCLUDED.queues,
                concurrency = EXCLUDED.concurrency,
                active_jobs = EXCLUDED.active_jobs,
                last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(&heartbeat.worker_id)
        .bind(&heartbeat.hostname)
        .bind(serde_json::to_value(&heartbeat.queues)?)
        .bind(heartbeat.concurrency as i32)
        .bind(heartbeat.active_jobs as i32)
        .bind(heartbeat.started_at)
        .bind(heartbeat.last_heartbeat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, hostname, queues, concurrency, active_jobs, started_at, last_heartbeat
            FROM conveyor_workers
            ORDER BY last_heartbeat DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let queues: serde_json::Value = row.get("queues");
                Ok(WorkerHeartbeat {
                    worker_id: row.get("worker_id"),
                    hostname: row.get("hostname"),
                    queues: serde_json::from_value(queues)?,
                    concurrency: row.get::<i32, _>("concurrency") as u32,
                    active_jobs: row.get::<i32, _>("active_jobs") as u32,
                    started_at: row.get("started_at"),
                    last_heartbeat: row.get("last_heartbeat"),
                })
            })
            .collect()
    }

    async fn remove_heartbeat(&self, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM conveyor_workers WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(started.elapsed())
    }
}
