//! Database schema migrations.
//!
//! Migrations are embedded, versioned, and tracked in `conveyor_migrations`
//! so each one runs exactly once. Call [`run`] at deploy time (or from test
//! setup) before starting intake, scheduler or workers.

use crate::Result;
use sqlx::PgPool;
use tracing::{debug, info};

struct Migration {
    id: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "001_jobs",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS conveyor_jobs (
                id UUID PRIMARY KEY,
                queue VARCHAR(100) NOT NULL,
                job_type VARCHAR(200) NOT NULL,
                priority INTEGER NOT NULL DEFAULT 1,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                payload JSONB NOT NULL,
                result JSONB,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                visibility_timeout_ms BIGINT NOT NULL,
                idempotency_key VARCHAR(255),
                scheduled_at TIMESTAMPTZ,
                locked_by VARCHAR(255),
                locked_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conveyor_jobs_idempotency_key
                ON conveyor_jobs (idempotency_key) WHERE idempotency_key IS NOT NULL
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_conveyor_jobs_queue_status
                ON conveyor_jobs (queue, status)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_conveyor_jobs_created_at
                ON conveyor_jobs (created_at)
            "#,
        ],
    },
    Migration {
        id: "002_job_history",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS conveyor_job_history (
                id BIGSERIAL PRIMARY KEY,
                job_id UUID NOT NULL,
                status VARCHAR(20) NOT NULL,
                message TEXT,
                worker_id VARCHAR(255),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_conveyor_job_history_job_id
                ON conveyor_job_history (job_id, created_at)
            "#,
        ],
    },
    Migration {
        id: "003_workers",
        statements: &[r#"
            CREATE TABLE IF NOT EXISTS conveyor_workers (
                worker_id VARCHAR(255) PRIMARY KEY,
                hostname VARCHAR(255) NOT NULL,
                queues JSONB NOT NULL,
                concurrency INTEGER NOT NULL,
                active_jobs INTEGER NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                last_heartbeat TIMESTAMPTZ NOT NULL
            )
            "#],
    },
];

/// Apply all pending migrations to the given pool.
pub async fn run(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conveyor_migrations (
            id VARCHAR(255) PRIMARY KEY,
            executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    for migration in MIGRATIONS {
        let already_run: Option<String> =
            sqlx::query_scalar("SELECT id FROM conveyor_migrations WHERE id = $1")
                .bind(migration.id)
                .fetch_optional(pool)
                .await?;
        if already_run.is_some() {
            debug!(migration = migration.id, "migration already applied");
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in migration.statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO conveyor_migrations (id) VALUES ($1)")
            .bind(migration.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(migration = migration.id, "applied migration");
    }

    Ok(())
}
