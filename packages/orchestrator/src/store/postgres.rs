//! PostgreSQL job store backend.
//!
//! All queue state is one `jobs` table. Queue membership is a `dequeued`
//! flag flipped atomically by the claim query (`FOR UPDATE SKIP LOCKED`),
//! so concurrent workers never receive the same row. Retry readiness is the
//! `not_ready_until` column; the claim filter skips rows still inside
//! their backoff window.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DeadLetterEntry, FailureKind, JobStore, QueueStats, RetryPolicy};
use crate::error::OrchestratorError;
use crate::record::{JobRecord, JobStatus};

pub struct PostgresJobStore {
    pool: PgPool,
    retry: RetryPolicy,
    liveness_ttl: Duration,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
            liveness_ttl: Duration::from_secs(60),
        }
    }

    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running job store migrations")?;
        Ok(())
    }

    async fn insert_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, task_name, params, status, created_at, started_at,
                finished_at, last_heartbeat, result, error, retry_count,
                max_retries, timeout_seconds, worker_id, priority,
                not_ready_until, dequeued
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, FALSE)
            "#,
        )
        .bind(job.id)
        .bind(&job.task_name)
        .bind(&job.params)
        .bind(job.status)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.last_heartbeat)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.timeout_seconds)
        .bind(&job.worker_id)
        .bind(job.priority)
        .bind(job.not_ready_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn connect(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(e.to_string()))?;
        debug!("postgres job store ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn add_job(&self, job: JobRecord) -> Result<()> {
        debug!(job_id = %job.id, task = %job.task_name, priority = job.priority, "job added");
        self.insert_job(&job).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, task_name, params, status, created_at, started_at,
                   finished_at, last_heartbeat, result, error, retry_count,
                   max_retries, timeout_seconds, worker_id, priority,
                   not_ready_until
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn update_job(&self, job: JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET task_name = $2, params = $3, status = $4, created_at = $5,
                started_at = $6, finished_at = $7, last_heartbeat = $8,
                result = $9, error = $10, retry_count = $11, max_retries = $12,
                timeout_seconds = $13, worker_id = $14, priority = $15,
                not_ready_until = $16
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.task_name)
        .bind(&job.params)
        .bind(job.status)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.last_heartbeat)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.timeout_seconds)
        .bind(&job.worker_id)
        .bind(job.priority)
        .bind(job.not_ready_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_next_job(&self) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'queued'
                  AND NOT dequeued
                  AND (not_ready_until IS NULL OR not_ready_until <= NOW())
                ORDER BY priority DESC, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET dequeued = TRUE
            WHERE id IN (SELECT id FROM next_job)
            RETURNING id
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark_running(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = NOW(),
                last_heartbeat = NOW(), worker_id = $2
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            match self.get_job(id).await? {
                None => return Err(OrchestratorError::NotFound(id).into()),
                // Lost a race with cancel; the caller should skip the job.
                Some(job) => bail!("job {id} already {}, not claiming", job.status),
            }
        }
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid, result: Value) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', finished_at = NOW(), result = $2
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 && self.get_job(id).await?.is_none() {
            return Err(OrchestratorError::NotFound(id).into());
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        should_retry: bool,
        kind: FailureKind,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, task_name, params, status, created_at, started_at,
                   finished_at, last_heartbeat, result, error, retry_count,
                   max_retries, timeout_seconds, worker_id, priority,
                   not_ready_until
            FROM jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(OrchestratorError::NotFound(id))?;

        if job.status.is_terminal() {
            debug!(job_id = %id, status = %job.status, "failure ignored for terminal job");
            return Ok(());
        }

        let retry_count = job.retry_count + 1;

        if should_retry && retry_count < job.max_retries {
            let delay = self.retry.delay_for(retry_count);
            let ready_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued', retry_count = $2, error = $3,
                    started_at = NULL, finished_at = NULL,
                    last_heartbeat = NULL, worker_id = NULL,
                    not_ready_until = $4, dequeued = FALSE
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(retry_count)
            .bind(error)
            .bind(ready_at)
            .execute(&mut *tx)
            .await?;
            info!(
                job_id = %id,
                retry_count,
                delay_secs = delay.as_secs(),
                "job requeued for retry"
            );
        } else {
            let status = match kind {
                FailureKind::Error => JobStatus::Failed,
                FailureKind::Timeout => JobStatus::TimedOut,
            };
            let reason = if should_retry {
                "max retries exceeded".to_string()
            } else {
                format!("non-retryable: {error}")
            };
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = $2, retry_count = $3, error = $4, finished_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(status)
            .bind(retry_count)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"
                INSERT INTO job_dead_letters (job_id, reason)
                VALUES ($1, $2)
                ON CONFLICT (job_id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(&reason)
            .execute(&mut *tx)
            .await?;
            warn!(job_id = %id, status = %status, reason = %reason, "job dead lettered");
        }

        tx.commit().await?;
        Ok(())
    }

    async fn requeue(&self, id: Uuid) -> Result<()> {
        // Only still-queued rows flip back; running or terminal rows are
        // left alone.
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET dequeued = FALSE
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            debug!(job_id = %id, "job returned to queue");
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', finished_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        let cancelled = updated.rows_affected() > 0;
        if cancelled {
            info!(job_id = %id, "job cancelled");
        }
        Ok(cancelled)
    }

    async fn update_heartbeat(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET last_heartbeat = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        // The liveness marker only counts heartbeats for jobs actually
        // running; a heartbeat against a queued or terminal job is a no-op.
        if updated.rows_affected() == 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_id, expires_at)
            VALUES ($1, NOW() + ($2 || ' milliseconds')::INTERVAL)
            ON CONFLICT (worker_id)
            DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(worker_id)
        .bind(self.liveness_ttl.as_millis().to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<Vec<Uuid>> {
        let expired = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE jobs
            SET status = 'timeout', finished_at = NOW(),
                error = 'job timed out after ' || timeout_seconds || ' seconds'
            WHERE status = 'running'
              AND started_at + make_interval(secs => timeout_seconds::double precision) < NOW()
            RETURNING id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for id in &expired {
            warn!(job_id = %id, "swept expired job");
        }
        Ok(expired)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let (regular, priority, delayed, running): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE status = 'queued' AND NOT dequeued AND priority = 0
                      AND (not_ready_until IS NULL OR not_ready_until <= NOW())
                ),
                COUNT(*) FILTER (
                    WHERE status = 'queued' AND NOT dequeued AND priority > 0
                      AND (not_ready_until IS NULL OR not_ready_until <= NOW())
                ),
                COUNT(*) FILTER (
                    WHERE status = 'queued' AND NOT dequeued AND not_ready_until > NOW()
                ),
                COUNT(*) FILTER (WHERE status = 'running')
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let dead_letters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_dead_letters")
            .fetch_one(&self.pool)
            .await?;
        let live_workers: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM worker_heartbeats WHERE expires_at > NOW()",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            regular_queue_size: regular as usize,
            priority_queue_size: priority as usize,
            delayed_queue_size: delayed as usize,
            running_count: running as usize,
            dead_letter_count: dead_letters as usize,
            live_workers: live_workers as usize,
        })
    }

    async fn list_running(&self) -> Result<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, task_name, params, status, created_at, started_at,
                   finished_at, last_heartbeat, result, error, retry_count,
                   max_retries, timeout_seconds, worker_id, priority,
                   not_ready_until
            FROM jobs
            WHERE status = 'running'
            ORDER BY started_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            #[sqlx(flatten)]
            job: JobRecord,
            reason: String,
            dead_lettered_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"
            SELECT j.id, j.task_name, j.params, j.status, j.created_at,
                   j.started_at, j.finished_at, j.last_heartbeat, j.result,
                   j.error, j.retry_count, j.max_retries, j.timeout_seconds,
                   j.worker_id, j.priority, j.not_ready_until,
                   d.reason, d.dead_lettered_at
            FROM job_dead_letters d
            JOIN jobs j ON j.id = d.job_id
            ORDER BY d.dead_lettered_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DeadLetterEntry {
                job: row.job,
                reason: row.reason,
                dead_lettered_at: row.dead_lettered_at,
            })
            .collect())
    }

    async fn replay_dead_letter(&self, id: Uuid, reset_retries: bool) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let original = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT j.id, j.task_name, j.params, j.status, j.created_at,
                   j.started_at, j.finished_at, j.last_heartbeat, j.result,
                   j.error, j.retry_count, j.max_retries, j.timeout_seconds,
                   j.worker_id, j.priority, j.not_ready_until
            FROM job_dead_letters d
            JOIN jobs j ON j.id = d.job_id
            WHERE d.job_id = $1
            FOR UPDATE OF d
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(original) = original else {
            return Ok(None);
        };

        let replay = JobRecord::builder()
            .task_name(original.task_name.clone())
            .params(original.params.clone())
            .priority(original.priority)
            .max_retries(original.max_retries)
            .timeout_seconds(original.timeout_seconds)
            .retry_count(if reset_retries { 0 } else { original.retry_count })
            .build();
        let replay_id = replay.id;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, task_name, params, status, created_at, retry_count,
                max_retries, timeout_seconds, priority, dequeued
            )
            VALUES ($1, $2, $3, 'queued', $4, $5, $6, $7, $8, FALSE)
            "#,
        )
        .bind(replay.id)
        .bind(&replay.task_name)
        .bind(&replay.params)
        .bind(replay.created_at)
        .bind(replay.retry_count)
        .bind(replay.max_retries)
        .bind(replay.timeout_seconds)
        .bind(replay.priority)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM job_dead_letters WHERE job_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(job_id = %id, replay_id = %replay_id, "dead letter replayed");
        Ok(Some(replay_id))
    }
}
