use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::model::{Job, JobFilter, JobPatch, NewJob, StatusCounts};
use crate::jobs::store::JobStore;

/// Postgres-backed job store. Transition guards live in the SQL itself
/// (`WHERE status = ...`) so concurrent writers serialize on the row and a
/// late progress write can never resurrect a cancelled or failed job.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, owner_id, kind, queue, status, progress, current_step,
                config, retry_count, max_retries, run_at, estimated_duration
            )
            VALUES (
                $1, $2, $3, $4, 'pending', 0, 'Queued for processing',
                $5, 0, $6, now(), $7
            )
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.owner_id)
        .bind(&new.kind)
        .bind(&new.queue)
        .bind(&new.config)
        .bind(new.max_retries)
        .bind(new.estimated_duration)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get(&self, id: Uuid, owner: Uuid) -> Result<Job, JobError> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE id = $1 AND owner_id = $2",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or(JobError::NotFound)
    }

    async fn update(&self, id: Uuid, owner: Uuid, patch: JobPatch) -> Result<Job, JobError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET progress = COALESCE($3, progress),
                current_step = COALESCE($4, current_step),
                result = COALESCE($5, result),
                error_message = COALESCE($6, error_message),
                error_code = COALESCE($7, error_code),
                estimated_duration = COALESCE($8, estimated_duration),
                updated_at = now()
            WHERE id = $1
              AND owner_id = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(patch.progress)
        .bind(patch.current_step)
        .bind(patch.result)
        .bind(patch.error_message)
        .bind(patch.error_code)
        .bind(patch.estimated_duration)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or(JobError::NotFound)
    }

    async fn list(&self, owner: Uuid, filter: JobFilter) -> Result<Vec<Job>, JobError> {
        let limit = filter.limit.unwrap_or(100).clamp(1, 500);

        let rows = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE owner_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR kind = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#,
        )
        .bind(owner)
        .bind(filter.status)
        .bind(filter.kind)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn cancel(&self, id: Uuid, owner: Uuid) -> Result<Job, JobError> {
        let cancelled = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                current_step = 'cancelled',
                completed_at = now(),
                actual_duration = CASE
                    WHEN started_at IS NOT NULL
                    THEN EXTRACT(EPOCH FROM (now() - started_at))::int
                    ELSE actual_duration
                END,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND owner_id = $2
              AND status IN ('pending', 'queued', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        match cancelled {
            Some(job) => Ok(job),
            None => {
                // Either unknown/foreign job or already terminal.
                let job = self.get(id, owner).await?;
                match job.status_enum() {
                    Some(status) if status.is_terminal() => {
                        Err(JobError::already_terminal(status))
                    }
                    _ => Err(JobError::InvalidTransition(format!(
                        "cannot cancel job in status {}",
                        job.status
                    ))),
                }
            }
        }
    }

    async fn reset_for_retry(&self, id: Uuid, owner: Uuid) -> Result<Job, JobError> {
        let reset = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'pending',
                progress = 0,
                current_step = 'Queued for retry',
                result = NULL,
                error_message = NULL,
                error_code = NULL,
                started_at = NULL,
                completed_at = NULL,
                actual_duration = NULL,
                run_at = now(),
                updated_at = now()
            WHERE id = $1
              AND owner_id = $2
              AND status IN ('failed', 'cancelled')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        match reset {
            Some(job) => Ok(job),
            None => {
                let job = self.get(id, owner).await?;
                Err(JobError::InvalidTransition(format!(
                    "retry only valid from failed or cancelled (status: {})",
                    job.status
                )))
            }
        }
    }

    async fn load(&self, id: Uuid) -> Result<Job, JobError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        job.ok_or(JobError::NotFound)
    }

    async fn mark_queued(&self, id: Uuid) -> Result<(), JobError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                updated_at = now()
            WHERE id = $1
              AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = COALESCE(started_at, now()),
                updated_at = now()
            WHERE id = $1
              AND status IN ('pending', 'queued')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: i32,
        step: &str,
    ) -> Result<(), JobError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET progress = GREATEST(progress, LEAST($2, 100)),
                current_step = $3,
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(progress)
        .bind(step)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        result: Value,
        actual_duration: i32,
    ) -> Result<(), JobError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                progress = 100,
                current_step = 'completed',
                result = $2,
                completed_at = now(),
                actual_duration = $3,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(result)
        .bind(actual_duration)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        code: &str,
        message: &str,
        actual_duration: Option<i32>,
    ) -> Result<(), JobError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                current_step = 'failed',
                error_code = $2,
                error_message = $3,
                completed_at = now(),
                actual_duration = COALESCE($4, actual_duration),
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status IN ('pending', 'queued', 'running')
            "#,
        )
        .bind(id)
        .bind(code)
        .bind(message)
        .bind(actual_duration)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: i32,
        message: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                progress = 0,
                retry_count = $2,
                current_step = 'Queued for retry',
                error_message = $3,
                run_at = $4,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(message)
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<Job>, JobError> {
        let mut tx = self.pool.begin().await.map_err(JobError::from)?;

        let candidate = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE queue = $1
              AND status = 'queued'
              AND run_at <= now()
            ORDER BY run_at ASC, created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = candidate else {
            tx.commit().await.map_err(JobError::from)?;
            return Ok(None);
        };

        let leased = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'running',
                locked_by = $2,
                lock_expires_at = now() + ($3::bigint * interval '1 second'),
                started_at = COALESCE(started_at, now()),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(lease_seconds)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await.map_err(JobError::from)?;
        Ok(Some(leased))
    }

    async fn reap_expired_leases(&self) -> Result<u64, JobError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE status = 'running'
              AND lock_expires_at IS NOT NULL
              AND lock_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, JobError> {
        let res = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at IS NOT NULL
              AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn status_counts(&self) -> Result<StatusCounts, JobError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.record(&status, count);
        }
        Ok(counts)
    }
}
