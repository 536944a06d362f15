//! Repository for delayed, cancellable jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{JobId, JobStatus, NewScheduledJob, RelatedEntity, ScheduledJob},
};

const JOB_COLUMNS: &str = "id, kind, entity_type, entity_id, payload, run_at, status, attempts, \
     last_error, created_at, updated_at";

/// Repository for scheduled job database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Schedules a job unless one is already waiting for the same key.
    ///
    /// Returns the waiting job in either case; the partial unique index keeps
    /// one scheduled row per `(kind, entity)`.
    ///
    /// # Errors
    ///
    /// Returns error if insert or lookup fails.
    pub async fn schedule(&self, job: &NewScheduledJob, now: DateTime<Utc>) -> Result<ScheduledJob> {
        let inserted = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            INSERT INTO scheduled_jobs (
                id, kind, entity_type, entity_id, payload, run_at, status,
                attempts, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 'scheduled', 0, $7, $7)
            ON CONFLICT (kind, entity_type, entity_id) WHERE status = 'scheduled' DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(JobId::new().0)
        .bind(&job.kind)
        .bind(job.entity.kind())
        .bind(job.entity.id())
        .bind(sqlx::types::Json(&job.payload))
        .bind(job.run_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(job) = inserted {
            return Ok(job);
        }

        let existing = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM scheduled_jobs
            WHERE kind = $1 AND entity_type = $2 AND entity_id = $3 AND status = 'scheduled'
            "#
        ))
        .bind(&job.kind)
        .bind(job.entity.kind())
        .bind(job.entity.id())
        .fetch_one(&*self.pool)
        .await?;

        Ok(existing)
    }

    /// Cancels the waiting job for a key.
    ///
    /// Returns `false` when nothing was waiting, including when the job
    /// already ran.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn cancel(
        &self,
        kind: &str,
        entity: &RelatedEntity,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'cancelled', updated_at = $4
            WHERE kind = $1 AND entity_type = $2 AND entity_id = $3 AND status = 'scheduled'
            "#,
        )
        .bind(kind)
        .bind(entity.kind())
        .bind(entity.id())
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Claims up to `limit` due jobs and marks them running.
    ///
    /// `FOR UPDATE SKIP LOCKED` lets several runners poll the same table
    /// without handing one job to two of them.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>> {
        let jobs = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            UPDATE scheduled_jobs
            SET status = 'running', attempts = attempts + 1, updated_at = $1
            WHERE id IN (
                SELECT id FROM scheduled_jobs
                WHERE status = 'scheduled' AND run_at <= $1
                ORDER BY run_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }

    /// Marks a running job completed.
    ///
    /// Returns `false` when the job was no longer running, for example
    /// because its lease expired and it was handed out again.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs SET status = 'completed', updated_at = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.0)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records a failed execution of a running job.
    ///
    /// With `retry_at` the job goes back to `scheduled` for that instant,
    /// unless another job is already waiting for its key. Otherwise it ends
    /// `failed`. Returns the resulting status, or `None` when the job was no
    /// longer running.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn fail(
        &self,
        id: JobId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            WITH target AS (
                SELECT j.id,
                       ($3::TIMESTAMPTZ IS NOT NULL AND NOT EXISTS (
                           SELECT 1 FROM scheduled_jobs s
                           WHERE s.status = 'scheduled'
                             AND s.kind = j.kind
                             AND s.entity_type = j.entity_type
                             AND s.entity_id = j.entity_id
                       )) AS retry
                FROM scheduled_jobs j
                WHERE j.id = $1 AND j.status = 'running'
            )
            UPDATE scheduled_jobs j
            SET status = CASE WHEN t.retry THEN 'scheduled' ELSE 'failed' END,
                run_at = CASE WHEN t.retry THEN $3 ELSE j.run_at END,
                last_error = $2,
                updated_at = $4
            FROM target t
            WHERE j.id = t.id AND j.status = 'running'
            RETURNING j.status
            "#,
        )
        .bind(id.0)
        .bind(error)
        .bind(retry_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        status.map(|s| s.parse::<JobStatus>()).transpose()
    }

    /// Finds `running` jobs whose last state change is older than `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledJob>> {
        let jobs = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM scheduled_jobs
            WHERE status = 'running' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }

    /// Returns every job recorded for an entity, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_for_entity(&self, entity: &RelatedEntity) -> Result<Vec<ScheduledJob>> {
        let jobs = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM scheduled_jobs
            WHERE entity_type = $1 AND entity_id = $2
            ORDER BY created_at DESC
            "#
        ))
        .bind(entity.kind())
        .bind(entity.id())
        .fetch_all(&*self.pool)
        .await?;

        Ok(jobs)
    }
}
