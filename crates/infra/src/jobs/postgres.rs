//! Postgres-backed job store.
//!
//! Rows live in `media_jobs` (see [`crate::db`]). A `BIGSERIAL seq` column
//! records insertion order so due jobs with equal `next_run_at` come back in
//! the order they were enqueued.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use memetok_core::{MediaId, PostId};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobKind, JobPatch, VERIFY_MEDIA};
use crate::db::{describe_sqlx_error, is_unique_violation};

const JOB_COLUMNS: &str =
    "id, job_type, post_id, media_id, media_kind, attempts, next_run_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(describe_sqlx_error(operation, &err))
}

/// Column values of one `media_jobs` row, before domain validation.
#[derive(Debug, Clone)]
struct JobRow {
    id: Uuid,
    job_type: String,
    post_id: Uuid,
    media_id: String,
    media_kind: String,
    attempts: i32,
    next_run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn from_row(row: &PgRow) -> Result<Self, JobStoreError> {
        let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {}", e));

        Ok(Self {
            id: row.try_get("id").map_err(decode)?,
            job_type: row.try_get("job_type").map_err(decode)?,
            post_id: row.try_get("post_id").map_err(decode)?,
            media_id: row.try_get("media_id").map_err(decode)?,
            media_kind: row.try_get("media_kind").map_err(decode)?,
            attempts: row.try_get("attempts").map_err(decode)?,
            next_run_at: row.try_get("next_run_at").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
        })
    }

    fn into_job(self) -> Result<Job, JobStoreError> {
        let attempts = self.attempts;
        Ok(Job {
            id: JobId::from_uuid(self.id),
            kind: JobKind::from(self.job_type),
            post_id: PostId::from_uuid(self.post_id),
            media_id: MediaId::new(self.media_id).map_err(|e| JobStoreError::Storage(e.to_string()))?,
            media_kind: self
                .media_kind
                .parse()
                .map_err(|e: memetok_core::DomainError| JobStoreError::Storage(e.to_string()))?,
            attempts: u32::try_from(attempts)
                .map_err(|_| JobStoreError::Storage(format!("negative attempts: {}", attempts)))?,
            next_run_at: self.next_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)?.into_job()
}

/// Split due rows into usable jobs and the ids of rows that can never run.
///
/// A bad row must not starve the due jobs behind it.
fn split_due(rows: Vec<JobRow>) -> (Vec<Job>, Vec<Uuid>) {
    let mut jobs = Vec::with_capacity(rows.len());
    let mut poisoned = Vec::new();
    for row in rows {
        let id = row.id;
        match row.into_job() {
            Ok(job) => jobs.push(job),
            Err(err) => {
                warn!(job_id = %id, error = %err, "undecodable job row; removing it");
                poisoned.push(id);
            }
        }
    }
    (jobs, poisoned)
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, post_id = %job.post_id), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO media_jobs
                (id, job_type, post_id, media_id, media_kind, attempts, next_run_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(job.kind.as_str())
        .bind(*job.post_id.as_uuid())
        .bind(job.media_id.as_str())
        .bind(job.media_kind.as_str())
        .bind(attempts_to_db(job.attempts))
        .bind(job.next_run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM media_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_count = tracing::field::Empty), err)]
    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM media_jobs WHERE next_run_at <= $1 ORDER BY next_run_at ASC, seq ASC LIMIT $2",
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_due", e))?;

        tracing::Span::current().record("job_count", rows.len());

        let mut raw = Vec::with_capacity(rows.len());
        for row in &rows {
            match JobRow::from_row(row) {
                Ok(job_row) => raw.push(job_row),
                Err(err) => warn!(error = %err, "skipping unreadable job row"),
            }
        }

        let (jobs, poisoned) = split_due(raw);
        if !poisoned.is_empty() {
            if let Err(err) = sqlx::query("DELETE FROM media_jobs WHERE id = ANY($1)")
                .bind(&poisoned[..])
                .execute(&*self.pool)
                .await
            {
                warn!(
                    count = poisoned.len(),
                    error = %describe_sqlx_error("delete_poisoned", &err),
                    "failed to remove undecodable job rows"
                );
            }
        }
        Ok(jobs)
    }

    #[instrument(skip(self, patch), fields(job_id = %id), err)]
    async fn update(&self, id: JobId, patch: JobPatch) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE media_jobs
            SET attempts    = COALESCE($2, attempts),
                next_run_at = GREATEST(next_run_at, COALESCE($3, next_run_at)),
                updated_at  = $4
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .bind(patch.attempts.map(attempts_to_db))
        .bind(patch.next_run_at)
        .bind(patch.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM media_jobs WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(post_id = %post_id), err)]
    async fn find_by_post(&self, post_id: PostId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM media_jobs WHERE post_id = $1 AND job_type = $2 ORDER BY seq ASC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(*post_id.as_uuid())
        .bind(VERIFY_MEDIA)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_post", e))?;

        row.as_ref().map(job_from_row).transpose()
    }
}
