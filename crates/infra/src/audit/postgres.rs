use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use memetok_core::{PostId, UserId};

use super::{UploadErrorRecord, UploadErrorStore, UploadErrorStoreError};
use crate::db::describe_sqlx_error;

const RECORD_COLUMNS: &str = "id, post_id, user_id, filename, message, content_hash, created_at";

/// Postgres-backed audit store (`upload_errors` table).
#[derive(Debug, Clone)]
pub struct PostgresUploadErrorStore {
    pool: Arc<PgPool>,
}

impl PostgresUploadErrorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> UploadErrorStoreError {
    UploadErrorStoreError::Storage(describe_sqlx_error(operation, &err))
}

fn record_from_row(row: &PgRow) -> Result<UploadErrorRecord, UploadErrorStoreError> {
    let decode =
        |e: sqlx::Error| UploadErrorStoreError::Storage(format!("failed to decode upload error row: {}", e));

    Ok(UploadErrorRecord {
        id: row.try_get("id").map_err(decode)?,
        post_id: PostId::from_uuid(row.try_get::<Uuid, _>("post_id").map_err(decode)?),
        user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id").map_err(decode)?),
        filename: row.try_get("filename").map_err(decode)?,
        message: row.try_get("message").map_err(decode)?,
        content_hash: row.try_get("content_hash").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

#[async_trait]
impl UploadErrorStore for PostgresUploadErrorStore {
    #[instrument(skip(self, record), fields(post_id = %record.post_id, filename = %record.filename), err)]
    async fn insert(&self, record: UploadErrorRecord) -> Result<(), UploadErrorStoreError> {
        sqlx::query(
            r#"
            INSERT INTO upload_errors (id, post_id, user_id, filename, message, content_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(*record.post_id.as_uuid())
        .bind(*record.user_id.as_uuid())
        .bind(&record.filename)
        .bind(&record.message)
        .bind(record.content_hash.as_deref())
        .bind(record.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_upload_error", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(post_id = %post_id), err)]
    async fn query_by_post(&self, post_id: PostId) -> Result<Vec<UploadErrorRecord>, UploadErrorStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_errors WHERE post_id = $1 ORDER BY created_at ASC, id ASC",
            RECORD_COLUMNS
        ))
        .bind(*post_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_by_post", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn query_by_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<UploadErrorRecord>, UploadErrorStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upload_errors WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
            RECORD_COLUMNS
        ))
        .bind(*user_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_by_user", e))?;

        rows.iter().map(record_from_row).collect()
    }
}
