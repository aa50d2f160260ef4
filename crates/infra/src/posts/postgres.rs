use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use memetok_core::{CounterDelta, MediaItem, Post, PostId, PostStats, PostStatus, UserId};

use super::{PostRepository, PostStoreError};
use crate::db::{describe_sqlx_error, is_unique_violation};

/// Postgres-backed post repository (`posts` table).
#[derive(Debug, Clone)]
pub struct PostgresPostRepository {
    pool: Arc<PgPool>,
}

impl PostgresPostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PostStoreError {
    PostStoreError::Storage(describe_sqlx_error(operation, &err))
}

fn post_from_row(row: &PgRow) -> Result<Post, PostStoreError> {
    let decode = |e: sqlx::Error| PostStoreError::Storage(format!("failed to decode post row: {}", e));

    let status: String = row.try_get("status").map_err(decode)?;
    let Json(media): Json<Vec<MediaItem>> = row.try_get("media").map_err(decode)?;

    Ok(Post {
        id: PostId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?),
        author: UserId::from_uuid(row.try_get::<Uuid, _>("author_id").map_err(decode)?),
        status: status
            .parse()
            .map_err(|e: memetok_core::DomainError| PostStoreError::Storage(e.to_string()))?,
        media,
        stats: PostStats {
            likes: row.try_get("likes").map_err(decode)?,
            comments: row.try_get("comments").map_err(decode)?,
        },
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn require_row(id: PostId, rows_affected: u64) -> Result<(), PostStoreError> {
    if rows_affected == 0 {
        Err(PostStoreError::NotFound(id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl PostRepository for PostgresPostRepository {
    #[instrument(skip(self, post), fields(post_id = %post.id), err)]
    async fn insert(&self, post: Post) -> Result<(), PostStoreError> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, author_id, status, media, likes, comments, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*post.id.as_uuid())
        .bind(*post.author.as_uuid())
        .bind(post.status.as_str())
        .bind(Json(&post.media))
        .bind(post.stats.likes)
        .bind(post.stats.comments)
        .bind(post.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                PostStoreError::AlreadyExists(post.id)
            } else {
                map_sqlx_error("insert_post", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(post_id = %id), err)]
    async fn find_by_id(&self, id: PostId) -> Result<Option<Post>, PostStoreError> {
        let row = sqlx::query(
            "SELECT id, author_id, status, media, likes, comments, created_at FROM posts WHERE id = $1",
        )
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_post", e))?;

        row.as_ref().map(post_from_row).transpose()
    }

    #[instrument(skip(self), fields(post_id = %id, status = %status), err)]
    async fn set_status(&self, id: PostId, status: PostStatus) -> Result<(), PostStoreError> {
        let result = sqlx::query("UPDATE posts SET status = $2 WHERE id = $1")
            .bind(*id.as_uuid())
            .bind(status.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_status", e))?;
        require_row(id, result.rows_affected())
    }

    #[instrument(skip(self, items), fields(post_id = %id, media_count = items.len()), err)]
    async fn update_media(&self, id: PostId, items: Vec<MediaItem>) -> Result<(), PostStoreError> {
        let result = sqlx::query("UPDATE posts SET media = $2 WHERE id = $1")
            .bind(*id.as_uuid())
            .bind(Json(&items))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_media", e))?;
        require_row(id, result.rows_affected())
    }

    #[instrument(skip(self), fields(post_id = %id), err)]
    async fn increment_counters(&self, id: PostId, delta: CounterDelta) -> Result<(), PostStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET likes    = GREATEST(likes + $2, 0),
                comments = GREATEST(comments + $3, 0)
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .bind(delta.likes)
        .bind(delta.comments)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_counters", e))?;
        require_row(id, result.rows_affected())
    }
}
