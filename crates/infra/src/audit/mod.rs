//! Audit trail of failed uploads, one record per failed file.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use memetok_core::{PostId, UserId};

pub use in_memory::InMemoryUploadErrorStore;
pub use postgres::PostgresUploadErrorStore;

/// Default page size for [`UploadErrorStore::query_by_user`].
pub const DEFAULT_USER_QUERY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadErrorRecord {
    pub id: Uuid,
    pub post_id: PostId,
    pub user_id: UserId,
    pub filename: String,
    pub message: String,
    /// md5 hex of the staged bytes, when they could be read.
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UploadErrorRecord {
    pub fn new(
        post_id: PostId,
        user_id: UserId,
        filename: impl Into<String>,
        message: impl Into<String>,
        content_hash: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            post_id,
            user_id,
            filename: filename.into(),
            message: message.into(),
            content_hash,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait UploadErrorStore: Send + Sync {
    async fn insert(&self, record: UploadErrorRecord) -> Result<(), UploadErrorStoreError>;

    /// All records for a post, oldest first.
    async fn query_by_post(&self, post_id: PostId) -> Result<Vec<UploadErrorRecord>, UploadErrorStoreError>;

    /// Most recent records for a user, newest first.
    async fn query_by_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<UploadErrorRecord>, UploadErrorStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadErrorStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}
