//! Post aggregate storage, limited to what the media workers touch.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;

use memetok_core::{CounterDelta, MediaItem, Post, PostId, PostStatus};

pub use in_memory::InMemoryPostRepository;
pub use postgres::PostgresPostRepository;

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn insert(&self, post: Post) -> Result<(), PostStoreError>;

    async fn find_by_id(&self, id: PostId) -> Result<Option<Post>, PostStoreError>;

    async fn set_status(&self, id: PostId, status: PostStatus) -> Result<(), PostStoreError>;

    /// Replace the accepted media list.
    async fn update_media(&self, id: PostId, items: Vec<MediaItem>) -> Result<(), PostStoreError>;

    /// Add signed deltas to the like/comment counters (clamped at zero).
    async fn increment_counters(&self, id: PostId, delta: CounterDelta) -> Result<(), PostStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PostStoreError {
    #[error("post not found: {0}")]
    NotFound(PostId),
    #[error("post already exists: {0}")]
    AlreadyExists(PostId),
    #[error("storage error: {0}")]
    Storage(String),
}
