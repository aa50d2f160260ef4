use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use memetok_core::{CounterDelta, MediaItem, Post, PostId, PostStatus};

use super::{PostRepository, PostStoreError};

/// In-memory post repository.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPostRepository {
    posts: RwLock<HashMap<PostId, Post>>,
}

impl InMemoryPostRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a post outright (simulates the author deleting it).
    pub fn remove(&self, id: PostId) -> Option<Post> {
        self.posts.write().ok()?.remove(&id)
    }

    fn with_post<T>(
        &self,
        id: PostId,
        f: impl FnOnce(&mut Post) -> T,
    ) -> Result<T, PostStoreError> {
        let mut posts = self
            .posts
            .write()
            .map_err(|_| PostStoreError::Storage("post store lock poisoned".to_string()))?;
        let post = posts.get_mut(&id).ok_or(PostStoreError::NotFound(id))?;
        Ok(f(post))
    }
}

#[async_trait]
impl PostRepository for InMemoryPostRepository {
    async fn insert(&self, post: Post) -> Result<(), PostStoreError> {
        let mut posts = self
            .posts
            .write()
            .map_err(|_| PostStoreError::Storage("post store lock poisoned".to_string()))?;
        if posts.contains_key(&post.id) {
            return Err(PostStoreError::AlreadyExists(post.id));
        }
        posts.insert(post.id, post);
        Ok(())
    }

    async fn find_by_id(&self, id: PostId) -> Result<Option<Post>, PostStoreError> {
        let posts = self
            .posts
            .read()
            .map_err(|_| PostStoreError::Storage("post store lock poisoned".to_string()))?;
        Ok(posts.get(&id).cloned())
    }

    async fn set_status(&self, id: PostId, status: PostStatus) -> Result<(), PostStoreError> {
        self.with_post(id, |post| post.status = status)
    }

    async fn update_media(&self, id: PostId, items: Vec<MediaItem>) -> Result<(), PostStoreError> {
        self.with_post(id, |post| post.media = items)
    }

    async fn increment_counters(&self, id: PostId, delta: CounterDelta) -> Result<(), PostStoreError> {
        self.with_post(id, |post| post.stats.apply(delta))
    }
}
