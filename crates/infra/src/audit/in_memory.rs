use std::sync::RwLock;

use async_trait::async_trait;

use memetok_core::{PostId, UserId};

use super::{UploadErrorRecord, UploadErrorStore, UploadErrorStoreError};

/// In-memory audit store for tests/dev. Records are kept in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryUploadErrorStore {
    records: RwLock<Vec<UploadErrorRecord>>,
}

impl InMemoryUploadErrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> UploadErrorStoreError {
    UploadErrorStoreError::Storage("audit store lock poisoned".to_string())
}

#[async_trait]
impl UploadErrorStore for InMemoryUploadErrorStore {
    async fn insert(&self, record: UploadErrorRecord) -> Result<(), UploadErrorStoreError> {
        self.records.write().map_err(|_| poisoned())?.push(record);
        Ok(())
    }

    async fn query_by_post(&self, post_id: PostId) -> Result<Vec<UploadErrorRecord>, UploadErrorStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .iter()
            .filter(|r| r.post_id == post_id)
            .cloned()
            .collect())
    }

    async fn query_by_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<UploadErrorRecord>, UploadErrorStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut matching: Vec<_> = records
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        // Stable sort keeps later inserts first among equal timestamps.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}
