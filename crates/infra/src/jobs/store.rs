//! Durable job storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use memetok_core::PostId;

use super::types::{Job, JobId, JobKind, JobPatch};

/// Job store abstraction.
///
/// Durable across restarts; the in-memory dispatch queue is only a fast path
/// in front of it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs with `next_run_at <= now`, ascending by `next_run_at`, ties in
    /// insertion order, at most `limit`.
    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Apply a partial update. `next_run_at` is never moved backwards.
    ///
    /// Returns `NotFound` if the job was already deleted.
    async fn update(&self, id: JobId, patch: JobPatch) -> Result<(), JobStoreError>;

    /// Delete a job. Deleting an absent job is not an error; returns whether a
    /// row was removed.
    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// The verification job for a post, if one is pending.
    async fn find_by_post(&self, post_id: PostId) -> Result<Option<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<JobId, Entry>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(id, Entry { seq, job });
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.jobs.get(&id).map(|entry| entry.job.clone()))
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut due: Vec<&Entry> = inner
            .jobs
            .values()
            .filter(|entry| entry.job.is_due(now))
            .collect();

        due.sort_by_key(|entry| (entry.job.next_run_at, entry.seq));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|entry| entry.job.clone())
            .collect())
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> Result<(), JobStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let entry = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        entry.job.apply(&patch);
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        Ok(inner.jobs.remove(&id).is_some())
    }

    async fn find_by_post(&self, post_id: PostId) -> Result<Option<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .jobs
            .values()
            .filter(|entry| entry.job.post_id == post_id && entry.job.kind == JobKind::VerifyMedia)
            .min_by_key(|entry| entry.seq)
            .map(|entry| entry.job.clone()))
    }
}
