//! The verify-media state machine.
//!
//! PENDING → IN_PROGRESS → COMPLETED | DEFERRED | DROPPED
//!
//! A job can reach the processor from the dispatch queue and from the due-sweep
//! at the same time. An in-process claim on the job id serialises the two
//! paths. The job is then re-read from the store, and a copy that is gone or
//! already rescheduled is skipped. The post is re-read before its status is
//! flipped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use memetok_core::PostStatus;
use memetok_events::{EventBus, event_types};

use super::backoff::BackoffPolicy;
use super::store::{JobStore, JobStoreError};
use super::types::{DropReason, Job, JobId, JobKind, JobOutcome, JobPatch, SkipReason};
use crate::media::MediaService;
use crate::posts::{PostRepository, PostStoreError};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Post(#[from] PostStoreError),
}

/// Releases a claimed job id when dropped, including on panic.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<JobId>>,
    id: JobId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct VerifyMediaProcessor {
    store: Arc<dyn JobStore>,
    posts: Arc<dyn PostRepository>,
    media: Arc<dyn MediaService>,
    backoff: BackoffPolicy,
    events: Option<Arc<EventBus>>,
    in_flight: Mutex<HashSet<JobId>>,
}

impl VerifyMediaProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        posts: Arc<dyn PostRepository>,
        media: Arc<dyn MediaService>,
    ) -> Self {
        Self {
            store,
            posts,
            media,
            backoff: BackoffPolicy::default(),
            events: None,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn claim(&self, id: JobId) -> Option<Claim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.insert(id).then(|| Claim {
            in_flight: &self.in_flight,
            id,
        })
    }

    /// Run one processing round for `job` at the current time.
    pub async fn process(&self, job: &Job) -> Result<JobOutcome, JobError> {
        self.process_at(job, Utc::now()).await
    }

    /// Run one processing round with an explicit clock, for deterministic scheduling.
    #[instrument(skip(self, job), fields(job_id = %job.id, post_id = %job.post_id), err)]
    pub async fn process_at(&self, job: &Job, now: DateTime<Utc>) -> Result<JobOutcome, JobError> {
        let Some(_claim) = self.claim(job.id) else {
            debug!("job already in progress elsewhere");
            return Ok(JobOutcome::Skipped(SkipReason::Claimed));
        };

        let Some(job) = self.store.get(job.id).await? else {
            debug!("job no longer stored");
            return Ok(JobOutcome::Skipped(SkipReason::Finished));
        };

        if !job.is_due(now) {
            debug!(next_run_at = %job.next_run_at, "job already rescheduled");
            return Ok(JobOutcome::Skipped(SkipReason::NotDue));
        }

        if let JobKind::Unknown(kind) = &job.kind {
            warn!(kind = %kind, "unknown job kind; dropping");
            self.store.delete(job.id).await?;
            return Ok(JobOutcome::Dropped(DropReason::UnknownKind(kind.clone())));
        }

        let Some(post) = self.posts.find_by_id(job.post_id).await? else {
            warn!("post no longer exists; dropping job");
            self.store.delete(job.id).await?;
            return Ok(JobOutcome::Dropped(DropReason::PostMissing));
        };

        if post.is_posted() {
            debug!("post already published");
            self.store.delete(job.id).await?;
            return Ok(JobOutcome::Completed);
        }

        let ready = match self.media.exists(&job.media_id).await {
            Ok(ready) => ready,
            Err(err) => {
                warn!(media_id = %job.media_id, error = %err, "media probe failed; treating as not ready");
                false
            }
        };

        if ready {
            match self.posts.set_status(job.post_id, PostStatus::Posted).await {
                Ok(()) => {}
                Err(PostStoreError::NotFound(_)) => {
                    warn!("post removed during processing; dropping job");
                    self.store.delete(job.id).await?;
                    return Ok(JobOutcome::Dropped(DropReason::PostMissing));
                }
                Err(err) => return Err(err.into()),
            }
            self.store.delete(job.id).await?;
            info!(media_id = %job.media_id, "media ready; post published");
            self.publish_posted(&job);
            return Ok(JobOutcome::Completed);
        }

        let attempts = job.attempts.saturating_add(1);
        let next_run_at = self.backoff.next_run_at(now, attempts);
        match self
            .store
            .update(job.id, JobPatch::reschedule(attempts, next_run_at, now))
            .await
        {
            Ok(()) => {}
            Err(JobStoreError::NotFound(_)) => {
                debug!("job removed while deferring");
                return Ok(JobOutcome::Skipped(SkipReason::Finished));
            }
            Err(err) => return Err(err.into()),
        }

        info!(attempts, next_run_at = %next_run_at, "media not ready; job deferred");
        Ok(JobOutcome::Deferred {
            attempts,
            next_run_at,
        })
    }

    fn publish_posted(&self, job: &Job) {
        let Some(bus) = &self.events else {
            return;
        };
        let payload = json!({ "postId": job.post_id, "mediaId": job.media_id });
        if let Err(err) = bus.publish(event_types::POST_PUBLISHED, payload) {
            debug!(error = %err, "event not published");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use memetok_core::{MediaId, MediaKind, Post, PostId, UserId};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::media::InMemoryMediaService;
    use crate::posts::InMemoryPostRepository;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        posts: Arc<InMemoryPostRepository>,
        media: Arc<InMemoryMediaService>,
        processor: VerifyMediaProcessor,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let posts = Arc::new(InMemoryPostRepository::new());
        let media = Arc::new(InMemoryMediaService::new());
        let processor = VerifyMediaProcessor::new(store.clone(), posts.clone(), media.clone());
        Fixture {
            store,
            posts,
            media,
            processor,
        }
    }

    async fn pending_job(f: &Fixture, media_id: &str) -> Job {
        let post_id = PostId::new();
        f.posts.insert(Post::pending(post_id, UserId::new())).await.unwrap();
        let job = Job::verify_media(post_id, MediaId::new(media_id).unwrap(), MediaKind::Video, Utc::now());
        f.store.enqueue(job.clone()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn ready_media_publishes_post_and_deletes_job() {
        let f = fixture();
        let job = pending_job(&f, "m1").await;
        f.media.mark_available(&job.media_id);

        let outcome = f.processor.process(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed);
        assert!(f.store.is_empty());
        let post = f.posts.find_by_id(job.post_id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Posted);
    }

    #[tokio::test]
    async fn missing_media_defers_with_backoff() {
        let f = fixture();
        let job = pending_job(&f, "m1").await;
        let now = Utc::now();

        let outcome = f.processor.process_at(&job, now).await.unwrap();
        let expected = now + chrono::TimeDelta::seconds(30);
        assert_eq!(
            outcome,
            JobOutcome::Deferred {
                attempts: 1,
                next_run_at: expected
            }
        );

        let stored = f.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.next_run_at, expected);

        // A stale copy handled again in the same round is left alone.
        let outcome = f.processor.process_at(&job, now).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::NotDue));

        // The next round reads attempts from the store, not the stale copy.
        let later = expected + chrono::TimeDelta::seconds(1);
        let outcome = f.processor.process_at(&job, later).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Deferred { attempts: 2, .. }));
        let stored = f.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.next_run_at, later + chrono::TimeDelta::seconds(60));
    }

    #[tokio::test]
    async fn probe_errors_count_as_not_ready() {
        let f = fixture();
        let job = pending_job(&f, "m1").await;
        f.media.mark_available(&job.media_id);
        f.media.set_probe_failing(true);

        let outcome = f.processor.process(&job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Deferred { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn missing_post_drops_job() {
        let f = fixture();
        let job = pending_job(&f, "m1").await;
        f.posts.remove(job.post_id);

        let outcome = f.processor.process(&job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Dropped(DropReason::PostMissing));
        assert!(f.store.is_empty());
        assert_eq!(f.media.probe_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_kind_is_dropped_without_processing() {
        let f = fixture();
        let mut job = pending_job(&f, "m1").await;
        f.store.delete(job.id).await.unwrap();
        job.kind = JobKind::from("resize_thumbnail");
        f.store.enqueue(job.clone()).await.unwrap();

        let outcome = f.processor.process(&job).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Dropped(DropReason::UnknownKind("resize_thumbnail".to_string()))
        );
        assert!(f.store.is_empty());
        assert_eq!(f.media.probe_calls(), 0);
    }

    #[tokio::test]
    async fn finished_job_is_skipped() {
        let f = fixture();
        let job = pending_job(&f, "m1").await;
        f.store.delete(job.id).await.unwrap();

        let outcome = f.processor.process(&job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::Finished));
    }

    #[tokio::test]
    async fn already_posted_post_is_not_flipped_again() {
        let f = fixture();
        let job = pending_job(&f, "m1").await;
        f.posts.set_status(job.post_id, PostStatus::Posted).await.unwrap();

        let outcome = f.processor.process(&job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
        assert!(f.store.is_empty());
        assert_eq!(f.media.probe_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_claim_is_skipped() {
        let store = InMemoryJobStore::arc();
        let posts = Arc::new(InMemoryPostRepository::new());
        let media = Arc::new(InMemoryMediaService::new().with_probe_delay(Duration::from_millis(50)));
        let processor = Arc::new(VerifyMediaProcessor::new(store.clone(), posts.clone(), media.clone()));

        let post_id = PostId::new();
        posts.insert(Post::pending(post_id, UserId::new())).await.unwrap();
        let job = Job::verify_media(post_id, MediaId::new("m1").unwrap(), MediaKind::Video, Utc::now());
        store.enqueue(job.clone()).await.unwrap();
        media.mark_available(&job.media_id);

        let (a, b) = tokio::join!(processor.process(&job), processor.process(&job));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, JobOutcome::Completed));

        assert_eq!(
            outcomes,
            vec![JobOutcome::Skipped(SkipReason::Claimed), JobOutcome::Completed]
        );
        assert_eq!(media.probe_calls(), 1);
    }
}
