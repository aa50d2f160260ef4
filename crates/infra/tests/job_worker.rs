//! Job worker end to end: dispatch queue, due-sweep, backoff and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use memetok_core::{CounterDelta, MediaId, MediaItem, MediaKind, Post, PostId, PostStatus, UserId};
use memetok_events::{Event, EventBus, EventBusConfig, event_types};
use memetok_infra::jobs::{
    BackoffPolicy, InMemoryJobStore, Job, JobId, JobKind, JobOutcome, JobPatch, JobStore, JobStoreError,
    JobWorker, JobWorkerConfig, SweepReport, VerifyMediaProcessor,
};
use memetok_infra::media::InMemoryMediaService;
use memetok_infra::posts::{InMemoryPostRepository, PostRepository, PostStoreError};

/// Post repository that counts transitions to `posted`.
#[derive(Default)]
struct CountingPosts {
    inner: InMemoryPostRepository,
    posted: AtomicUsize,
}

#[async_trait]
impl PostRepository for CountingPosts {
    async fn insert(&self, post: Post) -> Result<(), PostStoreError> {
        self.inner.insert(post).await
    }

    async fn find_by_id(&self, id: PostId) -> Result<Option<Post>, PostStoreError> {
        self.inner.find_by_id(id).await
    }

    async fn set_status(&self, id: PostId, status: PostStatus) -> Result<(), PostStoreError> {
        if status == PostStatus::Posted {
            self.posted.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.set_status(id, status).await
    }

    async fn update_media(&self, id: PostId, items: Vec<MediaItem>) -> Result<(), PostStoreError> {
        self.inner.update_media(id, items).await
    }

    async fn increment_counters(&self, id: PostId, delta: CounterDelta) -> Result<(), PostStoreError> {
        self.inner.increment_counters(id, delta).await
    }
}

/// Job store whose writes always fail.
struct BrokenStore;

#[async_trait]
impl JobStore for BrokenStore {
    async fn enqueue(&self, _job: Job) -> Result<JobId, JobStoreError> {
        Err(JobStoreError::Storage("disk full".to_string()))
    }

    async fn get(&self, _id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(None)
    }

    async fn fetch_due(&self, _now: DateTime<Utc>, _limit: usize) -> Result<Vec<Job>, JobStoreError> {
        Err(JobStoreError::Storage("disk full".to_string()))
    }

    async fn update(&self, id: JobId, _patch: JobPatch) -> Result<(), JobStoreError> {
        Err(JobStoreError::NotFound(id))
    }

    async fn delete(&self, _id: JobId) -> Result<bool, JobStoreError> {
        Ok(false)
    }

    async fn find_by_post(&self, _post_id: PostId) -> Result<Option<Job>, JobStoreError> {
        Ok(None)
    }
}

struct Harness {
    store: Arc<InMemoryJobStore>,
    posts: Arc<CountingPosts>,
    media: Arc<InMemoryMediaService>,
    events: Arc<EventBus>,
    published: Arc<Mutex<Vec<Event>>>,
    worker: Arc<JobWorker>,
}

fn fast_config() -> JobWorkerConfig {
    JobWorkerConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_sweep_interval(Duration::from_secs(3600))
}

impl Harness {
    fn new(media: InMemoryMediaService, backoff: BackoffPolicy) -> Self {
        let store = InMemoryJobStore::arc();
        let posts = Arc::new(CountingPosts::default());
        let media = Arc::new(media);

        let events = Arc::new(EventBus::new(
            EventBusConfig::default().with_poll_interval(Duration::from_millis(20)),
        ));
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();
        events.register(event_types::POST_PUBLISHED, move |event: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                anyhow::Ok(())
            }
        });
        events.start();

        let processor = VerifyMediaProcessor::new(store.clone(), posts.clone(), media.clone())
            .with_backoff(backoff)
            .with_events(events.clone());
        let worker = Arc::new(JobWorker::new(fast_config(), processor));

        Self {
            store,
            posts,
            media,
            events,
            published,
            worker,
        }
    }

    async fn pending_post(&self) -> PostId {
        let post_id = PostId::new();
        self.posts.insert(Post::pending(post_id, UserId::new())).await.unwrap();
        post_id
    }

    async fn status(&self, post_id: PostId) -> PostStatus {
        self.posts.find_by_id(post_id).await.unwrap().unwrap().status
    }

    async fn shutdown(&self) {
        self.worker.stop().await;
        self.events.stop().await;
    }
}

fn media_id(raw: &str) -> MediaId {
    MediaId::new(raw).unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn enqueued_job_publishes_post_when_media_ready() {
    let h = Harness::new(InMemoryMediaService::new(), BackoffPolicy::default());
    let post_id = h.pending_post().await;
    h.media.mark_available(&media_id("m1"));
    h.worker.start();

    h.worker
        .enqueue_verify_media(post_id, media_id("m1"), MediaKind::Video)
        .await
        .unwrap();

    let store = h.store.clone();
    wait_until(move || store.is_empty()).await;
    assert_eq!(h.status(post_id).await, PostStatus::Posted);
    assert_eq!(h.posts.posted.load(Ordering::SeqCst), 1);

    let published = h.published.clone();
    wait_until(move || !published.lock().unwrap().is_empty()).await;
    let event = h.published.lock().unwrap()[0].clone();
    assert_eq!(event.payload["mediaId"], "m1");
    assert_eq!(event.payload["postId"], post_id.to_string());

    h.shutdown().await;
}

#[tokio::test]
async fn unready_media_is_deferred_then_swept_later() {
    let backoff = BackoffPolicy::new(Duration::from_millis(300), Duration::from_secs(1));
    let h = Harness::new(InMemoryMediaService::new(), backoff);
    let post_id = h.pending_post().await;
    h.worker.start();

    let id = h
        .worker
        .enqueue_verify_media(post_id, media_id("m1"), MediaKind::Video)
        .await
        .unwrap();

    let media = h.media.clone();
    wait_until(move || media.probe_calls() == 1).await;
    let store = h.store.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.get(id).await.unwrap().is_some_and(|job| job.attempts == 0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job not deferred in time");

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.next_run_at > job.created_at);
    assert_eq!(h.status(post_id).await, PostStatus::Pending);

    // Not due yet: the sweep leaves it alone.
    let report = h.worker.sweep_once(10).await.unwrap();
    assert_eq!(report, SweepReport::default());

    h.media.mark_available(&media_id("m1"));
    tokio::time::sleep(Duration::from_millis(350)).await;
    let report = h.worker.sweep_once(10).await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.posted, 1);
    assert!(h.store.is_empty());
    assert_eq!(h.status(post_id).await, PostStatus::Posted);

    h.shutdown().await;
}

#[tokio::test]
async fn sweep_reports_every_outcome() {
    let h = Harness::new(InMemoryMediaService::new(), BackoffPolicy::default());
    let now = Utc::now();

    let ready_post = h.pending_post().await;
    h.media.mark_available(&media_id("ready"));
    h.store
        .enqueue(Job::verify_media(ready_post, media_id("ready"), MediaKind::Image, now))
        .await
        .unwrap();

    let waiting_post = h.pending_post().await;
    h.store
        .enqueue(Job::verify_media(waiting_post, media_id("waiting"), MediaKind::Image, now))
        .await
        .unwrap();

    h.store
        .enqueue(Job::verify_media(PostId::new(), media_id("orphan"), MediaKind::Image, now))
        .await
        .unwrap();

    let mut unknown = Job::verify_media(h.pending_post().await, media_id("x"), MediaKind::Image, now);
    unknown.kind = JobKind::from("transcode");
    h.store.enqueue(unknown).await.unwrap();

    let report = h.worker.sweep_once(10).await.unwrap();

    assert_eq!(report.processed, 4);
    assert_eq!(report.posted, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.dropped, 2);
    assert_eq!(report.skipped + report.failed, 0);
    assert_eq!(
        report.processed,
        report.posted + report.deferred + report.dropped + report.skipped + report.failed
    );
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.status(ready_post).await, PostStatus::Posted);

    h.shutdown().await;
}

#[tokio::test]
async fn queue_and_sweep_race_yields_one_transition() {
    let media = InMemoryMediaService::new().with_probe_delay(Duration::from_millis(50));
    let h = Harness::new(media, BackoffPolicy::default());
    let post_id = h.pending_post().await;
    h.media.mark_available(&media_id("m1"));

    let job = Job::verify_media(post_id, media_id("m1"), MediaKind::Video, Utc::now());
    h.store.enqueue(job.clone()).await.unwrap();

    let (direct, swept) = tokio::join!(h.worker.processor().process(&job), h.worker.sweep_once(10));
    let direct = direct.unwrap();
    let swept = swept.unwrap();

    let completions = usize::from(direct == JobOutcome::Completed) + swept.posted;
    assert_eq!(completions, 1);
    assert_eq!(swept.processed, 1);
    assert_eq!(h.posts.posted.load(Ordering::SeqCst), 1);
    assert_eq!(h.media.probe_calls(), 1);
    assert!(h.store.is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn first_sweep_recovers_stored_jobs_on_start() {
    let h = Harness::new(InMemoryMediaService::new(), BackoffPolicy::default());
    let post_id = h.pending_post().await;
    h.media.mark_available(&media_id("m1"));
    // Left behind by a previous process: stored, never queued in memory.
    h.store
        .enqueue(Job::verify_media(post_id, media_id("m1"), MediaKind::Video, Utc::now()))
        .await
        .unwrap();

    h.worker.start();
    let store = h.store.clone();
    wait_until(move || store.is_empty()).await;
    assert_eq!(h.status(post_id).await, PostStatus::Posted);

    h.shutdown().await;
}

#[tokio::test]
async fn stop_waits_for_in_flight_job() {
    let media = InMemoryMediaService::new().with_probe_delay(Duration::from_millis(200));
    let h = Harness::new(media, BackoffPolicy::default());
    let post_id = h.pending_post().await;
    h.media.mark_available(&media_id("m1"));
    h.worker.start();
    h.worker
        .enqueue_verify_media(post_id, media_id("m1"), MediaKind::Video)
        .await
        .unwrap();

    let media = h.media.clone();
    wait_until(move || media.probe_calls() == 1).await;
    h.worker.stop().await;

    assert!(!h.worker.is_running());
    assert_eq!(h.status(post_id).await, PostStatus::Posted);
    assert!(h.store.is_empty());
    h.events.stop().await;
}

#[tokio::test]
async fn stop_mid_sweep_leaves_unstarted_jobs_stored() {
    let media = InMemoryMediaService::new().with_probe_delay(Duration::from_millis(300));
    let h = Harness::new(media, BackoffPolicy::default());
    let now = Utc::now();
    for n in 0..6 {
        let id = media_id(&format!("m{n}"));
        h.media.mark_available(&id);
        let post_id = h.pending_post().await;
        h.store
            .enqueue(Job::verify_media(post_id, id, MediaKind::Image, now))
            .await
            .unwrap();
    }

    h.worker.start();
    let media = h.media.clone();
    wait_until(move || media.probe_calls() == 1).await;

    let started = std::time::Instant::now();
    h.worker.stop().await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(900), "stop took {elapsed:?}");
    assert_eq!(h.media.probe_calls(), 1);
    assert_eq!(h.posts.posted.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.len(), 5);
    h.events.stop().await;
}

#[tokio::test]
async fn store_failure_on_enqueue_queues_nothing() {
    let posts = Arc::new(InMemoryPostRepository::new());
    let media = Arc::new(InMemoryMediaService::new());
    let processor = VerifyMediaProcessor::new(Arc::new(BrokenStore), posts, media);
    let worker = JobWorker::new(fast_config(), processor);

    let err = worker
        .enqueue_verify_media(PostId::new(), media_id("m1"), MediaKind::Image)
        .await
        .unwrap_err();

    assert!(matches!(err, JobStoreError::Storage(_)));
    assert_eq!(worker.queued(), 0);
    assert!(worker.sweep_once(10).await.is_err());
}
