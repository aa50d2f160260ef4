//! Upload pipeline scenarios against in-memory collaborators and a real
//! temporary staging directory.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use memetok_core::{Post, PostId, PostStatus, UserId};
use memetok_events::{Event, EventBus, EventBusConfig, event_types};
use memetok_infra::audit::{InMemoryUploadErrorStore, UploadErrorStore};
use memetok_infra::media::InMemoryMediaService;
use memetok_infra::pipeline::{BatchRunner, PipelineConfig, PipelineContext, PipelineError, UploadPipeline};
use memetok_infra::posts::{InMemoryPostRepository, PostRepository, PostStoreError};
use memetok_infra::staging::{FsStagingStore, IncomingFile, StagingArea, StagingError, StagingStore};

/// Filesystem staging that counts directory removals.
#[derive(Default)]
struct CountingStaging {
    inner: FsStagingStore,
    removals: AtomicUsize,
}

#[async_trait]
impl StagingStore for CountingStaging {
    async fn create_dir_all(&self, dir: &Path) -> Result<(), StagingError> {
        self.inner.create_dir_all(dir).await
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StagingError> {
        self.inner.write(path, bytes).await
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StagingError> {
        self.inner.read(path).await
    }

    async fn remove_dir_all(&self, dir: &Path) -> Result<(), StagingError> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_dir_all(dir).await
    }
}

struct Harness {
    _root: TempDir,
    staging: Arc<CountingStaging>,
    area: StagingArea,
    posts: Arc<InMemoryPostRepository>,
    audit: Arc<InMemoryUploadErrorStore>,
    media: Arc<InMemoryMediaService>,
    events: Arc<EventBus>,
    seen: Arc<Mutex<Vec<Event>>>,
}

impl Harness {
    fn new(media: InMemoryMediaService) -> Self {
        let root = tempfile::tempdir().unwrap();
        let staging = Arc::new(CountingStaging::default());
        let area = StagingArea::new(root.path(), staging.clone());

        let events = Arc::new(EventBus::new(
            EventBusConfig::default().with_poll_interval(Duration::from_millis(20)),
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for event_type in [event_types::POST_PUBLISHED, event_types::POST_UPLOAD_FAILED] {
            let seen = seen.clone();
            events.register(event_type, move |event: Event| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(event);
                    anyhow::Ok(())
                }
            });
        }
        events.start();

        Self {
            _root: root,
            staging,
            area,
            posts: Arc::new(InMemoryPostRepository::new()),
            audit: Arc::new(InMemoryUploadErrorStore::new()),
            media: Arc::new(media),
            events,
            seen,
        }
    }

    fn runner(&self, permits: usize) -> BatchRunner {
        BatchRunner::new(
            self.posts.clone(),
            self.audit.clone(),
            self.media.clone(),
            self.staging.clone(),
            permits,
        )
        .with_events(self.events.clone())
    }

    async fn staged_post(&self, files: Vec<IncomingFile>) -> PipelineContext {
        let post_id = PostId::new();
        let user_id = UserId::new();
        self.posts.insert(Post::pending(post_id, user_id)).await.unwrap();
        self.area.stage_batch(post_id, user_id, files).await.unwrap()
    }

    async fn post(&self, id: PostId) -> Post {
        self.posts.find_by_id(id).await.unwrap().unwrap()
    }

    async fn events_of(&self, event_type: &str) -> Vec<Event> {
        wait_until(|| !self.seen.lock().unwrap().is_empty()).await;
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
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

fn images(names: &[&str]) -> Vec<IncomingFile> {
    names
        .iter()
        .map(|name| IncomingFile::new(*name, "image/jpeg", format!("bytes of {}", name).into_bytes()))
        .collect()
}

fn assert_removed(dir: &Path) {
    assert!(!dir.exists(), "staging dir {} still exists", dir.display());
}

#[tokio::test]
async fn uploads_respect_permit_limit_and_keep_file_order() {
    let h = Harness::new(InMemoryMediaService::new().with_upload_delay(Duration::from_millis(50)));
    let ctx = h
        .staged_post(images(&["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"]))
        .await;
    let (post_id, dir) = (ctx.post_id, ctx.staging_dir.clone());

    let report = h.runner(3).run_batch(ctx).await.unwrap();

    assert_eq!(report.uploaded, 5);
    assert_eq!(report.failed, 0);
    assert_eq!(report.status, PostStatus::Posted);
    assert_eq!(h.media.upload_calls(), 5);
    assert!(h.media.max_in_flight() <= 3, "saw {} uploads in flight", h.media.max_in_flight());
    assert!(h.media.max_in_flight() >= 2);

    let post = h.post(post_id).await;
    assert_eq!(post.status, PostStatus::Posted);
    assert_eq!(post.media.len(), 5);
    // Results keep file order regardless of which upload finished first.
    let expected: Vec<String> = ["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"]
        .iter()
        .map(|name| format!("{:x}", md5::compute(format!("bytes of {}", name))))
        .collect();
    let hashes: Vec<String> = post.media.iter().map(|item| item.hash.clone()).collect();
    assert_eq!(hashes, expected);

    assert_removed(&dir);
    assert_eq!(h.staging.removals.load(Ordering::SeqCst), 1);

    let published = h.events_of(event_types::POST_PUBLISHED).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload["mediaCount"], 5);
    h.events.stop().await;
}

#[tokio::test]
async fn partial_failure_posts_successes_and_audits_failures() {
    let h = Harness::new(InMemoryMediaService::new().with_upload_delay(Duration::from_millis(40)));
    h.media.fail_uploads_for("b.jpg");
    h.media.fail_uploads_for("d.jpg");
    let ctx = h
        .staged_post(images(&["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"]))
        .await;
    let (post_id, user_id, dir) = (ctx.post_id, ctx.user_id, ctx.staging_dir.clone());

    let report = h.runner(3).run_batch(ctx).await.unwrap();

    assert_eq!((report.uploaded, report.failed), (3, 2));
    assert_eq!(h.media.upload_calls(), 5);
    assert!(h.media.max_in_flight() <= 3, "saw {} uploads in flight", h.media.max_in_flight());

    // Exactly the successful files' media ids, in file order.
    let uploaded = h.media.uploaded();
    let expected: Vec<_> = ["a.jpg", "c.jpg", "e.jpg"]
        .iter()
        .map(|name| {
            uploaded
                .iter()
                .find(|(filename, _)| filename == name)
                .map(|(_, id)| id.clone())
                .unwrap()
        })
        .collect();
    let post = h.post(post_id).await;
    assert_eq!(post.status, PostStatus::Posted);
    assert_eq!(post.media.iter().map(|item| item.id.clone()).collect::<Vec<_>>(), expected);

    let errors = h.audit.query_by_post(post_id).await.unwrap();
    let mut failed: Vec<&str> = errors.iter().map(|e| e.filename.as_str()).collect();
    failed.sort_unstable();
    assert_eq!(failed, ["b.jpg", "d.jpg"]);
    let b = errors.iter().find(|e| e.filename == "b.jpg").unwrap();
    assert_eq!(b.user_id, user_id);
    assert!(b.message.contains("upload failed: 500"));
    assert_eq!(
        b.content_hash.as_deref(),
        Some(format!("{:x}", md5::compute(b"bytes of b.jpg")).as_str())
    );

    assert_removed(&dir);
    assert_eq!(h.staging.removals.load(Ordering::SeqCst), 1);
    h.events.stop().await;
}

#[tokio::test]
async fn total_failure_leaves_post_pending() {
    let names = ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"];
    let h = Harness::new(InMemoryMediaService::new().with_upload_delay(Duration::from_millis(40)));
    for name in names {
        h.media.fail_uploads_for(name);
    }
    let ctx = h.staged_post(images(&names)).await;
    let (post_id, dir) = (ctx.post_id, ctx.staging_dir.clone());

    let report = h.runner(3).run_batch(ctx).await.unwrap();

    assert_eq!(report.status, PostStatus::Pending);
    assert_eq!((report.uploaded, report.failed), (0, 5));
    assert!(h.media.max_in_flight() <= 3, "saw {} uploads in flight", h.media.max_in_flight());
    let post = h.post(post_id).await;
    assert_eq!(post.status, PostStatus::Pending);
    assert!(post.media.is_empty());
    assert_eq!(h.audit.query_by_post(post_id).await.unwrap().len(), 5);
    assert_removed(&dir);
    assert_eq!(h.staging.removals.load(Ordering::SeqCst), 1);

    let failed = h.events_of(event_types::POST_UPLOAD_FAILED).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["errorCount"], 5);
    h.events.stop().await;
}

#[tokio::test]
async fn aggregate_error_still_cleans_up() {
    let h = Harness::new(InMemoryMediaService::new());
    let ctx = h.staged_post(images(&["a.jpg"])).await;
    let (post_id, dir) = (ctx.post_id, ctx.staging_dir.clone());
    h.posts.remove(post_id);

    let err = h.runner(3).run_batch(ctx).await.unwrap_err();

    assert!(matches!(err, PipelineError::Post(PostStoreError::NotFound(id)) if id == post_id));
    assert_removed(&dir);
    assert_eq!(h.staging.removals.load(Ordering::SeqCst), 1);
    h.events.stop().await;
}

#[tokio::test]
async fn unreadable_staged_file_is_recorded_without_hash() {
    let h = Harness::new(InMemoryMediaService::new());
    let ctx = h.staged_post(images(&["a.jpg", "b.jpg"])).await;
    tokio::fs::remove_file(&ctx.files[1].path).await.unwrap();
    let post_id = ctx.post_id;

    let report = h.runner(1).run_batch(ctx).await.unwrap();

    assert_eq!((report.uploaded, report.failed), (1, 1));
    let errors = h.audit.query_by_post(post_id).await.unwrap();
    assert_eq!(errors[0].filename, "b.jpg");
    assert_eq!(errors[0].content_hash, None);
    h.events.stop().await;
}

#[tokio::test]
async fn workers_drain_queue_and_share_permits() {
    let h = Harness::new(InMemoryMediaService::new().with_upload_delay(Duration::from_millis(30)));
    let pipeline = UploadPipeline::new(
        PipelineConfig::default()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(20)),
        h.runner(3),
    );

    let mut post_ids = Vec::new();
    for _ in 0..3 {
        let ctx = h.staged_post(images(&["a.jpg", "b.jpg", "c.jpg"])).await;
        post_ids.push(ctx.post_id);
        pipeline.enqueue(ctx);
    }
    assert_eq!(pipeline.queued(), 3);

    pipeline.start();
    let posts = h.posts.clone();
    let ids = post_ids.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        loop {
            let mut done = 0;
            for id in &ids {
                if posts.find_by_id(*id).await.unwrap().is_some_and(|p| p.is_posted()) {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("batches not processed in time");
    pipeline.stop().await;

    assert_eq!(pipeline.queued(), 0);
    assert!(!pipeline.is_running());
    assert_eq!(h.media.upload_calls(), 9);
    assert!(h.media.max_in_flight() <= 3);
    assert_eq!(h.staging.removals.load(Ordering::SeqCst), 3);
    h.events.stop().await;
}

#[tokio::test]
async fn stop_lets_running_batch_finish() {
    let h = Harness::new(InMemoryMediaService::new().with_upload_delay(Duration::from_millis(200)));
    let pipeline = UploadPipeline::new(
        PipelineConfig::default()
            .with_workers(1)
            .with_poll_interval(Duration::from_millis(20)),
        h.runner(3),
    );
    let ctx = h.staged_post(images(&["a.jpg"])).await;
    let (post_id, dir) = (ctx.post_id, ctx.staging_dir.clone());
    pipeline.enqueue(ctx);
    pipeline.start();

    let media = h.media.clone();
    wait_until(move || media.upload_calls() == 1).await;
    pipeline.stop().await;

    assert_eq!(h.post(post_id).await.status, PostStatus::Posted);
    assert_removed(&dir);
    h.events.stop().await;
}
