//! One batch run: upload, aggregate, clean up.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use memetok_core::{MediaItem, PostId, PostStatus};
use memetok_events::{EventBus, event_types, panic_message};

use super::context::{FileError, PipelineContext, StagedFile};
use crate::audit::{UploadErrorRecord, UploadErrorStore};
use crate::media::MediaService;
use crate::posts::{PostRepository, PostStoreError};
use crate::staging::StagingStore;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to update post: {0}")]
    Post(#[from] PostStoreError),
    #[error("batch panicked: {0}")]
    Panicked(String),
}

/// What a finished batch did to its post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub post_id: PostId,
    pub uploaded: usize,
    pub failed: usize,
    pub status: PostStatus,
}

/// Runs batches against the collaborators.
///
/// The upload semaphore is shared by every batch this runner executes, so the
/// number of concurrent uploads is bounded across all pipeline workers.
pub struct BatchRunner {
    posts: Arc<dyn PostRepository>,
    audit: Arc<dyn UploadErrorStore>,
    media: Arc<dyn MediaService>,
    staging: Arc<dyn StagingStore>,
    permits: Arc<Semaphore>,
    events: Option<Arc<EventBus>>,
}

impl BatchRunner {
    pub fn new(
        posts: Arc<dyn PostRepository>,
        audit: Arc<dyn UploadErrorStore>,
        media: Arc<dyn MediaService>,
        staging: Arc<dyn StagingStore>,
        upload_permits: usize,
    ) -> Self {
        Self {
            posts,
            audit,
            media,
            staging,
            permits: Arc::new(Semaphore::new(upload_permits.max(1))),
            events: None,
        }
    }

    /// Publish `post.published` / `post.upload_failed` after each batch.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Run all three stages. The staging directory is removed on every path
    /// out of this function, including errors and panics in stages 1 and 2.
    pub async fn run_batch(&self, mut ctx: PipelineContext) -> Result<BatchReport, PipelineError> {
        let post_id = ctx.post_id;
        let staging_dir = ctx.staging_dir.clone();
        info!(post_id = %post_id, file_count = ctx.files.len(), "batch started");

        let outcome = AssertUnwindSafe(async {
            self.upload_all(&mut ctx).await;
            self.aggregate(&ctx).await
        })
        .catch_unwind()
        .await;

        self.cleanup(post_id, &staging_dir).await;

        match outcome {
            Ok(result) => result,
            Err(panic) => Err(PipelineError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    /// Stage 1: upload every file, at most `permits` at a time pipeline-wide.
    async fn upload_all(&self, ctx: &mut PipelineContext) {
        let post_id = ctx.post_id;
        info!(post_id = %post_id, file_count = ctx.files.len(), "stage1: starting uploads");

        let uploads = ctx.files.iter().map(|file| async move {
            AssertUnwindSafe(self.upload_one(post_id, file))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(FileError {
                        filename: file.filename.clone(),
                        message: format!("upload task panicked: {}", panic_message(panic.as_ref())),
                        content_hash: None,
                    })
                })
        });
        let results = join_all(uploads).await;

        for result in results {
            match result {
                Ok(item) => ctx.media_items.push(item),
                Err(err) => ctx.errors.push(err),
            }
        }

        info!(
            post_id = %post_id,
            success = ctx.media_items.len(),
            errors = ctx.errors.len(),
            "stage1: completed"
        );
    }

    async fn upload_one(&self, post_id: PostId, file: &StagedFile) -> Result<MediaItem, FileError> {
        let failure = |message: String, content_hash: Option<String>| FileError {
            filename: file.filename.clone(),
            message,
            content_hash,
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| failure("upload limiter closed".to_string(), None))?;

        let bytes = self.staging.read(&file.path).await.map_err(|e| {
            warn!(post_id = %post_id, filename = %file.filename, error = %e, "staged file unreadable");
            failure(e.to_string(), None)
        })?;
        let hash = format!("{:x}", md5::compute(&bytes));

        info!(post_id = %post_id, filename = %file.filename, size = bytes.len(), "uploading to media service");

        match self.media.upload(&file.filename, &file.content_type, bytes).await {
            Ok(uploaded) => {
                info!(post_id = %post_id, media_id = %uploaded.id, "media upload succeeded");
                Ok(MediaItem {
                    kind: file.kind,
                    id: uploaded.id,
                    hash,
                })
            }
            Err(err) => {
                warn!(post_id = %post_id, filename = %file.filename, error = %err, "media upload failed");
                Err(failure(err.to_string(), Some(hash)))
            }
        }
    }

    /// Stage 2: record failures, then settle the post.
    async fn aggregate(&self, ctx: &PipelineContext) -> Result<BatchReport, PipelineError> {
        let post_id = ctx.post_id;

        for err in &ctx.errors {
            let record = UploadErrorRecord::new(
                post_id,
                ctx.user_id,
                err.filename.clone(),
                err.message.clone(),
                err.content_hash.clone(),
            );
            match self.audit.insert(record).await {
                Ok(()) => debug!(post_id = %post_id, filename = %err.filename, "logged upload error"),
                Err(audit_err) => error!(
                    post_id = %post_id,
                    filename = %err.filename,
                    error = %audit_err,
                    "failed to record upload error"
                ),
            }
        }

        let status = if ctx.media_items.is_empty() {
            self.posts.set_status(post_id, PostStatus::Pending).await?;
            warn!(post_id = %post_id, "stage2: no media uploaded; post left pending");
            self.publish(
                event_types::POST_UPLOAD_FAILED,
                json!({ "postId": post_id, "errorCount": ctx.errors.len() }),
            );
            PostStatus::Pending
        } else {
            self.posts
                .update_media(post_id, ctx.media_items.clone())
                .await?;
            self.posts.set_status(post_id, PostStatus::Posted).await?;
            info!(post_id = %post_id, media_count = ctx.media_items.len(), "stage2: post updated to posted");
            self.publish(
                event_types::POST_PUBLISHED,
                json!({ "postId": post_id, "mediaCount": ctx.media_items.len() }),
            );
            PostStatus::Posted
        };

        Ok(BatchReport {
            post_id,
            uploaded: ctx.media_items.len(),
            failed: ctx.errors.len(),
            status,
        })
    }

    /// Stage 3: best-effort removal of the batch's staging directory.
    async fn cleanup(&self, post_id: PostId, dir: &Path) {
        match self.staging.remove_dir_all(dir).await {
            Ok(()) => info!(post_id = %post_id, staging_dir = %dir.display(), "cleaned up staging files"),
            Err(err) => error!(
                post_id = %post_id,
                staging_dir = %dir.display(),
                error = %err,
                "failed to clean up staging files"
            ),
        }
    }

    fn publish(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.events {
            if let Err(err) = bus.publish(event_type, payload) {
                debug!(error = %err, "event not published");
            }
        }
    }
}
