//! Staging storage: local files held between the upload request and the
//! pipeline run that pushes them to the media service.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use memetok_core::{DomainError, MediaKind, PostId, UserId};

use crate::pipeline::{PipelineContext, StagedFile};

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("staging io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StagingError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn create_dir_all(&self, dir: &Path) -> Result<(), StagingError>;

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StagingError>;

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StagingError>;

    /// Remove a directory and everything below it. A missing directory is not
    /// an error.
    async fn remove_dir_all(&self, dir: &Path) -> Result<(), StagingError>;
}

/// Staging on the local filesystem via `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStagingStore;

#[async_trait]
impl StagingStore for FsStagingStore {
    async fn create_dir_all(&self, dir: &Path) -> Result<(), StagingError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StagingError::io(dir, e))
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StagingError> {
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| StagingError::io(path, e))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StagingError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| StagingError::io(path, e))
    }

    async fn remove_dir_all(&self, dir: &Path) -> Result<(), StagingError> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagingError::io(dir, e)),
        }
    }
}

/// A file as received by the upload endpoint.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub filename: Option<String>,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl IncomingFile {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: Some(filename.into()),
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// Why a batch could not be staged.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("at least one file is required")]
    Empty,
    #[error(transparent)]
    Unsupported(#[from] DomainError),
    #[error("only one video is allowed per post")]
    MultipleVideos,
    #[error("cannot mix videos and images in one post")]
    MixedMedia,
    #[error("duplicate filename in batch: {0}")]
    DuplicateFilename(String),
    #[error("failed to stage file: {0}")]
    Staging(#[from] StagingError),
}

/// Creates per-batch staging directories under a common root.
#[derive(Clone)]
pub struct StagingArea {
    root: PathBuf,
    store: Arc<dyn StagingStore>,
}

impl std::fmt::Debug for StagingArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingArea").field("root", &self.root).finish()
    }
}

/// Strip any directory components a client put in the filename.
fn base_name(filename: Option<&str>) -> Option<String> {
    filename
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn StagingStore>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a batch, write it to a fresh directory and build its pipeline context.
    ///
    /// A batch holds one video, or one or more images. On a write failure the
    /// partially written directory is removed before the error is returned.
    pub async fn stage_batch(
        &self,
        post_id: PostId,
        user_id: UserId,
        files: Vec<IncomingFile>,
    ) -> Result<PipelineContext, BatchError> {
        if files.is_empty() {
            return Err(BatchError::Empty);
        }

        let mut planned = Vec::with_capacity(files.len());
        let mut names = HashSet::new();
        for file in files {
            let kind = MediaKind::classify(&file.content_type, file.filename.as_deref())?;
            let filename = kind.staging_filename(base_name(file.filename.as_deref()).as_deref());
            if !names.insert(filename.clone()) {
                return Err(BatchError::DuplicateFilename(filename));
            }
            planned.push((kind, filename, file));
        }

        let videos = planned
            .iter()
            .filter(|(kind, _, _)| *kind == MediaKind::Video)
            .count();
        if videos > 1 {
            return Err(BatchError::MultipleVideos);
        }
        if videos > 0 && videos < planned.len() {
            return Err(BatchError::MixedMedia);
        }

        let dir = self.root.join(Uuid::now_v7().to_string());
        self.store.create_dir_all(&dir).await?;

        let mut staged = Vec::with_capacity(planned.len());
        for (kind, filename, file) in planned {
            let path = dir.join(&filename);
            if let Err(err) = self.store.write(&path, &file.bytes).await {
                warn!(post_id = %post_id, filename = %filename, error = %err, "failed to stage file");
                if let Err(cleanup) = self.store.remove_dir_all(&dir).await {
                    warn!(post_id = %post_id, error = %cleanup, "failed to remove partial staging dir");
                }
                return Err(err.into());
            }
            info!(post_id = %post_id, filename = %filename, size = file.bytes.len(), "staged file");
            staged.push(StagedFile {
                path,
                filename,
                content_type: file.content_type,
                kind,
            });
        }

        Ok(PipelineContext::new(post_id, user_id, dir, staged))
    }
}
