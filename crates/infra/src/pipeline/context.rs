use std::path::PathBuf;

use memetok_core::{MediaItem, MediaKind, PostId, UserId};

/// One file written to staging storage, waiting for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub filename: String,
    pub content_type: String,
    pub kind: MediaKind,
}

/// A file that could not be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileError {
    pub filename: String,
    pub message: String,
    /// md5 hex of the staged bytes, when they could be read.
    pub content_hash: Option<String>,
}

/// State of one batch while it moves through the pipeline. Never persisted.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub post_id: PostId,
    pub user_id: UserId,
    /// Owned by this batch; removed when the batch run ends.
    pub staging_dir: PathBuf,
    pub files: Vec<StagedFile>,
    /// Accepted uploads, in file order.
    pub media_items: Vec<MediaItem>,
    pub errors: Vec<FileError>,
}

impl PipelineContext {
    pub fn new(post_id: PostId, user_id: UserId, staging_dir: PathBuf, files: Vec<StagedFile>) -> Self {
        Self {
            post_id,
            user_id,
            staging_dir,
            files,
            media_items: Vec::new(),
            errors: Vec::new(),
        }
    }
}
