//! Upload pipeline: staged files go to the media service under a shared
//! concurrency limit, the outcome is folded into the post, and the staging
//! directory is removed whatever happened.

pub mod batch;
pub mod context;
pub mod workers;

pub use batch::{BatchReport, BatchRunner, PipelineError};
pub use context::{FileError, PipelineContext, StagedFile};
pub use workers::{PipelineConfig, UploadPipeline};
