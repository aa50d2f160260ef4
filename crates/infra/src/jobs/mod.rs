//! Deferred media verification jobs.
//!
//! ## Components
//!
//! - `Job`: one verification attempt chain for a post's media
//! - `JobStore`: durable storage (in-memory or Postgres)
//! - `BackoffPolicy`: retry delay after each failed round
//! - `VerifyMediaProcessor`: the per-job state machine
//! - `JobWorker`: dispatch queue, due-sweep and lifecycle

pub mod backoff;
pub mod postgres;
pub mod processor;
pub mod store;
pub mod types;
pub mod worker;

pub use backoff::{BackoffPolicy, delay_seconds};
pub use postgres::PostgresJobStore;
pub use processor::{JobError, VerifyMediaProcessor};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    DropReason, Job, JobId, JobKind, JobOutcome, JobPatch, SkipReason, SweepReport, VERIFY_MEDIA,
};
pub use worker::{JobWorker, JobWorkerConfig};
