//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use memetok_core::{MediaId, MediaKind, PostId};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

memetok_core::impl_uuid_newtype!(JobId, "JobId");

/// Persisted name of the media verification job.
pub const VERIFY_MEDIA: &str = "verify_media";

/// Job kind for routing.
///
/// Stored as a plain string. Anything this build does not recognise loads as
/// `Unknown` instead of failing, so stale or newer rows can still be dropped
/// cleanly by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobKind {
    /// Confirm that an uploaded media item exists, then publish the post.
    VerifyMedia,
    Unknown(String),
}

impl JobKind {
    pub fn as_str(&self) -> &str {
        match self {
            JobKind::VerifyMedia => VERIFY_MEDIA,
            JobKind::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, JobKind::Unknown(_))
    }
}

impl From<String> for JobKind {
    fn from(value: String) -> Self {
        if value == VERIFY_MEDIA {
            JobKind::VerifyMedia
        } else {
            JobKind::Unknown(value)
        }
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        JobKind::from(value.to_string())
    }
}

impl From<JobKind> for String {
    fn from(value: JobKind) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deferred, retryable unit of work tied to one post's media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Correlation key: the post whose media this job confirms.
    pub post_id: PostId,
    pub media_id: MediaId,
    pub media_kind: MediaKind,
    /// Failed processing rounds so far.
    pub attempts: u32,
    /// Earliest time the job may run again. Never moves backwards.
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh verification job, due immediately.
    pub fn verify_media(
        post_id: PostId,
        media_id: MediaId,
        media_kind: MediaKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind: JobKind::VerifyMedia,
            post_id,
            media_id,
            media_kind,
            attempts: 0,
            next_run_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }

    /// Apply a partial update in place.
    ///
    /// `next_run_at` only ever moves forward.
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(next_run_at) = patch.next_run_at {
            self.next_run_at = self.next_run_at.max(next_run_at);
        }
        self.updated_at = patch.updated_at;
    }
}

/// Partial update for a stored job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPatch {
    pub attempts: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobPatch {
    /// The update written after a failed processing round.
    pub fn reschedule(attempts: u32, next_run_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            attempts: Some(attempts),
            next_run_at: Some(next_run_at),
            updated_at: now,
        }
    }
}

/// Why a job was removed without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    UnknownKind(String),
    /// The post the job belongs to no longer exists.
    PostMissing,
}

/// Why a job was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another path is processing this job right now.
    Claimed,
    /// The job is no longer in the store (another path finished it).
    Finished,
    /// The stored job was already rescheduled past the current round.
    NotDue,
}

/// Terminal state of one processing round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Media confirmed; post is posted and the job is deleted.
    Completed,
    /// Media not ready; job rescheduled.
    Deferred {
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    Dropped(DropReason),
    Skipped(SkipReason),
}

/// Summary of one due-sweep.
///
/// `processed` is always the sum of the other counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub posted: usize,
    pub deferred: usize,
    pub dropped: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Completed => self.posted += 1,
            JobOutcome::Deferred { .. } => self.deferred += 1,
            JobOutcome::Dropped(_) => self.dropped += 1,
            JobOutcome::Skipped(_) => self.skipped += 1,
        }
    }

    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }
}
