//! Post aggregate as seen by the media job system.
//!
//! Only the fields the background workers read or write are modelled here;
//! captions, tags and the rest of the post document belong to the API layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{PostId, UserId};
use crate::media::MediaItem;

/// Publication status of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    /// Created, media not yet confirmed (or every upload failed).
    Pending,
    /// Media accepted; visible in feeds.
    Posted,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Posted => "posted",
        }
    }
}

impl core::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PostStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "posted" => Ok(Self::Posted),
            other => Err(DomainError::unknown_value("post status", other)),
        }
    }
}

/// Engagement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostStats {
    pub likes: i64,
    pub comments: i64,
}

/// Signed change applied to [`PostStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub likes: i64,
    pub comments: i64,
}

impl CounterDelta {
    pub fn likes(delta: i64) -> Self {
        Self {
            likes: delta,
            comments: 0,
        }
    }

    pub fn comments(delta: i64) -> Self {
        Self {
            likes: 0,
            comments: delta,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.likes == 0 && self.comments == 0
    }
}

impl PostStats {
    /// Apply a delta. Counters never go below zero.
    pub fn apply(&mut self, delta: CounterDelta) {
        self.likes = self.likes.saturating_add(delta.likes).max(0);
        self.comments = self.comments.saturating_add(delta.comments).max(0);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub author: UserId,
    pub status: PostStatus,
    pub media: Vec<MediaItem>,
    pub stats: PostStats,
    pub created_at: DateTime<Utc>,
}

impl Post {
    /// A freshly created post: pending, no media, zero counters.
    pub fn pending(id: PostId, author: UserId) -> Self {
        Self {
            id,
            author,
            status: PostStatus::Pending,
            media: Vec::new(),
            stats: PostStats::default(),
            created_at: Utc::now(),
        }
    }

    pub fn is_posted(&self) -> bool {
        self.status == PostStatus::Posted
    }
}
