use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event names published by the media workers.
pub mod event_types {
    /// A post's media was accepted and the post flipped to "posted".
    pub const POST_PUBLISHED: &str = "post.published";
    /// Every upload in a batch failed; the post stays "pending".
    pub const POST_UPLOAD_FAILED: &str = "post.upload_failed";
}

/// A transient notification.
///
/// `event_type` selects the handler; `payload` is opaque to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Correlation id for logs (UUIDv7, time-ordered).
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
            published_at: Utc::now(),
        }
    }
}
