//! Domain primitives shared by the media job system.
//!
//! This crate contains **pure domain** types (no IO, no async runtime).

pub mod error;
pub mod id;
pub mod media;
pub mod post;

pub use error::{DomainError, DomainResult};
pub use id::{MediaId, PostId, UserId};
pub use media::{MediaItem, MediaKind};
pub use post::{CounterDelta, Post, PostStats, PostStatus};
