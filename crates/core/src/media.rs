//! Media kinds and accepted media items.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::MediaId;

/// Kind of media attached to a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Image,
}

const ACCEPTED_EXTENSIONS: [&str; 4] = [".mp4", ".jpg", ".jpeg", ".png"];

impl MediaKind {
    /// Classify an incoming file.
    ///
    /// `video/mp4` or a `.mp4` filename is a video; any `image/*` content type is
    /// an image. Video wins when both match.
    pub fn classify(content_type: &str, filename: Option<&str>) -> Result<Self, DomainError> {
        let is_mp4_name = filename
            .map(|name| name.to_ascii_lowercase().ends_with(".mp4"))
            .unwrap_or(false);

        if content_type == "video/mp4" || is_mp4_name {
            Ok(Self::Video)
        } else if content_type.starts_with("image/") {
            Ok(Self::Image)
        } else {
            Err(DomainError::validation(format!(
                "file {} is not a valid MP4 video or image",
                filename.unwrap_or("<unnamed>")
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Image => "image",
        }
    }

    fn default_extension(&self) -> &'static str {
        match self {
            Self::Video => ".mp4",
            Self::Image => ".jpg",
        }
    }

    /// Staging filename for an upload of this kind.
    ///
    /// Missing names become `upload.mp4` / `upload.jpg`; names without an
    /// accepted extension get the default one appended.
    pub fn staging_filename(&self, filename: Option<&str>) -> String {
        let name = match filename.map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => return format!("upload{}", self.default_extension()),
        };

        let lower = name.to_ascii_lowercase();
        if ACCEPTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            name.to_string()
        } else {
            format!("{}{}", name, self.default_extension())
        }
    }
}

impl core::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MediaKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "image" => Ok(Self::Image),
            other => Err(DomainError::unknown_value("media kind", other)),
        }
    }
}

/// A file accepted by the media service and attached to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub id: MediaId,
    /// md5 hex digest of the uploaded bytes.
    pub hash: String,
}
