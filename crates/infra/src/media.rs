//! External media service client.
//!
//! The service accepts uploads (`POST {base}/upload`, multipart field `file`,
//! JSON response carrying `id`) and answers existence probes
//! (`GET {base}/media/{id}`, 200 means the media is ready).

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use memetok_core::MediaId;

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub id: MediaId,
}

#[async_trait]
pub trait MediaService: Send + Sync {
    async fn upload(
        &self,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedMedia, MediaError>;

    /// Whether the media is available. `Err` means the probe itself failed.
    async fn exists(&self, media_id: &MediaId) -> Result<bool, MediaError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    #[error("media service unreachable: {0}")]
    Transport(String),
    #[error("upload failed: {status} - {body}")]
    Status { status: u16, body: String },
    #[error("media service did not return a media ID")]
    MissingId,
    #[error("invalid media service response: {0}")]
    InvalidResponse(String),
    #[error("upload rejected: {0}")]
    Rejected(String),
}

const MAX_ERROR_BODY_CHARS: usize = 500;

/// HTTP client for the media service.
#[derive(Debug, Clone)]
pub struct HttpMediaService {
    client: reqwest::Client,
    base_url: String,
    upload_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpMediaService {
    pub fn new(
        base_url: impl Into<String>,
        upload_timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self, MediaError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| MediaError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            upload_timeout,
            probe_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn media_id_from_response(body: &serde_json::Value) -> Result<MediaId, MediaError> {
    let raw = match body.get("id") {
        Some(serde_json::Value::String(id)) => id.clone(),
        Some(serde_json::Value::Number(id)) => id.to_string(),
        _ => return Err(MediaError::MissingId),
    };
    MediaId::new(raw).map_err(|_| MediaError::MissingId)
}

#[async_trait]
impl MediaService for HttpMediaService {
    #[instrument(skip(self, bytes), fields(size = bytes.len()), err)]
    async fn upload(
        &self,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedMedia, MediaError> {
        let mut part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        if !content_type.is_empty() {
            part = part
                .mime_str(content_type)
                .map_err(|e| MediaError::Rejected(format!("invalid content type: {}", e)))?;
        }
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .multipart(form)
            .timeout(self.upload_timeout)
            .send()
            .await
            .map_err(|e| MediaError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MediaError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MediaError::InvalidResponse(e.to_string()))?;

        Ok(UploadedMedia {
            id: media_id_from_response(&body)?,
        })
    }

    #[instrument(skip(self), fields(media_id = %media_id), err)]
    async fn exists(&self, media_id: &MediaId) -> Result<bool, MediaError> {
        let response = self
            .client
            .get(format!("{}/media/{}", self.base_url, media_id))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| MediaError::Transport(e.to_string()))?;

        debug!(status = %response.status(), "media probe answered");
        Ok(response.status() == StatusCode::OK)
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    available: HashSet<MediaId>,
    uploaded: Vec<(String, MediaId)>,
    failing_filenames: HashSet<String>,
    probe_failing: bool,
    hold_back_uploads: bool,
}

/// In-memory media service for tests/dev.
///
/// Uploads succeed unless the filename was registered with
/// [`fail_uploads_for`](Self::fail_uploads_for). Uploaded media is available
/// immediately unless [`hold_back_uploads`](Self::hold_back_uploads) is set.
#[derive(Debug, Default)]
pub struct InMemoryMediaService {
    state: Mutex<InMemoryState>,
    upload_delay: Duration,
    probe_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    upload_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl InMemoryMediaService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upload take at least `delay`.
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    /// Make every existence probe take at least `delay`.
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_uploads_for(&self, filename: impl Into<String>) {
        self.state().failing_filenames.insert(filename.into());
    }

    /// Uploaded media stays unavailable until [`mark_available`](Self::mark_available).
    pub fn hold_back_uploads(&self) {
        self.state().hold_back_uploads = true;
    }

    pub fn mark_available(&self, media_id: &MediaId) {
        self.state().available.insert(media_id.clone());
    }

    /// Make probes fail with a transport error.
    pub fn set_probe_failing(&self, failing: bool) {
        self.state().probe_failing = failing;
    }

    /// `(filename, media id)` of every accepted upload, in completion order.
    pub fn uploaded(&self) -> Vec<(String, MediaId)> {
        self.state().uploaded.clone()
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Highest number of uploads observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaService for InMemoryMediaService {
    async fn upload(
        &self,
        filename: &str,
        _content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadedMedia, MediaError> {
        let call = self.upload_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }

        let mut state = self.state();
        if state.failing_filenames.contains(filename) {
            return Err(MediaError::Status {
                status: 500,
                body: format!("cannot store {}", filename),
            });
        }

        let id = MediaId::new(format!("media-{}-{}", call, bytes.len()))
            .map_err(|e| MediaError::InvalidResponse(e.to_string()))?;
        if !state.hold_back_uploads {
            state.available.insert(id.clone());
        }
        state.uploaded.push((filename.to_string(), id.clone()));
        Ok(UploadedMedia { id })
    }

    async fn exists(&self, media_id: &MediaId) -> Result<bool, MediaError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.probe_delay.is_zero() {
            tokio::time::sleep(self.probe_delay).await;
        }

        let state = self.state();
        if state.probe_failing {
            return Err(MediaError::Transport("connection refused".to_string()));
        }
        Ok(state.available.contains(media_id))
    }
}
