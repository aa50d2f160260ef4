//! Runtime configuration for the media workers.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `MEDIA_SERVICE_URL` | `http://localhost:8080` | Base URL of the external media service |
//! | `MEDIA_UPLOAD_TIMEOUT_SECS` | `1600` | Per-request timeout for uploads |
//! | `MEDIA_PROBE_TIMEOUT_SECS` | `10` | Per-request timeout for existence probes |
//! | `STAGING_ROOT` | `<tmp>/memetok_uploads` | Parent directory of per-batch staging dirs |
//! | `PIPELINE_WORKERS` | `2` | Batches processed concurrently |
//! | `UPLOAD_PERMITS` | `3` | Uploads in flight, pipeline-wide |
//! | `JOB_POLL_INTERVAL_MS` | `1000` | Bounded wait of every worker loop |
//! | `JOB_SWEEP_INTERVAL_SECS` | `30` | Period of the durable due-sweep |
//! | `JOB_SWEEP_LIMIT` | `20` | Max jobs per sweep |
//! | `USE_PERSISTENT_STORES` | `false` | Use Postgres instead of in-memory stores |
//! | `DATABASE_URL` | unset | Postgres connection string |
//!
//! Unparseable values fall back to the default with a warning. Intervals are
//! clamped to [`MIN_POLL_INTERVAL`] and [`MIN_SWEEP_INTERVAL`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Floor for every worker loop's bounded wait.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Floor for the durable due-sweep period.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration shared by every service in the process.
#[derive(Debug, Clone)]
pub struct InfraConfig {
    pub media_base_url: String,
    pub media_upload_timeout: Duration,
    pub media_probe_timeout: Duration,
    pub staging_root: PathBuf,
    pub pipeline_workers: usize,
    pub upload_permits: usize,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub sweep_limit: usize,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            media_base_url: "http://localhost:8080".to_string(),
            media_upload_timeout: Duration::from_secs(1600),
            media_probe_timeout: Duration::from_secs(10),
            staging_root: std::env::temp_dir().join("memetok_uploads"),
            pipeline_workers: 2,
            upload_permits: 3,
            poll_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
            sweep_limit: 20,
            use_persistent_stores: false,
            database_url: None,
        }
    }
}

impl InfraConfig {
    /// Load configuration from the environment (see module docs).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            media_base_url: lookup("MEDIA_SERVICE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.media_base_url),
            media_upload_timeout: Duration::from_secs(parse_or(
                &lookup,
                "MEDIA_UPLOAD_TIMEOUT_SECS",
                defaults.media_upload_timeout.as_secs(),
            )),
            media_probe_timeout: Duration::from_secs(parse_or(
                &lookup,
                "MEDIA_PROBE_TIMEOUT_SECS",
                defaults.media_probe_timeout.as_secs(),
            )),
            staging_root: lookup("STAGING_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_root),
            pipeline_workers: parse_or(&lookup, "PIPELINE_WORKERS", defaults.pipeline_workers)
                .max(1),
            upload_permits: parse_or(&lookup, "UPLOAD_PERMITS", defaults.upload_permits).max(1),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "JOB_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            ))
            .max(MIN_POLL_INTERVAL),
            sweep_interval: Duration::from_secs(parse_or(
                &lookup,
                "JOB_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            ))
            .max(MIN_SWEEP_INTERVAL),
            sweep_limit: parse_or(&lookup, "JOB_SWEEP_LIMIT", defaults.sweep_limit).max(1),
            use_persistent_stores: parse_or(
                &lookup,
                "USE_PERSISTENT_STORES",
                defaults.use_persistent_stores,
            ),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
        }
    }

    pub fn with_media_base_url(mut self, url: impl Into<String>) -> Self {
        self.media_base_url = url.into();
        self
    }

    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = root.into();
        self
    }

    pub fn with_pipeline_workers(mut self, workers: usize) -> Self {
        self.pipeline_workers = workers.max(1);
        self
    }

    pub fn with_upload_permits(mut self, permits: usize) -> Self {
        self.upload_permits = permits.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(MIN_SWEEP_INTERVAL);
        self
    }

    pub fn with_sweep_limit(mut self, limit: usize) -> Self {
        self.sweep_limit = limit.max(1);
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self.use_persistent_stores = true;
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = ?default, "invalid config value; using default");
            default
        }),
    }
}
