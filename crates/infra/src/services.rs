//! Process-wide service wiring.
//!
//! [`Services`] is built once at startup and owns every long-running component.
//! Nothing starts until [`Services::start`]; [`Services::stop`] shuts down the
//! event bus, then the job worker, then the upload pipeline.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use memetok_core::{PostId, UserId};
use memetok_events::{Event, EventBus, EventBusConfig, event_types};

use crate::audit::{InMemoryUploadErrorStore, PostgresUploadErrorStore, UploadErrorStore};
use crate::config::InfraConfig;
use crate::db;
use crate::jobs::{InMemoryJobStore, JobStore, JobWorker, JobWorkerConfig, PostgresJobStore, VerifyMediaProcessor};
use crate::media::{HttpMediaService, MediaError, MediaService};
use crate::pipeline::{BatchRunner, PipelineConfig, UploadPipeline};
use crate::posts::{InMemoryPostRepository, PostRepository, PostgresPostRepository};
use crate::staging::{BatchError, FsStagingStore, IncomingFile, StagingArea, StagingStore};

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("media service client: {0}")]
    Media(#[from] MediaError),
}

/// External collaborators the services run against.
#[derive(Clone)]
pub struct Collaborators {
    pub job_store: Arc<dyn JobStore>,
    pub posts: Arc<dyn PostRepository>,
    pub audit: Arc<dyn UploadErrorStore>,
    pub media: Arc<dyn MediaService>,
    pub staging: Arc<dyn StagingStore>,
}

impl Collaborators {
    /// In-memory stores and filesystem staging.
    pub fn in_memory(media: Arc<dyn MediaService>) -> Self {
        Self {
            job_store: InMemoryJobStore::arc(),
            posts: Arc::new(InMemoryPostRepository::new()),
            audit: Arc::new(InMemoryUploadErrorStore::new()),
            media,
            staging: Arc::new(FsStagingStore),
        }
    }

    /// Postgres stores and filesystem staging.
    pub fn persistent(pool: PgPool, media: Arc<dyn MediaService>) -> Self {
        Self {
            job_store: Arc::new(PostgresJobStore::new(pool.clone())),
            posts: Arc::new(PostgresPostRepository::new(pool.clone())),
            audit: Arc::new(PostgresUploadErrorStore::new(pool)),
            media,
            staging: Arc::new(FsStagingStore),
        }
    }
}

pub struct Services {
    config: InfraConfig,
    events: Arc<EventBus>,
    jobs: Arc<JobWorker>,
    pipeline: UploadPipeline,
    staging_area: StagingArea,
    posts: Arc<dyn PostRepository>,
    audit: Arc<dyn UploadErrorStore>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("events", &self.events)
            .field("jobs", &self.jobs)
            .field("pipeline", &self.pipeline)
            .field("staging_area", &self.staging_area)
            .finish()
    }
}

impl Services {
    pub fn new(config: InfraConfig, collaborators: Collaborators) -> Self {
        let events = Arc::new(EventBus::new(
            EventBusConfig::default().with_poll_interval(config.poll_interval),
        ));
        register_log_handlers(&events);

        let processor = VerifyMediaProcessor::new(
            collaborators.job_store,
            collaborators.posts.clone(),
            collaborators.media.clone(),
        )
        .with_events(events.clone());
        let jobs = Arc::new(JobWorker::new(
            JobWorkerConfig::default()
                .with_poll_interval(config.poll_interval)
                .with_sweep_interval(config.sweep_interval)
                .with_sweep_limit(config.sweep_limit),
            processor,
        ));

        let runner = BatchRunner::new(
            collaborators.posts.clone(),
            collaborators.audit.clone(),
            collaborators.media,
            collaborators.staging.clone(),
            config.upload_permits,
        )
        .with_events(events.clone());
        let pipeline = UploadPipeline::new(
            PipelineConfig::default()
                .with_workers(config.pipeline_workers)
                .with_poll_interval(config.poll_interval),
            runner,
        );

        let staging_area = StagingArea::new(config.staging_root.clone(), collaborators.staging);

        Self {
            config,
            events,
            jobs,
            pipeline,
            staging_area,
            posts: collaborators.posts,
            audit: collaborators.audit,
        }
    }

    pub fn config(&self) -> &InfraConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn jobs(&self) -> &Arc<JobWorker> {
        &self.jobs
    }

    pub fn pipeline(&self) -> &UploadPipeline {
        &self.pipeline
    }

    pub fn posts(&self) -> &Arc<dyn PostRepository> {
        &self.posts
    }

    pub fn audit(&self) -> &Arc<dyn UploadErrorStore> {
        &self.audit
    }

    /// Start every component. Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.events.start();
        self.jobs.start();
        self.pipeline.start();
        info!(
            staging_root = %self.staging_area.root().display(),
            pipeline_workers = self.config.pipeline_workers,
            upload_permits = self.config.upload_permits,
            "services started"
        );
    }

    pub async fn stop(&self) {
        self.events.stop().await;
        self.jobs.stop().await;
        self.pipeline.stop().await;
        info!("services stopped");
    }

    /// Stage an upload batch and queue it for the pipeline.
    pub async fn submit_upload(
        &self,
        post_id: PostId,
        user_id: UserId,
        files: Vec<IncomingFile>,
    ) -> Result<(), BatchError> {
        let ctx = self.staging_area.stage_batch(post_id, user_id, files).await?;
        self.pipeline.enqueue(ctx);
        Ok(())
    }
}

fn register_log_handlers(bus: &EventBus) {
    bus.register(event_types::POST_PUBLISHED, |event: Event| async move {
        info!(event_id = %event.id, payload = %event.payload, "post published");
        anyhow::Ok(())
    });
    bus.register(event_types::POST_UPLOAD_FAILED, |event: Event| async move {
        warn!(event_id = %event.id, payload = %event.payload, "post upload failed");
        anyhow::Ok(())
    });
}

/// Build services from configuration.
///
/// Postgres stores are used when `USE_PERSISTENT_STORES` is set and a
/// `DATABASE_URL` is configured; otherwise in-memory stores, with a warning.
pub async fn build_services(config: InfraConfig) -> Result<Services, ServicesError> {
    let media: Arc<dyn MediaService> = Arc::new(HttpMediaService::new(
        config.media_base_url.clone(),
        config.media_upload_timeout,
        config.media_probe_timeout,
    )?);

    let collaborators = match (config.use_persistent_stores, config.database_url.as_deref()) {
        (true, Some(url)) => {
            let pool = db::connect(url).await?;
            db::ensure_schema(&pool).await?;
            info!("using postgres stores");
            Collaborators::persistent(pool, media)
        }
        (true, None) => {
            warn!("USE_PERSISTENT_STORES=true but DATABASE_URL is not set, falling back to in-memory");
            Collaborators::in_memory(media)
        }
        (false, _) => {
            warn!("using in-memory stores; jobs and posts do not survive a restart");
            Collaborators::in_memory(media)
        }
    };

    Ok(Services::new(config, collaborators))
}
