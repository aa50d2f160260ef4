//! Worker pool draining the batch queue.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use memetok_events::panic_message;

use crate::config::MIN_POLL_INTERVAL;

use super::batch::BatchRunner;
use super::context::PipelineContext;

/// Pipeline worker configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Batches processed concurrently.
    pub workers: usize,
    /// Bounded wait before a worker re-checks the shutdown flag.
    pub poll_interval: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(1),
            name: "upload-pipeline".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PipelineContext>>>;

struct Running {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

/// Batch queue plus the workers that run it.
///
/// Batches can be enqueued before `start()`; they wait in the queue. Batches
/// still queued when the pipeline stops are not run and their staging
/// directories are left behind.
pub struct UploadPipeline {
    config: PipelineConfig,
    runner: Arc<BatchRunner>,
    sender: mpsc::UnboundedSender<PipelineContext>,
    receiver: SharedReceiver,
    queued: Arc<AtomicUsize>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for UploadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPipeline")
            .field("name", &self.config.name)
            .field("workers", &self.config.workers)
            .field("queued", &self.queued())
            .finish()
    }
}

impl UploadPipeline {
    pub fn new(config: PipelineConfig, runner: BatchRunner) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            config,
            runner: Arc::new(runner),
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            queued: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(None),
        }
    }

    pub fn runner(&self) -> &BatchRunner {
        &self.runner
    }

    /// Queue a staged batch. Returns immediately.
    pub fn enqueue(&self, ctx: PipelineContext) {
        let post_id = ctx.post_id;
        // The receiver lives as long as `self`, so send only fails after drop.
        if self.sender.send(ctx).is_ok() {
            let depth = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(pipeline = %self.config.name, post_id = %post_id, queued = depth, "batch queued");
        }
    }

    /// Batches waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// Spawn the worker tasks. No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            debug!(pipeline = %self.config.name, "upload pipeline already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let joins = (0..self.config.workers.max(1))
            .map(|worker| {
                tokio::spawn(work(
                    worker,
                    self.config.clone(),
                    self.runner.clone(),
                    self.receiver.clone(),
                    self.queued.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(pipeline = %self.config.name, workers = self.config.workers, "upload pipeline started");
        *running = Some(Running { shutdown, joins });
    }

    /// Signal shutdown and wait for every worker; batches already running finish.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { shutdown, joins }) = running else {
            return;
        };

        let _ = shutdown.send(true);
        for join in joins {
            if let Err(err) = join.await {
                error!(pipeline = %self.config.name, error = %err, "pipeline worker task failed");
            }
        }

        let left = self.queued();
        if left > 0 {
            warn!(pipeline = %self.config.name, queued = left, "upload pipeline stopped with queued batches");
        }
        info!(pipeline = %self.config.name, "upload pipeline stopped");
    }
}

async fn next_batch(receiver: &SharedReceiver, poll_interval: Duration) -> Option<Option<PipelineContext>> {
    tokio::time::timeout(poll_interval, async {
        let mut receiver = receiver.lock().await;
        receiver.recv().await
    })
    .await
    .ok()
}

async fn work(
    worker: usize,
    config: PipelineConfig,
    runner: Arc<BatchRunner>,
    receiver: SharedReceiver,
    queued: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(pipeline = %config.name, worker, "pipeline worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let ctx = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = next_batch(&receiver, config.poll_interval) => match next {
                None => continue,
                Some(None) => break,
                Some(Some(ctx)) => ctx,
            },
        };
        queued.fetch_sub(1, Ordering::SeqCst);

        let post_id = ctx.post_id;
        match AssertUnwindSafe(runner.run_batch(ctx)).catch_unwind().await {
            Ok(Ok(report)) => info!(
                pipeline = %config.name,
                worker,
                post_id = %post_id,
                uploaded = report.uploaded,
                failed = report.failed,
                status = report.status.as_str(),
                "batch finished"
            ),
            Ok(Err(err)) => error!(
                pipeline = %config.name,
                worker,
                post_id = %post_id,
                error = %err,
                "batch failed"
            ),
            Err(panic) => error!(
                pipeline = %config.name,
                worker,
                post_id = %post_id,
                panic = %panic_message(panic.as_ref()),
                "batch panicked"
            ),
        }
    }

    debug!(pipeline = %config.name, worker, "pipeline worker stopped");
}
