//! Job worker service: an in-memory dispatch queue for freshly enqueued jobs and
//! a periodic sweep over the durable store for everything that is due.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use memetok_core::{MediaId, MediaKind, PostId};
use memetok_events::panic_message;

use crate::config::{MIN_POLL_INTERVAL, MIN_SWEEP_INTERVAL};

use super::processor::{JobError, VerifyMediaProcessor};
use super::store::JobStoreError;
use super::types::{Job, JobId, JobOutcome, SweepReport};

/// Job worker configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Bounded wait of the dispatch loop before re-checking shutdown.
    pub poll_interval: Duration,
    /// Period of the durable due-sweep.
    pub sweep_interval: Duration,
    /// Max jobs fetched per sweep.
    pub sweep_limit: usize,
    /// Name for logging.
    pub name: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
            sweep_limit: 20,
            name: "job-worker".to_string(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
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
}

struct Running {
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

/// Owns the dispatch queue and both worker loops.
pub struct JobWorker {
    config: JobWorkerConfig,
    processor: Arc<VerifyMediaProcessor>,
    sender: mpsc::UnboundedSender<Job>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    queued: Arc<AtomicUsize>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorker")
            .field("name", &self.config.name)
            .field("queued", &self.queued())
            .field("running", &self.is_running())
            .finish()
    }
}

impl JobWorker {
    pub fn new(config: JobWorkerConfig, processor: VerifyMediaProcessor) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            config,
            processor: Arc::new(processor),
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            queued: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(None),
        }
    }

    pub fn processor(&self) -> &VerifyMediaProcessor {
        &self.processor
    }

    /// Jobs waiting in the in-memory dispatch queue.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Persist a verification job, then hand it to the dispatch queue.
    ///
    /// If the store write fails nothing is queued.
    #[instrument(skip(self), fields(worker = %self.config.name), err)]
    pub async fn enqueue_verify_media(
        &self,
        post_id: PostId,
        media_id: MediaId,
        media_kind: MediaKind,
    ) -> Result<JobId, JobStoreError> {
        let job = Job::verify_media(post_id, media_id, media_kind, Utc::now());
        let id = self.processor.store().enqueue(job.clone()).await?;

        if self.sender.send(job).is_ok() {
            let depth = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
            info!(job_id = %id, post_id = %post_id, queued = depth, "verify_media job enqueued");
        }
        Ok(id)
    }

    /// One pass over the durable store: process every due job, up to `limit`.
    #[instrument(skip(self), fields(worker = %self.config.name), err)]
    pub async fn sweep_once(&self, limit: usize) -> Result<SweepReport, JobStoreError> {
        self.sweep(limit, None).await
    }

    /// Like [`sweep_once`](Self::sweep_once), but stops starting jobs once
    /// `shutdown` flips. Jobs not yet started stay in the store.
    async fn sweep(
        &self,
        limit: usize,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<SweepReport, JobStoreError> {
        let now = Utc::now();
        let due = self.processor.store().fetch_due(now, limit).await?;

        let mut report = SweepReport::default();
        for (started, job) in due.iter().enumerate() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                info!(
                    worker = %self.config.name,
                    left = due.len() - started,
                    "shutdown requested; due jobs left for the next sweep"
                );
                break;
            }
            match run_guarded(&self.config, &self.processor, job).await {
                Some(outcome) => report.record(&outcome),
                None => report.record_failure(),
            }
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                posted = report.posted,
                deferred = report.deferred,
                dropped = report.dropped,
                skipped = report.skipped,
                failed = report.failed,
                "due-sweep finished"
            );
        }
        Ok(report)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// Spawn the dispatch and sweep loops. No-op if already running.
    ///
    /// The first sweep runs immediately, so jobs left over from a previous
    /// process are picked up at startup.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            debug!(worker = %self.config.name, "job worker already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatch = tokio::spawn(dispatch_loop(self.clone(), shutdown_rx.clone()));
        let sweep = tokio::spawn(sweep_loop(self.clone(), shutdown_rx));

        info!(
            worker = %self.config.name,
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            sweep_limit = self.config.sweep_limit,
            "job worker started"
        );
        *running = Some(Running {
            shutdown,
            dispatch,
            sweep,
        });
    }

    /// Signal shutdown and wait for both loops. A job being processed finishes
    /// first; jobs still queued in memory, or not yet reached by a running
    /// sweep, stay in the durable store.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running {
            shutdown,
            dispatch,
            sweep,
        }) = running
        else {
            return;
        };

        let _ = shutdown.send(true);
        for (name, join) in [("dispatch", dispatch), ("sweep", sweep)] {
            if let Err(err) = join.await {
                error!(worker = %self.config.name, task = name, error = %err, "job worker task failed");
            }
        }
        info!(worker = %self.config.name, queued = self.queued(), "job worker stopped");
    }
}

/// Process one job, logging instead of propagating errors and panics.
///
/// Returns `None` when processing failed.
async fn run_guarded(
    config: &JobWorkerConfig,
    processor: &VerifyMediaProcessor,
    job: &Job,
) -> Option<JobOutcome> {
    match AssertUnwindSafe(processor.process(job)).catch_unwind().await {
        Ok(Ok(outcome)) => {
            debug!(worker = %config.name, job_id = %job.id, outcome = ?outcome, "job processed");
            Some(outcome)
        }
        Ok(Err(err)) => {
            log_job_error(config, job, &err);
            None
        }
        Err(panic) => {
            error!(
                worker = %config.name,
                job_id = %job.id,
                post_id = %job.post_id,
                panic = %panic_message(panic.as_ref()),
                "job processing panicked"
            );
            None
        }
    }
}

fn log_job_error(config: &JobWorkerConfig, job: &Job, err: &JobError) {
    error!(
        worker = %config.name,
        job_id = %job.id,
        post_id = %job.post_id,
        error = %err,
        "job processing failed; left for the next sweep"
    );
}

async fn dispatch_loop(worker: Arc<JobWorker>, mut shutdown: watch::Receiver<bool>) {
    let config = worker.config.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = tokio::time::timeout(config.poll_interval.max(MIN_POLL_INTERVAL), async {
                worker.receiver.lock().await.recv().await
            }) => next,
        };

        match next {
            Err(_idle) => continue,
            Ok(None) => break,
            Ok(Some(job)) => {
                worker.queued.fetch_sub(1, Ordering::SeqCst);
                run_guarded(&config, &worker.processor, &job).await;
            }
        }
    }
    debug!(worker = %config.name, "dispatch loop stopped");
}

async fn sweep_loop(worker: Arc<JobWorker>, mut shutdown: watch::Receiver<bool>) {
    let config = worker.config.clone();
    let mut ticker = tokio::time::interval(config.sweep_interval.max(MIN_SWEEP_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if let Err(err) = worker.sweep(config.sweep_limit, Some(&shutdown)).await {
            warn!(worker = %config.name, error = %err, "due-sweep failed");
        }
    }
    debug!(worker = %config.name, "sweep loop stopped");
}
