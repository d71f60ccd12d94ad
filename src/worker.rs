//! The worker runtime: claims jobs, checks campaign cancellation, dispatches
//! to the channel adapter, tracks outcomes, and surfaces lifecycle events.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::ChannelRegistry;
use crate::error::WorkerError;
use crate::job::DEFAULT_TRACKING_KEY;
use crate::queue::{QueueBackend, QueuedJob, RedisQueue};
use crate::stats::StatsTracker;
use crate::store::{is_campaign_cancelled, Store, StoreConfig, StoreHandle};
use crate::types::SendResult;

/// Default maximum in-flight jobs per worker.
const DEFAULT_CONCURRENCY: usize = 10;
/// Default job lease duration.
const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
/// Sleep between claim attempts when the queue is empty.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Drain detection: poll the counts this many times, spaced this far apart.
const DEFAULT_DRAIN_POLLS: u32 = 10;
const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Worker lifecycle callbacks.
///
/// Implementations run on the worker's executor and should be short.
/// Panics inside them are caught and logged, never propagated.
#[async_trait]
pub trait WorkerEvents: Send + Sync {
    /// A job was claimed and is about to be processed.
    async fn on_start(&self, _job: &QueuedJob) {}

    /// A job finished successfully. `stats` is the tracking-key snapshot
    /// read after the job's increments were applied.
    async fn on_complete(&self, _job: &QueuedJob, _stats: &HashMap<String, u64>) {}

    /// The queue stayed empty through the drain-detection window.
    async fn on_drained(&self) {}
}

/// The default, do-nothing event sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

#[async_trait]
impl WorkerEvents for NoopEvents {}

/// Worker settings.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub queue_name: String,
    /// Maximum in-flight jobs.
    pub concurrency: usize,
    /// Stats key used when a job payload carries an empty one.
    pub tracking_key: String,
    /// Delete the stats hash after each completion callback.
    pub reset_stats_after_completion: bool,
    /// Job lease duration; crashed workers free their jobs when it lapses.
    pub lock_duration: Duration,
    pub poll_interval: Duration,
    pub drain_polls: u32,
    pub drain_poll_interval: Duration,
}

impl WorkerConfig {
    /// Settings with the documented defaults.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            concurrency: DEFAULT_CONCURRENCY,
            tracking_key: DEFAULT_TRACKING_KEY.to_string(),
            reset_stats_after_completion: false,
            lock_duration: DEFAULT_LOCK_DURATION,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_polls: DEFAULT_DRAIN_POLLS,
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
        }
    }
}

/// Starts and supervises a worker process's claim loop.
pub struct WorkerManager;

impl WorkerManager {
    /// Connect to the store and start consuming `config.queue_name`.
    ///
    /// The store handle is owned by the worker iff `store` is a URL; an
    /// owned handle is released by [`WorkerHandle::close`].
    pub async fn start(
        store: StoreConfig,
        config: WorkerConfig,
        registry: ChannelRegistry,
        events: Arc<dyn WorkerEvents>,
    ) -> Result<WorkerHandle, WorkerError> {
        if config.queue_name.is_empty() {
            return Err(crate::error::ConfigError::MissingField("queue_name").into());
        }
        let handle = store.resolve().await?;
        let queue = Arc::new(RedisQueue::new(handle.manager(), &config.queue_name));
        let store_view: Arc<dyn Store> = Arc::new(handle.store());
        Ok(Self::start_with_backends(queue, store_view, config, registry, events, Some(handle)))
    }

    /// Start over explicit queue/store backends. The seam integration tests
    /// and embedded setups use.
    pub fn start_with_backends(
        queue: Arc<dyn QueueBackend>,
        store: Arc<dyn Store>,
        config: WorkerConfig,
        registry: ChannelRegistry,
        events: Arc<dyn WorkerEvents>,
        store_handle: Option<StoreHandle>,
    ) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let ctx = Arc::new(WorkerCtx {
            tracker: StatsTracker::new(store.clone()),
            queue,
            store,
            registry,
            events,
            config,
            shutdown: shutdown.clone(),
        });
        let task = tokio::spawn(run(ctx));
        WorkerHandle { shutdown, task, store_handle }
    }
}

/// Handle to a running worker. Dropping it does NOT stop the worker; call
/// [`close`](Self::close).
pub struct WorkerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    store_handle: Option<StoreHandle>,
}

impl WorkerHandle {
    /// Stop claiming new jobs, wait for in-flight jobs to finish, and
    /// release worker-owned resources.
    pub async fn close(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            error!(err = %err, "worker task ended abnormally");
        }
        if let Some(handle) = self.store_handle {
            if handle.is_owned() {
                handle.close();
            }
        }
    }
}

struct WorkerCtx {
    queue: Arc<dyn QueueBackend>,
    store: Arc<dyn Store>,
    tracker: StatsTracker,
    registry: ChannelRegistry,
    events: Arc<dyn WorkerEvents>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

async fn run(ctx: Arc<WorkerCtx>) {
    info!(
        queue = %ctx.config.queue_name,
        concurrency = ctx.config.concurrency,
        "worker started"
    );

    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut had_work_since_drain = false;

    loop {
        while let Some(result) = in_flight.try_join_next() {
            if let Err(err) = result {
                error!(err = %err, "job task join error");
            }
        }

        if ctx.shutdown.is_cancelled() {
            break;
        }

        if in_flight.len() >= ctx.config.concurrency {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                result = in_flight.join_next() => {
                    if let Some(Err(err)) = result {
                        error!(err = %err, "job task join error");
                    }
                }
            }
            continue;
        }

        match ctx.queue.claim(ctx.config.lock_duration).await {
            Ok(Some(job)) => {
                had_work_since_drain = true;
                let ctx = ctx.clone();
                in_flight.spawn(async move { process_job(ctx, job).await });
            }
            Ok(None) => {
                if in_flight.is_empty() && had_work_since_drain {
                    had_work_since_drain = false;
                    if wait_for_drained(&ctx).await {
                        let events = ctx.events.clone();
                        if AssertUnwindSafe(events.on_drained()).catch_unwind().await.is_err() {
                            warn!("on_drained callback panicked");
                        }
                    }
                    continue;
                }
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ctx.config.poll_interval) => {}
                }
            }
            Err(err) => {
                error!(err = %err, "claim failed");
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ctx.config.poll_interval) => {}
                }
            }
        }
    }

    // Cooperative shutdown: in-flight jobs run to completion.
    while let Some(result) = in_flight.join_next().await {
        if let Err(err) = result {
            error!(err = %err, "job task join error");
        }
    }
    info!(queue = %ctx.config.queue_name, "worker stopped");
}

/// Poll the queue counts until the backlog is empty, up to the configured
/// window. True means "drained".
async fn wait_for_drained(ctx: &WorkerCtx) -> bool {
    for _ in 0..ctx.config.drain_polls {
        match ctx.queue.counts().await {
            Ok(counts) if counts.backlog() == 0 => return true,
            Ok(counts) => {
                debug!(backlog = counts.backlog(), "queue not yet drained");
            }
            Err(err) => warn!(err = %err, "job counts read failed during drain detection"),
        }
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return false,
            _ = tokio::time::sleep(ctx.config.drain_poll_interval) => {}
        }
    }
    warn!(queue = %ctx.config.queue_name, "queue never drained within the detection window");
    false
}

async fn process_job(ctx: Arc<WorkerCtx>, job: QueuedJob) {
    let span = info_span!(
        "job",
        job_id = %job.id,
        job_name = %job.name,
        campaign_id = job.payload.campaign_id.as_deref().unwrap_or(""),
        channel = %job.payload.channel,
    );

    async {
        if AssertUnwindSafe(ctx.events.on_start(&job)).catch_unwind().await.is_err() {
            warn!("on_start callback panicked");
        }

        // Cancellation check comes before any validation or adapter work.
        if let Some(campaign_id) = &job.payload.campaign_id {
            if is_campaign_cancelled(ctx.store.as_ref(), campaign_id).await {
                info!("campaign cancelled, skipping job");
                complete_job(&ctx, &job).await;
                return;
            }
        }

        if let Err(err) = job.payload.validate() {
            warn!(err = %err, "job failed validation");
            fail_job(&ctx, job, &err.to_string(), false).await;
            return;
        }

        let tracking = job.payload.track_responses;
        let adapter = match ctx.registry.get(job.payload.channel) {
            Ok(adapter) => adapter,
            Err(err) => {
                error!(err = %err, "no adapter for channel");
                fail_job(&ctx, job, &err.to_string(), tracking).await;
                return;
            }
        };

        let send = adapter.send(&job.payload.user_ids, &job.payload.meta);
        let results: Vec<SendResult> = match AssertUnwindSafe(send).catch_unwind().await {
            Ok(results) => results,
            Err(_) => {
                error!("channel adapter panicked");
                fail_job(&ctx, job, "channel adapter panicked", tracking).await;
                return;
            }
        };

        if tracking {
            ctx.tracker.record_results(tracking_key(&ctx, &job), &results).await;
        }

        complete_job(&ctx, &job).await;
    }
    .instrument(span)
    .await
}

fn tracking_key<'a>(ctx: &'a WorkerCtx, job: &'a QueuedJob) -> &'a str {
    if job.payload.tracking_key.is_empty() {
        &ctx.config.tracking_key
    } else {
        &job.payload.tracking_key
    }
}

async fn complete_job(ctx: &WorkerCtx, job: &QueuedJob) {
    if let Err(err) = ctx.queue.complete(job).await {
        error!(err = %err, "marking job complete failed");
        return;
    }
    debug!("job completed");

    let key = tracking_key(ctx, job);
    let stats = ctx.tracker.get_stats(key).await;
    if AssertUnwindSafe(ctx.events.on_complete(job, &stats)).catch_unwind().await.is_err() {
        warn!("on_complete callback panicked");
    }
    if ctx.config.reset_stats_after_completion {
        ctx.tracker.reset_stats(key).await;
    }
}

/// Surface a job failure to the queue's retry policy, recording the error
/// under the tracking key first when tracking is on.
async fn fail_job(ctx: &WorkerCtx, job: QueuedJob, error_message: &str, tracking: bool) {
    if tracking {
        ctx.tracker.record_error(tracking_key(ctx, &job), error_message).await;
    }
    match ctx.queue.fail(job, error_message).await {
        Ok(outcome) => debug!(?outcome, "job failed"),
        Err(err) => error!(err = %err, "marking job failed failed"),
    }
}
