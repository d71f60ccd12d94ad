//! The producer side: page recipients out of the caller's database, group
//! them into jobs, and enqueue with retry.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, DispatchError};
use crate::job::{Job, DEFAULT_TRACKING_KEY};
use crate::limiter::TokenBucket;
use crate::queue::{JobOptions, QueueBackend, QueuedJob, RedisQueue};
use crate::retry::{retry, RetryConfig};
use crate::store::StoreConfig;
use crate::types::{ChannelKind, Meta};

/// Concurrent batch handlers (page -> job -> enqueue) per dispatch call.
const MAX_BATCH_HANDLERS: usize = 3;
/// Recipients per job unless overridden.
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Errors a recipient source may surface. Query failures are retried; meta
/// failures degrade the single slot.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// The caller's database boundary: a finite paginator plus per-record
/// mapping into a recipient and its channel meta.
#[async_trait]
pub trait RecipientSource: Send + Sync {
    type Record: Send;

    /// Fetch up to `limit` records starting at `offset`. An empty page
    /// signals the end.
    async fn query(&self, offset: usize, limit: usize) -> Result<Vec<Self::Record>, SourceError>;

    /// The channel-specific recipient identifier for one record.
    fn recipient(&self, record: &Self::Record) -> String;

    /// The channel meta for one record.
    fn build_meta(&self, record: &Self::Record) -> Result<Meta, SourceError>;
}

/// Settings for one dispatch run.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub queue_name: String,
    pub job_name: String,
    pub channel: ChannelKind,
    pub campaign_id: Option<String>,
    /// Recipients per job.
    pub batch_size: usize,
    /// Paces `query` calls; unlimited when unset.
    pub max_queries_per_second: Option<f64>,
    pub track_responses: bool,
    pub tracking_key: String,
    /// Queue options attached to every job, layered over the queue
    /// defaults (`remove_on_complete: true`, `remove_on_fail: false`).
    pub job_options: JobOptions,
    /// Retry schedule protecting the enqueue write.
    pub enqueue_retry: RetryConfig,
    /// Retry schedule protecting each `query` page.
    pub query_retry: RetryConfig,
    /// Cooperative cancellation; checked between batches, never mid-batch.
    pub cancel: Option<CancellationToken>,
}

impl DispatchConfig {
    /// Settings with the documented defaults.
    pub fn new(
        queue_name: impl Into<String>,
        job_name: impl Into<String>,
        channel: ChannelKind,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_name: job_name.into(),
            channel,
            campaign_id: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_queries_per_second: None,
            track_responses: false,
            tracking_key: DEFAULT_TRACKING_KEY.to_string(),
            job_options: JobOptions::default(),
            enqueue_retry: RetryConfig::new()
                .with_max_retries(3)
                .with_base_delay(std::time::Duration::from_millis(200)),
            query_retry: RetryConfig::new()
                .with_max_retries(4)
                .with_base_delay(std::time::Duration::from_millis(500)),
            cancel: None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.is_empty() {
            return Err(ConfigError::MissingField("queue_name"));
        }
        if self.job_name.is_empty() {
            return Err(ConfigError::MissingField("job_name"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::MissingField("batch_size"));
        }
        Ok(())
    }
}

/// What a finished dispatch run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub batches: usize,
    pub recipients: usize,
}

/// Page the source, group records into jobs, and enqueue them on the named
/// Redis queue.
///
/// The store handle is owned by this call iff `store` is a URL; an owned
/// handle is released on exit, a caller-provided one is left untouched.
pub async fn dispatch<S>(
    store: StoreConfig,
    config: DispatchConfig,
    source: S,
) -> Result<DispatchSummary, DispatchError>
where
    S: RecipientSource,
{
    config.validate()?;
    let handle = store.resolve().await?;
    let queue = Arc::new(RedisQueue::new(handle.manager(), &config.queue_name));
    let result = dispatch_on(queue, config, source).await;
    handle.close();
    result
}

/// [`dispatch`] over an explicit queue backend. The seam integration tests
/// and embedded setups use.
pub async fn dispatch_on<S>(
    queue: Arc<dyn QueueBackend>,
    config: DispatchConfig,
    source: S,
) -> Result<DispatchSummary, DispatchError>
where
    S: RecipientSource,
{
    config.validate()?;

    let limiter = match config.max_queries_per_second {
        Some(rate) => Some(TokenBucket::new(rate)?),
        None => None,
    };

    let mut offset = 0usize;
    let mut summary = DispatchSummary::default();
    let mut handlers: JoinSet<Result<(), DispatchError>> = JoinSet::new();
    let mut failure: Option<DispatchError> = None;

    debug!(
        queue = %config.queue_name,
        job_name = %config.job_name,
        channel = %config.channel,
        batch_size = config.batch_size,
        "dispatch started"
    );

    'paging: loop {
        if config.cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
            failure = Some(DispatchError::Cancelled);
            break;
        }

        if let Some(limiter) = &limiter {
            limiter.acquire().await;
        }

        let records = match retry("db_query", &config.query_retry, || {
            source.query(offset, config.batch_size)
        })
        .await
        {
            Ok(records) => records,
            Err(err) => {
                failure = Some(DispatchError::Source(err.to_string()));
                break;
            }
        };
        if records.is_empty() {
            break;
        }
        let count = records.len();

        let mut user_ids = Vec::with_capacity(count);
        let mut metas = Vec::with_capacity(count);
        for record in &records {
            let recipient = source.recipient(record);
            match source.build_meta(record) {
                Ok(meta) => metas.push(meta),
                Err(err) => {
                    warn!(
                        recipient = %crate::telemetry::redact(&recipient),
                        err = %err,
                        "meta build failed, degrading slot to empty meta"
                    );
                    metas.push(Meta::empty(config.channel));
                }
            }
            user_ids.push(recipient);
        }

        let job = Job {
            user_ids,
            channel: config.channel,
            meta: metas,
            track_responses: config.track_responses,
            tracking_key: config.tracking_key.clone(),
            campaign_id: config.campaign_id.clone(),
        };
        let queued = QueuedJob::new(&config.job_name, job, config.job_options.clone());

        while handlers.len() >= MAX_BATCH_HANDLERS {
            match handlers.join_next().await {
                Some(result) => {
                    if let Some(err) = handler_failure(result) {
                        failure = Some(err);
                        break 'paging;
                    }
                }
                None => break,
            }
        }

        let queue = queue.clone();
        let enqueue_retry = config.enqueue_retry.clone();
        handlers.spawn(async move {
            retry("enqueue", &enqueue_retry, || {
                let queue = queue.clone();
                let job = queued.clone();
                async move { queue.add(job).await }
            })
            .await
            .map_err(DispatchError::Enqueue)
        });

        summary.batches += 1;
        summary.recipients += count;
        offset += count;
    }

    // A failure surfaces only after the outstanding handlers drain.
    while let Some(result) = handlers.join_next().await {
        if let Some(err) = handler_failure(result) {
            failure.get_or_insert(err);
        }
    }

    match failure {
        Some(err) => Err(err),
        None => {
            info!(
                queue = %config.queue_name,
                batches = summary.batches,
                recipients = summary.recipients,
                "dispatch complete"
            );
            Ok(summary)
        }
    }
}

fn handler_failure(
    result: Result<Result<(), DispatchError>, tokio::task::JoinError>,
) -> Option<DispatchError> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(join_err) => Some(DispatchError::Handler(join_err.to_string())),
    }
}
