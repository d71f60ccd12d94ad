//! Notify Fanout
//!
//! A distributed notification fan-out engine: producers page recipients out
//! of an external database into jobs on a durable Redis-backed queue;
//! workers claim jobs, check campaign cancellation, and deliver through
//! rate-limited channel adapters (SMTP email, Firebase push, Telegram,
//! Web Push), tracking per-recipient outcomes in a shared stats hash.
//!
//! Producers and workers are independent processes that meet only in the
//! queue and the store, so both sides scale horizontally.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use notify_fanout::{
//!     dispatch, ChannelKind, ChannelRegistry, DispatchConfig, EmailAdapter, EmailConfig,
//!     EmailMeta, Meta, NoopEvents, RecipientSource, SourceError, StoreConfig, WorkerConfig,
//!     WorkerManager,
//! };
//!
//! struct Subscribers;
//!
//! #[async_trait::async_trait]
//! impl RecipientSource for Subscribers {
//!     type Record = String;
//!
//!     async fn query(&self, offset: usize, limit: usize) -> Result<Vec<String>, SourceError> {
//!         // Page rows out of your database here.
//!         Ok(Vec::new())
//!     }
//!
//!     fn recipient(&self, record: &String) -> String {
//!         record.clone()
//!     }
//!
//!     fn build_meta(&self, _record: &String) -> Result<Meta, SourceError> {
//!         Ok(Meta::Email(EmailMeta {
//!             subject: Some("Welcome!".into()),
//!             text: Some("Hello from the fan-out engine.".into()),
//!             ..Default::default()
//!         }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Producer process: page the database into queued jobs.
//!     let config = DispatchConfig::new("notifications", "welcome-email", ChannelKind::Email);
//!     dispatch(StoreConfig::Url("redis://127.0.0.1/".into()), config, Subscribers).await?;
//!
//!     // Worker process: register adapters and consume the queue.
//!     let registry = ChannelRegistry::new();
//!     let email = EmailConfig::new("Notify <no-reply@example.com>", "smtp.example.com");
//!     registry.register(Arc::new(EmailAdapter::new(&email)?));
//!
//!     let worker = WorkerManager::start(
//!         StoreConfig::Url("redis://127.0.0.1/".into()),
//!         WorkerConfig::new("notifications"),
//!         registry,
//!         Arc::new(NoopEvents),
//!     )
//!     .await?;
//!     worker.close().await;
//!     Ok(())
//! }
//! ```

mod batch;
mod channel;
mod error;
mod job;
mod limiter;
mod producer;
mod queue;
mod retry;
mod stats;
mod store;
mod telemetry;
mod types;
mod worker;

pub use batch::send_batch;
pub use channel::{
    AccessTokenProvider, BotApiTransport, ChannelAdapter, ChannelRegistry, EmailAdapter,
    EmailConfig, EmailMessage, EmailReceipt, EmailTransport, FcmHttpTransport, FirebaseApp,
    FirebaseCredentials, PushAdapter, PushConfig, PushMessage, PushTransport, SmtpTransport,
    StaticTokenProvider, Subscription, SubscriptionKeys, TelegramAdapter, TelegramConfig,
    TelegramTransport, VapidConfig, WebPushAdapter, WebPushConfig, WebPushOptions,
    WebPushTransport,
};
pub use error::{
    compose_error_key, error_key, Cancelled, ConfigError, DispatchError, InvalidJobError,
    QueueError, StoreError, TransportError, WorkerError,
};
pub use job::{Job, DEFAULT_TRACKING_KEY};
pub use limiter::{MinTime, TokenBucket};
pub use producer::{
    dispatch, dispatch_on, DispatchConfig, DispatchSummary, RecipientSource, SourceError,
};
pub use queue::{
    BackoffPolicy, FailOutcome, JobCounts, JobOptions, MemoryQueue, QueueBackend, QueuedJob,
    RedisQueue,
};
pub use retry::{apply_jitter, retry, JitterMode, RetryConfig};
pub use stats::StatsTracker;
pub use store::{
    campaign_cancel_key, cancel_campaign, clear_campaign, is_campaign_cancelled, MemoryStore,
    RedisStore, Store, StoreConfig, StoreHandle,
};
pub use telemetry::{init as init_telemetry, redact, LOG_LEVEL_ENV};
pub use types::{
    Attachment, ChannelKind, EmailMeta, Meta, PushMeta, SendResult, SendStatus, TelegramMeta,
    WebPushMeta,
};
pub use worker::{NoopEvents, WorkerConfig, WorkerEvents, WorkerHandle, WorkerManager};
