//! The durable job queue handing work from producers to workers.
//!
//! Two retry loops exist by design and stay independent: the producer
//! retries the *enqueue write* (see [`crate::producer`]), while the queue
//! retries *job execution* according to [`JobOptions`].

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::Job;

/// How many delayed/expired entries one claim pass promotes.
const PROMOTE_BATCH: usize = 16;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Job-side retry backoff.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Failed attempts go straight back to the waiting list.
    #[default]
    None,
    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },
    /// `base * 2^(attempts_made - 1)`.
    Exponential { base_ms: u64 },
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many attempts have failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { base_ms } => {
                let factor = 1u64 << attempts_made.saturating_sub(1).min(20);
                Duration::from_millis(base_ms.saturating_mul(factor))
            }
        }
    }
}

/// Per-job queue options, persisted with the job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Delay before the job becomes claimable, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Total execution attempts before the job is parked or discarded.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Drop the job record once it completes.
    #[serde(default = "default_true")]
    pub remove_on_complete: bool,
    /// Drop the job record once attempts are exhausted. Off by default so
    /// failures stay inspectable.
    #[serde(default)]
    pub remove_on_fail: bool,
}

fn default_attempts() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay_ms: None,
            attempts: 1,
            backoff: BackoffPolicy::None,
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }
}

impl JobOptions {
    /// Delay the job's first claim.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Allow up to `attempts` executions with the given backoff.
    pub fn with_attempts(mut self, attempts: u32, backoff: BackoffPolicy) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }
}

/// The persisted envelope around a [`Job`] payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    /// The job name it was enqueued under.
    pub name: String,
    pub payload: Job,
    #[serde(default)]
    pub attempts_made: u32,
    #[serde(default)]
    pub opts: JobOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedJob {
    /// Wrap a payload in a fresh envelope.
    pub fn new(name: impl Into<String>, payload: Job, opts: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            payload,
            attempts_made: 0,
            opts,
            last_error: None,
        }
    }
}

/// Queue population snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub active: u64,
    pub waiting: u64,
    pub delayed: u64,
    pub failed: u64,
}

impl JobCounts {
    /// Jobs that still have work pending (drain detection ignores parked
    /// failures).
    pub fn backlog(&self) -> u64 {
        self.active + self.waiting + self.delayed
    }
}

/// What happened to a failed job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued for another attempt after `delay`.
    Retried { delay: Duration },
    /// Attempts exhausted; the record is parked on the failed list.
    Retained,
    /// Attempts exhausted and `remove_on_fail` dropped the record.
    Discarded,
}

/// The queue contract between producer and workers.
///
/// FIFO per producer within a queue; a claimed job is leased to exactly one
/// worker until its lock expires.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a job and make it claimable (after its delay, if any).
    async fn add(&self, job: QueuedJob) -> Result<(), QueueError>;

    /// Claim the next due job, leasing it for `lock`. Returns `None` when
    /// nothing is due.
    async fn claim(&self, lock: Duration) -> Result<Option<QueuedJob>, QueueError>;

    /// Mark a claimed job as done.
    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Mark a claimed job as failed, applying the job's retry policy.
    async fn fail(&self, job: QueuedJob, error: &str) -> Result<FailOutcome, QueueError>;

    /// Current population counts.
    async fn counts(&self) -> Result<JobCounts, QueueError>;
}

/// Redis-backed queue.
///
/// Layout per queue `q`: `q:waiting` (list), `q:delayed` (zset by ready
/// time), `q:active` (zset by lease expiry), `q:failed` (list),
/// `q:job:<id>` (envelope JSON).
#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
    name: String,
}

impl RedisQueue {
    pub fn new(manager: ConnectionManager, name: impl Into<String>) -> Self {
        Self { manager, name: name.into() }
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn waiting_key(&self) -> String {
        format!("{}:waiting", self.name)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.name)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.name)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.name)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.name, id)
    }

    /// Move due delayed jobs and expired leases back onto the waiting list.
    async fn promote_due(&self, conn: &mut ConnectionManager) -> Result<(), QueueError> {
        let now = now_ms();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key())
            .arg(0)
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await?;
        for id in due {
            // ZREM guards against another worker promoting the same id.
            let removed: i64 =
                redis::cmd("ZREM").arg(self.delayed_key()).arg(&id).query_async(conn).await?;
            if removed == 1 {
                redis::cmd("LPUSH").arg(self.waiting_key()).arg(&id).query_async::<()>(conn).await?;
            }
        }

        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.active_key())
            .arg(0)
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await?;
        for id in expired {
            let removed: i64 =
                redis::cmd("ZREM").arg(self.active_key()).arg(&id).query_async(conn).await?;
            if removed == 1 {
                warn!(queue = %self.name, job_id = %id, "reclaiming job with expired lease");
                redis::cmd("LPUSH").arg(self.waiting_key()).arg(&id).query_async::<()>(conn).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn add(&self, job: QueuedJob) -> Result<(), QueueError> {
        let envelope = serde_json::to_string(&job)?;
        let mut conn = self.manager.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET").arg(self.job_key(&job.id)).arg(&envelope).ignore();
        match job.opts.delay_ms {
            Some(delay) if delay > 0 => {
                pipe.cmd("ZADD").arg(self.delayed_key()).arg(now_ms() + delay).arg(&job.id).ignore();
            }
            _ => {
                pipe.cmd("LPUSH").arg(self.waiting_key()).arg(&job.id).ignore();
            }
        }
        pipe.query_async::<()>(&mut conn).await?;

        debug!(queue = %self.name, job_id = %job.id, job_name = %job.name, "job enqueued");
        Ok(())
    }

    async fn claim(&self, lock: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.manager.clone();
        self.promote_due(&mut conn).await?;

        let id: Option<String> =
            redis::cmd("RPOP").arg(self.waiting_key()).query_async(&mut conn).await?;
        let Some(id) = id else {
            return Ok(None);
        };

        let lease_expiry = now_ms() + lock.as_millis() as u64;
        redis::cmd("ZADD")
            .arg(self.active_key())
            .arg(lease_expiry)
            .arg(&id)
            .query_async::<()>(&mut conn)
            .await?;

        let envelope: Option<String> =
            redis::cmd("GET").arg(self.job_key(&id)).query_async(&mut conn).await?;
        let Some(envelope) = envelope else {
            warn!(queue = %self.name, job_id = %id, "claimed id has no job record, dropping");
            redis::cmd("ZREM").arg(self.active_key()).arg(&id).query_async::<()>(&mut conn).await?;
            return Ok(None);
        };

        match serde_json::from_str::<QueuedJob>(&envelope) {
            Ok(job) => Ok(Some(job)),
            Err(err) => {
                warn!(queue = %self.name, job_id = %id, err = %err, "job record is corrupt, dropping");
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.cmd("ZREM").arg(self.active_key()).arg(&id).ignore();
                pipe.cmd("LPUSH").arg(self.failed_key()).arg(&id).ignore();
                pipe.query_async::<()>(&mut conn).await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZREM").arg(self.active_key()).arg(&job.id).ignore();
        if job.opts.remove_on_complete {
            pipe.cmd("DEL").arg(self.job_key(&job.id)).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn fail(&self, mut job: QueuedJob, error: &str) -> Result<FailOutcome, QueueError> {
        job.attempts_made += 1;
        job.last_error = Some(error.to_string());
        let mut conn = self.manager.clone();

        if job.attempts_made < job.opts.attempts {
            let delay = job.opts.backoff.delay_for(job.attempts_made);
            let envelope = serde_json::to_string(&job)?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("SET").arg(self.job_key(&job.id)).arg(&envelope).ignore();
            pipe.cmd("ZREM").arg(self.active_key()).arg(&job.id).ignore();
            if delay > Duration::ZERO {
                pipe.cmd("ZADD")
                    .arg(self.delayed_key())
                    .arg(now_ms() + delay.as_millis() as u64)
                    .arg(&job.id)
                    .ignore();
            } else {
                pipe.cmd("LPUSH").arg(self.waiting_key()).arg(&job.id).ignore();
            }
            pipe.query_async::<()>(&mut conn).await?;
            return Ok(FailOutcome::Retried { delay });
        }

        if job.opts.remove_on_fail {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("ZREM").arg(self.active_key()).arg(&job.id).ignore();
            pipe.cmd("DEL").arg(self.job_key(&job.id)).ignore();
            pipe.query_async::<()>(&mut conn).await?;
            return Ok(FailOutcome::Discarded);
        }

        let envelope = serde_json::to_string(&job)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET").arg(self.job_key(&job.id)).arg(&envelope).ignore();
        pipe.cmd("ZREM").arg(self.active_key()).arg(&job.id).ignore();
        pipe.cmd("LPUSH").arg(self.failed_key()).arg(&job.id).ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(FailOutcome::Retained)
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("ZCARD").arg(self.active_key());
        pipe.cmd("LLEN").arg(self.waiting_key());
        pipe.cmd("ZCARD").arg(self.delayed_key());
        pipe.cmd("LLEN").arg(self.failed_key());
        let (active, waiting, delayed, failed): (u64, u64, u64, u64) =
            pipe.query_async(&mut conn).await?;
        Ok(JobCounts { active, waiting, delayed, failed })
    }
}

/// In-memory queue for tests and development. Same semantics as
/// [`RedisQueue`], minus durability.
#[derive(Default)]
pub struct MemoryQueue {
    inner: parking_lot::Mutex<MemoryQueueInner>,
}

#[derive(Default)]
struct MemoryQueueInner {
    waiting: VecDeque<String>,
    delayed: Vec<(u64, String)>,
    active: Vec<(u64, String)>,
    failed: Vec<String>,
    jobs: HashMap<String, QueuedJob>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn promote_due(inner: &mut MemoryQueueInner) {
        let now = now_ms();
        let mut i = 0;
        while i < inner.delayed.len() {
            if inner.delayed[i].0 <= now {
                let (_, id) = inner.delayed.remove(i);
                inner.waiting.push_back(id);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < inner.active.len() {
            if inner.active[i].0 <= now {
                let (_, id) = inner.active.remove(i);
                warn!(job_id = %id, "reclaiming job with expired lease");
                inner.waiting.push_back(id);
            } else {
                i += 1;
            }
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn add(&self, job: QueuedJob) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let id = job.id.clone();
        match job.opts.delay_ms {
            Some(delay) if delay > 0 => inner.delayed.push((now_ms() + delay, id.clone())),
            _ => inner.waiting.push_back(id.clone()),
        }
        inner.jobs.insert(id, job);
        Ok(())
    }

    async fn claim(&self, lock: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let mut inner = self.inner.lock();
        Self::promote_due(&mut inner);
        let Some(id) = inner.waiting.pop_front() else {
            return Ok(None);
        };
        inner.active.push((now_ms() + lock.as_millis() as u64, id.clone()));
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        inner.active.retain(|(_, id)| id != &job.id);
        if job.opts.remove_on_complete {
            inner.jobs.remove(&job.id);
        }
        Ok(())
    }

    async fn fail(&self, mut job: QueuedJob, error: &str) -> Result<FailOutcome, QueueError> {
        let mut inner = self.inner.lock();
        inner.active.retain(|(_, id)| id != &job.id);
        job.attempts_made += 1;
        job.last_error = Some(error.to_string());

        if job.attempts_made < job.opts.attempts {
            let delay = job.opts.backoff.delay_for(job.attempts_made);
            let id = job.id.clone();
            if delay > Duration::ZERO {
                inner.delayed.push((now_ms() + delay.as_millis() as u64, id.clone()));
            } else {
                inner.waiting.push_back(id.clone());
            }
            inner.jobs.insert(id, job);
            return Ok(FailOutcome::Retried { delay });
        }

        if job.opts.remove_on_fail {
            inner.jobs.remove(&job.id);
            return Ok(FailOutcome::Discarded);
        }
        inner.failed.push(job.id.clone());
        inner.jobs.insert(job.id.clone(), job);
        Ok(FailOutcome::Retained)
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let inner = self.inner.lock();
        Ok(JobCounts {
            active: inner.active.len() as u64,
            waiting: inner.waiting.len() as u64,
            delayed: inner.delayed.len() as u64,
            failed: inner.failed.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelKind, EmailMeta, Meta};

    fn job(n: usize) -> Job {
        Job {
            user_ids: vec![format!("user{n}@x")],
            channel: ChannelKind::Email,
            meta: vec![Meta::Email(EmailMeta { subject: Some("S".into()), ..Default::default() })],
            track_responses: false,
            tracking_key: "k".into(),
            campaign_id: None,
        }
    }

    #[test]
    fn backoff_policies() {
        assert_eq!(BackoffPolicy::None.delay_for(3), Duration::ZERO);
        assert_eq!(
            BackoffPolicy::Fixed { delay_ms: 100 }.delay_for(5),
            Duration::from_millis(100)
        );
        let exp = BackoffPolicy::Exponential { base_ms: 100 };
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(2), Duration::from_millis(200));
        assert_eq!(exp.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn job_options_defaults() {
        let opts = JobOptions::default();
        assert!(opts.remove_on_complete);
        assert!(!opts.remove_on_fail);
        assert_eq!(opts.attempts, 1);
    }

    #[tokio::test]
    async fn memory_queue_is_fifo() {
        let queue = MemoryQueue::new();
        for n in 0..3 {
            queue.add(QueuedJob::new("send", job(n), JobOptions::default())).await.unwrap();
        }
        for n in 0..3 {
            let claimed = queue.claim(Duration::from_secs(30)).await.unwrap().unwrap();
            assert_eq!(claimed.payload.user_ids[0], format!("user{n}@x"));
        }
        assert!(queue.claim(Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_their_ready_time() {
        let queue = MemoryQueue::new();
        queue
            .add(QueuedJob::new(
                "send",
                job(0),
                JobOptions::default().with_delay(Duration::from_millis(60)),
            ))
            .await
            .unwrap();

        assert!(queue.claim(Duration::from_secs(30)).await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.claim(Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn completion_removes_by_default() {
        let queue = MemoryQueue::new();
        queue.add(QueuedJob::new("send", job(0), JobOptions::default())).await.unwrap();
        let claimed = queue.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        queue.complete(&claimed).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.backlog(), 0);
        assert!(queue.inner.lock().jobs.is_empty());
    }

    #[tokio::test]
    async fn failure_retries_until_attempts_exhausted_then_retains() {
        let queue = MemoryQueue::new();
        let opts = JobOptions::default().with_attempts(3, BackoffPolicy::None);
        queue.add(QueuedJob::new("send", job(0), opts)).await.unwrap();

        let first = queue.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(matches!(
            queue.fail(first, "boom").await.unwrap(),
            FailOutcome::Retried { .. }
        ));

        let second = queue.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(second.attempts_made, 1);
        assert_eq!(second.last_error.as_deref(), Some("boom"));
        assert!(matches!(
            queue.fail(second, "boom again").await.unwrap(),
            FailOutcome::Retried { .. }
        ));

        let third = queue.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(queue.fail(third, "final").await.unwrap(), FailOutcome::Retained);

        // Failures are retained for inspection, not claimable.
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.backlog(), 0);
    }

    #[tokio::test]
    async fn remove_on_fail_discards() {
        let queue = MemoryQueue::new();
        let opts = JobOptions { remove_on_fail: true, ..Default::default() };
        queue.add(QueuedJob::new("send", job(0), opts)).await.unwrap();
        let claimed = queue.claim(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(queue.fail(claimed, "boom").await.unwrap(), FailOutcome::Discarded);
        assert!(queue.inner.lock().jobs.is_empty());
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed() {
        let queue = MemoryQueue::new();
        queue.add(QueuedJob::new("send", job(0), JobOptions::default())).await.unwrap();

        // Claim with an immediately-expiring lease and never finish it.
        queue.claim(Duration::from_millis(0)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reclaimed = queue.claim(Duration::from_secs(30)).await.unwrap();
        assert!(reclaimed.is_some(), "expired lease should be claimable again");
    }

    #[test]
    fn envelope_round_trips() {
        let queued = QueuedJob::new(
            "send",
            job(1),
            JobOptions::default().with_attempts(5, BackoffPolicy::Exponential { base_ms: 250 }),
        );
        let raw = serde_json::to_string(&queued).unwrap();
        let back: QueuedJob = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, queued.id);
        assert_eq!(back.opts, queued.opts);
        assert_eq!(back.payload.user_ids, queued.payload.user_ids);
    }
}
