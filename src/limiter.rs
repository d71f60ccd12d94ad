//! Rate limiting primitives: a token bucket for producer pacing and a
//! min-time limiter for outbound channel pacing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Cancelled, ConfigError};

/// Classic token bucket: capacity equals the per-second rate, refill
/// granularity is milliseconds, starts full.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_ms: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket allowing `rate_per_second` acquisitions per second.
    pub fn new(rate_per_second: f64) -> Result<Self, ConfigError> {
        if rate_per_second <= 0.0 || !rate_per_second.is_finite() {
            return Err(ConfigError::InvalidRate(rate_per_second));
        }
        Ok(Self {
            capacity: rate_per_second,
            refill_per_ms: rate_per_second / 1000.0,
            state: Mutex::new(BucketState { tokens: rate_per_second, last_refill: Instant::now() }),
        })
    }

    /// Block until a token is available, then take it.
    ///
    /// Non-busy-wait: when empty, sleeps for half the estimated refill time,
    /// clamped to [10ms, 50ms], then re-checks.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let needed = 1.0 - state.tokens;
                let estimated_ms = needed / self.refill_per_ms;
                (estimated_ms / 2.0).clamp(10.0, 50.0)
            };
            tokio::time::sleep(Duration::from_secs_f64(wait / 1000.0)).await;
        }
    }

    /// Tokens currently available (after refilling).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed_ms = now.saturating_duration_since(state.last_refill).as_secs_f64() * 1000.0;
        // Zero elapsed time is a no-op; the clock is monotonic so it can't
        // go backwards.
        if elapsed_ms <= 0.0 {
            return;
        }
        state.tokens = (state.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        state.last_refill = now;
    }
}

/// Enforces a minimum spacing between task starts and a cap on concurrently
/// running tasks. FIFO: tasks start in submission order.
///
/// Used by channel adapters to pace outbound transport calls.
#[derive(Clone, Debug)]
pub struct MinTime {
    inner: Arc<MinTimeInner>,
}

#[derive(Debug)]
struct MinTimeInner {
    min_gap: Duration,
    slots: Semaphore,
    next_start: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl MinTime {
    /// Allow `max_requests` starts per `period`, with at most
    /// `max_concurrent` tasks running at once.
    pub fn new(max_requests: u32, period: Duration, max_concurrent: usize) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::InvalidRate(0.0));
        }
        if max_concurrent == 0 {
            return Err(ConfigError::MissingField("max_concurrent"));
        }
        let min_gap = period / max_requests;
        Ok(Self {
            inner: Arc::new(MinTimeInner {
                min_gap,
                slots: Semaphore::new(max_concurrent),
                next_start: Mutex::new(Instant::now()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Convenience constructor for a per-second rate.
    pub fn per_second(rate: u32, max_concurrent: usize) -> Result<Self, ConfigError> {
        Self::new(rate, Duration::from_secs(1), max_concurrent)
    }

    /// Run `task` once a concurrency slot and the min-time gate permit.
    ///
    /// Tasks queued behind the gate when [`close`](Self::close) is called
    /// fail with [`Cancelled`]; tasks already started run to completion.
    pub async fn schedule<T, Fut>(&self, task: Fut) -> Result<T, Cancelled>
    where
        Fut: Future<Output = T>,
    {
        // Fair semaphore: waiters are released in submission order.
        let permit = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => return Err(Cancelled),
            permit = self.inner.slots.acquire() => permit.map_err(|_| Cancelled)?,
        };

        // Claim the next start slot before sleeping so spacing holds across
        // concurrent schedulers.
        let start_at = {
            let mut next = self.inner.next_start.lock();
            let now = Instant::now();
            let slot = if *next > now { *next } else { now };
            *next = slot + self.inner.min_gap;
            slot
        };

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => {
                drop(permit);
                return Err(Cancelled);
            }
            _ = tokio::time::sleep_until(start_at) => {}
        }

        // Past the gate: in-flight work is never interrupted.
        let out = task.await;
        drop(permit);
        Ok(out)
    }

    /// Fail all queued-but-unstarted tasks with [`Cancelled`]. In-flight
    /// tasks drain normally.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Minimum spacing between task starts.
    pub fn min_gap(&self) -> Duration {
        self.inner.min_gap
    }
}
