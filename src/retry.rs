//! Retry and backoff configuration with jitter support.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, trace, warn};

/// Retry/backoff configuration for transient external calls (DB pages,
/// enqueues, store ops).
///
/// **Important**: retries are only safe for idempotent operations. Enqueue
/// is protected against duplicates by the queue's job ids; paginated reads
/// are naturally idempotent.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Jitter mode for backoff delays (prevents thundering herd).
    pub jitter: JitterMode,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: JitterMode::None,
        }
    }
}

impl RetryConfig {
    /// Create a retry config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retry attempts (total attempts = `max_retries + 1`).
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base delay before the first retry.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter mode.
    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry `attempt` (1-based): `base * multiplier^(attempt-1)`,
    /// with jitter applied.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = Duration::from_secs_f64(self.base_delay.as_secs_f64() * factor);
        apply_jitter(base, &self.jitter)
    }
}

/// Jitter mode for retry backoff (following AWS SDK patterns).
#[derive(Clone, Debug, Default)]
pub enum JitterMode {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Full jitter: random delay between 0 and calculated backoff
    Full,
    /// Equal jitter: half fixed + half random
    Equal,
    /// Decorrelated jitter (AWS recommended)
    Decorrelated,
}

/// Apply jitter to a backoff delay.
pub fn apply_jitter(delay: Duration, mode: &JitterMode) -> Duration {
    let mut rng = rand::thread_rng();

    match mode {
        JitterMode::None => delay,
        JitterMode::Full => {
            // Random between 0 and delay
            Duration::from_secs_f64(rng.gen::<f64>() * delay.as_secs_f64())
        }
        JitterMode::Equal => {
            // Half fixed + half random
            let half = delay.as_secs_f64() / 2.0;
            Duration::from_secs_f64(half + rng.gen::<f64>() * half)
        }
        JitterMode::Decorrelated => {
            // AWS-style: min(max_delay, random_between(base, delay * 3))
            let base = delay.as_secs_f64() / 3.0;
            let upper = delay.as_secs_f64() * 3.0;
            Duration::from_secs_f64(base + rng.gen::<f64>() * (upper - base))
        }
    }
}

/// Run `op` up to `max_retries + 1` times, sleeping between attempts.
///
/// Each attempt is logged at trace level; each retry warns with the attempt
/// number and delay; the final failure is logged at error level and
/// returned.
pub async fn retry<T, E, F, Fut>(name: &str, cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        trace!(op = name, attempt, "attempting operation");
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < cfg.max_retries => {
                attempt += 1;
                let delay = cfg.delay_before(attempt);
                warn!(
                    op = name,
                    attempt,
                    max_retries = cfg.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    err = %err,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(op = name, attempts = attempt + 1, err = %err, "operation failed permanently");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_without_jitter() {
        let cfg = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_multiplier(2.0);
        assert_eq!(cfg.delay_before(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_before(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_before(3), Duration::from_millis(400));
    }

    #[test]
    fn full_jitter_stays_below_base() {
        let base = Duration::from_millis(500);
        for _ in 0..32 {
            assert!(apply_jitter(base, &JitterMode::Full) <= base);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig::new().with_max_retries(5).with_base_delay(Duration::from_millis(10));

        let result: Result<u32, String> = retry("flaky", &cfg, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("failure {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig::new().with_max_retries(2).with_base_delay(Duration::from_millis(1));

        let result: Result<(), String> = retry("doomed", &cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
