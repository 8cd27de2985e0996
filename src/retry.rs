//! Exponential backoff for outbound HTTP collaborators.
//!
//! Each client decides which of its errors are transient; this module only
//! owns the delay schedule and the loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Retry schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Up to this fraction of the delay is added as random jitter.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.25,
        }
    }
}

impl RetryConfig {
    /// Schedule with no waiting, for tests against mock servers.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_fraction: 0.0,
        }
    }

    /// Delay after the failed attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        let jitter_max = capped.as_secs_f64() * self.jitter_fraction;
        if jitter_max <= 0.0 {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_max);
        capped + Duration::from_secs_f64(jitter)
    }

    /// Longest the whole schedule can run when each attempt takes up to
    /// `per_attempt`, counting maximum jitter on every wait.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let waits: Duration = (0..attempts - 1)
            .map(|attempt| {
                self.capped_delay(attempt)
                    .mul_f64(1.0 + self.jitter_fraction.max(0.0))
            })
            .sum();
        per_attempt.saturating_mul(attempts) + waits
    }

    fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// `is_transient` decides whether an error is worth another attempt. The last
/// error is returned when attempts are exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt + 1 >= attempts || !is_transient(&err) {
                    return Err(err);
                }
                let delay = config.delay_for(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
