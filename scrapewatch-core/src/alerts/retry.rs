use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetrySection;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetrySection::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetrySection) -> Self {
        let initial_backoff = Duration::from_millis(config.initial_backoff_ms);
        let max_backoff = Duration::from_millis(config.max_backoff_ms).max(initial_backoff);
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier: config.multiplier.max(1.0),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Retries without any wait between attempts.
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(RetrySection {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            jitter_ms: 0,
        })
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Wait before attempt `attempt` (zero-based); the first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let scaled = self.initial_backoff.as_secs_f64() * factor;
        Duration::try_from_secs_f64(scaled)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    fn sample_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let bound = self.jitter.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }

    pub async fn run<F, Fut, T, E>(
        &self,
        label: &str,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0usize;
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    });
                }
                Err(error) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(
                            channel = label,
                            attempts = attempt,
                            error = %error,
                            "giving up after exhausting retries"
                        );
                        return Err(error);
                    }
                    let delay = self.delay_for_attempt(attempt) + self.sample_jitter();
                    debug!(
                        channel = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retry scheduled"
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}
