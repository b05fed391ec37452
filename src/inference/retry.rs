//! Retry policy for inference calls.
//!
//! Exponential backoff capped at a maximum delay, plus uniform random
//! jitter so that concurrent callers do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::RequestConfig;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to every delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn from_config(config: &RequestConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.retry_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
        .with_jitter(Duration::from_millis(config.retry_jitter_ms))
    }

    /// Whether another attempt is allowed after `retry` retries so far.
    pub fn should_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based) with a fixed jitter
    /// fraction in `[0, 1]`.
    pub fn delay_with_jitter(&self, retry: u32, jitter_fraction: f64) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let backoff = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let backoff = Duration::from_secs_f64(backoff.min(self.max_delay.as_secs_f64()));
        let jitter = self.jitter.mul_f64(jitter_fraction.clamp(0.0, 1.0));
        backoff + jitter
    }

    /// Delay before retry number `retry` (1-based) with random jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let fraction = if self.jitter.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..=1.0)
        };
        self.delay_with_jitter(retry, fraction)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RequestConfig::default())
    }
}
