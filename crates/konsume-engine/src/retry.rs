//! Per-queue retry policy.
//!
//! An outcome is retriable when retry is enabled and the request either
//! produced no response at all or a status at or above the threshold.
//! Retries re-send the already-prepared request; the body is not
//! re-rendered.

use std::time::Duration;

use rand::Rng;

use konsume_config::{RetryConfig, RetryStrategy};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
    pub strategy: RetryStrategy,
    pub threshold_status: u16,
}

impl RetryPolicy {
    /// Build the active policy from a queue's retry block; `None` when
    /// retry is disabled.
    pub fn from_config(config: &RetryConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            max_retries: config.max_retries,
            interval: config.interval.unwrap_or_default(),
            strategy: config.strategy,
            threshold_status: config.threshold_status,
        })
    }

    /// A transport error (no response) or a status at or above the
    /// threshold triggers a retry.
    pub fn is_retriable(&self, status: Option<u16>) -> bool {
        match status {
            None => true,
            Some(status) => status >= self.threshold_status,
        }
    }

    /// Delay before the k-th retry (k = 1..=max_retries).
    ///
    /// `expo` is a linear multiplier (`interval * k`), not exponential;
    /// `random` is uniform in `[0, interval)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Fixed => self.interval,
            RetryStrategy::Expo => self.interval * attempt,
            RetryStrategy::Random => {
                let max = self.interval.as_nanos().max(1) as u64;
                Duration::from_nanos(rand::thread_rng().gen_range(0..max))
            }
        }
    }
}
