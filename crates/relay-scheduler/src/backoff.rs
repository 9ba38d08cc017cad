//! Exponential backoff between same-model retries.

use relay_config::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.backoff_initial(), config.backoff_max())
    }

    /// No sleeping at all; used by tests and latency-sensitive embedders.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the `retry`-th retry (1-based): `initial * 2^(retry-1)`,
    /// raised to the backend's hint when that is larger, capped at `max`.
    pub fn delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let exponential = self.initial.saturating_mul(factor).min(self.max);
        match hint {
            Some(hint) if hint > exponential => hint.min(self.max),
            _ => exponential,
        }
    }
}
