//! Exponential backoff with jitter.

use std::time::Duration;

use gantry_types::config::RetryConfig;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            exponential_base: config.exponential_base.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Un-jittered delay before retry number `retry` (0 = first retry):
    /// `min(max_delay, base_delay * exponential_base ^ retry)`.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let factor = self.exponential_base.powi(retry.min(64) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Jittered delay before retry number `retry`, never above `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_for(retry);
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max_delay)
    }

    /// Delay to wait, preferring a provider-supplied hint when present.
    pub fn delay_with_hint(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay_for(retry),
        }
    }
}
