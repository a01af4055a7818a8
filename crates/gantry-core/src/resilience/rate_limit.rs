//! Adaptive per-provider rate limiter.
//!
//! Sliding-window admission against a ceiling that reacts to the provider:
//! every throttle signal halves the ceiling (down to `min_requests`), and
//! every `recovery_successes` consecutive successes double it again (up to
//! `max_requests`). With a shared store attached, the window is counted there
//! so several engine processes share one budget.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gantry_types::config::RateLimitConfig;
use thiserror::Error;
use tokio::time::Instant;

use crate::repository::rate_limit::BoxRateLimitStore;

/// Poll interval while waiting on the shared store.
const STORE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit for '{provider}' exhausted ({ceiling} per window)")]
    Exhausted {
        provider: String,
        ceiling: u32,
        retry_after: Option<Duration>,
    },

    #[error("rate limit store unavailable for '{provider}': {message}")]
    Store { provider: String, message: String },
}

impl RateLimitError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Exhausted { retry_after, .. } => *retry_after,
            Self::Store { .. } => None,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    ceiling: u32,
    consecutive_successes: u32,
    admitted: VecDeque<Instant>,
}

pub struct AdaptiveRateLimiter {
    provider: String,
    max_requests: u32,
    min_requests: u32,
    window: Duration,
    recovery_successes: u32,
    max_wait: Duration,
    state: Mutex<LimiterState>,
    store: Option<Arc<BoxRateLimitStore>>,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("provider", &self.provider)
            .field("ceiling", &self.ceiling())
            .field("max_requests", &self.max_requests)
            .field("distributed", &self.store.is_some())
            .finish()
    }
}

impl AdaptiveRateLimiter {
    pub fn new(provider: impl Into<String>, config: &RateLimitConfig) -> Self {
        let max_requests = config.max_requests.max(1);
        Self {
            provider: provider.into(),
            max_requests,
            min_requests: config.min_requests.clamp(1, max_requests),
            window: config.window(),
            recovery_successes: config.recovery_successes.max(1),
            max_wait: config.max_wait(),
            state: Mutex::new(LimiterState {
                ceiling: max_requests,
                consecutive_successes: 0,
                admitted: VecDeque::new(),
            }),
            store: None,
        }
    }

    /// Count admissions in a shared store instead of process memory.
    pub fn with_store(mut self, store: Arc<BoxRateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current adaptive ceiling.
    pub fn ceiling(&self) -> u32 {
        self.lock().ceiling
    }

    /// Wait for a slot in the window, up to `max_wait`.
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let wait = match &self.store {
                Some(store) => self.try_shared(store).await?,
                None => self.try_local(),
            };
            let Some(wait) = wait else {
                return Ok(());
            };

            let now = Instant::now();
            if now + wait > deadline {
                tracing::debug!(provider = %self.provider, "rate limit wait would exceed max_wait");
                return Err(RateLimitError::Exhausted {
                    provider: self.provider.clone(),
                    ceiling: self.ceiling(),
                    retry_after: Some(wait),
                });
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Admit locally or return how long until the oldest admission expires.
    fn try_local(&self) -> Option<Duration> {
        let mut state = self.lock();
        let now = Instant::now();
        while state
            .admitted
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            state.admitted.pop_front();
        }

        if (state.admitted.len() as u32) < state.ceiling {
            state.admitted.push_back(now);
            return None;
        }
        let oldest = state.admitted.front().copied().unwrap_or(now);
        Some((oldest + self.window).saturating_duration_since(now))
    }

    async fn try_shared(&self, store: &BoxRateLimitStore) -> Result<Option<Duration>, RateLimitError> {
        let ceiling = self.ceiling();
        let decision = store
            .increment_and_check(&self.provider, self.window, ceiling)
            .await
            .map_err(|e| RateLimitError::Store {
                provider: self.provider.clone(),
                message: e.to_string(),
            })?;
        Ok((!decision.allowed).then_some(STORE_POLL_INTERVAL))
    }

    /// The provider signalled throttling: halve the ceiling.
    pub fn record_throttle(&self) {
        let mut state = self.lock();
        let lowered = (state.ceiling / 2).max(self.min_requests);
        state.consecutive_successes = 0;
        if lowered != state.ceiling {
            tracing::warn!(
                provider = %self.provider,
                from = state.ceiling,
                to = lowered,
                "provider throttled, lowering rate ceiling"
            );
            state.ceiling = lowered;
        }
    }

    /// A call succeeded; raise the ceiling after a long enough streak.
    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.ceiling >= self.max_requests {
            state.consecutive_successes = 0;
            return;
        }
        state.consecutive_successes += 1;
        if state.consecutive_successes >= self.recovery_successes {
            let raised = state.ceiling.saturating_mul(2).min(self.max_requests);
            tracing::info!(
                provider = %self.provider,
                from = state.ceiling,
                to = raised,
                "raising rate ceiling"
            );
            state.ceiling = raised;
            state.consecutive_successes = 0;
        }
    }

    /// A call failed for a reason other than throttling.
    pub fn record_failure(&self) {
        self.lock().consecutive_successes = 0;
    }
}
