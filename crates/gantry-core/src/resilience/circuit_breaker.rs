//! Per-provider circuit breaker.
//!
//! Remembers consecutive failures of one provider and stops calling it once it
//! looks persistently broken. Counters change only when a call completes,
//! under a short non-async lock.
//!
//! ```text
//! CLOSED --(failure_threshold consecutive failures)--> OPEN
//! OPEN   --(recovery_timeout elapsed)----------------> HALF_OPEN
//! HALF_OPEN --(success_threshold probe successes)----> CLOSED
//! HALF_OPEN --(any failure)--------------------------> OPEN
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gantry_types::config::CircuitBreakerConfig;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call was rejected without reaching the provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit for '{provider}' is {state}")]
pub struct CircuitOpenError {
    pub provider: String,
    pub state: CircuitState,
    /// Time left before a probe will be allowed, when known.
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { consecutive_successes: u32, probe_in_flight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::with_settings(
            provider,
            config.failure_threshold,
            config.recovery_timeout(),
            config.success_threshold,
        )
    }

    pub fn with_settings(
        provider: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            provider: provider.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            success_threshold: success_threshold.max(1),
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, moving OPEN to HALF_OPEN if the recovery timeout elapsed.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.advance(&mut state);
        match *state {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn advance(&self, state: &mut BreakerState) {
        if let BreakerState::Open { opened_at } = *state {
            if opened_at.elapsed() >= self.recovery_timeout {
                tracing::info!(provider = %self.provider, "circuit half-open, allowing probe");
                *state = BreakerState::HalfOpen {
                    consecutive_successes: 0,
                    probe_in_flight: false,
                };
            }
        }
    }

    /// Ask to call the provider.
    ///
    /// In HALF_OPEN only one probe may be outstanding; concurrent callers are
    /// rejected until it settles. The returned permit must be settled with
    /// [`CallPermit::success`] or [`CallPermit::failure`]; dropping it
    /// unsettled releases the probe slot without recording an outcome.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitOpenError> {
        let mut state = self.lock();
        self.advance(&mut state);
        match &mut *state {
            BreakerState::Closed { .. } => Ok(CallPermit::new(self.clone(), false)),
            BreakerState::Open { opened_at } => Err(CircuitOpenError {
                provider: self.provider.clone(),
                state: CircuitState::Open,
                retry_in: Some(self.recovery_timeout.saturating_sub(opened_at.elapsed())),
            }),
            BreakerState::HalfOpen {
                probe_in_flight, ..
            } => {
                if *probe_in_flight {
                    Err(CircuitOpenError {
                        provider: self.provider.clone(),
                        state: CircuitState::HalfOpen,
                        retry_in: None,
                    })
                } else {
                    *probe_in_flight = true;
                    Ok(CallPermit::new(self.clone(), true))
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut state = self.lock();
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
            } => *consecutive_failures = 0,
            BreakerState::HalfOpen {
                consecutive_successes,
                probe_in_flight,
            } if probe => {
                *probe_in_flight = false;
                *consecutive_successes += 1;
                if *consecutive_successes >= self.success_threshold {
                    tracing::info!(provider = %self.provider, "circuit closed");
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                }
            }
            // A call admitted before the circuit opened; its late success
            // says nothing about recovery.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut state = self.lock();
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.failure_threshold {
                    tracing::warn!(
                        provider = %self.provider,
                        failures = *consecutive_failures,
                        "circuit opened"
                    );
                    *state = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            BreakerState::HalfOpen { .. } if probe => {
                tracing::warn!(provider = %self.provider, "probe failed, circuit reopened");
                *state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        if let BreakerState::HalfOpen {
            probe_in_flight, ..
        } = &mut *self.lock()
        {
            *probe_in_flight = false;
        }
    }
}

/// Admission ticket for one provider call.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this call is the HALF_OPEN probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("anthropic", &CircuitBreakerConfig::default()))
    }

    fn fail_times(b: &Arc<CircuitBreaker>, n: u32) {
        for _ in 0..n {
            b.try_acquire().unwrap().failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_five_failures_and_rejects_sixth() {
        let b = breaker();
        fail_times(&b, 4);
        assert_eq!(b.state(), CircuitState::Closed);
        fail_times(&b, 1);
        assert_eq!(b.state(), CircuitState::Open);

        let err = b.try_acquire().unwrap_err();
        assert_eq!(err.state, CircuitState::Open);
        assert_eq!(err.provider, "anthropic");
        assert!(err.retry_in.unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker();
        fail_times(&b, 4);
        b.try_acquire().unwrap().success();
        fail_times(&b, 4);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_probe() {
        let b = breaker();
        fail_times(&b, 5);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let probe = b.try_acquire().unwrap();
        assert!(probe.is_probe());
        let second = b.try_acquire().unwrap_err();
        assert_eq!(second.state, CircuitState::HalfOpen);

        probe.success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_probe_successes_close() {
        let b = breaker();
        fail_times(&b, 5);
        tokio::time::advance(Duration::from_secs(60)).await;

        for _ in 0..2 {
            b.try_acquire().unwrap().success();
            assert_eq!(b.state(), CircuitState::HalfOpen);
        }
        b.try_acquire().unwrap().success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let b = breaker();
        fail_times(&b, 5);
        tokio::time::advance(Duration::from_secs(60)).await;

        b.try_acquire().unwrap().success();
        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), CircuitState::Open);

        // The recovery timeout restarts from the probe failure.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let b = breaker();
        fail_times(&b, 5);
        tokio::time::advance(Duration::from_secs(60)).await;

        drop(b.try_acquire().unwrap());
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcomes_from_closed_calls_ignored_while_open() {
        let b = breaker();
        let late = b.try_acquire().unwrap();
        fail_times(&b, 5);
        late.success();
        assert_eq!(b.state(), CircuitState::Open);
    }
}
