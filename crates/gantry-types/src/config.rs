//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes the
//! resilience layer (breaker, bulkhead, retry, rate limiting) globally and per
//! provider. All fields have defaults, so an empty file is a valid config.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub bulkhead: BulkheadConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Per-provider overrides keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderOverrides>,
    /// Directory of role contract files (YAML or JSON).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contracts_dir: Option<PathBuf>,
    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            bulkhead: BulkheadConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            providers: HashMap::new(),
            contracts_dir: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// Bulkhead settings for a provider, with overrides and built-in
    /// per-provider concurrency defaults applied.
    pub fn bulkhead_for(&self, provider: &str) -> BulkheadConfig {
        let mut config = self.bulkhead.clone();
        if let Some(builtin) = builtin_concurrency(provider) {
            config.max_concurrent = builtin;
        }
        if let Some(max) = self.providers.get(provider).and_then(|o| o.max_concurrent) {
            config.max_concurrent = max;
        }
        config
    }

    /// Rate-limit settings for a provider, with overrides applied.
    pub fn rate_limit_for(&self, provider: &str) -> RateLimitConfig {
        let mut config = self.rate_limit.clone();
        if let Some(max) = self.providers.get(provider).and_then(|o| o.max_requests) {
            config.max_requests = max;
        }
        config
    }

    /// Ordered fallback providers configured for a provider.
    pub fn fallbacks_for(&self, provider: &str) -> &[String] {
        self.providers
            .get(provider)
            .map(|o| o.fallbacks.as_slice())
            .unwrap_or(&[])
    }
}

/// Concurrency ceilings for well-known LLM providers.
fn builtin_concurrency(provider: &str) -> Option<usize> {
    match provider {
        "anthropic" | "claude_code" => Some(5),
        "openai" => Some(8),
        _ => None,
    }
}

/// Per-provider overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    /// Alternate providers tried, in order, while this provider's breaker is open.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a probe.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Consecutive probe successes that close a half-open circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    3
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BulkheadConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Callers allowed to queue for a permit; beyond this admission fails fast.
    #[serde(default = "default_max_waiting")]
    pub max_waiting: usize,
    /// Longest a queued caller waits for a permit.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_waiting() -> usize {
    20
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl BulkheadConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_waiting: default_max_waiting(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    /// Fractional jitter window; 0.25 randomizes each delay within +/-25%.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Configured ceiling of requests per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Floor the adaptive ceiling never drops below.
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Consecutive successes before the ceiling is raised again.
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,
    /// Longest a caller waits for a slot before failing as rate limited.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Enforce the ceiling through the shared rate-limit store.
    #[serde(default)]
    pub distributed: bool,
}

fn default_max_requests() -> u32 {
    60
}

fn default_min_requests() -> u32 {
    1
}

fn default_window_secs() -> u64 {
    60
}

fn default_recovery_successes() -> u32 {
    10
}

fn default_max_wait_secs() -> u64 {
    30
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            min_requests: default_min_requests(),
            window_secs: default_window_secs(),
            recovery_successes: default_recovery_successes(),
            max_wait_secs: default_max_wait_secs(),
            distributed: false,
        }
    }
}
