//! Provider-keyed resilience state.
//!
//! One breaker, bulkhead and rate limiter per provider, created on first use
//! from [`EngineConfig`] and shared by every run the registry is injected
//! into. Tests build their own registry for isolation.

use std::sync::Arc;

use dashmap::DashMap;
use gantry_types::config::EngineConfig;

use super::bulkhead::Bulkhead;
use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::fallback::FallbackChain;
use super::rate_limit::AdaptiveRateLimiter;
use super::retry::RetryPolicy;
use crate::repository::rate_limit::BoxRateLimitStore;

#[derive(Debug)]
pub struct ResilienceRegistry {
    config: EngineConfig,
    retry: RetryPolicy,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    bulkheads: DashMap<String, Arc<Bulkhead>>,
    limiters: DashMap<String, Arc<AdaptiveRateLimiter>>,
    store: Option<Arc<BoxRateLimitStore>>,
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ResilienceRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config.retry),
            config,
            breakers: DashMap::new(),
            bulkheads: DashMap::new(),
            limiters: DashMap::new(),
            store: None,
        }
    }

    /// Shared counter store used by limiters when `rate_limit.distributed` is set.
    pub fn with_store(mut self, store: BoxRateLimitStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, &self.config.circuit_breaker)))
            .clone()
    }

    pub fn bulkhead(&self, provider: &str) -> Arc<Bulkhead> {
        self.bulkheads
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(provider, &self.config.bulkhead_for(provider))))
            .clone()
    }

    pub fn limiter(&self, provider: &str) -> Arc<AdaptiveRateLimiter> {
        self.limiters
            .entry(provider.to_string())
            .or_insert_with(|| {
                let config = self.config.rate_limit_for(provider);
                let limiter = AdaptiveRateLimiter::new(provider, &config);
                let limiter = match (&self.store, config.distributed) {
                    (Some(store), true) => limiter.with_store(store.clone()),
                    (None, true) => {
                        tracing::warn!(
                            provider,
                            "distributed rate limiting requested without a shared store, using local window"
                        );
                        limiter
                    }
                    _ => limiter,
                };
                Arc::new(limiter)
            })
            .clone()
    }

    pub fn fallback_chain(&self, provider: &str) -> FallbackChain {
        FallbackChain::new(provider, self.config.fallbacks_for(provider).to_vec())
    }

    /// Breaker state of every provider called so far, sorted by name.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<(String, CircuitState)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
