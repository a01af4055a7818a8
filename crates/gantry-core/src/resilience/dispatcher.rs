//! Resilient provider dispatch.
//!
//! Wraps one provider call in, outermost first: bulkhead admission, circuit
//! breaker check, rate-limiter admission, then the invocation under the step
//! timeout. The whole chain is repeated over the provider's fallback list
//! while circuits are open. Retry on transient failure is the caller's loop,
//! so every attempt gets its own checkpoint.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use gantry_types::error::ProviderError;
use gantry_types::workflow::ErrorKind;
use serde_json::Value;
use thiserror::Error;

use super::bulkhead::BulkheadError;
use super::circuit_breaker::CircuitOpenError;
use super::rate_limit::RateLimitError;
use super::registry::ResilienceRegistry;
use crate::provider::{ProviderRegistry, ProviderRequest};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    CapacityExceeded(#[from] BulkheadError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("provider '{provider}' timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("provider '{provider}' failed: {source}")]
    Provider {
        provider: String,
        source: ProviderError,
    },

    #[error("no provider registered for '{0}'")]
    UnknownProvider(String),

    #[error("provider '{provider}' panicked: {message}")]
    Panicked { provider: String, message: String },
}

impl DispatchError {
    /// Position in the run-level error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Self::RateLimited(_) | Self::Timeout { .. } => ErrorKind::TransientProvider,
            Self::Provider { source, .. } if source.is_transient() => ErrorKind::TransientProvider,
            Self::Provider { .. } => ErrorKind::PermanentProvider,
            Self::UnknownProvider(_) | Self::Panicked { .. } => ErrorKind::Execution,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientProvider
    }

    /// Delay hint supplied by the provider or the rate limiter.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider {
                source: ProviderError::Transient { retry_after, .. },
                ..
            } => *retry_after,
            Self::RateLimited(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// A failed dispatch with every provider it reached for.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct DispatchFailure {
    pub error: DispatchError,
    pub providers_attempted: Vec<String>,
}

/// A successful dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub output: Value,
    /// Provider that produced `output`.
    pub provider: String,
    pub providers_attempted: Vec<String>,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResilientDispatcher {
    providers: Arc<ProviderRegistry>,
    resilience: Arc<ResilienceRegistry>,
}

impl ResilientDispatcher {
    pub fn new(providers: Arc<ProviderRegistry>, resilience: Arc<ResilienceRegistry>) -> Self {
        Self {
            providers,
            resilience,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn resilience(&self) -> &ResilienceRegistry {
        &self.resilience
    }

    /// Dispatch one attempt of `request` to the provider named by its action.
    pub async fn dispatch(
        &self,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<Dispatched, DispatchFailure> {
        let started = Instant::now();
        let chain = self.resilience.fallback_chain(&request.action);
        let outcome = chain
            .execute(|provider| self.call_through(provider, request, timeout))
            .await;

        match outcome.result {
            Ok((output, provider)) => Ok(Dispatched {
                output,
                provider,
                providers_attempted: outcome.attempted,
                duration: started.elapsed(),
            }),
            Err(error) => Err(DispatchFailure {
                error,
                providers_attempted: outcome.attempted,
            }),
        }
    }

    async fn call_through(
        &self,
        provider_name: String,
        request: &ProviderRequest,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let provider = self
            .providers
            .get(&provider_name)
            .ok_or_else(|| DispatchError::UnknownProvider(provider_name.clone()))?;

        let _slot = self.resilience.bulkhead(&provider_name).acquire().await?;
        let permit = self.resilience.breaker(&provider_name).try_acquire()?;
        let limiter = self.resilience.limiter(&provider_name);
        limiter.acquire().await?;

        tracing::debug!(
            provider = %provider_name,
            stage = %request.stage,
            probe = permit.is_probe(),
            "invoking provider"
        );

        let call = AssertUnwindSafe(provider.invoke(request)).catch_unwind();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(output))) => {
                permit.success();
                limiter.record_success();
                Ok(output)
            }
            Ok(Ok(Err(source))) => {
                permit.failure();
                if source.is_rate_limited() {
                    limiter.record_throttle();
                } else {
                    limiter.record_failure();
                }
                Err(DispatchError::Provider {
                    provider: provider_name,
                    source,
                })
            }
            Ok(Err(panic)) => {
                permit.failure();
                limiter.record_failure();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(provider = %provider_name, %message, "provider panicked");
                Err(DispatchError::Panicked {
                    provider: provider_name,
                    message,
                })
            }
            Err(_) => {
                permit.failure();
                limiter.record_failure();
                tracing::warn!(
                    provider = %provider_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "provider call timed out"
                );
                Err(DispatchError::Timeout {
                    provider: provider_name,
                    timeout,
                })
            }
        }
    }
}
