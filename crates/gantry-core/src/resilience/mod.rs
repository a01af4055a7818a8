//! Resilience primitives composed around every outbound provider call.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod fallback;
pub mod rate_limit;
pub mod registry;
pub mod retry;

pub use bulkhead::{Bulkhead, BulkheadError};
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitOpenError, CircuitState};
pub use dispatcher::{DispatchError, DispatchFailure, Dispatched, ResilientDispatcher};
pub use fallback::FallbackChain;
pub use rate_limit::{AdaptiveRateLimiter, RateLimitError};
pub use registry::ResilienceRegistry;
pub use retry::RetryPolicy;
