//! Shared rate-limit counter store.
//!
//! The only engine state that may be shared across processes. Implementations
//! must perform the prune/count/insert as one atomic read-modify-write against
//! their backing store.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use gantry_types::error::RepositoryError;

/// Result of one `increment_and_check` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request was admitted (and counted).
    pub allowed: bool,
    /// Requests in the current window, including this one when admitted.
    pub current_count: u64,
}

/// Sliding-window request counter keyed by provider.
pub trait RateLimitStore: Send + Sync {
    /// Count a request against `key` if fewer than `limit` requests were
    /// admitted within the trailing `window`.
    fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> impl Future<Output = Result<RateLimitDecision, RepositoryError>> + Send;
}

/// Object-safe version of [`RateLimitStore`] with boxed futures.
///
/// A blanket implementation is provided for all types implementing `RateLimitStore`.
pub trait RateLimitStoreDyn: Send + Sync {
    fn increment_and_check_boxed<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<RateLimitDecision, RepositoryError>> + Send + 'a>>;
}

impl<T: RateLimitStore> RateLimitStoreDyn for T {
    fn increment_and_check_boxed<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<RateLimitDecision, RepositoryError>> + Send + 'a>> {
        Box::pin(self.increment_and_check(key, window, limit))
    }
}

/// Type-erased rate-limit store, selected at runtime (in-memory vs SQLite).
pub struct BoxRateLimitStore {
    inner: Box<dyn RateLimitStoreDyn + Send + Sync>,
}

impl BoxRateLimitStore {
    pub fn new<T: RateLimitStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<RateLimitDecision, RepositoryError> {
        self.inner.increment_and_check_boxed(key, window, limit).await
    }
}

impl std::fmt::Debug for BoxRateLimitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxRateLimitStore").finish_non_exhaustive()
    }
}
