//! Per-provider concurrency limiter.
//!
//! At most `max_concurrent` calls run at once; at most `max_waiting` callers
//! queue behind them. A caller finding the queue full is rejected at once, and
//! a queued caller gives up after `acquire_timeout`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gantry_types::config::BulkheadConfig;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BulkheadError {
    #[error("bulkhead '{provider}' is full ({max_concurrent} running, {max_waiting} waiting)")]
    QueueFull {
        provider: String,
        max_concurrent: usize,
        max_waiting: usize,
    },

    #[error("bulkhead '{provider}' acquire timed out after {waited:?}")]
    Timeout { provider: String, waited: Duration },
}

#[derive(Debug)]
pub struct Bulkhead {
    provider: String,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    max_waiting: usize,
    waiting: AtomicUsize,
    acquire_timeout: Duration,
}

/// Holds one concurrency slot until dropped.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

impl Bulkhead {
    pub fn new(provider: impl Into<String>, config: &BulkheadConfig) -> Self {
        Self::with_limits(
            provider,
            config.max_concurrent,
            config.max_waiting,
            config.acquire_timeout(),
        )
    }

    pub fn with_limits(
        provider: impl Into<String>,
        max_concurrent: usize,
        max_waiting: usize,
        acquire_timeout: Duration,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            provider: provider.into(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            max_waiting,
            waiting: AtomicUsize::new(0),
            acquire_timeout,
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Take a concurrency slot, queueing if every slot is busy.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(BulkheadPermit { _permit: permit });
        }

        let max_waiting = self.max_waiting;
        let reserved = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_waiting).then_some(n + 1)
            });
        if reserved.is_err() {
            tracing::warn!(provider = %self.provider, "bulkhead queue full, rejecting call");
            return Err(BulkheadError::QueueFull {
                provider: self.provider.clone(),
                max_concurrent: self.max_concurrent,
                max_waiting: self.max_waiting,
            });
        }
        let _slot = WaitingSlot(&self.waiting);

        match tokio::time::timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(BulkheadPermit { _permit: permit }),
            // The semaphore is never closed; treat closure like a timeout.
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    provider = %self.provider,
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    "bulkhead acquire timed out"
                );
                Err(BulkheadError::Timeout {
                    provider: self.provider.clone(),
                    waited: self.acquire_timeout,
                })
            }
        }
    }
}

struct WaitingSlot<'a>(&'a AtomicUsize);

impl Drop for WaitingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
