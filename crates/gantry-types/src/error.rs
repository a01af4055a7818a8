use std::time::Duration;

use thiserror::Error;

/// Errors returned by persistence ports.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query failed: {0}")]
    Query(String),

    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised at the provider invocation boundary.
///
/// Providers classify their own failures; the engine never interprets
/// provider-specific codes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// Timeouts, throttling, temporary unavailability. Eligible for retry.
    #[error("transient provider error: {message}")]
    Transient {
        message: String,
        /// Provider-suggested wait before the next attempt.
        retry_after: Option<Duration>,
        /// The provider signalled that the caller is over its rate limit.
        rate_limited: bool,
    },

    /// Authorization, permission or malformed-request failures. Never retried.
    #[error("permanent provider error: {message}")]
    Permanent { message: String },
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
            rate_limited: false,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after,
            rate_limited: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Transient { rate_limited: true, .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. } | Self::Permanent { message } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_transient() {
        let err = ProviderError::rate_limited("429", Some(Duration::from_secs(2)));
        assert!(err.is_transient());
        assert!(err.is_rate_limited());
        assert_eq!(err.message(), "429");
    }

    #[test]
    fn permanent_is_not_transient() {
        let err = ProviderError::permanent("401 unauthorized");
        assert!(!err.is_transient());
        assert!(!err.is_rate_limited());
        assert_eq!(err.to_string(), "permanent provider error: 401 unauthorized");
    }
}
