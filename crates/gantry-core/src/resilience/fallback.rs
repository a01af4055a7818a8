//! Ordered provider failover.
//!
//! Only an open circuit moves a call off the primary provider. Once on an
//! alternate, any failure moves on to the next alternate. When every provider
//! has been tried the last error is returned together with the full list of
//! providers attempted.

use std::future::Future;

use super::dispatcher::DispatchError;

/// Primary provider plus alternates serving the same capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    primary: String,
    alternates: Vec<String>,
}

/// Outcome of one call through the chain.
#[derive(Debug)]
pub struct ChainOutcome<T> {
    pub result: Result<(T, String), DispatchError>,
    /// Providers tried, in order, primary first.
    pub attempted: Vec<String>,
}

impl FallbackChain {
    pub fn new(primary: impl Into<String>, alternates: Vec<String>) -> Self {
        let primary = primary.into();
        let mut seen = vec![primary.clone()];
        let alternates = alternates
            .into_iter()
            .filter(|name| {
                if seen.contains(name) {
                    false
                } else {
                    seen.push(name.clone());
                    true
                }
            })
            .collect();
        Self { primary, alternates }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn alternates(&self) -> &[String] {
        &self.alternates
    }

    /// Run `call` against each provider until one succeeds or the chain is
    /// exhausted.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> ChainOutcome<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let mut attempted = Vec::with_capacity(1 + self.alternates.len());
        let mut last_error = None;

        for (index, provider) in std::iter::once(&self.primary)
            .chain(self.alternates.iter())
            .enumerate()
        {
            attempted.push(provider.clone());
            match call(provider.clone()).await {
                Ok(value) => {
                    if index > 0 {
                        tracing::warn!(
                            primary = %self.primary,
                            provider = %provider,
                            "served by fallback provider"
                        );
                    }
                    return ChainOutcome {
                        result: Ok((value, provider.clone())),
                        attempted,
                    };
                }
                Err(error @ DispatchError::CircuitOpen(_)) => {
                    tracing::debug!(provider = %provider, "circuit open, trying next provider");
                    last_error = Some(error);
                }
                Err(error) if index == 0 => {
                    return ChainOutcome {
                        result: Err(error),
                        attempted,
                    };
                }
                Err(error) => {
                    tracing::warn!(provider = %provider, error = %error, "fallback provider failed");
                    last_error = Some(error);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| DispatchError::UnknownProvider(self.primary.clone()));
        ChainOutcome {
            result: Err(error),
            attempted,
        }
    }
}
