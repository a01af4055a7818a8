//! BoxStepProvider -- object-safe dynamic dispatch wrapper for StepProvider.
//!
//! 1. `StepProviderDyn` is the object-safe trait with boxed futures
//! 2. Blanket impl of `StepProviderDyn` for every `T: StepProvider`
//! 3. `BoxStepProvider` wraps `Box<dyn StepProviderDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use gantry_types::error::ProviderError;
use serde_json::Value;

use super::{ProviderRequest, StepProvider};

/// Object-safe version of [`StepProvider`] with boxed futures.
pub trait StepProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        request: &'a ProviderRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + 'a>>;
}

impl<T: StepProvider> StepProviderDyn for T {
    fn name(&self) -> &str {
        StepProvider::name(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        request: &'a ProviderRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased step provider, so the registry can hold mixed provider types.
pub struct BoxStepProvider {
    inner: Box<dyn StepProviderDyn + Send + Sync>,
}

impl BoxStepProvider {
    pub fn new<T: StepProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        self.inner.invoke_boxed(request).await
    }
}

impl std::fmt::Debug for BoxStepProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepProvider")
            .field("name", &self.name())
            .finish()
    }
}
