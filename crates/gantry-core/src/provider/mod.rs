//! Step provider abstraction.
//!
//! A provider executes one kind of step (`type` in the workflow definition).
//! The engine never interprets provider-specific failures: each provider
//! classifies its own errors as transient or permanent via [`ProviderError`].

pub mod box_provider;
pub mod builtin;
pub mod registry;

use std::future::Future;

use gantry_types::error::ProviderError;
use serde_json::{Map, Value};
use uuid::Uuid;

pub use box_provider::BoxStepProvider;
pub use registry::ProviderRegistry;

/// One invocation of a provider for one step attempt.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub run_id: Uuid,
    /// Step id being executed.
    pub stage: String,
    /// Step kind requested by the definition. Unchanged when a fallback
    /// provider serves the call.
    pub action: String,
    /// Parameters with every `${}` placeholder already substituted.
    pub params: Map<String, Value>,
}

impl ProviderRequest {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Trait for step providers.
///
/// Uses native async fn in traits (Rust 2024, no async_trait macro).
/// Calls must be safe to re-issue with the same request: an attempt that
/// dies before its checkpoint is written runs again on resume.
pub trait StepProvider: Send + Sync {
    /// Registry key, matched against a step's `type`.
    fn name(&self) -> &str;

    fn invoke(
        &self,
        request: &ProviderRequest,
    ) -> impl Future<Output = Result<Value, ProviderError>> + Send;
}

/// Tokens a provider reports having consumed, read from `tokens_used`.
pub fn tokens_used(output: &Value) -> u64 {
    output
        .get("tokens_used")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}
