//! Name-keyed provider registry.

use std::collections::HashMap;
use std::sync::Arc;

use super::{BoxStepProvider, StepProvider};

/// Providers available to the executor, keyed by step type.
///
/// Built once at startup and read-only afterwards.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<BoxStepProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the providers that need no external collaborator
    /// (`echo`, `fan_in`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(super::builtin::EchoProvider);
        registry.register(super::builtin::FanInProvider);
        registry
    }

    /// Add a provider, replacing any previous provider with the same name.
    pub fn register<P: StepProvider + 'static>(&mut self, provider: P) {
        let boxed = BoxStepProvider::new(provider);
        let name = boxed.name().to_string();
        if self.providers.insert(name.clone(), Arc::new(boxed)).is_some() {
            tracing::debug!(provider = %name, "replaced provider");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxStepProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["echo", "fan_in"]);
        assert!(registry.get("echo").is_some());
        assert!(!registry.contains("shell"));
    }
}
