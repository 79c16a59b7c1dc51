//! Provider router — resolves a request's provider name to an LLM capability.

use std::collections::HashMap;
use std::sync::Arc;
use stepwise_core::provider::Provider;

/// Named providers plus a default.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    /// Create a router; `default_provider` is used when a request names none.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Builder-style `register`.
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(name, provider);
        self
    }

    pub fn default_name(&self) -> &str {
        &self.default_provider
    }

    /// Look up a provider. An empty name means the default.
    ///
    /// Returns the resolved name alongside the provider.
    pub fn resolve(&self, name: &str) -> Option<(String, Arc<dyn Provider>)> {
        let name = match name.trim() {
            "" => self.default_provider.as_str(),
            other => other,
        };
        self.providers
            .get(name)
            .map(|p| (name.to_string(), Arc::clone(p)))
    }

    /// All registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
