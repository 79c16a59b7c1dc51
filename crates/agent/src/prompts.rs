//! System prompts, selected by provider.

use std::collections::HashMap;
use stepwise_config::PromptConfig;

/// Provider name → system prompt, with a fallback.
#[derive(Debug, Clone)]
pub struct PromptBook {
    default: String,
    overrides: HashMap<String, String>,
}

impl PromptBook {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            overrides: HashMap::new(),
        }
    }

    pub fn from_config(config: &PromptConfig) -> Self {
        Self {
            default: config.default.clone(),
            overrides: config.providers.clone(),
        }
    }

    pub fn with_override(mut self, provider: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.overrides.insert(provider.into(), prompt.into());
        self
    }

    /// The system prompt for `provider`; blank overrides are ignored.
    pub fn system_prompt(&self, provider: &str) -> &str {
        self.overrides
            .get(provider)
            .map(String::as_str)
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(&self.default)
    }
}

impl Default for PromptBook {
    fn default() -> Self {
        Self::from_config(&PromptConfig::default())
    }
}
