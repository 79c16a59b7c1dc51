//! Run inputs: the execution request and the reasoning profile derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::message::Message;

/// How much reasoning a task is expected to need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trivial" => Ok(Self::Trivial),
            "moderate" => Ok(Self::Moderate),
            "complex" => Ok(Self::Complex),
            other => Err(format!("unknown complexity level '{other}'")),
        }
    }
}

/// Sampling and budget settings for one run. Immutable once derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningProfile {
    /// The level this profile was derived for
    pub complexity: Complexity,

    /// Sampling temperature passed to the provider
    pub temperature: f32,

    /// Hard cap on loop iterations (always >= 1)
    pub max_iterations: u32,

    /// Whether the `delegate` tool is offered to the model
    pub delegation_allowed: bool,
}

/// The immutable input of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// What the user wants done
    pub task: String,

    /// Prior conversation turns, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memory: Vec<Message>,

    /// Provider name; empty selects the configured default
    #[serde(default)]
    pub provider: String,

    /// Model identifier passed through to the provider
    pub model: String,

    /// Skip classification and use this level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_override: Option<Complexity>,
}

impl ExecutionRequest {
    pub fn new(task: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            memory: Vec::new(),
            provider: String::new(),
            model: model.into(),
            complexity_override: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_memory(mut self, memory: Vec<Message>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity_override = Some(complexity);
        self
    }
}
