//! Configuration loading, validation, and management for Stepwise.
//!
//! Loads configuration from `~/.stepwise/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use stepwise_core::request::{Complexity, ReasoningProfile};

/// The root configuration structure.
///
/// Maps directly to `~/.stepwise/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Provider used when a request does not name one
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Execution loop settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Complexity classification table
    #[serde(default)]
    pub complexity: ComplexityConfig,

    /// System prompt text per provider
    #[serde(default)]
    pub prompts: PromptConfig,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock bound on one iteration (model call + all tool calls)
    #[serde(default = "default_iteration_timeout_secs")]
    pub iteration_timeout_secs: u64,

    /// Run registry-backed tool calls of one turn concurrently
    #[serde(default)]
    pub parallel_tool_calls: bool,

    /// Use the provider's streaming API and emit token events
    #[serde(default = "default_true")]
    pub stream_tokens: bool,

    /// How deep `delegate` may nest sub-runs
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: u32,

    /// Per-protocol event channel capacity
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub loop_detection: LoopDetectionConfig,
}

fn default_iteration_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_max_delegation_depth() -> u32 {
    1
}
fn default_event_buffer() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            iteration_timeout_secs: default_iteration_timeout_secs(),
            parallel_tool_calls: false,
            stream_tokens: true,
            max_delegation_depth: default_max_delegation_depth(),
            event_buffer: default_event_buffer(),
            loop_detection: LoopDetectionConfig::default(),
        }
    }
}

/// Repeated-call detection knobs.
///
/// A call is rejected when its (tool, arguments) signature already appears
/// more than `max_repeats` times among the last `window` signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectionConfig {
    #[serde(default = "default_max_repeats")]
    pub max_repeats: usize,

    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_max_repeats() -> usize {
    2
}
fn default_window() -> usize {
    10
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            max_repeats: default_max_repeats(),
            window: default_window(),
        }
    }
}

/// One row of the complexity table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub temperature: f32,
    pub max_iterations: u32,
    #[serde(default)]
    pub delegation: bool,
}

impl ProfileConfig {
    pub fn to_profile(&self, complexity: Complexity) -> ReasoningProfile {
        ReasoningProfile {
            complexity,
            temperature: self.temperature,
            max_iterations: self.max_iterations.max(1),
            delegation_allowed: self.delegation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityConfig {
    /// Tasks with at most this many words may be trivial
    #[serde(default = "default_trivial_max_words")]
    pub trivial_max_words: usize,

    /// Tasks with at least this many words are complex
    #[serde(default = "default_complex_min_words")]
    pub complex_min_words: usize,

    /// Words that push a task towards `complex`
    #[serde(default = "default_complex_keywords")]
    pub complex_keywords: Vec<String>,

    /// Words that mark a short task as `trivial`
    #[serde(default = "default_trivial_keywords")]
    pub trivial_keywords: Vec<String>,

    #[serde(default = "default_trivial_profile")]
    pub trivial: ProfileConfig,

    #[serde(default = "default_moderate_profile")]
    pub moderate: ProfileConfig,

    #[serde(default = "default_complex_profile")]
    pub complex: ProfileConfig,
}

fn default_trivial_max_words() -> usize {
    12
}
fn default_complex_min_words() -> usize {
    60
}
fn default_complex_keywords() -> Vec<String> {
    [
        "analyze", "analyse", "compare", "report", "presentation", "slides", "research",
        "investigate", "summarize", "summarise", "forecast", "breakdown", "strategy",
        "quarterly", "step by step",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_trivial_keywords() -> Vec<String> {
    [
        "hi", "hello", "hey", "thanks", "thank you", "what time", "what day", "who are you",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_trivial_profile() -> ProfileConfig {
    ProfileConfig {
        temperature: 0.2,
        max_iterations: 2,
        delegation: false,
    }
}
fn default_moderate_profile() -> ProfileConfig {
    ProfileConfig {
        temperature: 0.5,
        max_iterations: 8,
        delegation: false,
    }
}
fn default_complex_profile() -> ProfileConfig {
    ProfileConfig {
        temperature: 0.7,
        max_iterations: 15,
        delegation: true,
    }
}

impl ComplexityConfig {
    /// The table row for a level.
    pub fn profile_for(&self, complexity: Complexity) -> ReasoningProfile {
        match complexity {
            Complexity::Trivial => self.trivial.to_profile(complexity),
            Complexity::Moderate => self.moderate.to_profile(complexity),
            Complexity::Complex => self.complex.to_profile(complexity),
        }
    }
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            trivial_max_words: default_trivial_max_words(),
            complex_min_words: default_complex_min_words(),
            complex_keywords: default_complex_keywords(),
            trivial_keywords: default_trivial_keywords(),
            trivial: default_trivial_profile(),
            moderate: default_moderate_profile(),
            complex: default_complex_profile(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Used for providers without an override
    #[serde(default = "default_system_prompt")]
    pub default: String,

    /// Provider name → system prompt
    #[serde(default)]
    pub providers: HashMap<String, String>,
}

fn default_system_prompt() -> String {
    "You are a capable assistant. Use the available tools to gather what you need. \
     Call `finish` with your final answer when you are done."
        .into()
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            default: default_system_prompt(),
            providers: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.stepwise/config.toml).
    ///
    /// Environment overrides:
    /// - `STEPWISE_PROVIDER`
    /// - `STEPWISE_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(provider) = std::env::var("STEPWISE_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("STEPWISE_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".stepwise")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, profile) in [
            ("trivial", &self.complexity.trivial),
            ("moderate", &self.complexity.moderate),
            ("complex", &self.complexity.complex),
        ] {
            if !(0.0..=2.0).contains(&profile.temperature) {
                return Err(ConfigError::ValidationError(format!(
                    "complexity.{name}.temperature must be between 0.0 and 2.0"
                )));
            }
            if profile.max_iterations == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "complexity.{name}.max_iterations must be > 0"
                )));
            }
        }

        if self.engine.loop_detection.window == 0 {
            return Err(ConfigError::ValidationError(
                "engine.loop_detection.window must be > 0".into(),
            ));
        }

        if self.engine.iteration_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "engine.iteration_timeout_secs must be > 0".into(),
            ));
        }

        if self.engine.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "engine.event_buffer must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: default_model(),
            engine: EngineConfig::default(),
            complexity: ComplexityConfig::default(),
            prompts: PromptConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for stepwise_core::Error {
    fn from(err: ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}
