//! Complexity classification: picks a reasoning profile for a request.
//!
//! Classification is a cheap lexical heuristic over the task text: length
//! and keyword hits against the configured table. It never fails; anything
//! it cannot place lands on `moderate`.

use stepwise_config::ComplexityConfig;
use stepwise_core::request::{Complexity, ExecutionRequest, ReasoningProfile};

/// Maps an `ExecutionRequest` to a `ReasoningProfile`.
#[derive(Debug, Clone, Default)]
pub struct ComplexityClassifier {
    table: ComplexityConfig,
}

impl ComplexityClassifier {
    pub fn new(table: ComplexityConfig) -> Self {
        Self { table }
    }

    /// Derive the profile for a run. An explicit override always wins.
    pub fn classify(&self, request: &ExecutionRequest) -> ReasoningProfile {
        let level = request
            .complexity_override
            .unwrap_or_else(|| self.assess(&request.task));
        self.table.profile_for(level)
    }

    /// Profile for an explicit level, bypassing the heuristic.
    pub fn profile_for(&self, level: Complexity) -> ReasoningProfile {
        self.table.profile_for(level)
    }

    /// Estimate the complexity level of a task description.
    pub fn assess(&self, task: &str) -> Complexity {
        let tokens = tokenize(task);
        if tokens.is_empty() {
            return Complexity::Moderate;
        }

        // Padded so multi-word keywords only match on word boundaries.
        let joined = format!(" {} ", tokens.join(" "));
        let hits = |keywords: &[String]| {
            keywords.iter().any(|kw| {
                let kw = kw.trim().to_lowercase();
                !kw.is_empty() && joined.contains(&format!(" {kw} "))
            })
        };

        if tokens.len() >= self.table.complex_min_words || hits(&self.table.complex_keywords) {
            return Complexity::Complex;
        }

        if tokens.len() <= self.table.trivial_max_words
            && (hits(&self.table.trivial_keywords) || tokens.len() <= 2)
        {
            return Complexity::Trivial;
        }

        Complexity::Moderate
    }
}

/// Lowercase words with surrounding punctuation stripped.
fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}
