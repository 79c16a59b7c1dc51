//! Per-run mutable state and the run state machine.
//!
//! ```text
//!            ┌──────────────────────┐
//!            ▼                      │
//!  Running ──tool calls──▶ AwaitingToolResults
//!     │                             │
//!     ├──▶ Finished ◀───────────────┤
//!     ├──▶ ForcedFinish ◀───────────┤
//!     └──▶ Failed ◀─────────────────┘
//! ```
//!
//! Terminal states are final; every attempt to leave one is rejected.

use std::collections::HashSet;
use stepwise_config::LoopDetectionConfig;
use stepwise_core::message::{Message, Transcript};
use stepwise_core::request::ReasoningProfile;
use thiserror::Error;

use crate::error::RunError;
use crate::events::Artifact;
use crate::validators::{LoopDetector, LoopVerdict};

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Running,
    AwaitingToolResults,
    Finished { answer: String },
    ForcedFinish { answer: String },
    Failed(RunError),
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingToolResults => "awaiting_tool_results",
            Self::Finished { .. } => "finished",
            Self::ForcedFinish { .. } => "forced_finish",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::ForcedFinish { .. } | Self::Failed(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("run is already {from}; cannot move to {to}")]
    AlreadyTerminal { from: &'static str, to: &'static str },

    #[error("iteration budget of {max} exhausted")]
    BudgetExhausted { max: u32 },
}

/// Everything one run mutates. Owned by exactly one executing task.
#[derive(Debug)]
pub struct IterationState {
    run_id: String,
    iteration: u32,
    max_iterations: u32,
    transcript: Transcript,
    /// Transcript length before the run appended anything
    run_start: usize,
    loops: LoopDetector,
    seen_call_ids: HashSet<String>,
    state: RunState,
    tool_calls_made: usize,
    artifacts: Vec<Artifact>,
}

impl IterationState {
    pub fn new(
        run_id: impl Into<String>,
        profile: &ReasoningProfile,
        loop_config: &LoopDetectionConfig,
        transcript: Transcript,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            iteration: 0,
            max_iterations: profile.max_iterations.max(1),
            run_start: transcript.len(),
            transcript,
            loops: LoopDetector::new(loop_config),
            seen_call_ids: HashSet::new(),
            state: RunState::Running,
            tool_calls_made: 0,
            artifacts: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// 1-based index of the current iteration; 0 before the first.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Messages this run produced, excluding the prompt, memory and task.
    pub fn run_messages(&self) -> &[Message] {
        self.transcript
            .messages()
            .get(self.run_start..)
            .unwrap_or_default()
    }

    pub fn tool_calls_made(&self) -> usize {
        self.tool_calls_made
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Advance to the next iteration, enforcing the budget.
    pub fn begin_iteration(&mut self) -> Result<u32, StateError> {
        if self.state.is_terminal() {
            return Err(StateError::AlreadyTerminal {
                from: self.state.name(),
                to: "running",
            });
        }
        if self.iteration >= self.max_iterations {
            return Err(StateError::BudgetExhausted {
                max: self.max_iterations,
            });
        }
        self.iteration += 1;
        self.state = RunState::Running;
        Ok(self.iteration)
    }

    /// Move to `next`. Leaving a terminal state is rejected.
    pub fn transition(&mut self, next: RunState) -> Result<(), StateError> {
        if self.state.is_terminal() {
            return Err(StateError::AlreadyTerminal {
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// The id a call will carry: the model's own when usable, otherwise
    /// `call_<iteration>_<index>`. Ids are unique within the run.
    pub fn assign_call_id(&mut self, proposed: &str, index: usize) -> String {
        let proposed = proposed.trim();
        if !proposed.is_empty() && !self.seen_call_ids.contains(proposed) {
            self.seen_call_ids.insert(proposed.to_string());
            return proposed.to_string();
        }

        let base = format!("call_{}_{}", self.iteration, index);
        let mut candidate = base.clone();
        let mut suffix = 1;
        while self.seen_call_ids.contains(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        self.seen_call_ids.insert(candidate.clone());
        candidate
    }

    /// Record a call signature and report whether it is looping.
    pub fn observe_call(&mut self, name: &str, arguments: &serde_json::Value) -> LoopVerdict {
        self.loops.check(name, arguments)
    }

    pub fn push(&mut self, message: Message) {
        self.transcript.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.transcript.extend(messages);
    }

    pub fn count_tool_calls(&mut self, n: usize) {
        self.tool_calls_made += n;
    }

    pub fn record_artifact(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    pub fn take_transcript(&mut self) -> Transcript {
        std::mem::take(&mut self.transcript)
    }

    pub fn take_artifacts(&mut self) -> Vec<Artifact> {
        std::mem::take(&mut self.artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::request::Complexity;

    fn state(max_iterations: u32) -> IterationState {
        let profile = ReasoningProfile {
            complexity: Complexity::Moderate,
            temperature: 0.5,
            max_iterations,
            delegation_allowed: false,
        };
        IterationState::new("run-1", &profile, &LoopDetectionConfig::default(), Transcript::new())
    }

    #[test]
    fn run_messages_exclude_the_starting_transcript() {
        let mut transcript = Transcript::new();
        transcript.push(Message::system("sys"));
        transcript.push(Message::assistant("Room 4, last month."));
        transcript.push(Message::user("Which room?"));
        let profile = ReasoningProfile {
            complexity: Complexity::Moderate,
            temperature: 0.5,
            max_iterations: 3,
            delegation_allowed: false,
        };
        let mut state =
            IterationState::new("run-1", &profile, &LoopDetectionConfig::default(), transcript);
        assert!(state.run_messages().is_empty());

        state.push(Message::tool_result("call_1_0", "no rooms found"));
        assert_eq!(state.run_messages().len(), 1);
        assert_eq!(state.run_messages()[0].content, "no rooms found");
    }

    #[test]
    fn budget_is_enforced() {
        let mut s = state(2);
        assert_eq!(s.begin_iteration(), Ok(1));
        assert_eq!(s.begin_iteration(), Ok(2));
        assert_eq!(s.begin_iteration(), Err(StateError::BudgetExhausted { max: 2 }));
        assert_eq!(s.iteration(), 2);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut s = state(5);
        s.begin_iteration().unwrap();
        s.transition(RunState::AwaitingToolResults).unwrap();
        s.transition(RunState::Finished {
            answer: "done".into(),
        })
        .unwrap();

        let err = s.transition(RunState::Failed(RunError::Cancelled)).unwrap_err();
        assert_eq!(
            err,
            StateError::AlreadyTerminal {
                from: "finished",
                to: "failed"
            }
        );
        assert!(s.begin_iteration().is_err());
        assert!(matches!(s.state(), RunState::Finished { .. }));
    }

    #[test]
    fn call_ids_are_unique_and_deterministic() {
        let mut s = state(5);
        s.begin_iteration().unwrap();
        assert_eq!(s.assign_call_id("abc", 0), "abc");
        // Duplicate of a model id falls back to the positional id
        assert_eq!(s.assign_call_id("abc", 1), "call_1_1");
        assert_eq!(s.assign_call_id("", 2), "call_1_2");
        assert_eq!(s.assign_call_id("call_1_2", 3), "call_1_3");
    }

    #[test]
    fn positional_id_collision_gets_suffix() {
        let mut s = state(5);
        s.begin_iteration().unwrap();
        assert_eq!(s.assign_call_id("call_1_0", 5), "call_1_0");
        assert_eq!(s.assign_call_id("  ", 0), "call_1_0_1");
    }

    #[test]
    fn zero_budget_is_clamped() {
        let mut s = state(0);
        assert_eq!(s.max_iterations(), 1);
        assert_eq!(s.begin_iteration(), Ok(1));
    }
}
