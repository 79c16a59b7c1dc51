//! Tool handlers turn tool results into loop decisions.
//!
//! Every tool name resolves to exactly one `ToolHandler`. The handler turns
//! the call's `ToolResult` into a transcript message, zero or more side
//! effects (thinking, artifacts, sources) and a `Continuation`.
//!
//! | Handler     | Tools                  | Registry call | Terminates |
//! |-------------|------------------------|---------------|------------|
//! | `Finish`    | `finish`               | no            | always     |
//! | `Reasoning` | `think` `reflect` `plan` | no          | never      |
//! | `Delegate`  | `delegate`             | no (sub-run)  | never      |
//! | `Slides`    | `generate_slides`      | yes           | on success |
//! | `Default`   | everything else        | yes           | never      |
//!
//! A failed result always takes the default path: the failure is shown to
//! the model and the loop continues.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use stepwise_core::message::Message;
use stepwise_core::provider::ToolDefinition;
use stepwise_core::tool::{FailureKind, ToolCall, ToolResult};
use tracing::debug;

use crate::events::{Artifact, Source};

pub const FINISH_TOOL: &str = "finish";
pub const DELEGATE_TOOL: &str = "delegate";
pub const SLIDES_TOOL: &str = "generate_slides";
pub const THINK_TOOL: &str = "think";
pub const REFLECT_TOOL: &str = "reflect";
pub const PLAN_TOOL: &str = "plan";

/// Which reasoning aid a call used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningKind {
    Think,
    Reflect,
    Plan,
}

impl ReasoningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Think => "think",
            Self::Reflect => "reflect",
            Self::Plan => "plan",
        }
    }

    /// Argument that carries the content.
    fn field(&self) -> &'static str {
        match self {
            Self::Think => "thought",
            Self::Reflect => "reflection",
            Self::Plan => "steps",
        }
    }
}

/// Closed set of result-processing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolHandler {
    Finish,
    Delegate,
    Slides,
    Reasoning(ReasoningKind),
    Default,
}

/// Whether the loop keeps going after a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    Continue,
    Terminate { answer: String },
}

/// Something a handler surfaces to observers besides the transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    Thinking { kind: String, content: String },
    Artifact(Artifact),
    Sources(Vec<Source>),
}

/// Result of processing one call.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub message: Message,
    pub continuation: Continuation,
    pub side_effects: Vec<SideEffect>,
}

impl HandlerOutcome {
    fn proceed(message: Message) -> Self {
        Self {
            message,
            continuation: Continuation::Continue,
            side_effects: Vec::new(),
        }
    }

    fn with_effects(mut self, effects: Vec<SideEffect>) -> Self {
        self.side_effects.extend(effects);
        self
    }
}

/// What a nested run reports back to the delegating handler.
#[derive(Debug, Clone)]
pub struct DelegationOutcome {
    pub answer: String,
    pub iterations: u32,
    /// True when the sub-run hit its iteration budget.
    pub forced: bool,
    pub artifacts: Vec<Artifact>,
}

/// Runs a nested execution on behalf of the `delegate` tool.
#[async_trait]
pub trait Delegator: Send + Sync {
    /// Execute `task` as an independent run. `Err` carries the failure reason.
    async fn delegate(&self, task: &str, context: Option<&str>) -> Result<DelegationOutcome, String>;
}

/// Per-iteration capabilities handed to handlers.
#[derive(Clone, Copy, Default)]
pub struct HandlerContext<'a> {
    pub delegator: Option<&'a dyn Delegator>,
}

impl ToolHandler {
    /// Handlers that terminate the run on success.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish | Self::Slides)
    }

    /// Handlers whose tools are served by the engine, not the registry.
    pub fn is_intrinsic(&self) -> bool {
        matches!(self, Self::Finish | Self::Delegate | Self::Reasoning(_))
    }

    /// Loop-control tools that are not user-facing actions.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Finish | Self::Reasoning(_))
    }

    /// Result for an intrinsic call that passed validation.
    pub fn intrinsic_result(&self, call: &ToolCall) -> ToolResult {
        ToolResult::ok(&call.id, call.arguments.to_string())
    }

    /// Turn a call's result into a transcript entry, side effects and a decision.
    pub async fn process(
        &self,
        call: &ToolCall,
        result: ToolResult,
        ctx: HandlerContext<'_>,
    ) -> HandlerOutcome {
        if !result.success {
            return failure_outcome(call, &result);
        }

        match self {
            Self::Finish => finish(call),
            Self::Reasoning(kind) => reasoning(*kind, call),
            Self::Slides => slides(call, result),
            Self::Delegate => delegate(call, ctx).await,
            Self::Default => passthrough(call, result),
        }
    }
}

fn failure_outcome(call: &ToolCall, result: &ToolResult) -> HandlerOutcome {
    let kind = result.failure.unwrap_or(FailureKind::ToolExecutionFailure);
    let message = Message::tool_result(&call.id, result.transcript_text())
        .with_metadata("tool", json!(call.name))
        .with_metadata("failure", json!(kind.as_str()));
    HandlerOutcome::proceed(message)
}

fn finish(call: &ToolCall) -> HandlerOutcome {
    let answer = match call.arguments.get("answer") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    HandlerOutcome {
        message: Message::tool_result(&call.id, "Final answer recorded.")
            .with_metadata("tool", json!(call.name)),
        continuation: Continuation::Terminate { answer },
        side_effects: Vec::new(),
    }
}

fn reasoning(kind: ReasoningKind, call: &ToolCall) -> HandlerOutcome {
    let content = match call.arguments.get(kind.field()) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => call.arguments.to_string(),
    };

    let ack = match kind {
        ReasoningKind::Think => "Thought recorded. Continue.",
        ReasoningKind::Reflect => "Reflection recorded. Continue.",
        ReasoningKind::Plan => "Plan recorded. Continue with the first step.",
    };

    HandlerOutcome::proceed(
        Message::tool_result(&call.id, ack).with_metadata("tool", json!(call.name)),
    )
    .with_effects(vec![SideEffect::Thinking {
        kind: kind.as_str().to_string(),
        content,
    }])
}

fn slides(call: &ToolCall, result: ToolResult) -> HandlerOutcome {
    let data = result.data.clone().unwrap_or(Value::Null);
    let reference = ["url", "path", "reference"]
        .iter()
        .find_map(|key| data.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| result.output.clone());
    let title = data.get("title").and_then(Value::as_str).map(str::to_string);

    let answer = if result.output.trim().is_empty() {
        format!("Slide deck generated: {reference}")
    } else {
        result.output.clone()
    };

    let artifact = Artifact {
        kind: "slides".into(),
        reference,
        title,
        data: result.data.clone(),
    };

    let mut effects = vec![SideEffect::Artifact(artifact)];
    effects.extend(data_side_effects(result.data.as_ref()));

    HandlerOutcome {
        message: Message::tool_result(&call.id, &result.output)
            .with_metadata("tool", json!(call.name)),
        continuation: Continuation::Terminate { answer },
        side_effects: effects,
    }
}

async fn delegate(call: &ToolCall, ctx: HandlerContext<'_>) -> HandlerOutcome {
    let Some(delegator) = ctx.delegator else {
        let failed = ToolResult::failure(
            &call.id,
            FailureKind::ToolExecutionFailure,
            "delegation is not available in this run",
        );
        return failure_outcome(call, &failed);
    };

    let task = call
        .arguments
        .get("task")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let context = call.arguments.get("context").and_then(Value::as_str);

    match delegator.delegate(task, context).await {
        Ok(outcome) => {
            debug!(call_id = %call.id, iterations = outcome.iterations, "Sub-agent returned");
            let text = if outcome.forced {
                format!(
                    "Sub-agent stopped at its iteration limit after {} iteration(s). Partial answer:\n{}",
                    outcome.iterations, outcome.answer
                )
            } else {
                format!(
                    "Sub-agent finished after {} iteration(s):\n{}",
                    outcome.iterations, outcome.answer
                )
            };
            let effects = outcome
                .artifacts
                .into_iter()
                .map(SideEffect::Artifact)
                .collect();
            HandlerOutcome::proceed(
                Message::tool_result(&call.id, text).with_metadata("tool", json!(call.name)),
            )
            .with_effects(effects)
        }
        Err(reason) => {
            let failed = ToolResult::failure(
                &call.id,
                FailureKind::ToolExecutionFailure,
                format!("sub-agent failed: {reason}"),
            );
            failure_outcome(call, &failed)
        }
    }
}

fn passthrough(call: &ToolCall, result: ToolResult) -> HandlerOutcome {
    let effects = data_side_effects(result.data.as_ref());
    HandlerOutcome::proceed(
        Message::tool_result(&call.id, result.output).with_metadata("tool", json!(call.name)),
    )
    .with_effects(effects)
}

/// Sources and artifacts a tool advertised in its structured data.
fn data_side_effects(data: Option<&Value>) -> Vec<SideEffect> {
    let Some(data) = data else {
        return Vec::new();
    };
    let mut effects = Vec::new();

    if let Some(items) = data.get("sources").and_then(Value::as_array) {
        let sources: Vec<Source> = items.iter().filter_map(parse_source).collect();
        if !sources.is_empty() {
            effects.push(SideEffect::Sources(sources));
        }
    }

    if let Some(items) = data.get("artifacts").and_then(Value::as_array) {
        effects.extend(
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<Artifact>(item.clone()).ok())
                .map(SideEffect::Artifact),
        );
    }

    effects
}

fn parse_source(item: &Value) -> Option<Source> {
    match item {
        Value::String(s) if !s.trim().is_empty() => Some(Source {
            title: s.clone(),
            url: None,
            snippet: None,
        }),
        Value::Object(map) => {
            let text = |keys: &[&str]| {
                keys.iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(str::to_string)
            };
            let url = text(&["url", "uri", "path"]);
            let title = text(&["title", "name", "subject"]).or_else(|| url.clone())?;
            Some(Source {
                title,
                url,
                snippet: text(&["snippet", "excerpt"]),
            })
        }
        _ => None,
    }
}

/// Name → handler table. Unknown names resolve to `Default`.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, ToolHandler>,
}

impl HandlerRegistry {
    /// Empty table: every tool is handled by `Default`.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The built-in mapping for finish, delegate, slides and the reasoning aids.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(FINISH_TOOL, ToolHandler::Finish);
        registry.register(DELEGATE_TOOL, ToolHandler::Delegate);
        registry.register(SLIDES_TOOL, ToolHandler::Slides);
        registry.register(THINK_TOOL, ToolHandler::Reasoning(ReasoningKind::Think));
        registry.register(REFLECT_TOOL, ToolHandler::Reasoning(ReasoningKind::Reflect));
        registry.register(PLAN_TOOL, ToolHandler::Reasoning(ReasoningKind::Plan));
        registry
    }

    /// Map a tool name to a handler, replacing any previous mapping.
    pub fn register(&mut self, tool: impl Into<String>, handler: ToolHandler) {
        self.handlers.insert(tool.into(), handler);
    }

    pub fn resolve(&self, tool: &str) -> ToolHandler {
        self.handlers
            .get(tool)
            .copied()
            .unwrap_or(ToolHandler::Default)
    }

    /// Definitions for the engine-served tools exposed to the model.
    ///
    /// `delegate` is only advertised when delegation is permitted.
    pub fn builtin_definitions(&self, allow_delegation: bool) -> Vec<ToolDefinition> {
        let mut names: Vec<(&String, &ToolHandler)> = self
            .handlers
            .iter()
            .filter(|(_, h)| h.is_intrinsic())
            .filter(|(_, h)| allow_delegation || **h != ToolHandler::Delegate)
            .collect();
        names.sort_by(|a, b| a.0.cmp(b.0));

        names
            .into_iter()
            .map(|(name, handler)| builtin_definition(name, *handler))
            .collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn builtin_definition(name: &str, handler: ToolHandler) -> ToolDefinition {
    let (description, parameters) = match handler {
        ToolHandler::Finish => (
            "Submit the final answer to the user and end the task.",
            json!({
                "type": "object",
                "properties": {
                    "answer": { "type": "string", "description": "The complete final answer" }
                },
                "required": ["answer"]
            }),
        ),
        ToolHandler::Delegate => (
            "Hand a self-contained subtask to a sub-agent and receive its answer.",
            json!({
                "type": "object",
                "properties": {
                    "task": { "type": "string", "description": "The subtask to solve" },
                    "context": { "type": "string", "description": "Facts the sub-agent needs" }
                },
                "required": ["task"]
            }),
        ),
        ToolHandler::Reasoning(ReasoningKind::Think) => (
            "Think through the problem before acting. Not shown as an action.",
            json!({
                "type": "object",
                "properties": { "thought": { "type": "string" } },
                "required": ["thought"]
            }),
        ),
        ToolHandler::Reasoning(ReasoningKind::Reflect) => (
            "Reflect on the results so far and decide whether to change course.",
            json!({
                "type": "object",
                "properties": { "reflection": { "type": "string" } },
                "required": ["reflection"]
            }),
        ),
        ToolHandler::Reasoning(ReasoningKind::Plan) => (
            "Write down the ordered steps you intend to take.",
            json!({
                "type": "object",
                "properties": {
                    "steps": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["steps"]
            }),
        ),
        ToolHandler::Slides | ToolHandler::Default => ("", json!({ "type": "object" })),
    };

    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "call_1_0".into(),
            name: name.into(),
            arguments,
        }
    }

    struct FixedDelegator(Result<DelegationOutcome, String>);

    #[async_trait]
    impl Delegator for FixedDelegator {
        async fn delegate(&self, _task: &str, _context: Option<&str>) -> Result<DelegationOutcome, String> {
            self.0.clone()
        }
    }

    #[test]
    fn only_finish_and_slides_are_terminal() {
        assert!(ToolHandler::Finish.is_terminal());
        assert!(ToolHandler::Slides.is_terminal());
        assert!(!ToolHandler::Delegate.is_terminal());
        assert!(!ToolHandler::Reasoning(ReasoningKind::Plan).is_terminal());
        assert!(!ToolHandler::Default.is_terminal());
    }

    #[tokio::test]
    async fn terminal_handlers_terminate_and_others_continue() {
        let registry = HandlerRegistry::with_builtins();
        for (name, arguments) in [
            ("finish", json!({"answer": "done"})),
            ("think", json!({"thought": "hmm"})),
            ("mail_search", json!({"q": "x"})),
        ] {
            let handler = registry.resolve(name);
            let c = call(name, arguments);
            let result = if handler.is_intrinsic() {
                handler.intrinsic_result(&c)
            } else {
                ToolResult::ok(&c.id, "3 results")
            };
            let outcome = handler.process(&c, result, HandlerContext::default()).await;
            let terminated = matches!(outcome.continuation, Continuation::Terminate { .. });
            assert_eq!(terminated, handler.is_terminal(), "tool {name}");
        }
    }

    #[test]
    fn registry_resolves_builtins_and_defaults() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.resolve("finish"), ToolHandler::Finish);
        assert_eq!(registry.resolve("generate_slides"), ToolHandler::Slides);
        assert_eq!(
            registry.resolve("plan"),
            ToolHandler::Reasoning(ReasoningKind::Plan)
        );
        assert_eq!(registry.resolve("mail_search"), ToolHandler::Default);
        assert_eq!(HandlerRegistry::empty().resolve("finish"), ToolHandler::Default);
    }

    #[test]
    fn builtin_definitions_hide_delegate_unless_allowed() {
        let registry = HandlerRegistry::with_builtins();
        let names: Vec<String> = registry
            .builtin_definitions(false)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["finish", "plan", "reflect", "think"]);

        let with_delegate = registry.builtin_definitions(true);
        assert!(with_delegate.iter().any(|d| d.name == "delegate"));
        // Slides is served by the registry, never advertised here
        assert!(!with_delegate.iter().any(|d| d.name == "generate_slides"));
    }

    #[tokio::test]
    async fn finish_terminates_with_answer() {
        let c = call("finish", json!({"answer": "Dana is in Room 4"}));
        let result = ToolHandler::Finish.intrinsic_result(&c);
        let outcome = ToolHandler::Finish
            .process(&c, result, HandlerContext::default())
            .await;
        assert_eq!(
            outcome.continuation,
            Continuation::Terminate {
                answer: "Dana is in Room 4".into()
            }
        );
        assert_eq!(outcome.message.tool_call_id.as_deref(), Some("call_1_0"));
    }

    #[tokio::test]
    async fn reasoning_emits_thinking_and_continues() {
        let c = call("plan", json!({"steps": ["search mail", "summarize"]}));
        let handler = ToolHandler::Reasoning(ReasoningKind::Plan);
        let outcome = handler
            .process(&c, handler.intrinsic_result(&c), HandlerContext::default())
            .await;
        assert_eq!(outcome.continuation, Continuation::Continue);
        assert_eq!(
            outcome.side_effects,
            vec![SideEffect::Thinking {
                kind: "plan".into(),
                content: "search mail\nsummarize".into()
            }]
        );
    }

    #[tokio::test]
    async fn slides_success_terminates_with_artifact() {
        let c = call("generate_slides", json!({"topic": "Q3"}));
        let result = ToolResult::ok("call_1_0", "Created 8 slides")
            .with_data(json!({"url": "https://decks.local/q3", "title": "Q3 Review"}));
        let outcome = ToolHandler::Slides
            .process(&c, result, HandlerContext::default())
            .await;
        assert_eq!(
            outcome.continuation,
            Continuation::Terminate {
                answer: "Created 8 slides".into()
            }
        );
        match &outcome.side_effects[0] {
            SideEffect::Artifact(a) => {
                assert_eq!(a.kind, "slides");
                assert_eq!(a.reference, "https://decks.local/q3");
                assert_eq!(a.title.as_deref(), Some("Q3 Review"));
            }
            other => panic!("unexpected effect: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slides_failure_continues() {
        let c = call("generate_slides", json!({}));
        let result = ToolResult::failure("call_1_0", FailureKind::ToolExecutionFailure, "renderer down");
        let outcome = ToolHandler::Slides
            .process(&c, result, HandlerContext::default())
            .await;
        assert_eq!(outcome.continuation, Continuation::Continue);
        assert!(outcome.side_effects.is_empty());
        assert!(outcome.message.content.contains("renderer down"));
    }

    #[tokio::test]
    async fn default_passes_output_and_extracts_sources() {
        let c = call("mail_search", json!({"q": "Dana"}));
        let result = ToolResult::ok("call_1_0", "2 messages").with_data(json!({
            "sources": [
                {"title": "Re: offsite", "url": "mail://1"},
                "Calendar: planning",
                42
            ]
        }));
        let outcome = ToolHandler::Default
            .process(&c, result, HandlerContext::default())
            .await;
        assert_eq!(outcome.message.content, "2 messages");
        assert_eq!(outcome.continuation, Continuation::Continue);
        match &outcome.side_effects[0] {
            SideEffect::Sources(s) => {
                assert_eq!(s.len(), 2);
                assert_eq!(s[0].url.as_deref(), Some("mail://1"));
                assert_eq!(s[1].title, "Calendar: planning");
            }
            other => panic!("unexpected effect: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_message_names_kind() {
        let c = call("nope", json!({}));
        let result = ToolResult::failure("call_1_0", FailureKind::UnknownTool, "tool 'nope' is not available");
        let outcome = ToolHandler::Default
            .process(&c, result, HandlerContext::default())
            .await;
        assert!(outcome.message.content.starts_with("Error (unknown_tool)"));
        assert_eq!(outcome.message.metadata["failure"], json!("unknown_tool"));
    }

    #[tokio::test]
    async fn delegate_forwards_answer_and_artifacts() {
        let delegator = FixedDelegator(Ok(DelegationOutcome {
            answer: "Revenue grew 12%".into(),
            iterations: 3,
            forced: false,
            artifacts: vec![Artifact {
                kind: "image".into(),
                reference: "chart.png".into(),
                title: None,
                data: None,
            }],
        }));
        let c = call("delegate", json!({"task": "compute growth"}));
        let ctx = HandlerContext {
            delegator: Some(&delegator),
        };
        let outcome = ToolHandler::Delegate
            .process(&c, ToolHandler::Delegate.intrinsic_result(&c), ctx)
            .await;
        assert_eq!(outcome.continuation, Continuation::Continue);
        assert!(outcome.message.content.contains("Revenue grew 12%"));
        assert!(matches!(&outcome.side_effects[0], SideEffect::Artifact(a) if a.reference == "chart.png"));
    }

    #[tokio::test]
    async fn delegate_failure_becomes_execution_failure() {
        let delegator = FixedDelegator(Err("provider unavailable".into()));
        let c = call("delegate", json!({"task": "x"}));
        let ctx = HandlerContext {
            delegator: Some(&delegator),
        };
        let outcome = ToolHandler::Delegate
            .process(&c, ToolHandler::Delegate.intrinsic_result(&c), ctx)
            .await;
        assert_eq!(outcome.continuation, Continuation::Continue);
        assert!(outcome.message.content.starts_with("Error (tool_execution_failure)"));
    }

    #[tokio::test]
    async fn delegate_without_capability_fails_softly() {
        let c = call("delegate", json!({"task": "x"}));
        let outcome = ToolHandler::Delegate
            .process(&c, ToolHandler::Delegate.intrinsic_result(&c), HandlerContext::default())
            .await;
        assert_eq!(outcome.continuation, Continuation::Continue);
        assert!(outcome.message.content.contains("not available"));
    }
}
