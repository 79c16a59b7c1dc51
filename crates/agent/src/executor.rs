//! The adaptive executor drives one run from request to terminal state.
//!
//! Each iteration:
//!
//! 1. asks the provider for the next step (streaming tokens when enabled),
//! 2. validates every requested tool call (existence, argument repair,
//!    loop detection),
//! 3. executes the valid ones and hands every result to its handler,
//! 4. appends the assistant turn and all tool results to the transcript.
//!
//! The run ends when a handler or a plain-text answer terminates it, when
//! the iteration budget is spent (`forced_finish`), or on a provider error,
//! cancellation or iteration timeout (`failed`).

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stepwise_config::{AppConfig, EngineConfig};
use stepwise_core::message::{Message, MessageToolCall, Role, Transcript};
use stepwise_core::provider::{Provider, ProviderRequest, ToolCallDelta};
use stepwise_core::request::{ExecutionRequest, ReasoningProfile};
use stepwise_core::tool::{FailureKind, ToolCall, ToolRegistry, ToolResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::ComplexityClassifier;
use crate::error::{RunError, RunFailure};
use crate::events::{
    Artifact, EventHub, EventSubscription, ExecutionEvent, RunStatus, SemanticEvent, StreamEvent,
};
use crate::handlers::{
    Continuation, DelegationOutcome, Delegator, HandlerContext, HandlerRegistry, SideEffect,
    ToolHandler,
};
use crate::prompts::PromptBook;
use crate::router::ProviderRouter;
use crate::state::{IterationState, RunState};
use crate::validators::{LoopVerdict, ToolCatalog, check_exists, repair_arguments};

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Finished,
    ForcedFinish,
}

/// Everything a completed run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub answer: String,
    pub provider: String,
    pub model: String,
    pub profile: ReasoningProfile,
    pub iterations: u32,
    pub tool_calls: usize,
    pub artifacts: Vec<Artifact>,
    pub transcript: Transcript,
    pub events: Vec<ExecutionEvent>,
}

/// A background run with its event subscriptions.
pub struct RunHandle {
    run_stream: Option<EventSubscription<StreamEvent>>,
    semantic_stream: Option<EventSubscription<SemanticEvent>>,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunReport, RunFailure>>,
}

impl RunHandle {
    /// The stream-protocol subscription. Available once.
    pub fn stream_events(&mut self) -> Option<EventSubscription<StreamEvent>> {
        self.run_stream.take()
    }

    /// The semantic-protocol subscription. Available once.
    pub fn semantic_events(&mut self) -> Option<EventSubscription<SemanticEvent>> {
        self.semantic_stream.take()
    }

    /// Request cancellation; the run ends `failed` with `cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run. `Err` only if the task panicked or was aborted.
    pub async fn join(self) -> Result<Result<RunReport, RunFailure>, tokio::task::JoinError> {
        self.task.await
    }
}

/// Resolved, immutable facts about one run.
struct RunScope {
    provider_name: String,
    provider: Arc<dyn Provider>,
    model: String,
    profile: ReasoningProfile,
    catalog: ToolCatalog,
    allow_delegation: bool,
    cancel: CancellationToken,
    depth: u32,
}

enum Step {
    Continue,
    Answer(String),
}

/// A tool call after validation.
struct PreparedCall {
    call: ToolCall,
    handler: ToolHandler,
    rejection: Option<ToolResult>,
}

impl PreparedCall {
    fn rejected(call: ToolCall, handler: ToolHandler, kind: FailureKind, detail: String) -> Self {
        let rejection = ToolResult::failure(&call.id, kind, detail);
        Self {
            call,
            handler,
            rejection: Some(rejection),
        }
    }

    fn tool_start(&self) -> ExecutionEvent {
        ExecutionEvent::ToolStart {
            call_id: self.call.id.clone(),
            name: self.call.name.clone(),
            arguments: self.call.arguments.clone(),
            control: self.handler.is_control(),
        }
    }
}

/// Runs requests against a shared provider router and tool registry.
pub struct AdaptiveExecutor {
    providers: Arc<ProviderRouter>,
    tools: Arc<ToolRegistry>,
    handlers: HandlerRegistry,
    classifier: ComplexityClassifier,
    prompts: PromptBook,
    settings: EngineConfig,
    iteration_timeout: Duration,
}

impl AdaptiveExecutor {
    /// Create an executor with default engine settings and built-in handlers.
    pub fn new(providers: Arc<ProviderRouter>, tools: Arc<ToolRegistry>) -> Self {
        let settings = EngineConfig::default();
        Self {
            providers,
            tools,
            handlers: HandlerRegistry::with_builtins(),
            classifier: ComplexityClassifier::default(),
            prompts: PromptBook::default(),
            iteration_timeout: Duration::from_secs(settings.iteration_timeout_secs),
            settings,
        }
    }

    /// Create an executor from application configuration.
    pub fn from_config(
        config: &AppConfig,
        providers: Arc<ProviderRouter>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self::new(providers, tools)
            .with_settings(config.engine.clone())
            .with_classifier(ComplexityClassifier::new(config.complexity.clone()))
            .with_prompts(PromptBook::from_config(&config.prompts))
    }

    pub fn with_settings(mut self, settings: EngineConfig) -> Self {
        self.iteration_timeout = Duration::from_secs(settings.iteration_timeout_secs.max(1));
        self.settings = settings;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_classifier(mut self, classifier: ComplexityClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBook) -> Self {
        self.prompts = prompts;
        self
    }

    /// Override the per-iteration wall-clock limit.
    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = timeout;
        self
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    pub fn classifier(&self) -> &ComplexityClassifier {
        &self.classifier
    }

    /// A fresh hub sized from the engine settings.
    pub fn event_hub(&self) -> EventHub {
        EventHub::new(self.settings.event_buffer)
    }

    /// Run to completion without observers.
    pub async fn run(&self, request: ExecutionRequest) -> Result<RunReport, RunFailure> {
        self.execute(request, CancellationToken::new(), self.event_hub())
            .await
    }

    /// Run to completion, publishing to `hub` and honouring `cancel`.
    ///
    /// Subscribe to `hub` before calling; events are not replayed.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
        hub: EventHub,
    ) -> Result<RunReport, RunFailure> {
        self.execute_at_depth(request, cancel, hub, 0).await
    }

    /// Start a run on the runtime and return its handle.
    pub fn spawn(self: &Arc<Self>, request: ExecutionRequest) -> RunHandle {
        let hub = self.event_hub();
        let run_stream = hub.subscribe_stream();
        let semantic_stream = hub.subscribe_semantic();
        let cancel = CancellationToken::new();

        let executor = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { executor.execute(request, token, hub).await });

        RunHandle {
            run_stream: Some(run_stream),
            semantic_stream: Some(semantic_stream),
            cancel,
            task,
        }
    }

    // Boxed so delegation can recurse.
    fn execute_at_depth(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
        mut hub: EventHub,
        depth: u32,
    ) -> BoxFuture<'_, Result<RunReport, RunFailure>> {
        Box::pin(async move {
            let run_id = Uuid::new_v4().to_string();
            let profile = self.classifier.classify(&request);
            let requested = match request.provider.trim() {
                "" => self.providers.default_name().to_string(),
                name => name.to_string(),
            };

            let allow_delegation =
                profile.delegation_allowed && depth < self.settings.max_delegation_depth;
            let catalog = ToolCatalog::new(
                self.tools
                    .definitions()
                    .into_iter()
                    .chain(self.handlers.builtin_definitions(allow_delegation)),
            );

            // The provider's declared identity picks the system prompt.
            let resolved = self.providers.resolve(&requested);
            let prompt_key = resolved
                .as_ref()
                .map(|(_, provider)| provider.name().to_string())
                .unwrap_or_else(|| requested.clone());
            let transcript = self.initial_transcript(&prompt_key, &request);
            let mut state = IterationState::new(
                &run_id,
                &profile,
                &self.settings.loop_detection,
                transcript,
            );

            info!(
                run_id = %run_id,
                provider = %requested,
                model = %request.model,
                complexity = %profile.complexity,
                max_iterations = profile.max_iterations,
                depth,
                "Run started"
            );
            publish(
                &mut hub,
                ExecutionEvent::RunStart {
                    run_id: run_id.clone(),
                    provider: requested.clone(),
                    model: request.model.clone(),
                    profile: profile.clone(),
                    depth,
                },
            );

            let Some((provider_name, provider)) = resolved else {
                let error =
                    RunError::ProviderUnavailable(format!("no provider registered as '{requested}'"));
                return Err(finish_failed(state, hub, error));
            };

            let scope = RunScope {
                provider_name,
                provider,
                model: request.model,
                profile,
                catalog,
                allow_delegation,
                cancel,
                depth,
            };

            match self.drive(&scope, &mut state, &mut hub).await {
                Ok((outcome, answer)) => Ok(finish_completed(state, hub, &scope, outcome, answer)),
                Err(error) => Err(finish_failed(state, hub, error)),
            }
        })
    }

    fn initial_transcript(&self, provider: &str, request: &ExecutionRequest) -> Transcript {
        let mut transcript = Transcript::new();
        transcript.push(Message::system(self.prompts.system_prompt(provider)));
        transcript.extend(request.memory.iter().cloned());
        transcript.push(Message::user(&request.task));
        transcript
    }

    /// Iterate until something terminates the run.
    async fn drive(
        &self,
        scope: &RunScope,
        state: &mut IterationState,
        hub: &mut EventHub,
    ) -> Result<(RunOutcome, String), RunError> {
        loop {
            if scope.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            let Ok(iteration) = state.begin_iteration() else {
                warn!(
                    run_id = %state.run_id(),
                    max_iterations = state.max_iterations(),
                    "Iteration budget spent without a final answer"
                );
                return Ok((RunOutcome::ForcedFinish, forced_answer(state)));
            };

            debug!(run_id = %state.run_id(), iteration, "Iteration started");
            publish(hub, ExecutionEvent::IterationStart { iteration });

            let timeout = self.iteration_timeout;
            let step = tokio::select! {
                biased;
                _ = scope.cancel.cancelled() => Err(RunError::Cancelled),
                outcome = tokio::time::timeout(timeout, self.iterate(scope, state, hub)) => {
                    outcome.unwrap_or_else(|_| {
                        Err(RunError::IterationTimeout {
                            iteration,
                            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        })
                    })
                }
            };

            match step? {
                Step::Answer(answer) => return Ok((RunOutcome::Finished, answer)),
                Step::Continue => continue,
            }
        }
    }

    async fn iterate(
        &self,
        scope: &RunScope,
        state: &mut IterationState,
        hub: &mut EventHub,
    ) -> Result<Step, RunError> {
        let request = ProviderRequest {
            model: scope.model.clone(),
            messages: state.transcript().messages().to_vec(),
            temperature: scope.profile.temperature,
            max_tokens: None,
            tools: scope.catalog.definitions().to_vec(),
            stream: self.settings.stream_tokens,
        };

        let mut message = self.generate(scope, request, hub).await?;

        if message.tool_calls.is_empty() {
            if message.content.trim().is_empty() {
                return Err(RunError::ProviderMalformedResponse(
                    "response contained neither text nor tool calls".into(),
                ));
            }
            let answer = message.content.clone();
            state.push(message);
            return Ok(Step::Answer(answer));
        }

        if let Err(err) = state.transition(RunState::AwaitingToolResults) {
            warn!(run_id = %state.run_id(), error = %err, "Unexpected state transition");
        }

        for (index, call) in message.tool_calls.iter_mut().enumerate() {
            call.id = state.assign_call_id(&call.id, index);
        }

        let prepared: Vec<PreparedCall> = message
            .tool_calls
            .iter()
            .map(|call| self.prepare(scope, state, call))
            .collect();

        let results = self.execute_calls(&prepared, hub).await;

        let runner = SubRunner {
            executor: self,
            scope,
        };
        let ctx = HandlerContext {
            delegator: scope
                .allow_delegation
                .then_some(&runner as &dyn Delegator),
        };

        let call_count = prepared.len();
        let mut entries = Vec::with_capacity(call_count);
        let mut terminal: Option<String> = None;

        for (prepared, result) in prepared.into_iter().zip(results) {
            let success = result.success;
            let failure = result.failure;
            let outcome = prepared.handler.process(&prepared.call, result, ctx).await;

            publish(
                hub,
                ExecutionEvent::ToolEnd {
                    call_id: prepared.call.id.clone(),
                    name: prepared.call.name.clone(),
                    success,
                    output: outcome.message.content.clone(),
                    failure,
                },
            );
            for effect in outcome.side_effects {
                apply_side_effect(state, hub, effect);
            }
            entries.push(outcome.message);

            if let Continuation::Terminate { answer } = outcome.continuation {
                if !prepared.handler.is_terminal() {
                    warn!(
                        call_id = %prepared.call.id,
                        tool = %prepared.call.name,
                        "Non-terminal handler asked to stop the run; ignoring"
                    );
                } else if terminal.is_none() {
                    terminal = Some(answer);
                } else {
                    debug!(call_id = %prepared.call.id, "Ignoring later terminal signal");
                }
            }
        }

        state.count_tool_calls(call_count);
        state.push(message);
        state.extend(entries);

        Ok(terminal.map_or(Step::Continue, Step::Answer))
    }

    /// Ask the provider for the next step, emitting token events when streaming.
    async fn generate(
        &self,
        scope: &RunScope,
        request: ProviderRequest,
        hub: &mut EventHub,
    ) -> Result<Message, RunError> {
        if !self.settings.stream_tokens {
            let response = scope.provider.complete(request).await?;
            return Ok(response.message);
        }

        let mut rx = scope.provider.stream(request).await?;
        let mut content = String::new();
        let mut calls: Vec<(usize, MessageToolCall)> = Vec::new();
        let mut done = false;

        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
                content.push_str(&delta);
                publish(hub, ExecutionEvent::Token { content: delta });
            }
            for delta in chunk.tool_calls {
                merge_call_delta(&mut calls, delta);
            }
            if chunk.done {
                done = true;
                break;
            }
        }

        if !done {
            return Err(RunError::ProviderUnavailable(
                "stream closed before the final chunk".into(),
            ));
        }

        // Model order is the delta index, not arrival order
        calls.sort_by_key(|(index, _)| *index);
        let mut message = Message::assistant(content);
        message.tool_calls = calls.into_iter().map(|(_, call)| call).collect();
        Ok(message)
    }

    /// Validate one call: existence, then arguments, then repetition.
    fn prepare(
        &self,
        scope: &RunScope,
        state: &mut IterationState,
        raw: &MessageToolCall,
    ) -> PreparedCall {
        let handler = self.handlers.resolve(&raw.name);
        let unparsed = || ToolCall {
            id: raw.id.clone(),
            name: raw.name.clone(),
            arguments: Value::String(raw.arguments.clone()),
        };

        let schema = match check_exists(&scope.catalog, &raw.name) {
            Ok(schema) => schema,
            Err(detail) => {
                warn!(run_id = %state.run_id(), tool = %raw.name, call_id = %raw.id, "Unknown tool requested");
                return PreparedCall::rejected(unparsed(), handler, FailureKind::UnknownTool, detail);
            }
        };

        let arguments = match repair_arguments(&raw.arguments, schema) {
            Ok(arguments) => arguments,
            Err(detail) => {
                debug!(tool = %raw.name, call_id = %raw.id, error = %detail, "Rejected tool arguments");
                return PreparedCall::rejected(
                    unparsed(),
                    handler,
                    FailureKind::MalformedArguments,
                    format!("Invalid arguments for '{}': {detail}", raw.name),
                );
            }
        };

        let call = ToolCall {
            id: raw.id.clone(),
            name: raw.name.clone(),
            arguments,
        };

        match state.observe_call(&call.name, &call.arguments) {
            LoopVerdict::Loop { prior } => {
                warn!(run_id = %state.run_id(), tool = %call.name, call_id = %call.id, prior, "Repeated tool call rejected");
                let detail = format!(
                    "'{}' was already called with identical arguments {prior} time(s) recently. \
                     Use a different approach or call finish.",
                    call.name
                );
                PreparedCall::rejected(call, handler, FailureKind::LoopDetected, detail)
            }
            LoopVerdict::Fresh | LoopVerdict::Repeated { .. } => PreparedCall {
                call,
                handler,
                rejection: None,
            },
        }
    }

    /// Produce one result per prepared call, in the model's order.
    ///
    /// With `parallel_tool_calls`, parallel-safe registry calls of the turn
    /// run concurrently; everything else runs in order.
    async fn execute_calls(&self, prepared: &[PreparedCall], hub: &mut EventHub) -> Vec<ToolResult> {
        let mut results: Vec<Option<ToolResult>> = vec![None; prepared.len()];

        if self.settings.parallel_tool_calls {
            let batch: Vec<usize> = prepared
                .iter()
                .enumerate()
                .filter(|(_, p)| p.rejection.is_none() && !p.handler.is_intrinsic())
                .filter(|(_, p)| {
                    self.tools
                        .get(&p.call.name)
                        .is_some_and(|tool| tool.parallel_safe())
                })
                .map(|(index, _)| index)
                .collect();

            if batch.len() > 1 {
                debug!(calls = batch.len(), "Executing tool calls concurrently");
                for &index in &batch {
                    publish(hub, prepared[index].tool_start());
                }
                let outputs = join_all(batch.iter().map(|&i| self.tools.execute(&prepared[i].call))).await;
                for (index, result) in batch.into_iter().zip(outputs) {
                    results[index] = Some(result);
                }
            }
        }

        for (index, call) in prepared.iter().enumerate() {
            if results[index].is_some() {
                continue;
            }
            let result = match &call.rejection {
                Some(rejection) => rejection.clone(),
                None => {
                    publish(hub, call.tool_start());
                    if call.handler.is_intrinsic() {
                        call.handler.intrinsic_result(&call.call)
                    } else {
                        debug!(tool = %call.call.name, call_id = %call.call.id, "Executing tool");
                        self.tools.execute(&call.call).await
                    }
                }
            };
            results[index] = Some(result);
        }

        results
            .into_iter()
            .zip(prepared)
            .map(|(result, call)| {
                result.unwrap_or_else(|| {
                    ToolResult::failure(
                        &call.call.id,
                        FailureKind::ToolExecutionFailure,
                        "tool produced no result",
                    )
                })
            })
            .collect()
    }
}

/// Nested runs for the `delegate` handler.
struct SubRunner<'a> {
    executor: &'a AdaptiveExecutor,
    scope: &'a RunScope,
}

#[async_trait]
impl<'a> Delegator for SubRunner<'a> {
    async fn delegate(&self, task: &str, context: Option<&str>) -> Result<DelegationOutcome, String> {
        if task.trim().is_empty() {
            return Err("delegate needs a non-empty task".into());
        }

        let memory = context
            .filter(|c| !c.trim().is_empty())
            .map(|c| vec![Message::user(format!("Context from the delegating agent:\n{c}"))])
            .unwrap_or_default();
        let request = ExecutionRequest::new(task, &self.scope.model)
            .with_provider(&self.scope.provider_name)
            .with_memory(memory);

        info!(depth = self.scope.depth + 1, "Delegating subtask");
        let report = self
            .executor
            .execute_at_depth(
                request,
                self.scope.cancel.child_token(),
                self.executor.event_hub(),
                self.scope.depth + 1,
            )
            .await
            .map_err(|failure| failure.error.to_string())?;

        Ok(DelegationOutcome {
            answer: report.answer,
            iterations: report.iterations,
            forced: report.outcome == RunOutcome::ForcedFinish,
            artifacts: report.artifacts,
        })
    }
}

/// Emission never fails the run.
fn publish(hub: &mut EventHub, event: ExecutionEvent) {
    if let Err(err) = hub.emit(event) {
        warn!(error = %err, "Event dropped");
    }
}

fn apply_side_effect(state: &mut IterationState, hub: &mut EventHub, effect: SideEffect) {
    match effect {
        SideEffect::Thinking { kind, content } => {
            publish(hub, ExecutionEvent::Thinking { kind, content });
        }
        SideEffect::Artifact(artifact) => {
            state.record_artifact(artifact.clone());
            publish(hub, ExecutionEvent::Artifact { artifact });
        }
        SideEffect::Sources(sources) => {
            publish(hub, ExecutionEvent::Sources { sources });
        }
    }
}

/// Fold a streamed fragment into the call at its index. Every index is a
/// separate call, even when ids repeat or are missing.
fn merge_call_delta(calls: &mut Vec<(usize, MessageToolCall)>, delta: ToolCallDelta) {
    match calls.iter_mut().find(|(index, _)| *index == delta.index) {
        Some((_, call)) => delta.merge_into(call),
        None => {
            let index = delta.index;
            let mut call = MessageToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            };
            delta.merge_into(&mut call);
            calls.push((index, call));
        }
    }
}

/// Best-effort answer when the budget runs out. Never empty.
/// Only messages appended by this run are considered.
fn forced_answer(state: &IterationState) -> String {
    let produced = state.run_messages();
    let latest_text = |role: Role| {
        produced
            .iter()
            .rev()
            .find(|m| m.role == role && !m.content.trim().is_empty())
    };

    if let Some(message) = latest_text(Role::Assistant) {
        return message.content.clone();
    }

    match latest_text(Role::Tool) {
        Some(observation) => format!(
            "Stopped after {} iteration(s) without a final answer. Latest result:\n{}",
            state.max_iterations(),
            observation.content
        ),
        None => format!(
            "Stopped after {} iteration(s) without a final answer.",
            state.max_iterations()
        ),
    }
}

fn finish_completed(
    mut state: IterationState,
    mut hub: EventHub,
    scope: &RunScope,
    outcome: RunOutcome,
    answer: String,
) -> RunReport {
    let (terminal, status) = match outcome {
        RunOutcome::Finished => (
            RunState::Finished {
                answer: answer.clone(),
            },
            RunStatus::Finished,
        ),
        RunOutcome::ForcedFinish => (
            RunState::ForcedFinish {
                answer: answer.clone(),
            },
            RunStatus::ForcedFinish,
        ),
    };
    if let Err(err) = state.transition(terminal) {
        warn!(run_id = %state.run_id(), error = %err, "Unexpected state transition");
    }

    publish(
        &mut hub,
        ExecutionEvent::RunEnd {
            status,
            iterations: state.iteration(),
            answer: Some(answer.clone()),
            error: None,
        },
    );
    info!(
        run_id = %state.run_id(),
        outcome = ?outcome,
        iterations = state.iteration(),
        tool_calls = state.tool_calls_made(),
        "Run finished"
    );

    RunReport {
        run_id: state.run_id().to_string(),
        outcome,
        answer,
        provider: scope.provider_name.clone(),
        model: scope.model.clone(),
        profile: scope.profile.clone(),
        iterations: state.iteration(),
        tool_calls: state.tool_calls_made(),
        artifacts: state.take_artifacts(),
        transcript: state.take_transcript(),
        events: hub.take_log(),
    }
}

fn finish_failed(mut state: IterationState, mut hub: EventHub, error: RunError) -> RunFailure {
    if let Err(err) = state.transition(RunState::Failed(error.clone())) {
        warn!(run_id = %state.run_id(), error = %err, "Unexpected state transition");
    }

    let status = match error {
        RunError::Cancelled => RunStatus::Cancelled,
        _ => RunStatus::Failed,
    };
    publish(
        &mut hub,
        ExecutionEvent::RunEnd {
            status,
            iterations: state.iteration(),
            answer: None,
            error: Some(error.to_string()),
        },
    );
    warn!(
        run_id = %state.run_id(),
        kind = error.kind(),
        iterations = state.iteration(),
        "Run failed: {error}"
    );

    RunFailure {
        run_id: state.run_id().to_string(),
        error,
        iterations: state.iteration(),
        transcript: state.take_transcript(),
        events: hub.take_log(),
    }
}
