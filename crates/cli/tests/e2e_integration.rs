//! End-to-end integration tests for the Stepwise execution engine.
//!
//! These tests exercise the full pipeline from request to report:
//! classification, the iteration loop, validation, handlers, and both
//! event protocols.

use std::io::Write as _;
use std::sync::Arc;

use serde_json::json;
use stepwise_agent::scripted::{Script, ScriptedCall, ScriptedProvider, ScriptedTurn, StubTool};
use stepwise_agent::{
    AdaptiveExecutor, ExecutionEvent, ProviderRouter, RunOutcome, RunStatus, SemanticEvent,
    StreamEvent,
};
use stepwise_config::AppConfig;
use stepwise_core::error::ProviderError;
use stepwise_core::message::{MessageToolCall, Role, Transcript};
use stepwise_core::provider::{
    Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta,
};
use stepwise_core::tool::{FailureKind, ToolRegistry};
use stepwise_core::{Complexity, ExecutionRequest};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

// ── Helpers ──────────────────────────────────────────────────────────────

fn executor_with(provider: Arc<dyn Provider>, tools: Vec<StubTool>) -> AdaptiveExecutor {
    executor_from_config(&AppConfig::default(), provider, tools)
}

fn executor_from_config(
    config: &AppConfig,
    provider: Arc<dyn Provider>,
    tools: Vec<StubTool>,
) -> AdaptiveExecutor {
    let router = ProviderRouter::new("e2e").with_provider("e2e", provider);
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(Box::new(tool));
    }
    AdaptiveExecutor::from_config(config, Arc::new(router), Arc::new(registry))
}

fn finish(answer: &str) -> ScriptedCall {
    ScriptedCall::new("finish", json!({ "answer": answer }))
}

/// Transcript content without generated ids and timestamps.
fn shape(transcript: &Transcript) -> Vec<(Role, String, Vec<MessageToolCall>, Option<String>)> {
    transcript
        .messages()
        .iter()
        .map(|m| {
            (
                m.role.clone(),
                m.content.clone(),
                m.tool_calls.clone(),
                m.tool_call_id.clone(),
            )
        })
        .collect()
}

/// A provider that streams one tool call split across several chunks.
struct FragmentedProvider {
    turn: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl Provider for FragmentedProvider {
    fn name(&self) -> &str {
        "fragmented"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured("streaming only".into()))
    }

    async fn stream(
        &self,
        _request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let turn = self.turn.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let chunks = if turn == 0 {
            vec![
                StreamChunk {
                    content: Some("Let me finish. ".into()),
                    ..StreamChunk::default()
                },
                StreamChunk {
                    tool_calls: vec![ToolCallDelta {
                        index: 0,
                        id: "fin-1".into(),
                        name: "finish".into(),
                        arguments: "{\"answer\": \"assem".into(),
                    }],
                    ..StreamChunk::default()
                },
                StreamChunk {
                    tool_calls: vec![ToolCallDelta {
                        index: 0,
                        arguments: "bled\"}".into(),
                        ..ToolCallDelta::default()
                    }],
                    ..StreamChunk::default()
                },
                StreamChunk {
                    done: true,
                    ..StreamChunk::default()
                },
            ]
        } else {
            return Err(ProviderError::NotConfigured("no more turns".into()));
        };

        let (tx, rx) = mpsc::channel(chunks.len());
        for chunk in chunks {
            let _ = tx.send(Ok(chunk)).await;
        }
        Ok(rx)
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_trivial_direct_answer() {
    let provider = Arc::new(ScriptedProvider::text("Hi! How can I help?"));
    let executor = executor_with(provider.clone(), vec![]);

    let report = executor
        .run(ExecutionRequest::new("hello", "mock"))
        .await
        .expect("run should succeed");

    assert_eq!(report.profile.complexity, Complexity::Trivial);
    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(report.answer, "Hi! How can I help?");
    assert_eq!(report.iterations, 1);
    assert_eq!(report.tool_calls, 0);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn e2e_finish_tool_answer_is_verbatim() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::calls(vec![finish("42")])]));
    let executor = executor_with(provider, vec![]);

    let report = executor
        .run(ExecutionRequest::new("What is six times seven?", "mock"))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Finished);
    assert_eq!(report.answer, "42");
}

#[tokio::test]
async fn e2e_budget_from_config_forces_finish() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[complexity.moderate]
temperature = 0.4
max_iterations = 3
"#
    )
    .unwrap();
    let config = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(config.complexity.moderate.max_iterations, 3);

    let turns = (0..3)
        .map(|i| {
            ScriptedTurn::calls(vec![ScriptedCall::new("lookup", json!({ "page": i }))])
                .with_content(format!("Still looking, page {i}"))
        })
        .collect();
    let provider = Arc::new(ScriptedProvider::new(turns));
    let executor = executor_from_config(
        &config,
        provider.clone(),
        vec![StubTool::new("lookup", "no luck")],
    );

    let report = executor
        .run(ExecutionRequest::new("find the contract", "mock").with_complexity(Complexity::Moderate))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::ForcedFinish);
    assert_eq!(report.iterations, 3);
    assert!(!report.answer.trim().is_empty());
    assert_eq!(provider.call_count(), 3);
    assert_eq!(provider.requests()[0].temperature, 0.4);
}

#[tokio::test]
async fn e2e_unknown_tool_does_not_fail_run() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedTurn::calls(vec![ScriptedCall::new("foo_bar", json!({}))]),
        ScriptedTurn::text("I answered without foo_bar."),
    ]));
    let executor = executor_with(provider, vec![StubTool::new("mail_search", "")]);

    let report = executor
        .run(ExecutionRequest::new("do the foo bar thing", "mock"))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Finished);
    let failure = report
        .transcript
        .messages()
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("failure message in transcript");
    assert!(failure.content.contains("unknown_tool"));
    assert!(failure.content.contains("foo_bar"));
}

#[tokio::test]
async fn e2e_think_then_finish_semantic_order() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedTurn::calls(vec![ScriptedCall::new(
            "think",
            json!({ "thought": "The user wants a short summary." }),
        )]),
        ScriptedTurn::calls(vec![finish("Here is the summary.")]),
    ]));
    let executor = Arc::new(executor_with(provider, vec![]));

    let mut handle = executor.spawn(ExecutionRequest::new("summarize my week", "mock"));
    let semantic = handle.semantic_events().unwrap();
    let report = handle.join().await.unwrap().unwrap();
    assert_eq!(report.iterations, 2);

    let events: Vec<SemanticEvent> = semantic.collect().await;
    let thinking = events
        .iter()
        .position(|e| matches!(e, SemanticEvent::Thinking { .. }))
        .expect("thinking event");
    let done = events
        .iter()
        .position(|e| matches!(e, SemanticEvent::Done { .. }))
        .expect("done event");
    assert!(thinking < done);
    assert_eq!(done, events.len() - 1);
}

// ── Properties ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_replay_is_deterministic() {
    let script = || {
        Script::from_json(
            r#"{
                "tools": [
                    { "name": "mail_search", "output": "Offsite moved to Friday",
                      "data": { "sources": [ { "title": "Re: offsite", "url": "mail://7" } ] } }
                ],
                "turns": [
                    { "tool_calls": [ { "name": "mail_search", "arguments": "{'query': 'offsite'}" } ] },
                    { "tool_calls": [ { "name": "finish", "arguments": { "answer": "Friday." } } ] }
                ]
            }"#,
        )
        .unwrap()
    };

    let mut shapes = Vec::new();
    for _ in 0..2 {
        let (provider, registry) = script().into_parts();
        let router = ProviderRouter::new("e2e").with_provider("e2e", Arc::new(provider));
        let executor = AdaptiveExecutor::new(Arc::new(router), Arc::new(registry));
        let report = executor
            .run(ExecutionRequest::new("When is the offsite?", "mock"))
            .await
            .unwrap();
        assert_eq!(report.answer, "Friday.");
        shapes.push(shape(&report.transcript));
    }
    assert_eq!(shapes[0], shapes[1]);
}

#[tokio::test]
async fn e2e_loop_detection_never_invokes_tool() {
    let turns = (0..4)
        .map(|_| ScriptedTurn::calls(vec![ScriptedCall::new("lookup", json!({ "id": 9 }))]))
        .chain(std::iter::once(ScriptedTurn::text("Stopping here.")))
        .collect();
    let provider = Arc::new(ScriptedProvider::new(turns));
    let executor = executor_with(provider, vec![StubTool::new("lookup", "record 9")]);

    let report = executor
        .run(ExecutionRequest::new("look it up", "mock").with_complexity(Complexity::Complex))
        .await
        .unwrap();

    let kinds: Vec<Option<FailureKind>> = report
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::ToolEnd { failure, .. } => Some(*failure),
            _ => None,
        })
        .collect();
    assert_eq!(kinds.last(), Some(&Some(FailureKind::LoopDetected)));

    // Rejected calls get a tool_end but never a tool_start
    let starts = report
        .events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::ToolStart { .. }))
        .count();
    assert_eq!(starts, 3);
}

#[tokio::test]
async fn e2e_stream_fragments_are_reassembled() {
    let provider = Arc::new(FragmentedProvider {
        turn: std::sync::atomic::AtomicUsize::new(0),
    });
    let executor = Arc::new(executor_with(provider, vec![]));

    let mut handle = executor.spawn(ExecutionRequest::new("hello", "mock"));
    let stream = handle.stream_events().unwrap();
    let report = handle.join().await.unwrap().unwrap();
    assert_eq!(report.answer, "assembled");

    let events: Vec<StreamEvent> = stream.collect().await;
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Token { content } if content == "Let me finish. ")));
    assert!(events.iter().any(|e| matches!(e, StreamEvent::ToolStart { call_id, .. } if call_id == "fin-1")));
    assert!(matches!(
        events.last(),
        Some(StreamEvent::RunEnd {
            status: RunStatus::Finished,
            ..
        })
    ));
}

#[tokio::test]
async fn e2e_slides_artifact_reaches_semantic_stream() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::calls(vec![
        ScriptedCall::new("generate_slides", json!({ "topic": "Q3 results" })),
    ])]));
    let slides = StubTool::new("generate_slides", "Deck ready: 5 slides")
        .with_data(json!({ "path": "/decks/q3.pptx", "title": "Q3 results" }));
    let executor = Arc::new(executor_with(provider, vec![slides]));

    let mut handle = executor.spawn(
        ExecutionRequest::new("prepare a presentation on Q3 results", "mock"),
    );
    let semantic = handle.semantic_events().unwrap();
    let report = handle.join().await.unwrap().unwrap();

    assert_eq!(report.answer, "Deck ready: 5 slides");
    let events: Vec<SemanticEvent> = semantic.collect().await;
    let kinds: Vec<&str> = events.iter().map(SemanticEvent::event_type).collect();
    assert_eq!(kinds, vec!["action", "artifact", "done"]);
    match &events[1] {
        SemanticEvent::Artifact { artifact } => assert_eq!(artifact.reference, "/decks/q3.pptx"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn e2e_provider_failure_keeps_partial_transcript() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::calls(vec![
        ScriptedCall::new("lookup", json!({})),
    ])]));
    let executor = executor_with(provider, vec![StubTool::new("lookup", "found it")]);

    // The script runs dry on the second call
    let failure = executor
        .run(ExecutionRequest::new("find the thing", "mock"))
        .await
        .unwrap_err();

    assert_eq!(failure.error.kind(), "provider_unavailable");
    assert_eq!(failure.iterations, 2);
    assert!(failure
        .transcript
        .messages()
        .iter()
        .any(|m| m.role == Role::Tool && m.content == "found it"));
}
