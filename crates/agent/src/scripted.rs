//! Scripted model and stub tools for offline runs.
//!
//! A `Script` is a JSON document listing the model turns to replay and the
//! stub tools to register:
//!
//! ```json
//! {
//!   "tools": [
//!     { "name": "mail_search", "output": "2 messages", "data": { "sources": ["Re: offsite"] } }
//!   ],
//!   "turns": [
//!     { "tool_calls": [ { "name": "mail_search", "arguments": { "query": "offsite" } } ] },
//!     { "content": "The offsite is on Friday." }
//!   ]
//! }
//! ```
//!
//! `arguments` may be a JSON object or raw text; raw text is passed to the
//! engine untouched so argument repair can be exercised.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stepwise_core::error::{ProviderError, ToolError};
use stepwise_core::message::{Message, MessageToolCall};
use stepwise_core::provider::{
    Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta, Usage,
};
use stepwise_core::tool::{Tool, ToolRegistry, ToolResult};
use tokio::sync::mpsc;

/// One replayed model response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub tool_calls: Vec<ScriptedCall>,

    /// Simulated latency before answering
    #[serde(default)]
    pub delay_ms: u64,

    /// Answer with an error instead of a message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ScriptedFailure>,

    /// Streaming only: close the stream without a final chunk
    #[serde(default)]
    pub truncate_stream: bool,
}

impl ScriptedTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn calls(calls: Vec<ScriptedCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn failing(failure: ScriptedFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn truncated(mut self) -> Self {
        self.truncate_stream = true;
        self
    }

    fn to_message(&self) -> Message {
        let mut message = Message::assistant(&self.content);
        message.tool_calls = self.tool_calls.iter().map(ScriptedCall::to_call).collect();
        message
    }
}

/// A tool call inside a scripted turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedCall {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub arguments: Value,
}

impl ScriptedCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            arguments,
        }
    }

    /// A call whose argument text is sent verbatim.
    pub fn raw(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::new(name, Value::String(arguments.into()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    fn to_call(&self) -> MessageToolCall {
        let arguments = match &self.arguments {
            Value::String(raw) => raw.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        MessageToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments,
        }
    }
}

/// Provider-level failure to replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptedFailure {
    Unavailable { message: String },
    Malformed { message: String },
}

impl ScriptedFailure {
    fn to_error(&self) -> ProviderError {
        match self {
            Self::Unavailable { message } => ProviderError::Network(message.clone()),
            Self::Malformed { message } => ProviderError::MalformedResponse(message.clone()),
        }
    }
}

/// Replays a fixed list of turns, one per provider call.
///
/// Calls past the end of the script fail as unavailable.
pub struct ScriptedProvider {
    turns: Vec<ScriptedTurn>,
    cursor: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns,
            cursor: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that answers once with plain text.
    pub fn text(answer: &str) -> Self {
        Self::new(vec![ScriptedTurn::text(answer)])
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    async fn next_turn(&self, request: ProviderRequest) -> Result<ScriptedTurn, ProviderError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request);
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let Some(turn) = self.turns.get(index).cloned() else {
            return Err(ProviderError::NotConfigured(format!(
                "script exhausted after {} turn(s)",
                self.turns.len()
            )));
        };
        if turn.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(turn.delay_ms)).await;
        }
        match &turn.failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(turn),
        }
    }
}

fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();
        let turn = self.next_turn(request).await?;
        Ok(ProviderResponse {
            message: turn.to_message(),
            usage: Some(usage()),
            model,
        })
    }

    /// Streams content word by word, then the tool calls, then `done`.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let turn = self.next_turn(request).await?;
        let message = turn.to_message();

        let mut chunks: Vec<StreamChunk> = message
            .content
            .split_inclusive(' ')
            .map(|word| StreamChunk {
                content: Some(word.to_string()),
                ..StreamChunk::default()
            })
            .collect();
        if !message.tool_calls.is_empty() {
            chunks.push(StreamChunk {
                tool_calls: message
                    .tool_calls
                    .into_iter()
                    .enumerate()
                    .map(|(index, call)| ToolCallDelta::whole(index, call))
                    .collect(),
                ..StreamChunk::default()
            });
        }
        if !turn.truncate_stream {
            chunks.push(StreamChunk {
                done: true,
                usage: Some(usage()),
                ..StreamChunk::default()
            });
        }

        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            if tx.send(Ok(chunk)).await.is_err() {
                break;
            }
        }
        Ok(rx)
    }
}

/// A stub tool that returns a canned result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StubTool {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_schema")]
    pub parameters: Value,

    #[serde(default)]
    pub output: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Fail every call with this reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail: Option<String>,

    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub parallel_safe: bool,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl StubTool {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: default_schema(),
            output: output.into(),
            data: None,
            fail: None,
            delay_ms: 0,
            parallel_safe: false,
        }
    }

    pub fn with_schema(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.fail = Some(reason.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration, parallel_safe: bool) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.parallel_safe = parallel_safe;
        self
    }
}

#[async_trait]
impl Tool for StubTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if let Some(reason) = &self.fail {
            return Err(ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: reason.clone(),
            });
        }
        let result = ToolResult::ok("", &self.output);
        Ok(match &self.data {
            Some(data) => result.with_data(data.clone()),
            None => result,
        })
    }

    fn parallel_safe(&self) -> bool {
        self.parallel_safe
    }
}

/// A complete offline scenario.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub tools: Vec<StubTool>,

    #[serde(default)]
    pub turns: Vec<ScriptedTurn>,
}

impl Script {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Read and parse a script file.
    pub fn load(path: &Path) -> stepwise_core::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&text)?)
    }

    pub fn into_parts(self) -> (ScriptedProvider, ToolRegistry) {
        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register(Box::new(tool));
        }
        (ScriptedProvider::new(self.turns), registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "m".into(),
            messages: vec![],
            temperature: 0.5,
            max_tokens: None,
            tools: vec![],
            stream: false,
        }
    }

    #[tokio::test]
    async fn replays_turns_in_order_then_fails() {
        let provider = ScriptedProvider::new(vec![
            ScriptedTurn::calls(vec![ScriptedCall::new("search", json!({"q": "x"}))]),
            ScriptedTurn::text("done"),
        ]);
        let first = provider.complete(request()).await.unwrap();
        assert_eq!(first.message.tool_calls[0].arguments, r#"{"q":"x"}"#);
        let second = provider.complete(request()).await.unwrap();
        assert_eq!(second.message.content, "done");
        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn stream_splits_words_and_ends_with_done() {
        let provider = ScriptedProvider::text("hello big world");
        let mut rx = provider.stream(request()).await.unwrap();
        let mut deltas = Vec::new();
        let mut done = false;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            if let Some(c) = chunk.content {
                deltas.push(c);
            }
            done |= chunk.done;
        }
        assert_eq!(deltas, vec!["hello ", "big ", "world"]);
        assert!(done);
    }

    #[tokio::test]
    async fn truncated_stream_has_no_done() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::text("cut off").truncated()]);
        let mut rx = provider.stream(request()).await.unwrap();
        while let Some(chunk) = rx.recv().await {
            assert!(!chunk.unwrap().done);
        }
    }

    #[tokio::test]
    async fn scripted_failures_map_to_provider_errors() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::failing(ScriptedFailure::Malformed {
            message: "no choices".into(),
        })]);
        let err = provider.complete(request()).await.unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn stub_tool_returns_canned_output() {
        let tool = StubTool::new("mail_search", "2 messages").with_data(json!({"sources": ["a"]}));
        let result = tool.execute(json!({})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "2 messages");

        let err = StubTool::new("x", "").failing("upstream down").execute(json!({})).await;
        assert!(err.is_err());
    }

    #[test]
    fn script_parses_raw_and_object_arguments() {
        let script = Script::from_json(
            r#"{
                "tools": [{ "name": "search", "output": "ok" }],
                "turns": [
                    { "tool_calls": [
                        { "name": "search", "arguments": "{'q': 'x',}" },
                        { "name": "search", "arguments": { "q": "y" } }
                    ] },
                    { "content": "bye" }
                ]
            }"#,
        )
        .unwrap();
        let calls: Vec<_> = script.turns[0].tool_calls.iter().map(ScriptedCall::to_call).collect();
        assert_eq!(calls[0].arguments, "{'q': 'x',}");
        assert_eq!(calls[1].arguments, r#"{"q":"y"}"#);

        let (_, registry) = script.into_parts();
        assert!(registry.contains("search"));
    }

    #[test]
    fn script_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.json");
        std::fs::write(&path, r#"{"turns": [{"content": "hello"}]}"#).unwrap();
        let script = Script::load(&path).unwrap();
        assert_eq!(script.turns.len(), 1);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Script::load(&path), Err(stepwise_core::Error::Serialization(_))));

        let missing = dir.path().join("missing.json");
        assert!(matches!(Script::load(&missing), Err(stepwise_core::Error::Io(_))));
    }
}
