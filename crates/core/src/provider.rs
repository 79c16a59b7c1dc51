//! Provider trait — the abstraction over LLM backends.
//!
//! A Provider receives the transcript, the tool schema and a temperature,
//! and answers either with text or with a set of tool calls, as a complete
//! message or as a stream of chunks. Concrete backends live outside this
//! workspace; the engine only sees this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o")
    pub model: String,

    /// The transcript so far
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Partial tool call deltas; deltas sharing an index are concatenated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A fragment of one streamed tool call.
///
/// `index` is the call's position in the assistant turn. Fragments with
/// the same index belong to the same call; `id` and `name` usually arrive
/// only on the first fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,

    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub arguments: String,
}

impl ToolCallDelta {
    /// A delta carrying a whole call at `index`.
    pub fn whole(index: usize, call: MessageToolCall) -> Self {
        Self {
            index,
            id: call.id,
            name: call.name,
            arguments: call.arguments,
        }
    }

    /// Append this fragment to the call assembled so far.
    pub fn merge_into(self, call: &mut MessageToolCall) {
        if call.id.is_empty() {
            call.id = self.id;
        }
        if call.name.is_empty() {
            call.name = self.name;
        }
        call.arguments.push_str(&self.arguments);
    }
}

/// The core Provider trait.
///
/// The executor calls `complete()` or `stream()` without knowing which
/// backend answers. `name()` is the provider identity used to pick the
/// per-provider system prompt.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai", "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let response = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx.send(Ok(StreamChunk {
            content: Some(response.message.content),
            tool_calls: response
                .message
                .tool_calls
                .into_iter()
                .enumerate()
                .map(|(index, call)| ToolCallDelta::whole(index, call))
                .collect(),
            done: true,
            usage: response.usage,
        })).await;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider;

    #[async_trait]
    impl Provider for FixedProvider {
        fn name(&self) -> &str { "fixed" }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                message: Message::assistant("hello"),
                usage: None,
                model: "fixed-1".into(),
            })
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "fixed-1".into(),
            messages: vec![],
            temperature: default_temperature(),
            max_tokens: None,
            tools: vec![],
            stream: false,
        }
    }

    #[test]
    fn provider_request_defaults() {
        let req = request();
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
        assert!(!req.stream);
    }

    #[test]
    fn tool_definition_serialization() {
        let tool = ToolDefinition {
            name: "calendar_lookup".into(),
            description: "Find calendar events".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "day": { "type": "string", "description": "ISO date" }
                },
                "required": ["day"]
            }),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("calendar_lookup"));
        assert!(json.contains("day"));
    }

    struct TwoCallProvider;

    #[async_trait]
    impl Provider for TwoCallProvider {
        fn name(&self) -> &str { "two-call" }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            let mut message = Message::assistant("");
            message.tool_calls = vec![
                MessageToolCall { id: String::new(), name: "lookup".into(), arguments: "{\"q\":\"a\"}".into() },
                MessageToolCall { id: String::new(), name: "lookup".into(), arguments: "{\"q\":\"b\"}".into() },
            ];
            Ok(ProviderResponse { message, usage: None, model: "two-call-1".into() })
        }
    }

    #[tokio::test]
    async fn default_stream_indexes_each_call() {
        let mut rx = TwoCallProvider.stream(request()).await.unwrap();
        let chunk = rx.recv().await.unwrap().unwrap();
        let indexes: Vec<_> = chunk.tool_calls.iter().map(|d| d.index).collect();
        assert_eq!(indexes, vec![0, 1]);
        assert_eq!(chunk.tool_calls[1].arguments, "{\"q\":\"b\"}");
    }

    #[test]
    fn delta_fills_missing_id_and_name() {
        let mut call = MessageToolCall { id: String::new(), name: String::new(), arguments: "{\"a\":".into() };
        ToolCallDelta { index: 0, id: "c1".into(), name: "search".into(), arguments: "1}".into() }
            .merge_into(&mut call);
        assert_eq!(call.id, "c1");
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, "{\"a\":1}");
    }

    #[tokio::test]
    async fn default_stream_wraps_complete() {
        let mut rx = FixedProvider.stream(request()).await.unwrap();
        let chunk = rx.recv().await.unwrap().unwrap();
        assert_eq!(chunk.content.as_deref(), Some("hello"));
        assert!(chunk.done);
        assert!(rx.recv().await.is_none());
    }
}
