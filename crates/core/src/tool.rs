//! Tool trait — the abstraction over agent capabilities.
//!
//! Tools are the external capabilities a run can use: mail, calendar,
//! file search, cube queries, slide generation. The engine only knows them
//! through this trait and the `ToolRegistry`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A validated request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID within the run
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON object
    pub arguments: serde_json::Value,
}

/// Why a tool call did not produce a successful result.
///
/// Every kind is recoverable: the failure is written to the transcript and
/// the model decides what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownTool,
    MalformedArguments,
    LoopDetected,
    ToolExecutionFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::MalformedArguments => "malformed_arguments",
            Self::LoopDetected => "loop_detected",
            Self::ToolExecutionFailure => "tool_execution_failure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content, or the error detail on failure
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Set exactly when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ToolResult {
    /// A successful result with a text payload.
    pub fn ok(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output: output.into(),
            data: None,
            failure: None,
        }
    }

    /// A failed result of the given kind.
    pub fn failure(call_id: impl Into<String>, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: detail.into(),
            data: None,
            failure: Some(kind),
        }
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The text the model sees for this result.
    pub fn transcript_text(&self) -> String {
        match self.failure {
            Some(kind) => format!("Error ({kind}): {}", self.output),
            None => self.output.clone(),
        }
    }
}

/// The core Tool trait.
///
/// Implementations report business failures (not found, upstream down) as
/// `Err(ToolError)` or as a `ToolResult` with `success = false`; the
/// registry turns both into failed results.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "mail_search").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolResult, ToolError>;

    /// Whether this tool may run concurrently with other calls of the same turn.
    fn parallel_safe(&self) -> bool {
        false
    }

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// Built once at startup and shared read-only by every run.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get all tool definitions (for sending to the LLM), sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool call.
    ///
    /// Never fails: a missing tool or a tool error becomes a failed
    /// `ToolResult` tagged with the call's id.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolResult::failure(
                &call.id,
                FailureKind::UnknownTool,
                ToolError::NotFound(call.name.clone()).to_string(),
            );
        };

        match tool.execute(call.arguments.clone()).await {
            Ok(mut result) => {
                result.call_id = call.id.clone();
                if !result.success && result.failure.is_none() {
                    result.failure = Some(FailureKind::ToolExecutionFailure);
                }
                result
            }
            Err(e) => {
                tracing::debug!(tool = %call.name, error = %e, "Tool reported failure");
                ToolResult::failure(&call.id, FailureKind::ToolExecutionFailure, e.to_string())
            }
        }
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
