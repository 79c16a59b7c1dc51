//! # Stepwise Core
//!
//! Domain types, traits, and error definitions for the Stepwise agent
//! execution engine. This crate has **no engine logic**; it defines the
//! contracts the engine consumes (providers, tools) and the values that
//! flow through a run.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here. Implementations live
//! elsewhere, which keeps the engine testable with scripted providers and
//! stub tools.

pub mod error;
pub mod message;
pub mod provider;
pub mod request;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, ToolError};
pub use message::{Message, MessageToolCall, Role, Transcript};
pub use provider::{
    Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta, ToolDefinition, Usage,
};
pub use request::{Complexity, ExecutionRequest, ReasoningProfile};
pub use tool::{FailureKind, Tool, ToolCall, ToolRegistry, ToolResult};
