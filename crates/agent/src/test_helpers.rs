//! Shared helpers for engine tests.

use std::sync::Arc;
use stepwise_core::request::ExecutionRequest;
use stepwise_core::tool::ToolRegistry;

use crate::events::ExecutionEvent;
use crate::executor::AdaptiveExecutor;
use crate::router::ProviderRouter;
use crate::scripted::{ScriptedCall, ScriptedProvider, ScriptedTurn, StubTool};

/// An executor wired to a scripted provider registered as "mock".
pub fn build(turns: Vec<ScriptedTurn>, tools: Vec<StubTool>) -> (AdaptiveExecutor, Arc<ScriptedProvider>) {
    let provider = Arc::new(ScriptedProvider::new(turns));
    let router = ProviderRouter::new("mock").with_provider("mock", provider.clone());

    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(Box::new(tool));
    }

    let executor = AdaptiveExecutor::new(Arc::new(router), Arc::new(registry));
    (executor, provider)
}

pub fn request(task: &str) -> ExecutionRequest {
    ExecutionRequest::new(task, "test-model")
}

pub fn finish_call(answer: &str) -> ScriptedCall {
    ScriptedCall::new("finish", serde_json::json!({ "answer": answer }))
}

pub fn event_types(events: &[ExecutionEvent]) -> Vec<&'static str> {
    events.iter().map(ExecutionEvent::event_type).collect()
}
