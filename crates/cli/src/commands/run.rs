//! `stepwise run` — replay a scripted model through the engine.
//!
//! Events are printed to stdout as JSON lines tagged with their protocol,
//! followed by a final `report` (or `failure`) line.

use clap::ValueEnum;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stepwise_agent::scripted::Script;
use stepwise_agent::{AdaptiveExecutor, ProviderRouter, RunReport};
use stepwise_core::{Complexity, Error, ExecutionRequest};
use tokio_stream::StreamExt;
use tracing::{error, info};

use super::load_config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Stream,
    Semantic,
    Both,
}

impl Protocol {
    fn includes_stream(self) -> bool {
        matches!(self, Self::Stream | Self::Both)
    }

    fn includes_semantic(self) -> bool {
        matches!(self, Self::Semantic | Self::Both)
    }
}

pub struct RunOptions {
    pub script: PathBuf,
    pub task: String,
    pub complexity: Option<Complexity>,
    pub protocol: Protocol,
    pub model: Option<String>,
}

pub async fn run(config_path: Option<&Path>, options: RunOptions) -> stepwise_core::Result<()> {
    let config = load_config(config_path)?;

    let script = Script::load(&options.script)
        .inspect_err(|e| error!(path = %options.script.display(), error = %e, "Failed to load script"))?;
    info!(turns = script.turns.len(), tools = script.tools.len(), "Loaded script");

    let (provider, registry) = script.into_parts();
    let router = ProviderRouter::new(&config.default_provider)
        .with_provider(config.default_provider.clone(), Arc::new(provider));
    let executor = Arc::new(AdaptiveExecutor::from_config(
        &config,
        Arc::new(router),
        Arc::new(registry),
    ));

    let model = options.model.unwrap_or_else(|| config.default_model.clone());
    let mut request = ExecutionRequest::new(options.task, model);
    if let Some(level) = options.complexity {
        request = request.with_complexity(level);
    }

    let mut handle = executor.spawn(request);

    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let protocol = options.protocol;
    let stream = handle
        .stream_events()
        .ok_or_else(|| Error::Internal("stream subscription already taken".into()))?
        .filter(move |_| protocol.includes_stream())
        .map(|event| tagged("stream", &event));
    let semantic = handle
        .semantic_events()
        .ok_or_else(|| Error::Internal("semantic subscription already taken".into()))?
        .filter(move |_| protocol.includes_semantic())
        .map(|event| tagged("semantic", &event));

    // Both subscriptions end after run_end
    let mut merged = stream.merge(semantic);
    while let Some(line) = merged.next().await {
        println!("{line}");
    }

    let finished = handle
        .join()
        .await
        .map_err(|e| Error::Internal(format!("run task did not complete: {e}")))?;
    match finished {
        Ok(report) => {
            println!("{}", json!({ "report": summary(&report) }));
            Ok(())
        }
        Err(failure) => {
            println!(
                "{}",
                json!({
                    "failure": {
                        "run_id": failure.run_id,
                        "kind": failure.error.kind(),
                        "error": failure.error.to_string(),
                        "iterations": failure.iterations,
                    }
                })
            );
            Err(failure.into())
        }
    }
}

fn tagged<T: serde::Serialize>(protocol: &str, event: &T) -> Value {
    json!({ "protocol": protocol, "event": event })
}

fn summary(report: &RunReport) -> Value {
    json!({
        "run_id": report.run_id,
        "outcome": report.outcome,
        "answer": report.answer,
        "complexity": report.profile.complexity,
        "iterations": report.iterations,
        "tool_calls": report.tool_calls,
        "artifacts": report.artifacts,
    })
}
