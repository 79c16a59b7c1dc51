//! `stepwise classify` — show the reasoning profile for a task.

use std::path::Path;
use stepwise_agent::ComplexityClassifier;
use stepwise_core::ExecutionRequest;

use super::load_config;

pub fn run(config_path: Option<&Path>, task: &str) -> stepwise_core::Result<()> {
    let config = load_config(config_path)?;
    let classifier = ComplexityClassifier::new(config.complexity);
    let profile = classifier.classify(&ExecutionRequest::new(task, &config.default_model));
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}
