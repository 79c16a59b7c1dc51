//! `stepwise config` — Configuration management commands.

use std::path::Path;
use stepwise_config::AppConfig;
use stepwise_core::Error;

use super::load_config;

pub fn validate(path: Option<&Path>) -> stepwise_core::Result<()> {
    println!("🔍 Validating configuration...");

    match load_config(path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();
            if config.prompts.default.trim().is_empty() {
                warnings.push("Default system prompt is empty");
            }
            if config.engine.max_delegation_depth == 0
                && config.complexity.complex.delegation
            {
                warnings.push("Complex profile allows delegation but max_delegation_depth is 0");
            }
            if config.engine.loop_detection.max_repeats >= config.engine.loop_detection.window {
                warnings.push("loop_detection.max_repeats >= window; loops will never be detected");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Provider:   {}", config.default_provider);
            println!("   Model:      {}", config.default_model);
            println!("   Timeout:    {}s per iteration", config.engine.iteration_timeout_secs);
            println!(
                "   Iterations: trivial={} moderate={} complex={}",
                config.complexity.trivial.max_iterations,
                config.complexity.moderate.max_iterations,
                config.complexity.complex.max_iterations
            );
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub fn show(path: Option<&Path>) -> stepwise_core::Result<()> {
    let config = load_config(path)?;
    let toml_str = toml::to_string_pretty(&config).map_err(|e| Error::Config {
        message: format!("could not render config as TOML: {e}"),
    })?;
    println!("{toml_str}");
    Ok(())
}

pub fn path(path: Option<&Path>) {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => AppConfig::config_dir().join("config.toml"),
    };
    println!("{}", config_path.display());
}
