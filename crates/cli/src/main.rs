//! Stepwise CLI — the main entry point.
//!
//! Commands:
//! - `run`       — Replay a scripted model through the engine and print events
//! - `classify`  — Show the reasoning profile a task would get
//! - `config`    — Show, locate or validate configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::run::Protocol;

#[derive(Parser)]
#[command(
    name = "stepwise",
    about = "Stepwise — adaptive agent execution engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of ~/.stepwise/config.toml
    #[arg(long, global = true, env = "STEPWISE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task against a scripted model and stub tools
    Run {
        /// JSON script with the model turns and stub tools
        #[arg(short, long)]
        script: PathBuf,

        /// The task to run
        #[arg(short, long)]
        task: String,

        /// Force a complexity level (trivial, moderate, complex)
        #[arg(short, long)]
        complexity: Option<stepwise_core::Complexity>,

        /// Which event protocol(s) to print
        #[arg(short, long, value_enum, default_value_t = Protocol::Both)]
        protocol: Protocol,

        /// Override the model name sent to the provider
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Classify a task and print its reasoning profile
    Classify {
        /// The task to classify
        #[arg(short, long)]
        task: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
    /// Validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the event stream
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run {
            script,
            task,
            complexity,
            protocol,
            model,
        } => {
            let options = commands::run::RunOptions {
                script,
                task,
                complexity,
                protocol,
                model,
            };
            commands::run::run(config_path, options).await?
        }
        Commands::Classify { task } => commands::classify::run(config_path, &task)?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config_path)?,
            ConfigAction::Path => commands::config_cmd::path(config_path),
            ConfigAction::Validate => commands::config_cmd::validate(config_path)?,
        },
    }

    Ok(())
}
