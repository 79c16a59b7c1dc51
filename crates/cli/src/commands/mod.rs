pub mod classify;
pub mod config_cmd;
pub mod run;

use std::path::Path;
use stepwise_config::{AppConfig, ConfigError};

/// Load from an explicit path, or from the default location with env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
}
