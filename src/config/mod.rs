//! Configuration management for the defense engine.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `DEFENSE__`-prefixed environment variables (`DEFENSE__SERVER__PORT=9090`).

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

const DEFAULT_CONFIG_FILE: &str = "config/default.toml";

/// Load configuration from `CONFIG_FILE` (if present) and the environment
pub fn load_config() -> Result<Config, ConfigError> {
    dotenv::dotenv().ok();
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    load_config_from(&config_file)
}

/// Same layering with an explicit file. A missing file is not an error.
pub fn load_config_from(config_file: &str) -> Result<Config, ConfigError> {
    let config = ConfigBuilder::builder()
        .add_source(File::with_name(config_file).required(false))
        .add_source(
            Environment::with_prefix("DEFENSE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = config.try_deserialize()?;
    config
        .detection
        .validate()
        .map_err(|e| ConfigError::Message(e.to_string()))?;
    config
        .rate_limit
        .validate()
        .map_err(|e| ConfigError::Message(e.to_string()))?;
    Ok(config)
}
