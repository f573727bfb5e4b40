//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: chain={}, {} redirects, dry_run={}",
        config.chain,
        config.redirects.len(),
        config.dry_run
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `NAT_REDIRECT_CHAIN`: Override chain name
/// - `NAT_REDIRECT_LOG_LEVEL`: Override log level
/// - `NAT_REDIRECT_DRY_RUN`: Override dry-run mode (`true`/`false`/`1`/`0`)
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Load configuration from `path` if it exists, or start from defaults,
/// then apply environment variable overrides
///
/// Accepts the same variables as [`load_config_with_env`].
///
/// # Errors
///
/// Returns `ConfigError` if an existing file cannot be loaded or an
/// override is invalid.
pub fn load_config_or_default_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    load_or_default(path.as_ref(), |name| std::env::var(name).ok())
}

fn load_or_default(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut config = if path.exists() {
        load_config(path)?
    } else {
        debug!("No configuration at {:?}, using defaults", path);
        Config::default_config()
    };
    apply_env_overrides(&mut config, lookup)?;
    Ok(config)
}

/// Apply overrides from a variable lookup, then re-validate
pub(crate) fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(chain) = lookup("NAT_REDIRECT_CHAIN") {
        config.chain = chain;
        debug!("Chain overridden to {}", config.chain);
    }

    if let Some(level) = lookup("NAT_REDIRECT_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(dry_run) = lookup("NAT_REDIRECT_DRY_RUN") {
        config.dry_run = match dry_run.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => {
                return Err(ConfigError::EnvError {
                    name: "NAT_REDIRECT_DRY_RUN".into(),
                    reason: format!("Invalid boolean: {dry_run}"),
                })
            }
        };
        debug!("Dry run overridden to {}", config.dry_run);
    }

    // Re-validate after overrides
    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
