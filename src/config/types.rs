//! Configuration types for nat-redirect
//!
//! Configuration is loaded from JSON files and validated at startup.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::nat::{AddressKey, ChainName, Protocol};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Name of the dedicated nat chain
    #[serde(default = "default_chain")]
    pub chain: String,

    /// Keep rules in memory instead of calling iptables
    #[serde(default)]
    pub dry_run: bool,

    /// Redirects installed right after the chain is enabled
    #[serde(default)]
    pub redirects: Vec<RedirectConfig>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ChainName::new(self.chain.clone())?;

        let mut keys = HashSet::new();
        for redirect in &self.redirects {
            redirect.validate()?;
            if !keys.insert(redirect.key()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate redirect for {}",
                    redirect.key()
                )));
            }
        }

        self.log.validate()?;

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            chain: default_chain(),
            dry_run: false,
            redirects: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

/// One static redirect
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RedirectConfig {
    /// Matched protocol
    pub protocol: Protocol,

    /// Matched destination address
    pub address: Ipv4Addr,

    /// Local port traffic is delivered to
    pub port: u16,
}

impl RedirectConfig {
    /// Validate a redirect entry
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the port is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Redirect for {} has port 0",
                self.key()
            )));
        }
        Ok(())
    }

    /// Table key of this redirect
    #[must_use]
    pub const fn key(&self) -> AddressKey {
        AddressKey::new(self.protocol, self.address)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for unknown levels or formats.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log level: {}",
                self.level
            )));
        }

        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log format: {}",
                self.format
            )));
        }

        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

// Default value functions for serde
const fn default_true() -> bool {
    true
}

fn default_chain() -> String {
    "PROXY_REDIRECT".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
