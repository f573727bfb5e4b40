//! Configuration module for nat-redirect
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use nat_redirect::config::load_config;
//!
//! let config = load_config("/etc/nat-redirect/config.json").unwrap();
//! println!("Chain: {}", config.chain);
//! ```

mod loader;
mod types;

pub use loader::{
    create_default_config, load_config, load_config_or_default_with_env, load_config_str,
    load_config_with_env,
};
pub use types::{Config, LogConfig, RedirectConfig};
