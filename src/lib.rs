//! nat-redirect: kernel traffic interception for transparent proxies
//!
//! This crate installs iptables `nat` rules that divert selected outbound
//! and forwarded traffic to a local proxy port, and recovers the original
//! destination of each diverted connection via `SO_ORIGINAL_DST`.
//!
//! # Architecture
//!
//! ```text
//! Client → OUTPUT/PREROUTING → <CHAIN> REDIRECT → proxy listener
//!                                                    ↓
//!                                        Translator::resolve (SO_ORIGINAL_DST)
//!                                                    ↓
//!                                         original ip:port for relaying
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use nat_redirect::config::load_config;
//! use nat_redirect::nat::Translator;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/nat-redirect/config.json")?;
//! let translator = Translator::from_config(&config)?;
//!
//! translator.enable();
//! translator.apply_redirects(&config.redirects);
//!
//! // Accept connections and call translator.resolve(&stream)...
//!
//! translator.disable();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`nat`]: Chain lifecycle, redirection table and destination recovery

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod nat;

// Re-export commonly used types at the crate root
pub use config::{Config, LogConfig, RedirectConfig};
pub use error::{ConfigError, NatRedirectError, ResolveError, RuleError, SetupReport};
pub use nat::{OriginalDestination, Protocol, Translator};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    // SAFETY: geteuid takes no arguments and cannot fail
    unsafe { libc::geteuid() == 0 }
}
