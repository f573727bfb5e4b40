//! Error types for nat-redirect
//!
//! Errors are split by tier. Rule manipulation failures ([`RuleError`]) are
//! collected into a [`SetupReport`] and never abort a lifecycle sequence.
//! Per-connection resolution failures ([`ResolveError`]) are returned to the
//! caller as-is.

use std::fmt;
use std::io;

use thiserror::Error;
use tracing::warn;

/// Top-level error type for nat-redirect
#[derive(Debug, Error)]
pub enum NatRedirectError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rule manipulation errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Original destination resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NatRedirectError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Rule(e) => e.is_recoverable(),
            Self::Resolve(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Kind of rule-manipulation command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleOp {
    /// `-L <chain>` used as an existence probe
    ChainExists,
    /// `-N`
    NewChain,
    /// `-F`
    FlushChain,
    /// `-X`
    DeleteChain,
    /// `-I <chain> <pos>`
    Insert,
    /// `-A`
    Append,
    /// `-D`
    Delete,
    /// `-C`
    Exists,
}

impl RuleOp {
    /// The iptables flag for this operation
    #[must_use]
    pub const fn flag(self) -> &'static str {
        match self {
            Self::ChainExists => "-L",
            Self::NewChain => "-N",
            Self::FlushChain => "-F",
            Self::DeleteChain => "-X",
            Self::Insert => "-I",
            Self::Append => "-A",
            Self::Delete => "-D",
            Self::Exists => "-C",
        }
    }
}

impl fmt::Display for RuleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

/// A failed rule-manipulation command
#[derive(Debug, Clone, Error)]
#[error("iptables -t {table} {op} {chain}{}: {reason}", rule_suffix(.rule))]
pub struct RuleError {
    /// Operation that failed
    pub op: RuleOp,
    /// Table the command targeted
    pub table: String,
    /// Chain the command targeted
    pub chain: String,
    /// Rule specification, for rule-level commands
    pub rule: Option<String>,
    /// Failure reason reported by the backend
    pub reason: String,
}

impl RuleError {
    /// Create a chain-level error (no rule specification)
    pub fn chain(
        op: RuleOp,
        table: impl Into<String>,
        chain: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            op,
            table: table.into(),
            chain: chain.into(),
            rule: None,
            reason: reason.into(),
        }
    }

    /// Create a rule-level error
    pub fn rule(
        op: RuleOp,
        table: impl Into<String>,
        chain: impl Into<String>,
        rule: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            op,
            table: table.into(),
            chain: chain.into(),
            rule: Some(rule.into()),
            reason: reason.into(),
        }
    }

    /// Rule commands are re-run by the next lifecycle call
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

#[allow(clippy::ref_option)]
fn rule_suffix(rule: &Option<String>) -> String {
    rule.as_deref().map(|r| format!(" {r}")).unwrap_or_default()
}

/// Original destination resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The connection's descriptor is not a usable socket
    #[error("Connection descriptor unavailable: {0}")]
    Descriptor(#[source] io::Error),

    /// getsockopt(SO_ORIGINAL_DST) failed
    #[error("SO_ORIGINAL_DST query failed (connection not redirected?): {0}")]
    Query(#[source] io::Error),

    /// The kernel returned a non-IPv4 socket address
    #[error("Unsupported address family {0} (only AF_INET is supported)")]
    UnsupportedFamily(u16),
}

impl ResolveError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Descriptor(_) | Self::UnsupportedFamily(_) => false,
            Self::Query(e) => e.kind() == io::ErrorKind::Interrupted,
        }
    }
}

/// Outcome of a best-effort rule sequence.
///
/// Every step of the sequence is attempted regardless of earlier failures;
/// the failures are collected here so they stay observable.
#[derive(Debug, Clone, Default)]
pub struct SetupReport {
    operation: &'static str,
    attempted: usize,
    failures: Vec<RuleError>,
}

impl SetupReport {
    /// Start an empty report for the named operation
    #[must_use]
    pub const fn new(operation: &'static str) -> Self {
        Self {
            operation,
            attempted: 0,
            failures: Vec::new(),
        }
    }

    /// Record the outcome of one step, logging it if it failed.
    ///
    /// Returns the step's value on success.
    pub fn step<T>(&mut self, result: std::result::Result<T, RuleError>) -> Option<T> {
        self.attempted += 1;
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(operation = self.operation, error = %e, "NAT: rule command failed");
                self.failures.push(e);
                None
            }
        }
    }

    /// Fold another report's steps into this one
    pub fn merge(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.failures.extend(other.failures);
    }

    /// Name of the operation this report covers
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }

    /// Number of commands attempted
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.attempted
    }

    /// Failed commands, in the order they were attempted
    #[must_use]
    pub fn failures(&self) -> &[RuleError] {
        &self.failures
    }

    /// True when every attempted command succeeded
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Convert into a `Result`, yielding the first failure if any
    ///
    /// # Errors
    ///
    /// Returns the first recorded `RuleError`.
    pub fn into_result(self) -> std::result::Result<(), RuleError> {
        match self.failures.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Display for SetupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} commands succeeded",
            self.operation,
            self.attempted - self.failures.len(),
            self.attempted
        )
    }
}

/// Type alias for Result with NatRedirectError
pub type Result<T> = std::result::Result<T, NatRedirectError>;
