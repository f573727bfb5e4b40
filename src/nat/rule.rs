//! Rule vocabulary
//!
//! Typed building blocks for the rules the translator installs in the
//! `nat` table. The rendered argument strings are the same ones the
//! `iptables` command line accepts, so existing tooling can inspect and
//! remove them.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The packet-filter table every rule lives in
pub const NAT_TABLE: &str = "nat";

/// Longest chain name iptables accepts (`XT_EXTENSION_MAXNAMELEN - 1`)
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Names the kernel reserves for built-in chains and standard targets
const RESERVED_NAMES: &[&str] = &[
    "PREROUTING",
    "INPUT",
    "FORWARD",
    "OUTPUT",
    "POSTROUTING",
    "ACCEPT",
    "DROP",
    "RETURN",
    "QUEUE",
    "REDIRECT",
    "DNAT",
    "SNAT",
    "MASQUERADE",
];

/// Transport protocol matched by a redirect rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl Protocol {
    /// The name iptables expects after `-p`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(ConfigError::ValidationError(format!(
                "Unsupported protocol '{other}' (expected tcp or udp)"
            ))),
        }
    }
}

/// Built-in chain a jump to the translator chain is hooked into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Locally-originated traffic
    Output,
    /// Traffic arriving for routing (containers, other hosts)
    Prerouting,
}

impl Hook {
    /// Both hook points, in installation order
    pub const ALL: [Self; 2] = [Self::Output, Self::Prerouting];

    /// Built-in chain name
    #[must_use]
    pub const fn chain(self) -> &'static str {
        match self {
            Self::Output => "OUTPUT",
            Self::Prerouting => "PREROUTING",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.chain())
    }
}

/// Lookup key of the redirection table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressKey {
    /// Matched protocol
    pub protocol: Protocol,
    /// Matched destination address
    pub ip: Ipv4Addr,
}

impl AddressKey {
    /// Create a new key
    #[must_use]
    pub const fn new(protocol: Protocol, ip: Ipv4Addr) -> Self {
        Self { protocol, ip }
    }

    /// Create a TCP key
    #[must_use]
    pub const fn tcp(ip: Ipv4Addr) -> Self {
        Self::new(Protocol::Tcp, ip)
    }

    /// Create a UDP key
    #[must_use]
    pub const fn udp(ip: Ipv4Addr) -> Self {
        Self::new(Protocol::Udp, ip)
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.ip)
    }
}

/// Validated name of the translator's chain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainName(String);

impl ChainName {
    /// Validate and wrap a chain name.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the name is empty, longer
    /// than [`MAX_CHAIN_NAME_LEN`], contains whitespace, starts with `-`, or
    /// collides with a built-in chain or target.
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();

        if name.is_empty() {
            return Err(ConfigError::ValidationError(
                "Chain name cannot be empty".into(),
            ));
        }

        if name.len() > MAX_CHAIN_NAME_LEN {
            return Err(ConfigError::ValidationError(format!(
                "Chain name '{name}' too long (max {MAX_CHAIN_NAME_LEN} chars)"
            )));
        }

        if name.starts_with('-') || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ConfigError::ValidationError(format!(
                "Chain name '{name}' contains invalid characters"
            )));
        }

        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Chain name '{name}' is reserved"
            )));
        }

        Ok(Self(name))
    }

    /// The chain name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChainName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ChainName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Jump rule placed in a built-in chain: `-j <CHAIN>`
#[must_use]
pub fn jump_rule(chain: &ChainName) -> String {
    format!("-j {chain}")
}

/// Rule letting loopback TCP traffic through un-redirected
#[must_use]
pub fn loopback_exempt_rule() -> String {
    format!("-j RETURN --dest {}/32 -p {}", Ipv4Addr::LOCALHOST, Protocol::Tcp)
}

/// Redirect rule for one address key
#[must_use]
pub fn redirect_rule(key: AddressKey, to_port: u16) -> String {
    format!(
        "-j REDIRECT --dest {}/32 -p {} --to-ports {to_port}",
        key.ip, key.protocol
    )
}
