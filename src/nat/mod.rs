//! NAT redirection module for transparent proxying
//!
//! This module installs iptables `nat` rules that divert chosen traffic to a
//! local port, and recovers the original destination of each diverted
//! connection.
//!
//! # Overview
//!
//! All rules live in one dedicated chain, hooked at the head of `OUTPUT`
//! (locally-originated traffic) and `PREROUTING` (traffic arriving from
//! containers or other hosts). The chain starts with an exemption for
//! loopback TCP, followed by one `REDIRECT` rule per `(protocol, address)`:
//!
//! ```text
//! -t nat -I OUTPUT 1 -j <CHAIN>
//! -t nat -I PREROUTING 1 -j <CHAIN>
//! -t nat -A <CHAIN> -j RETURN --dest 127.0.0.1/32 -p tcp
//! -t nat -A <CHAIN> -j REDIRECT --dest 10.0.0.1/32 -p tcp --to-ports 1080
//! ```
//!
//! # IPv4 Only
//!
//! Rules are installed with `iptables` (not `ip6tables`) and original
//! destinations are decoded as `sockaddr_in`. IPv6 destinations are
//! rejected with [`ResolveError::UnsupportedFamily`](crate::error::ResolveError).
//!
//! # Error Handling
//!
//! Lifecycle and table operations never stop half-way. Each returns a
//! [`SetupReport`](crate::error::SetupReport) listing any failed commands,
//! and every failure is logged. Resolution failures are returned as errors;
//! nothing is retried.
//!
//! # Requirements
//!
//! - `CAP_NET_ADMIN` capability (or root) for rule changes
//! - `nf_conntrack` loaded for `SO_ORIGINAL_DST`
//!
//! # Usage
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use nat_redirect::nat::{ChainName, Translator, default_rule_backend};
//!
//! # fn example(conn: std::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
//! let translator = Translator::new(ChainName::new("PROXY_REDIRECT")?, default_rule_backend()?);
//! translator.enable();
//! translator.forward_tcp(Ipv4Addr::new(10, 0, 0, 1), 1080);
//!
//! let dst = translator.resolve(&conn)?;
//! println!("client wanted {dst} ({:?})", dst.raw());
//!
//! translator.disable();
//! # Ok(())
//! # }
//! ```

mod backend;
mod chain;
mod resolve;
mod rule;
mod table;
mod translator;

pub use backend::{default_rule_backend, IptablesBackend, MemoryBackend, RuleBackend};
pub use chain::ChainController;
pub use resolve::{
    resolve, DestinationResolver, KernelQuery, OriginalDestination, OriginalDstQuery,
    ADDR_TYPE_IPV4, RAW_ADDR_LEN, SOCKADDR_IN_LEN, SO_ORIGINAL_DST,
};
pub use rule::{
    jump_rule, loopback_exempt_rule, redirect_rule, AddressKey, ChainName, Hook, Protocol,
    MAX_CHAIN_NAME_LEN, NAT_TABLE,
};
pub use table::{Redirect, RedirectionTable};
pub use translator::Translator;
