//! Translator facade
//!
//! [`Translator`] is what the proxy lifecycle manager holds: one chain, one
//! redirection table and one destination resolver over a shared rule
//! backend.

use std::net::Ipv4Addr;
use std::os::fd::AsFd;
use std::sync::Arc;

use tracing::info;

use super::backend::{IptablesBackend, MemoryBackend, RuleBackend};
use super::chain::ChainController;
use super::resolve::{DestinationResolver, OriginalDestination};
use super::rule::{AddressKey, ChainName, Protocol};
use super::table::{Redirect, RedirectionTable};
use crate::config::{Config, RedirectConfig};
use crate::error::{ResolveError, Result, SetupReport};

/// Kernel NAT redirection for one proxy instance
pub struct Translator {
    chain: ChainController,
    table: RedirectionTable,
    resolver: DestinationResolver,
}

impl Translator {
    /// Create a translator over the given backend, resolving with the kernel
    pub fn new(chain: ChainName, backend: Arc<dyn RuleBackend>) -> Self {
        Self::with_resolver(chain, backend, DestinationResolver::kernel())
    }

    /// Create a translator with a custom destination resolver
    pub fn with_resolver(
        chain: ChainName,
        backend: Arc<dyn RuleBackend>,
        resolver: DestinationResolver,
    ) -> Self {
        Self {
            chain: ChainController::new(chain.clone(), backend.clone()),
            table: RedirectionTable::new(chain, backend),
            resolver,
        }
    }

    /// Build a translator from configuration.
    ///
    /// Uses [`MemoryBackend`] when `dry_run` is set, [`IptablesBackend`]
    /// otherwise. Configured redirects are not applied here; see
    /// [`Translator::apply_redirects`].
    ///
    /// # Errors
    ///
    /// Returns an error if the chain name is invalid or `iptables` cannot be
    /// executed.
    pub fn from_config(config: &Config) -> Result<Self> {
        let chain = ChainName::new(config.chain.clone())?;
        let backend: Arc<dyn RuleBackend> = if config.dry_run {
            info!("NAT: dry run, rules are kept in memory only");
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(IptablesBackend::new()?)
        };
        Ok(Self::new(chain, backend))
    }

    /// Name of the managed chain
    #[must_use]
    pub const fn chain_name(&self) -> &ChainName {
        self.chain.chain()
    }

    /// Install the chain and its hooks. Re-runnable.
    pub fn enable(&self) -> SetupReport {
        self.chain.enable()
    }

    /// Remove hooks and chain, then forget all redirects.
    pub fn disable(&self) -> SetupReport {
        let report = self.chain.disable();
        self.table.forget_all();
        report
    }

    /// Whether the chain currently exists
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.chain.is_installed()
    }

    /// Redirect `protocol` traffic for `ip` to local port `to_port`
    pub fn forward(&self, protocol: Protocol, ip: Ipv4Addr, to_port: u16) -> SetupReport {
        self.table.forward(AddressKey::new(protocol, ip), to_port)
    }

    /// Redirect TCP traffic for `ip` to local port `to_port`
    pub fn forward_tcp(&self, ip: Ipv4Addr, to_port: u16) -> SetupReport {
        self.forward(Protocol::Tcp, ip, to_port)
    }

    /// Redirect UDP traffic for `ip` to local port `to_port`
    pub fn forward_udp(&self, ip: Ipv4Addr, to_port: u16) -> SetupReport {
        self.forward(Protocol::Udp, ip, to_port)
    }

    /// Stop redirecting `protocol` traffic for `ip`
    pub fn clear(&self, protocol: Protocol, ip: Ipv4Addr) -> SetupReport {
        self.table.clear(AddressKey::new(protocol, ip))
    }

    /// Stop redirecting TCP traffic for `ip`
    pub fn clear_tcp(&self, ip: Ipv4Addr) -> SetupReport {
        self.clear(Protocol::Tcp, ip)
    }

    /// Stop redirecting UDP traffic for `ip`
    pub fn clear_udp(&self, ip: Ipv4Addr) -> SetupReport {
        self.clear(Protocol::Udp, ip)
    }

    /// Install every configured redirect
    pub fn apply_redirects(&self, redirects: &[RedirectConfig]) -> SetupReport {
        let mut report = SetupReport::new("apply_redirects");
        for r in redirects {
            report.merge(self.forward(r.protocol, r.address, r.port));
        }
        report
    }

    /// Snapshot of active redirects, sorted by key
    #[must_use]
    pub fn mappings(&self) -> Vec<Redirect> {
        self.table.mappings()
    }

    /// Original destination of a redirected connection.
    ///
    /// # Errors
    ///
    /// See [`DestinationResolver::resolve`].
    pub fn resolve<S: AsFd>(&self, conn: &S) -> std::result::Result<OriginalDestination, ResolveError> {
        self.resolver.resolve(conn)
    }

    /// The resolver, for handing to connection tasks
    #[must_use]
    pub const fn resolver(&self) -> &DestinationResolver {
        &self.resolver
    }
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("chain", &self.chain)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
