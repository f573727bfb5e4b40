//! Redirection table
//!
//! Maps `(protocol, address)` keys to the local port their traffic is
//! redirected to, and keeps exactly one redirect rule per key in the
//! translator chain. The in-memory map is the source of truth for which
//! rule is installed: clearing a key deletes the rule recorded for it, never
//! a caller-supplied one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::backend::RuleBackend;
use super::rule::{redirect_rule, AddressKey, ChainName, NAT_TABLE};
use crate::error::SetupReport;

/// A single installed redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect {
    /// Matched traffic
    pub key: AddressKey,
    /// Local port the traffic is delivered to
    pub port: u16,
}

/// Redirect rules installed in the translator chain
pub struct RedirectionTable {
    chain: ChainName,
    backend: Arc<dyn RuleBackend>,
    entries: Mutex<HashMap<AddressKey, u16>>,
}

impl RedirectionTable {
    /// Create an empty table for the given chain
    pub fn new(chain: ChainName, backend: Arc<dyn RuleBackend>) -> Self {
        Self {
            chain,
            backend,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Redirect traffic for `key` to local port `to_port`.
    ///
    /// Any rule previously installed for `key` is deleted before the new one
    /// is appended, all under the table lock, so two rules for the same key
    /// never coexist. The mapping is recorded only if the append succeeded.
    pub fn forward(&self, key: AddressKey, to_port: u16) -> SetupReport {
        let mut report = SetupReport::new("forward");
        let mut entries = self.entries.lock();

        self.clear_locked(&mut entries, key, &mut report);
        if entries.contains_key(&key) {
            // The old rule could not be removed; appending would leave two
            debug!("NAT: keeping previous redirect for {key}");
            return report;
        }

        let rule = redirect_rule(key, to_port);
        if report
            .step(self.backend.append(NAT_TABLE, self.chain.as_str(), &rule))
            .is_some()
        {
            entries.insert(key, to_port);
            info!("NAT: redirecting {key} -> :{to_port}");
        }
        report
    }

    /// Remove the redirect for `key`, if any.
    ///
    /// No command is issued when the key has no mapping.
    pub fn clear(&self, key: AddressKey) -> SetupReport {
        let mut report = SetupReport::new("clear");
        let mut entries = self.entries.lock();
        self.clear_locked(&mut entries, key, &mut report);
        report
    }

    /// Port currently mapped for `key`
    #[must_use]
    pub fn get(&self, key: AddressKey) -> Option<u16> {
        self.entries.lock().get(&key).copied()
    }

    /// Snapshot of every mapping, sorted by key
    #[must_use]
    pub fn mappings(&self) -> Vec<Redirect> {
        let mut out: Vec<Redirect> = self
            .entries
            .lock()
            .iter()
            .map(|(key, port)| Redirect {
                key: *key,
                port: *port,
            })
            .collect();
        out.sort_by_key(|r| r.key);
        out
    }

    /// Number of mappings
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table has no mappings
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every mapping without touching rules.
    ///
    /// Used after the chain has been flushed and deleted.
    pub fn forget_all(&self) {
        let mut entries = self.entries.lock();
        if !entries.is_empty() {
            debug!("NAT: forgetting {} redirects", entries.len());
            entries.clear();
        }
    }

    fn clear_locked(
        &self,
        entries: &mut HashMap<AddressKey, u16>,
        key: AddressKey,
        report: &mut SetupReport,
    ) {
        let Some(previous) = entries.get(&key).copied() else {
            return;
        };

        let rule = redirect_rule(key, previous);
        if report
            .step(self.backend.delete(NAT_TABLE, self.chain.as_str(), &rule))
            .is_some()
        {
            entries.remove(&key);
            info!("NAT: cleared redirect {key} -> :{previous}");
        }
    }
}

impl std::fmt::Debug for RedirectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectionTable")
            .field("chain", &self.chain)
            .field("entries", &*self.entries.lock())
            .finish_non_exhaustive()
    }
}
