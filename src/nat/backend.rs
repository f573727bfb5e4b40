//! Rule backends
//!
//! The translator talks to the packet filter through the [`RuleBackend`]
//! trait, one method per administrative command. Production code uses
//! [`IptablesBackend`], which drives the `iptables` binary. [`MemoryBackend`]
//! models the `nat` table in memory with the same acceptance rules as the
//! kernel; it backs dry-run mode and the test suite.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RuleError, RuleOp};

/// Abstraction over the rule-manipulation commands the translator issues.
///
/// Rule specifications are iptables argument strings such as
/// `-j REDIRECT --dest 10.0.0.1/32 -p tcp --to-ports 8080`. All methods are
/// synchronous.
pub trait RuleBackend: Send + Sync {
    /// Whether a chain exists in the table
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the table cannot be queried.
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, RuleError>;

    /// Create a user chain (`-N`)
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the chain exists or creation fails.
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), RuleError>;

    /// Remove every rule from a chain (`-F`)
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the chain does not exist.
    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), RuleError>;

    /// Delete an empty, unreferenced user chain (`-X`)
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the chain is missing, non-empty or referenced.
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), RuleError>;

    /// Insert a rule at a 1-based position (`-I`)
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the chain or jump target is missing.
    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32)
        -> Result<(), RuleError>;

    /// Append a rule (`-A`)
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the chain or jump target is missing.
    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), RuleError>;

    /// Delete the first matching rule (`-D`)
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if no such rule exists.
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), RuleError>;

    /// Whether a matching rule exists (`-C`)
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the chain does not exist.
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, RuleError>;
}

// =============================================================================
// iptables backend
// =============================================================================

/// Production backend driving the IPv4 `iptables` binary.
///
/// Requires `CAP_NET_ADMIN`. Concurrent invocations from other tools are
/// serialized by the xtables lock (`-w`), which the `iptables` crate passes
/// when the installed binary supports it.
pub struct IptablesBackend {
    inner: iptables::IPTables,
}

impl IptablesBackend {
    /// Locate the `iptables` binary and probe its capabilities.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `iptables` cannot be executed.
    pub fn new() -> io::Result<Self> {
        let inner = iptables::new(false)
            .map_err(|e| io::Error::other(format!("iptables unavailable: {e}")))?;
        debug!("NAT: using iptables backend");
        Ok(Self { inner })
    }
}

impl fmt::Debug for IptablesBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IptablesBackend").finish_non_exhaustive()
    }
}

impl RuleBackend for IptablesBackend {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, RuleError> {
        debug!("NAT: iptables -t {table} -L {chain}");
        self.inner
            .chain_exists(table, chain)
            .map_err(|e| RuleError::chain(RuleOp::ChainExists, table, chain, e.to_string()))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        debug!("NAT: iptables -t {table} -N {chain}");
        self.inner
            .new_chain(table, chain)
            .map_err(|e| RuleError::chain(RuleOp::NewChain, table, chain, e.to_string()))
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        debug!("NAT: iptables -t {table} -F {chain}");
        self.inner
            .flush_chain(table, chain)
            .map_err(|e| RuleError::chain(RuleOp::FlushChain, table, chain, e.to_string()))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        debug!("NAT: iptables -t {table} -X {chain}");
        self.inner
            .delete_chain(table, chain)
            .map_err(|e| RuleError::chain(RuleOp::DeleteChain, table, chain, e.to_string()))
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<(), RuleError> {
        debug!("NAT: iptables -t {table} -I {chain} {position} {rule}");
        self.inner
            .insert(table, chain, rule, position)
            .map_err(|e| RuleError::rule(RuleOp::Insert, table, chain, rule, e.to_string()))
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), RuleError> {
        debug!("NAT: iptables -t {table} -A {chain} {rule}");
        self.inner
            .append(table, chain, rule)
            .map_err(|e| RuleError::rule(RuleOp::Append, table, chain, rule, e.to_string()))
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), RuleError> {
        debug!("NAT: iptables -t {table} -D {chain} {rule}");
        self.inner
            .delete(table, chain, rule)
            .map_err(|e| RuleError::rule(RuleOp::Delete, table, chain, rule, e.to_string()))
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, RuleError> {
        self.inner
            .exists(table, chain, rule)
            .map_err(|e| RuleError::rule(RuleOp::Exists, table, chain, rule, e.to_string()))
    }
}

/// Get the default rule backend (production implementation).
///
/// # Errors
///
/// Returns an I/O error if `iptables` cannot be executed.
pub fn default_rule_backend() -> io::Result<Arc<dyn RuleBackend>> {
    Ok(Arc::new(IptablesBackend::new()?))
}

// =============================================================================
// In-memory backend
// =============================================================================

/// Built-in chains of the `nat` table
const BUILTIN_CHAINS: &[&str] = &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

/// Targets that are not chains
const STANDARD_TARGETS: &[&str] = &[
    "ACCEPT",
    "DROP",
    "RETURN",
    "QUEUE",
    "REDIRECT",
    "DNAT",
    "SNAT",
    "MASQUERADE",
];

#[derive(Debug, Default)]
struct MemoryState {
    /// table -> chain -> rules, in evaluation order
    tables: HashMap<String, HashMap<String, Vec<String>>>,
    /// Operations forced to fail
    failing: HashSet<RuleOp>,
    /// Every command issued, rendered as iptables arguments
    history: Vec<String>,
}

impl MemoryState {
    fn table(&mut self, table: &str) -> &mut HashMap<String, Vec<String>> {
        self.tables.entry(table.to_owned()).or_insert_with(|| {
            BUILTIN_CHAINS
                .iter()
                .map(|c| ((*c).to_owned(), Vec::new()))
                .collect()
        })
    }

    fn record(&mut self, op: RuleOp, table: &str, chain: &str, extra: Option<&str>) {
        let line = match extra {
            Some(extra) => format!("-t {table} {} {chain} {extra}", op.flag()),
            None => format!("-t {table} {} {chain}", op.flag()),
        };
        self.history.push(line);
    }

    /// Reject a rule whose `-j` target is neither a standard target nor a chain
    fn check_target(&mut self, table: &str, rule: &str) -> Result<(), String> {
        let mut words = rule.split_whitespace();
        while let Some(word) = words.next() {
            if word == "-j" {
                let target = words.next().ok_or("option \"-j\" requires an argument")?;
                if STANDARD_TARGETS.contains(&target) || self.table(table).contains_key(target) {
                    return Ok(());
                }
                return Err(format!("Couldn't load target `{target}'"));
            }
        }
        Ok(())
    }
}

/// Normalize whitespace so equivalent rule strings compare equal
fn normalize(rule: &str) -> String {
    rule.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// In-memory model of an iptables table set.
///
/// Enforces the same acceptance rules the kernel does for the commands the
/// translator issues, so sequencing mistakes surface as errors. Commands are
/// logged at `debug` and kept in [`MemoryBackend::history`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Create an empty backend (built-in chains only)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Force every future command of the given kind to fail (or stop doing so)
    pub fn set_failing(&self, op: RuleOp, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Rules of a chain, or `None` if the chain does not exist
    #[must_use]
    pub fn rules(&self, table: &str, chain: &str) -> Option<Vec<String>> {
        self.state.lock().table(table).get(chain).cloned()
    }

    /// Names of the non-built-in chains of a table, sorted
    #[must_use]
    pub fn user_chains(&self, table: &str) -> Vec<String> {
        let mut state = self.state.lock();
        let mut chains: Vec<String> = state
            .table(table)
            .keys()
            .filter(|c| !BUILTIN_CHAINS.contains(&c.as_str()))
            .cloned()
            .collect();
        chains.sort();
        chains
    }

    /// Every command issued so far, in order
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    /// Forget the command history
    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }

    fn fail_if_forced(state: &MemoryState, op: RuleOp) -> Result<(), String> {
        if state.failing.contains(&op) {
            return Err("simulated failure".into());
        }
        Ok(())
    }
}

impl RuleBackend for MemoryBackend {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, RuleError> {
        let mut state = self.state.lock();
        Self::fail_if_forced(&state, RuleOp::ChainExists)
            .map_err(|e| RuleError::chain(RuleOp::ChainExists, table, chain, e))?;
        Ok(state.table(table).contains_key(chain))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        let mut state = self.state.lock();
        state.record(RuleOp::NewChain, table, chain, None);
        debug!("NAT: (memory) -t {table} -N {chain}");
        let err = |reason: &str| RuleError::chain(RuleOp::NewChain, table, chain, reason);

        Self::fail_if_forced(&state, RuleOp::NewChain).map_err(|e| err(&e))?;
        let chains = state.table(table);
        if chains.contains_key(chain) {
            return Err(err("Chain already exists."));
        }
        chains.insert(chain.to_owned(), Vec::new());
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        let mut state = self.state.lock();
        state.record(RuleOp::FlushChain, table, chain, None);
        debug!("NAT: (memory) -t {table} -F {chain}");
        let err = |reason: &str| RuleError::chain(RuleOp::FlushChain, table, chain, reason);

        Self::fail_if_forced(&state, RuleOp::FlushChain).map_err(|e| err(&e))?;
        match state.table(table).get_mut(chain) {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(err("No chain/target/match by that name.")),
        }
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        let mut state = self.state.lock();
        state.record(RuleOp::DeleteChain, table, chain, None);
        debug!("NAT: (memory) -t {table} -X {chain}");
        let err = |reason: &str| RuleError::chain(RuleOp::DeleteChain, table, chain, reason);

        Self::fail_if_forced(&state, RuleOp::DeleteChain).map_err(|e| err(&e))?;
        if BUILTIN_CHAINS.contains(&chain) {
            return Err(err("Can't delete built-in chain."));
        }

        let chains = state.table(table);
        match chains.get(chain) {
            None => return Err(err("No chain/target/match by that name.")),
            Some(rules) if !rules.is_empty() => return Err(err("Directory not empty.")),
            Some(_) => {}
        }

        let jump = format!("-j {chain}");
        if chains.values().flatten().any(|r| r == &jump) {
            return Err(err("Too many links."));
        }

        chains.remove(chain);
        Ok(())
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<(), RuleError> {
        let rule = normalize(rule);
        let mut state = self.state.lock();
        state.record(RuleOp::Insert, table, chain, Some(&format!("{position} {rule}")));
        debug!("NAT: (memory) -t {table} -I {chain} {position} {rule}");
        let err = |reason: &str| RuleError::rule(RuleOp::Insert, table, chain, &rule, reason);

        Self::fail_if_forced(&state, RuleOp::Insert).map_err(|e| err(&e))?;
        state.check_target(table, &rule).map_err(|e| err(&e))?;
        let rules = state
            .table(table)
            .get_mut(chain)
            .ok_or_else(|| err("No chain/target/match by that name."))?;

        let index = usize::try_from(position)
            .ok()
            .and_then(|p| p.checked_sub(1))
            .filter(|i| *i <= rules.len())
            .ok_or_else(|| err("Index of insertion too big."))?;
        rules.insert(index, rule.clone());
        Ok(())
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), RuleError> {
        let rule = normalize(rule);
        let mut state = self.state.lock();
        state.record(RuleOp::Append, table, chain, Some(&rule));
        debug!("NAT: (memory) -t {table} -A {chain} {rule}");
        let err = |reason: &str| RuleError::rule(RuleOp::Append, table, chain, &rule, reason);

        Self::fail_if_forced(&state, RuleOp::Append).map_err(|e| err(&e))?;
        state.check_target(table, &rule).map_err(|e| err(&e))?;
        state
            .table(table)
            .get_mut(chain)
            .ok_or_else(|| err("No chain/target/match by that name."))?
            .push(rule.clone());
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), RuleError> {
        let rule = normalize(rule);
        let mut state = self.state.lock();
        state.record(RuleOp::Delete, table, chain, Some(&rule));
        debug!("NAT: (memory) -t {table} -D {chain} {rule}");
        let err = |reason: &str| RuleError::rule(RuleOp::Delete, table, chain, &rule, reason);

        Self::fail_if_forced(&state, RuleOp::Delete).map_err(|e| err(&e))?;
        let rules = state
            .table(table)
            .get_mut(chain)
            .ok_or_else(|| err("No chain/target/match by that name."))?;
        let index = rules
            .iter()
            .position(|r| *r == rule)
            .ok_or_else(|| err("Bad rule (does a matching rule exist in that chain?)."))?;
        rules.remove(index);
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, RuleError> {
        let rule = normalize(rule);
        let mut state = self.state.lock();
        Self::fail_if_forced(&state, RuleOp::Exists)
            .map_err(|e| RuleError::rule(RuleOp::Exists, table, chain, &rule, e))?;
        state
            .table(table)
            .get(chain)
            .map(|rules| rules.contains(&rule))
            .ok_or_else(|| {
                RuleError::rule(
                    RuleOp::Exists,
                    table,
                    chain,
                    &rule,
                    "No chain/target/match by that name.",
                )
            })
    }
}
