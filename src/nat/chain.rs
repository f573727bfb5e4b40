//! Chain lifecycle
//!
//! [`ChainController`] owns the translator's dedicated chain in the `nat`
//! table and the jump rules that route `OUTPUT` and `PREROUTING` traffic
//! into it. Setup and teardown are fixed, re-runnable sequences: every step
//! is attempted and failures are collected in a [`SetupReport`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::backend::RuleBackend;
use super::rule::{jump_rule, loopback_exempt_rule, ChainName, Hook, NAT_TABLE};
use crate::error::{RuleError, RuleOp, SetupReport};

/// Upper bound on duplicate hook rules removed per hook point
const MAX_HOOK_COPIES: usize = 16;

/// Installs and removes the translator chain and its hooks
pub struct ChainController {
    chain: ChainName,
    backend: Arc<dyn RuleBackend>,
}

impl ChainController {
    /// Create a controller for the given chain
    pub fn new(chain: ChainName, backend: Arc<dyn RuleBackend>) -> Self {
        Self { chain, backend }
    }

    /// The managed chain
    #[must_use]
    pub const fn chain(&self) -> &ChainName {
        &self.chain
    }

    /// Install the chain and hook it in front of `OUTPUT` and `PREROUTING`.
    ///
    /// Sequence: remove stale hooks, create the chain if missing, flush it,
    /// append the loopback exemption, insert the hooks at position 1. The
    /// chain is populated before any hook points at it. Safe to call again
    /// on an already-enabled chain.
    pub fn enable(&self) -> SetupReport {
        let mut report = SetupReport::new("enable");
        let chain = self.chain.as_str();

        for hook in Hook::ALL {
            self.remove_hook(hook, &mut report);
        }

        match report.step(self.backend.chain_exists(NAT_TABLE, chain)) {
            Some(true) => debug!("NAT: reusing existing chain {chain}"),
            // Unknown existence: attempt creation and let it fail if present
            Some(false) | None => {
                report.step(self.backend.new_chain(NAT_TABLE, chain));
            }
        }

        report.step(self.backend.flush_chain(NAT_TABLE, chain));
        report.step(self.backend.append(NAT_TABLE, chain, &loopback_exempt_rule()));

        let jump = jump_rule(&self.chain);
        for hook in Hook::ALL {
            report.step(self.backend.insert(NAT_TABLE, hook.chain(), &jump, 1));
        }

        if report.is_clean() {
            info!("NAT: chain {chain} enabled");
        } else {
            warn!("NAT: chain {chain} enabled in degraded mode ({report})");
        }
        report
    }

    /// Unhook, flush and delete the chain.
    ///
    /// Connections redirected before this call keep their conntrack mapping.
    pub fn disable(&self) -> SetupReport {
        let mut report = SetupReport::new("disable");
        let chain = self.chain.as_str();

        for hook in Hook::ALL {
            self.remove_hook(hook, &mut report);
        }

        report.step(self.backend.flush_chain(NAT_TABLE, chain));
        report.step(self.backend.delete_chain(NAT_TABLE, chain));

        if report.is_clean() {
            info!("NAT: chain {chain} disabled");
        } else {
            warn!("NAT: chain {chain} disabled in degraded mode ({report})");
        }
        report
    }

    /// Whether the chain currently exists
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.backend
            .chain_exists(NAT_TABLE, self.chain.as_str())
            .unwrap_or(false)
    }

    /// Remove every copy of the jump rule from one hook point.
    ///
    /// A missing hook is not a failure. When the chain itself is gone,
    /// iptables cannot check for the rule, so the check error is skipped and
    /// a single blind delete is attempted instead; its failure is expected.
    /// Copies left over after [`MAX_HOOK_COPIES`] deletions are reported.
    fn remove_hook(&self, hook: Hook, report: &mut SetupReport) {
        let jump = jump_rule(&self.chain);

        for _ in 0..MAX_HOOK_COPIES {
            match self.backend.exists(NAT_TABLE, hook.chain(), &jump) {
                Ok(false) => return,
                Ok(true) => {
                    if report
                        .step(self.backend.delete(NAT_TABLE, hook.chain(), &jump))
                        .is_none()
                    {
                        return;
                    }
                    debug!("NAT: removed hook {hook} -> {}", self.chain);
                }
                Err(e) => {
                    debug!("NAT: hook check on {hook} failed ({e}), deleting blindly");
                    if self.backend.delete(NAT_TABLE, hook.chain(), &jump).is_err() {
                        return;
                    }
                }
            }
        }

        if let Ok(false) = self.backend.exists(NAT_TABLE, hook.chain(), &jump) {
            return;
        }
        report.step::<()>(Err(RuleError::rule(
            RuleOp::Delete,
            NAT_TABLE,
            hook.chain(),
            &jump,
            format!("more than {MAX_HOOK_COPIES} copies, giving up"),
        )));
    }
}

impl std::fmt::Debug for ChainController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainController")
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::backend::MemoryBackend;

    fn controller() -> (Arc<MemoryBackend>, ChainController) {
        let backend = Arc::new(MemoryBackend::new());
        let chain = ChainName::new("TEST_NAT").unwrap();
        let ctl = ChainController::new(chain, backend.clone());
        (backend, ctl)
    }

    #[test]
    fn test_enable_installs_chain_and_hooks() {
        let (backend, ctl) = controller();
        let report = ctl.enable();
        assert!(report.is_clean(), "{:?}", report.failures());

        assert!(ctl.is_installed());
        assert_eq!(
            backend.rules(NAT_TABLE, "TEST_NAT").unwrap(),
            vec!["-j RETURN --dest 127.0.0.1/32 -p tcp"]
        );
        assert_eq!(backend.rules(NAT_TABLE, "OUTPUT").unwrap(), vec!["-j TEST_NAT"]);
        assert_eq!(
            backend.rules(NAT_TABLE, "PREROUTING").unwrap(),
            vec!["-j TEST_NAT"]
        );
    }

    #[test]
    fn test_enable_is_idempotent() {
        let (backend, ctl) = controller();
        assert!(ctl.enable().is_clean());
        backend
            .append(NAT_TABLE, "TEST_NAT", "-j REDIRECT --dest 1.2.3.4/32 -p tcp --to-ports 80")
            .unwrap();

        let report = ctl.enable();
        assert!(report.is_clean(), "{:?}", report.failures());

        // Flushed back to just the exemption, hooks not duplicated
        assert_eq!(backend.rules(NAT_TABLE, "TEST_NAT").unwrap().len(), 1);
        assert_eq!(backend.rules(NAT_TABLE, "OUTPUT").unwrap(), vec!["-j TEST_NAT"]);
    }

    #[test]
    fn test_enable_hooks_in_front() {
        let (backend, ctl) = controller();
        backend.append(NAT_TABLE, "OUTPUT", "-j RETURN -p udp").unwrap();
        assert!(ctl.enable().is_clean());
        assert_eq!(
            backend.rules(NAT_TABLE, "OUTPUT").unwrap(),
            vec!["-j TEST_NAT", "-j RETURN -p udp"]
        );
    }

    #[test]
    fn test_enable_removes_duplicate_hooks() {
        let (backend, ctl) = controller();
        backend.new_chain(NAT_TABLE, "TEST_NAT").unwrap();
        for _ in 0..3 {
            backend.insert(NAT_TABLE, "OUTPUT", "-j TEST_NAT", 1).unwrap();
        }

        assert!(ctl.enable().is_clean());
        assert_eq!(backend.rules(NAT_TABLE, "OUTPUT").unwrap(), vec!["-j TEST_NAT"]);
    }

    #[test]
    fn test_enable_removes_hooks_up_to_cap() {
        let (backend, ctl) = controller();
        backend.new_chain(NAT_TABLE, "TEST_NAT").unwrap();
        for _ in 0..MAX_HOOK_COPIES {
            backend.insert(NAT_TABLE, "OUTPUT", "-j TEST_NAT", 1).unwrap();
        }

        let report = ctl.enable();
        assert!(report.is_clean(), "{:?}", report.failures());
        assert_eq!(backend.rules(NAT_TABLE, "OUTPUT").unwrap(), vec!["-j TEST_NAT"]);
    }

    #[test]
    fn test_enable_reports_hooks_beyond_cap() {
        let (backend, ctl) = controller();
        backend.new_chain(NAT_TABLE, "TEST_NAT").unwrap();
        for _ in 0..=MAX_HOOK_COPIES {
            backend.insert(NAT_TABLE, "OUTPUT", "-j TEST_NAT", 1).unwrap();
        }

        let report = ctl.enable();
        assert_eq!(report.failures().len(), 1);
        let failure = &report.failures()[0];
        assert_eq!(failure.op, RuleOp::Delete);
        assert_eq!(failure.chain, "OUTPUT");
        assert_eq!(backend.rules(NAT_TABLE, "OUTPUT").unwrap().len(), 2);

        // Running it again clears the leftover
        assert!(ctl.enable().is_clean());
        assert_eq!(backend.rules(NAT_TABLE, "OUTPUT").unwrap(), vec!["-j TEST_NAT"]);
    }

    #[test]
    fn test_enable_populates_chain_before_hooking() {
        let (backend, ctl) = controller();
        ctl.enable();

        let history = backend.history();
        let exempt = history
            .iter()
            .position(|c| c.contains("-A TEST_NAT -j RETURN"))
            .unwrap();
        let first_hook = history
            .iter()
            .position(|c| c.contains("-I OUTPUT 1 -j TEST_NAT"))
            .unwrap();
        assert!(exempt < first_hook);
    }

    #[test]
    fn test_enable_then_disable_leaves_nothing() {
        let (backend, ctl) = controller();
        assert!(ctl.enable().is_clean());
        let report = ctl.disable();
        assert!(report.is_clean(), "{:?}", report.failures());

        assert!(!ctl.is_installed());
        assert!(backend.user_chains(NAT_TABLE).is_empty());
        assert!(backend.rules(NAT_TABLE, "OUTPUT").unwrap().is_empty());
        assert!(backend.rules(NAT_TABLE, "PREROUTING").unwrap().is_empty());
    }

    #[test]
    fn test_disable_without_enable_reports_failures() {
        let (_backend, ctl) = controller();
        let report = ctl.disable();

        // Flush and delete of a missing chain fail; the sequence still completes
        let ops: Vec<RuleOp> = report.failures().iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![RuleOp::FlushChain, RuleOp::DeleteChain]);
    }

    #[test]
    fn test_enable_degraded_mode_continues() {
        let (backend, ctl) = controller();
        backend.set_failing(RuleOp::FlushChain, true);

        let report = ctl.enable();
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].op, RuleOp::FlushChain);

        // Later steps still ran
        assert_eq!(backend.rules(NAT_TABLE, "OUTPUT").unwrap(), vec!["-j TEST_NAT"]);
        assert_eq!(backend.rules(NAT_TABLE, "TEST_NAT").unwrap().len(), 1);
    }
}
