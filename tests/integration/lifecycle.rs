//! Chain lifecycle through the public Translator API

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nat_redirect::error::{RuleError, RuleOp};
use nat_redirect::nat::{ChainName, MemoryBackend, RuleBackend, Translator, NAT_TABLE};

const CHAIN: &str = "IT_REDIRECT";

fn setup() -> (Arc<MemoryBackend>, Translator) {
    let backend = Arc::new(MemoryBackend::new());
    let translator = Translator::new(ChainName::new(CHAIN).unwrap(), backend.clone());
    (backend, translator)
}

fn hooks(backend: &MemoryBackend) -> usize {
    ["OUTPUT", "PREROUTING"]
        .iter()
        .map(|c| {
            backend
                .rules(NAT_TABLE, c)
                .unwrap()
                .iter()
                .filter(|r| r.as_str() == format!("-j {CHAIN}"))
                .count()
        })
        .sum()
}

#[test]
fn test_enable_disable_leaves_no_trace() {
    let (backend, translator) = setup();

    assert!(translator.enable().is_clean());
    assert_eq!(hooks(&backend), 2);

    assert!(translator.disable().is_clean());
    assert_eq!(hooks(&backend), 0);
    assert!(backend.user_chains(NAT_TABLE).is_empty());
}

#[test]
fn test_disable_with_active_redirects() {
    let (backend, translator) = setup();
    translator.enable();
    translator.forward_tcp(Ipv4Addr::new(10, 0, 0, 1), 1080);
    translator.forward_udp(Ipv4Addr::new(10, 0, 0, 2), 5353);

    assert!(translator.disable().is_clean());
    assert!(backend.user_chains(NAT_TABLE).is_empty());
    assert!(translator.mappings().is_empty());
}

#[test]
fn test_repeated_enable_keeps_single_hooks() {
    let (backend, translator) = setup();
    for _ in 0..3 {
        assert!(translator.enable().is_clean());
    }
    assert_eq!(hooks(&backend), 2);
    assert_eq!(backend.rules(NAT_TABLE, CHAIN).unwrap().len(), 1);
}

#[test]
fn test_enable_recovers_from_stale_state() {
    let (backend, translator) = setup();

    // A previous instance crashed with hooks and redirects still installed
    backend.new_chain(NAT_TABLE, CHAIN).unwrap();
    backend
        .append(NAT_TABLE, CHAIN, "-j REDIRECT --dest 10.9.9.9/32 -p tcp --to-ports 9")
        .unwrap();
    backend.insert(NAT_TABLE, "OUTPUT", &format!("-j {CHAIN}"), 1).unwrap();
    backend.insert(NAT_TABLE, "OUTPUT", &format!("-j {CHAIN}"), 1).unwrap();

    assert!(translator.enable().is_clean());
    assert_eq!(hooks(&backend), 2);
    assert_eq!(
        backend.rules(NAT_TABLE, CHAIN).unwrap(),
        vec!["-j RETURN --dest 127.0.0.1/32 -p tcp"]
    );
}

/// Backend that fails the first `n` appends, then delegates
struct FlakyAppend {
    inner: MemoryBackend,
    remaining: AtomicUsize,
}

impl RuleBackend for FlakyAppend {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, RuleError> {
        self.inner.chain_exists(table, chain)
    }
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        self.inner.new_chain(table, chain)
    }
    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        self.inner.flush_chain(table, chain)
    }
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        self.inner.delete_chain(table, chain)
    }
    fn insert(&self, table: &str, chain: &str, rule: &str, pos: i32) -> Result<(), RuleError> {
        self.inner.insert(table, chain, rule, pos)
    }
    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), RuleError> {
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RuleError::rule(RuleOp::Append, table, chain, rule, "resource busy"));
        }
        self.inner.append(table, chain, rule)
    }
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), RuleError> {
        self.inner.delete(table, chain, rule)
    }
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, RuleError> {
        self.inner.exists(table, chain, rule)
    }
}

#[test]
fn test_degraded_enable_is_self_correcting() {
    let backend = Arc::new(FlakyAppend {
        inner: MemoryBackend::new(),
        remaining: AtomicUsize::new(1),
    });
    let translator = Translator::new(ChainName::new(CHAIN).unwrap(), backend.clone());

    // Loopback exemption append fails; everything else still happens
    let report = translator.enable();
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].op, RuleOp::Append);
    assert!(translator.is_enabled());
    assert!(backend.inner.rules(NAT_TABLE, CHAIN).unwrap().is_empty());

    // Re-running the lifecycle converges
    assert!(translator.enable().is_clean());
    assert_eq!(
        backend.inner.rules(NAT_TABLE, CHAIN).unwrap(),
        vec!["-j RETURN --dest 127.0.0.1/32 -p tcp"]
    );
}
