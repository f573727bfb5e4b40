//! Redirection table behaviour through the public Translator API

use std::net::Ipv4Addr;
use std::sync::Arc;

use nat_redirect::config::load_config_str;
use nat_redirect::nat::{
    redirect_rule, AddressKey, ChainName, MemoryBackend, Protocol, Translator, NAT_TABLE,
};

const CHAIN: &str = "IT_TABLE";

fn enabled() -> (Arc<MemoryBackend>, Translator) {
    let backend = Arc::new(MemoryBackend::new());
    let translator = Translator::new(ChainName::new(CHAIN).unwrap(), backend.clone());
    assert!(translator.enable().is_clean());
    (backend, translator)
}

fn redirect_rules(backend: &MemoryBackend, key: AddressKey) -> Vec<String> {
    let prefix = format!("-j REDIRECT --dest {}/32 -p {} ", key.ip, key.protocol);
    backend
        .rules(NAT_TABLE, CHAIN)
        .unwrap()
        .into_iter()
        .filter(|r| r.starts_with(&prefix))
        .collect()
}

#[test]
fn test_forward_clear_leaves_nothing() {
    let (backend, translator) = enabled();
    let addresses = [
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(192, 168, 1, 254),
        Ipv4Addr::new(8, 8, 8, 8),
    ];

    for protocol in [Protocol::Tcp, Protocol::Udp] {
        for ip in addresses {
            let key = AddressKey::new(protocol, ip);
            translator.forward(protocol, ip, 4000);
            assert_eq!(redirect_rules(&backend, key).len(), 1);

            translator.clear(protocol, ip);
            assert!(redirect_rules(&backend, key).is_empty());
            assert!(translator.mappings().iter().all(|r| r.key != key));
        }
    }
}

#[test]
fn test_reforward_single_rule_targets_latest_port() {
    let (backend, translator) = enabled();
    let ip = Ipv4Addr::new(10, 43, 0, 1);
    let key = AddressKey::tcp(ip);

    translator.forward_tcp(ip, 1111);
    translator.forward_tcp(ip, 2222);
    translator.forward_tcp(ip, 3333);

    assert_eq!(redirect_rules(&backend, key), vec![redirect_rule(key, 3333)]);
    let mappings = translator.mappings();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].port, 3333);
}

#[test]
fn test_clear_without_mapping_issues_no_command() {
    let (backend, translator) = enabled();
    backend.clear_history();

    let report = translator.clear_tcp(Ipv4Addr::new(10, 0, 0, 7));
    assert!(report.is_clean());
    assert_eq!(report.attempted(), 0);
    assert!(backend.history().is_empty());
}

#[test]
fn test_clear_uses_recorded_port() {
    let (backend, translator) = enabled();
    let ip = Ipv4Addr::new(10, 0, 0, 8);
    translator.forward_udp(ip, 5353);
    backend.clear_history();

    translator.clear_udp(ip);
    assert_eq!(
        backend.history(),
        vec![format!(
            "-t nat -D {CHAIN} -j REDIRECT --dest 10.0.0.8/32 -p udp --to-ports 5353"
        )]
    );
}

#[test]
fn test_redirects_from_config() {
    let config = load_config_str(
        r#"{
            "chain": "IT_TABLE",
            "dry_run": true,
            "redirects": [
                { "protocol": "tcp", "address": "10.0.0.1", "port": 1080 },
                { "protocol": "udp", "address": "10.0.0.1", "port": 5353 }
            ]
        }"#,
    )
    .unwrap();

    let translator = Translator::from_config(&config).unwrap();
    assert!(translator.enable().is_clean());
    assert!(translator.apply_redirects(&config.redirects).is_clean());

    let ports: Vec<u16> = translator.mappings().iter().map(|r| r.port).collect();
    assert_eq!(ports, vec![1080, 5353]);
}
