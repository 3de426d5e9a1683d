//! Integration tests for mirage-tun
//!
//! Nothing here needs root: only the userspace device and the recording
//! router/DNS implementations are exercised.

use std::sync::Arc;

use mirage_tun::{
    Device, DnsConfig, DnsConfigurator, NoopDns, NoopRouter, Router, RouterConfig, TunSpec,
    UserspaceTun, DEFAULT_MTU,
};

#[test]
fn test_userspace_candidate_builds_in_memory_device() {
    let specs = TunSpec::parse_list("userspace-networking").unwrap();
    assert!(specs[0].is_userspace());

    let dev: Arc<dyn Device> = Arc::new(UserspaceTun::new("userspace", DEFAULT_MTU));
    assert_eq!(dev.name(), "userspace");
    assert_eq!(dev.mtu(), DEFAULT_MTU);
    dev.write(&[0x45, 0, 0, 20]).unwrap();
    dev.close().unwrap();
    assert!(dev.write(&[0x45]).is_err());
}

#[test]
fn test_boxed_router_is_a_router() {
    let router: Box<dyn Router> = Box::new(NoopRouter::new());
    router.up().unwrap();
    router
        .set(&RouterConfig {
            local_addrs: vec!["100.64.0.7/32".parse().unwrap()],
            routes: vec!["::/0".parse().unwrap()],
        })
        .unwrap();
    router.close().unwrap();
}

#[test]
fn test_noop_dns_tracks_last_config() {
    let cfg = DnsConfig {
        nameservers: vec!["100.100.100.100".parse().unwrap()],
        search_domains: Vec::new(),
    };
    assert!(!cfg.is_empty());

    let dns = NoopDns::new();
    dns.set(&cfg).unwrap();
    assert_eq!(dns.current(), Some(cfg));
    dns.close().unwrap();
    assert_eq!(dns.current(), None);
}
