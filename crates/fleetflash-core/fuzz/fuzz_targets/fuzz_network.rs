//! Fuzz test for network validation

#![no_main]

use arbitrary::Arbitrary;
use fleetflash_core::validate;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    gateway: &'a str,
    dns: &'a str,
    manager: &'a str,
    nodes: u32,
}

fuzz_target!(|input: Input<'_>| {
    let Ok(network) = validate(input.gateway, input.dns, input.manager, input.nodes) else {
        return;
    };

    let manager = network.manager().octets()[3];
    assert!(u32::from(manager) + network.node_count() <= 254);
    assert!((1..=3).contains(&network.dns().len()));

    for role in network.roles() {
        let ip = network.role_ip(role);
        assert_ne!(ip, network.gateway());
        assert_eq!(ip.octets()[..3], network.gateway().octets()[..3]);
    }
});
