//! Contract Test: Link-Local Election
//!
//! Constraints verified:
//! - A DHCP service that finds no server gets an allocating link-local child
//! - Once the parent has an address the child only publishes the subnet
//! - A configured link-local service with an address leaves no room for a child
//! - One still without an address does not stop the election
//! - The child goes away with its parent
//! - Applying the same configuration twice changes nothing
//! - Among services with addresses the configured order picks the parent

mod common;

use common::*;
use ipconfig_core::config::{ConfigSnapshot, InterfaceConfig, MethodConfig};
use ipconfig_core::engine::EngineNotice;
use ipconfig_core::event::Event;
use ipconfig_core::timers::ServiceTimer;
use ipconfig_core::traits::{DhcpMessageKind, DhcpReply, DhcpReplyKind, Entity, StaticOptions};
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::Arc;

const OFFERED: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const CHILD: &str = "dhcp-en0-linklocal";

fn config(with_link_local: bool) -> ConfigSnapshot {
    let mut en0 = InterfaceConfig::new("en0").with_service("dhcp-en0", MethodConfig::Dhcp { client_id: None });
    let mut order = vec!["dhcp-en0".to_string()];
    if with_link_local {
        en0 = en0.with_service("ll-en0", MethodConfig::LinkLocal);
        order.push("ll-en0".into());
    }
    ConfigSnapshot {
        order,
        boot_interface: None,
        interfaces: vec![en0],
    }
}

fn reply(kind: DhcpReplyKind, xid: u32) -> Event {
    let options = StaticOptions::default()
        .with_subnet_mask(Ipv4Addr::new(255, 255, 255, 0))
        .with_lease_secs(3600);
    Event::Dhcp {
        ifname: "en0".into(),
        reply: DhcpReply {
            kind,
            xid,
            yiaddr: OFFERED,
            server_id: Some(Ipv4Addr::new(10, 0, 0, 1)),
            options: Arc::new(options),
        },
    }
}

/// Retransmit DISCOVER until the service reports that nobody answers
async fn no_server(with_link_local: bool) -> Harness {
    let mut h = Harness::new();
    h.interfaces(vec![en0()]).await;
    h.configure(config(with_link_local)).await;
    for _ in 0..3 {
        assert!(h.fire(is_service_timer(ServiceTimer::Retransmit)).await);
    }
    h
}

fn elected(notices: &[EngineNotice]) -> Vec<&EngineNotice> {
    notices
        .iter()
        .filter(|n| matches!(n, EngineNotice::LinkLocalElected { .. }))
        .collect()
}

#[tokio::test]
async fn no_server_spawns_allocating_child() {
    let mut h = no_server(false).await;

    assert_eq!(
        h.store.get("dhcp-en0", Entity::Status).await,
        Some(json!("no_server"))
    );
    let notices = h.drain_notices();
    assert_eq!(
        elected(&notices),
        vec![&EngineNotice::LinkLocalElected {
            interface: "en0".into(),
            parent: "dhcp-en0".into(),
            allocate: true,
        }]
    );
    let child = h.engine.service(CHILD).unwrap();
    assert_eq!(child.link_local_allocate(), Some(true));
    assert!(child.core.is_child());

    h.run_arp().await;

    let addresses = h.control.ipv4_addresses("en0");
    assert_eq!(addresses.len(), 1);
    assert_eq!(&addresses[0].octets()[..2], &[169, 254]);
    let ipv4 = h.store.get(CHILD, Entity::Ipv4).await.unwrap();
    assert_eq!(ipv4["addresses"], json!([addresses[0]]));
}

#[tokio::test]
async fn child_stops_allocating_once_parent_binds() {
    let mut h = no_server(false).await;
    h.run_arp().await;
    h.drain_notices();

    let xid = h.dhcp.last(DhcpMessageKind::Discover).unwrap().xid;
    h.handle(reply(DhcpReplyKind::Offer, xid)).await;
    h.handle(reply(DhcpReplyKind::Ack, xid)).await;
    h.run_arp().await;

    assert_eq!(h.control.ipv4_addresses("en0"), vec![OFFERED]);
    assert_eq!(
        h.engine.service(CHILD).unwrap().link_local_allocate(),
        Some(false)
    );
    assert_eq!(
        h.store.get(CHILD, Entity::Ipv4).await,
        Some(json!({ "interface": "en0", "subnet": "169.254.0.0/16" }))
    );
    // Same child, switched in place
    assert!(elected(&h.drain_notices()).is_empty());
}

#[tokio::test]
async fn configured_link_local_blocks_children() {
    let mut h = Harness::new();
    h.interfaces(vec![en0()]).await;
    h.configure(config(true)).await;
    // The configured service claims its address while DHCP is still asking
    h.run_arp().await;
    let claimed = h.engine.service("ll-en0").unwrap().core.ipv4_address().unwrap();
    h.drain_notices();

    for _ in 0..3 {
        assert!(h.fire(is_service_timer(ServiceTimer::Retransmit)).await);
    }

    assert_eq!(
        h.store.get("dhcp-en0", Entity::Status).await,
        Some(json!("no_server"))
    );
    assert!(h.engine.service(CHILD).is_none());
    assert!(elected(&h.drain_notices()).is_empty());
    assert_eq!(h.control.ipv4_addresses("en0"), vec![claimed]);
}

#[tokio::test]
async fn configured_link_local_without_address_does_not_block() {
    let mut h = no_server(true).await;

    // Still probing, so it has nothing to stand on yet
    assert!(h.engine.service("ll-en0").unwrap().core.ipv4_address().is_none());
    assert_eq!(
        elected(&h.drain_notices()),
        vec![&EngineNotice::LinkLocalElected {
            interface: "en0".into(),
            parent: "dhcp-en0".into(),
            allocate: true,
        }]
    );
    assert_eq!(h.engine.service(CHILD).unwrap().link_local_allocate(), Some(true));

    // Once the configured service has its address the child is retired
    h.run_arp().await;
    assert!(h.engine.service("ll-en0").unwrap().core.ipv4_address().is_some());
    assert!(h.engine.service(CHILD).is_none());
    assert_eq!(h.store.get(CHILD, Entity::Ipv4).await, None);
}

#[tokio::test]
async fn child_goes_away_with_parent() {
    let mut h = no_server(false).await;
    h.run_arp().await;
    assert!(h.store.get(CHILD, Entity::Ipv4).await.is_some());

    h.configure(ConfigSnapshot {
        order: Vec::new(),
        boot_interface: None,
        interfaces: vec![InterfaceConfig::new("en0")],
    })
    .await;

    assert!(h.engine.service(CHILD).is_none());
    assert!(h.engine.service("dhcp-en0").is_none());
    assert_eq!(h.store.get(CHILD, Entity::Ipv4).await, None);
    assert!(h.control.ipv4_addresses("en0").is_empty());
}

#[tokio::test]
async fn reapplying_configuration_is_a_no_op() {
    let mut h = no_server(false).await;
    h.run_arp().await;
    h.drain_notices();
    let services = h.engine.services().count();
    let published = h.store.publish_count();

    h.configure(config(false)).await;

    assert_eq!(h.engine.services().count(), services);
    assert_eq!(h.store.publish_count(), published);
    assert!(h.drain_notices().is_empty());
}

fn two_manual(order: [&str; 2]) -> ConfigSnapshot {
    let manual = |last: u8| MethodConfig::Manual {
        address: Ipv4Addr::new(10, 0, 0, last),
        subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
        router: None,
    };
    ConfigSnapshot {
        order: order.iter().map(|s| s.to_string()).collect(),
        boot_interface: None,
        interfaces: vec![
            InterfaceConfig::new("en0")
                .with_service("a", manual(10))
                .with_service("b", manual(11)),
        ],
    }
}

#[tokio::test]
async fn service_order_decides_the_parent() {
    let mut h = Harness::new();
    h.interfaces(vec![en0()]).await;
    h.configure(two_manual(["b", "a"])).await;
    h.run_arp().await;

    assert!(h.engine.service("b-linklocal").is_some());
    assert!(h.engine.service("a-linklocal").is_none());
    assert_eq!(
        h.engine.service("b-linklocal").unwrap().link_local_allocate(),
        Some(false)
    );

    h.drain_notices();
    h.configure(two_manual(["a", "b"])).await;

    assert!(h.engine.service("a-linklocal").is_some());
    assert!(h.engine.service("b-linklocal").is_none());
    assert_eq!(
        elected(&h.drain_notices()),
        vec![&EngineNotice::LinkLocalElected {
            interface: "en0".into(),
            parent: "a".into(),
            allocate: false,
        }]
    );
}
