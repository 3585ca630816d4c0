//! Contract Test: DHCP Lifecycle
//!
//! Drives a DHCP service through its transport double and the scripted wire.
//!
//! Constraints verified:
//! - DISCOVER, OFFER, REQUEST, ACK, probe, bind, publish
//! - An offered address that answers ARP is declined and retried later
//! - A NAK restarts discovery
//! - Replies for another transaction are ignored
//! - Removing the configuration retires everything the service published
//! - A method the link cannot run is rejected once and not retried

mod common;

use common::*;
use ipconfig_core::config::{ConfigSnapshot, InterfaceConfig, MethodConfig};
use ipconfig_core::engine::EngineNotice;
use ipconfig_core::error::Status;
use ipconfig_core::event::Event;
use ipconfig_core::interface::Interface;
use ipconfig_core::timers::ServiceTimer;
use ipconfig_core::traits::{DhcpMessageKind, DhcpReply, DhcpReplyKind, Entity, StaticOptions};
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::Arc;

const OFFERED: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn dhcp_config() -> ConfigSnapshot {
    ConfigSnapshot {
        order: vec!["dhcp-en0".into()],
        boot_interface: None,
        interfaces: vec![
            InterfaceConfig::new("en0").with_service("dhcp-en0", MethodConfig::Dhcp { client_id: None }),
        ],
    }
}

fn reply(kind: DhcpReplyKind, xid: u32) -> Event {
    let options = StaticOptions::default()
        .with_router(SERVER)
        .with_subnet_mask(Ipv4Addr::new(255, 255, 255, 0))
        .with_lease_secs(3600);
    Event::Dhcp {
        ifname: "en0".into(),
        reply: DhcpReply {
            kind,
            xid,
            yiaddr: OFFERED,
            server_id: Some(SERVER),
            options: Arc::new(options),
        },
    }
}

async fn started() -> Harness {
    let mut h = Harness::new();
    h.interfaces(vec![en0()]).await;
    h.configure(dhcp_config()).await;
    h
}

/// Run the exchange up to the conflict probe of the offered address
async fn acked() -> Harness {
    let mut h = started().await;
    let xid = h.dhcp.last(DhcpMessageKind::Discover).unwrap().xid;
    h.handle(reply(DhcpReplyKind::Offer, xid)).await;
    h.handle(reply(DhcpReplyKind::Ack, xid)).await;
    h
}

#[tokio::test]
async fn discover_is_sent_on_start() {
    let mut h = started().await;

    let discover = h.dhcp.last(DhcpMessageKind::Discover).unwrap();
    assert!(discover.broadcast);
    assert!(discover.hwaddr.is_some());
    assert!(h.timers.has(is_service_timer(ServiceTimer::Retransmit)));

    // Working, nothing to publish yet beyond the interface being busy
    assert_eq!(h.store.get("dhcp-en0", Entity::Status).await, None);
    assert_eq!(h.store.get("en0", Entity::Busy).await, Some(json!(true)));

    let notices = h.drain_notices();
    assert!(notices.contains(&EngineNotice::ServiceStarted {
        service: "dhcp-en0".into(),
        interface: "en0".into(),
        method: ipconfig_core::config::MethodKind::Dhcp,
    }));
}

#[tokio::test]
async fn full_exchange_binds_and_publishes() {
    let mut h = started().await;
    let xid = h.dhcp.last(DhcpMessageKind::Discover).unwrap().xid;

    h.handle(reply(DhcpReplyKind::Offer, xid)).await;
    let request = h.dhcp.last(DhcpMessageKind::Request).unwrap();
    assert_eq!(request.requested_ip, Some(OFFERED));
    assert_eq!(request.server_id, Some(SERVER));

    h.handle(reply(DhcpReplyKind::Ack, xid)).await;
    // The offered address is probed before use
    let probes = h.wire.sent_on("en0");
    assert_eq!(probes.len(), 1);
    assert!(probes[0].is_probe());
    assert_eq!(probes[0].target_ip, OFFERED);
    assert!(h.control.ipv4_addresses("en0").is_empty());

    h.run_arp().await;

    assert_eq!(h.control.ipv4_addresses("en0"), vec![OFFERED]);
    assert_eq!(
        h.store.get("dhcp-en0", Entity::Status).await,
        Some(json!("success"))
    );
    let ipv4 = h.store.get("dhcp-en0", Entity::Ipv4).await.unwrap();
    assert_eq!(ipv4["addresses"], json!(["10.0.0.5"]));
    assert_eq!(ipv4["subnet_masks"], json!(["255.255.255.0"]));
    assert_eq!(ipv4["router"], json!("10.0.0.1"));
    assert!(h.store.get("dhcp-en0", Entity::Dhcp).await.is_some());
    assert_eq!(h.store.get("en0", Entity::Busy).await, Some(json!(false)));

    // Lease timers are armed
    assert!(h.timers.has(is_service_timer(ServiceTimer::Renew)));
    assert!(h.timers.has(is_service_timer(ServiceTimer::Expire)));
    assert!(h.engine.dhcp_info("dhcp-en0").is_some());
}

#[tokio::test]
async fn offered_address_in_use_is_declined() {
    let mut h = acked().await;

    h.inject("en0", reply_from(PEER_HW, OFFERED, Ipv4Addr::UNSPECIFIED))
        .await;

    let decline = h.dhcp.last(DhcpMessageKind::Decline).unwrap();
    assert_eq!(decline.requested_ip, Some(OFFERED));
    assert_eq!(decline.server_id, Some(SERVER));
    assert!(h.control.ipv4_addresses("en0").is_empty());
    assert_eq!(
        h.store.get("dhcp-en0", Entity::Status).await,
        Some(json!(Status::AddressInUse))
    );

    // Discovery restarts after the decline delay
    assert_eq!(h.dhcp.count(DhcpMessageKind::Discover), 1);
    assert!(h.fire(is_service_timer(ServiceTimer::Retry)).await);
    assert_eq!(h.dhcp.count(DhcpMessageKind::Discover), 2);
}

#[tokio::test]
async fn nak_restarts_discovery() {
    let mut h = started().await;
    let xid = h.dhcp.last(DhcpMessageKind::Discover).unwrap().xid;
    h.handle(reply(DhcpReplyKind::Offer, xid)).await;

    h.handle(reply(DhcpReplyKind::Nak, xid)).await;

    assert_eq!(h.dhcp.count(DhcpMessageKind::Discover), 2);
    assert!(h.wire.sent_on("en0").is_empty());
}

#[tokio::test]
async fn reply_for_another_transaction_is_ignored() {
    let mut h = started().await;
    let xid = h.dhcp.last(DhcpMessageKind::Discover).unwrap().xid;

    h.handle(reply(DhcpReplyKind::Offer, xid.wrapping_add(1))).await;

    assert_eq!(h.dhcp.count(DhcpMessageKind::Request), 0);
}

#[tokio::test]
async fn removing_configuration_retires_published_facts() {
    let mut h = acked().await;
    h.run_arp().await;
    assert!(h.store.get("dhcp-en0", Entity::Ipv4).await.is_some());
    h.drain_notices();

    h.configure(ConfigSnapshot::default()).await;

    assert!(h.engine.service("dhcp-en0").is_none());
    assert!(h.control.ipv4_addresses("en0").is_empty());
    for entity in [Entity::Ipv4, Entity::Dhcp, Entity::Status] {
        assert_eq!(h.store.get("dhcp-en0", entity).await, None);
    }
    assert_eq!(h.engine.armed_timers(), 0);
    assert!(h.drain_notices().contains(&EngineNotice::ServiceStopped {
        service: "dhcp-en0".into(),
        interface: "en0".into(),
    }));
}

#[tokio::test]
async fn bootp_on_loopback_is_rejected_once() {
    let mut h = Harness::new();
    h.interfaces(vec![Interface::loopback("lo0", 3)]).await;
    let snapshot = ConfigSnapshot {
        order: vec!["bootp-lo0".into()],
        boot_interface: None,
        interfaces: vec![InterfaceConfig::new("lo0").with_service("bootp-lo0", MethodConfig::Bootp)],
    };

    h.configure(snapshot.clone()).await;

    assert!(h.engine.service("bootp-lo0").is_none());
    assert_eq!(
        h.store.get("bootp-lo0", Entity::Status).await,
        Some(json!("operation_not_supported"))
    );
    let rejected = |n: &EngineNotice| matches!(n, EngineNotice::ServiceRejected { .. });
    assert_eq!(h.drain_notices().iter().filter(|n| rejected(n)).count(), 1);

    // The same configuration again is not retried
    h.configure(snapshot).await;
    assert!(h.drain_notices().iter().all(|n| !rejected(n)));
    assert!(h.dhcp.sent().is_empty());
}
