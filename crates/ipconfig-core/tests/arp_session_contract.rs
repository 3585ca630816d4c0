//! Contract Test: Shared Capture Handles
//!
//! Every ARP client on an interface shares one capture handle.
//!
//! Constraints verified:
//! - The first operation opens the device, the last one to end closes it
//! - The open count tracks every running client, not just the first two
//! - One batch can complete several clients; the handle survives the batch
//! - Clients see frames in registration order
//! - Freeing the last client drops the interface session
//! - A defense on a closed interface opens the device just for that frame

mod common;

use common::*;
use ipconfig_core::arp::ArpCommand;
use std::net::Ipv4Addr;

#[test]
fn clients_share_one_handle() {
    let mut rig = ArpRig::new();
    let first = rig.arp.create_client(&en0()).unwrap();
    let second = rig.arp.create_client(&en0()).unwrap();
    assert_eq!(rig.arp.client_count("en0"), 2);
    assert!(!rig.arp.is_open("en0"));

    rig.arp
        .probe(first, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 5), 1, &mut rig.timers);
    rig.arp
        .probe(second, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 6), 2, &mut rig.timers);

    assert_eq!(rig.wire.opens(), 1);
    assert_eq!(rig.wire.live_handles(), 1);
    assert_eq!(rig.arp.open_count("en0"), 2);

    // The first client's address is taken; the second keeps probing
    rig.wire.inject(
        "en0",
        reply_from(PEER_HW, ip(10, 0, 0, 5), Ipv4Addr::UNSPECIFIED),
    );
    rig.read("en0");
    assert_eq!(rig.arp.open_count("en0"), 1);
    assert!(rig.arp.is_open("en0"));
    assert_eq!(rig.arp.command(second), Some(ArpCommand::Probe));

    rig.arp.cancel(second, &mut rig.timers);
    assert_eq!(rig.arp.open_count("en0"), 0);
    assert_eq!(rig.wire.live_handles(), 0);

    let completions = rig.arp.take_completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].tag, 1);
}

#[test]
fn three_clients_hold_the_handle_until_the_last_cancel() {
    let mut rig = ArpRig::new();
    let clients: Vec<_> = (0..3)
        .map(|_| rig.arp.create_client(&en0()).unwrap())
        .collect();
    for (n, client) in clients.iter().enumerate() {
        rig.arp.probe(
            *client,
            Ipv4Addr::UNSPECIFIED,
            ip(10, 0, 0, 5 + n as u8),
            n as u32,
            &mut rig.timers,
        );
    }
    assert_eq!(rig.arp.open_count("en0"), 3);
    assert_eq!(rig.wire.opens(), 1);

    rig.arp.cancel(clients[0], &mut rig.timers);
    rig.arp.cancel(clients[2], &mut rig.timers);
    assert_eq!(rig.arp.open_count("en0"), 1);
    assert!(rig.arp.is_open("en0"));
    assert_eq!(rig.wire.live_handles(), 1);
    assert_eq!(rig.arp.command(clients[1]), Some(ArpCommand::Probe));

    rig.arp.cancel(clients[1], &mut rig.timers);
    assert_eq!(rig.arp.open_count("en0"), 0);
    assert!(!rig.arp.is_open("en0"));
    assert_eq!(rig.wire.live_handles(), 0);
    assert_eq!(rig.wire.opens(), 1);
    assert!(rig.arp.take_completions().is_empty());
}

#[test]
fn one_batch_completes_several_clients_in_order() {
    let mut rig = ArpRig::new();
    let first = rig.arp.create_client(&en0()).unwrap();
    let second = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(first, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 5), 1, &mut rig.timers);
    rig.arp
        .probe(second, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 6), 2, &mut rig.timers);

    // Both answers arrive in the same batch, second's first
    rig.wire.inject(
        "en0",
        reply_from(PEER_HW, ip(10, 0, 0, 6), Ipv4Addr::UNSPECIFIED),
    );
    rig.wire.inject(
        "en0",
        reply_from(PEER_HW, ip(10, 0, 0, 5), Ipv4Addr::UNSPECIFIED),
    );
    assert_eq!(rig.read("en0"), 2);

    let tags: Vec<u32> = rig.arp.take_completions().iter().map(|c| c.tag).collect();
    assert_eq!(tags, vec![2, 1]);
    assert_eq!(rig.arp.open_count("en0"), 0);
    assert_eq!(rig.wire.live_handles(), 0);
}

#[test]
fn same_frame_matches_every_interested_client() {
    let mut rig = ArpRig::new();
    let first = rig.arp.create_client(&en0()).unwrap();
    let second = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(first, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 5), 1, &mut rig.timers);
    rig.arp.resolve(
        second,
        ip(10, 0, 0, 7),
        ip(10, 0, 0, 5),
        std::time::Duration::from_secs(3),
        2,
        &mut rig.timers,
    );

    rig.wire.inject(
        "en0",
        reply_from(PEER_HW, ip(10, 0, 0, 5), ip(10, 0, 0, 7)),
    );
    rig.read("en0");

    let completions = rig.arp.take_completions();
    let tags: Vec<u32> = completions.iter().map(|c| c.tag).collect();
    assert_eq!(tags, vec![1, 2]);
    assert!(completions.iter().all(|c| c.result.in_use));
}

#[test]
fn freeing_last_client_drops_session() {
    let mut rig = ArpRig::new();
    let first = rig.arp.create_client(&en0()).unwrap();
    let second = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(first, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 5), 1, &mut rig.timers);

    rig.arp.free(first, &mut rig.timers);
    assert_eq!(rig.arp.client_count("en0"), 1);
    assert_eq!(rig.wire.live_handles(), 0);
    assert!(rig.manual.pending().is_empty());

    rig.arp.free(second, &mut rig.timers);
    assert_eq!(rig.arp.client_count("en0"), 0);

    // Readability on an interface without a session is a no-op
    assert_eq!(rig.read("en0"), 0);
}

#[test]
fn sessions_are_per_interface() {
    let mut rig = ArpRig::new();
    let a = rig.arp.create_client(&en0()).unwrap();
    let b = rig.arp.create_client(&en1()).unwrap();
    rig.arp
        .probe(a, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 5), 1, &mut rig.timers);
    rig.arp
        .probe(b, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 5), 2, &mut rig.timers);
    assert_eq!(rig.wire.opens(), 2);

    // A conflict on en1 does not touch the en0 probe
    rig.wire.inject(
        "en1",
        reply_from(PEER_HW, ip(10, 0, 0, 5), Ipv4Addr::UNSPECIFIED),
    );
    rig.read("en1");

    let completions = rig.arp.take_completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].tag, 2);
    assert!(rig.arp.is_open("en0"));
    assert!(!rig.arp.is_open("en1"));
}

#[test]
fn defend_on_closed_interface_is_transient() {
    let mut rig = ArpRig::new();
    let client = rig.arp.create_client(&en0()).unwrap();

    rig.arp.defend(client, ip(169, 254, 3, 4)).unwrap();

    assert_eq!(rig.wire.opens(), 1);
    assert_eq!(rig.wire.live_handles(), 0);
    let frames = rig.wire.sent_on("en0");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].sender_ip, ip(169, 254, 3, 4));
    assert_eq!(frames[0].target_ip, ip(169, 254, 3, 4));
    assert!(!rig.arp.has_completions());
}

#[test]
fn defend_reuses_an_open_handle() {
    let mut rig = ArpRig::new();
    let prober = rig.arp.create_client(&en0()).unwrap();
    let defender = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(prober, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 5), 1, &mut rig.timers);

    rig.arp.defend(defender, ip(10, 0, 0, 9)).unwrap();

    assert_eq!(rig.wire.opens(), 1);
    assert_eq!(rig.wire.live_handles(), 1);
    assert_eq!(rig.arp.open_count("en0"), 1);
}
