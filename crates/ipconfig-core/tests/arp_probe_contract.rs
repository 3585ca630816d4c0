//! Contract Test: ARP Probing
//!
//! Drives the ARP session engine directly over a scripted wire.
//!
//! Constraints verified:
//! - A probe sends `probe_count` probes then `gratuitous_count` announcements
//! - Results are queued, never delivered while the caller is still inside the engine
//! - Any frame claiming the target address reports it in use
//! - Frames sent from the host's own interfaces never match
//! - Probe collisions are retried before being reported
//! - A completion that raced with a newer operation is recognized as stale
//! - An announce-only operation skips probing, and sends one less when the
//!   caller already announced
//!
//! If this test fails, someone has broken the RFC 5227 probe sequence or the
//! completion hand-off between the ARP engine and its owner.

mod common;

use common::*;
use ipconfig_core::interface::HwAddr;
use std::net::Ipv4Addr;

const TARGET: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

#[test]
fn unanswered_probe_reports_address_free() {
    let mut rig = ArpRig::new();
    let client = rig.arp.create_client(&en0()).unwrap();

    rig.arp
        .probe(client, Ipv4Addr::UNSPECIFIED, TARGET, 7, &mut rig.timers);

    // First probe goes out immediately, nothing is delivered yet
    assert_eq!(rig.wire.sent_on("en0").len(), 1);
    assert!(!rig.arp.has_completions());
    assert_eq!(rig.arp.open_count("en0"), 1);

    let fired = rig.fire_all();
    assert_eq!(fired, 5, "3 probes + 2 announcements, then finish");

    let frames = rig.wire.sent_on("en0");
    assert_eq!(frames.len(), 5);
    for probe in &frames[..3] {
        assert!(probe.is_probe());
        assert_eq!(probe.target_ip, TARGET);
        assert_eq!(probe.sender_hw, HwAddr::ethernet(EN0_HW));
    }
    for announcement in &frames[3..] {
        assert!(!announcement.is_probe());
        assert_eq!(announcement.sender_ip, TARGET);
        assert_eq!(announcement.target_ip, TARGET);
    }

    let completions = rig.arp.take_completions();
    assert_eq!(completions.len(), 1);
    let completion = &completions[0];
    assert_eq!(completion.tag, 7);
    assert!(!completion.result.error);
    assert!(!completion.result.in_use);
    assert!(rig.arp.accept(completion));

    // Handle closed once the last operation ended
    assert_eq!(rig.arp.open_count("en0"), 0);
    assert_eq!(rig.wire.live_handles(), 0);
}

#[test]
fn reply_from_another_host_reports_in_use() {
    let mut rig = ArpRig::new();
    let client = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(client, Ipv4Addr::UNSPECIFIED, TARGET, 1, &mut rig.timers);

    rig.wire
        .inject("en0", reply_from(PEER_HW, TARGET, Ipv4Addr::UNSPECIFIED));
    assert_eq!(rig.read("en0"), 1);

    let completions = rig.arp.take_completions();
    assert_eq!(completions.len(), 1);
    let result = completions[0].result;
    assert!(result.in_use);
    assert!(!result.error);
    assert_eq!(result.addr.target_ip, TARGET);
    assert_eq!(result.addr.target_hw, Some(HwAddr::ethernet(PEER_HW)));

    // Retry timer is gone and the device is closed
    assert!(rig.manual.pending().is_empty());
    assert_eq!(rig.wire.live_handles(), 0);
    assert_eq!(rig.fire_all(), 0);
}

#[test]
fn frames_from_own_interfaces_never_match() {
    let mut rig = ArpRig::new();
    rig.arp.set_local_hwaddrs([HwAddr::ethernet(EN1_HW)]);
    let client = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(client, Ipv4Addr::UNSPECIFIED, TARGET, 1, &mut rig.timers);

    // Our own interface, and another interface of this host
    rig.wire
        .inject("en0", reply_from(EN0_HW, TARGET, Ipv4Addr::UNSPECIFIED));
    rig.wire
        .inject("en0", reply_from(EN1_HW, TARGET, Ipv4Addr::UNSPECIFIED));
    assert_eq!(rig.read("en0"), 2);
    assert!(!rig.arp.has_completions());

    rig.fire_all();
    let completions = rig.arp.take_completions();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].result.in_use);
}

#[test]
fn unrelated_frames_are_ignored() {
    let mut rig = ArpRig::new();
    let client = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(client, Ipv4Addr::UNSPECIFIED, TARGET, 1, &mut rig.timers);

    rig.wire
        .inject("en0", reply_from(PEER_HW, ip(10, 0, 0, 6), TARGET));
    rig.wire.inject("en0", bytes::Bytes::from_static(&[0u8; 12]));
    rig.read("en0");

    assert!(!rig.arp.has_completions());
}

#[test]
fn probe_collisions_are_retried_before_reporting() {
    let mut rig = ArpRig::new();
    let retries = rig.arp.settings().conflict_retry_count;
    let client = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(client, Ipv4Addr::UNSPECIFIED, TARGET, 1, &mut rig.timers);

    for round in 1..=retries {
        rig.wire.inject("en0", probe_from(PEER_HW, TARGET));
        rig.read("en0");
        assert!(
            !rig.arp.has_completions(),
            "collision {round} should only restart probing"
        );
        let delay = rig.manual.delay_of(is_arp).unwrap();
        assert_eq!(delay, rig.arp.settings().conflict_retry_delay());
    }

    rig.wire.inject("en0", probe_from(PEER_HW, TARGET));
    rig.read("en0");

    let completions = rig.arp.take_completions();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].result.in_use);
    assert_eq!(
        completions[0].result.addr.target_hw,
        Some(HwAddr::ethernet(PEER_HW))
    );
}

#[test]
fn open_failure_completes_with_error() {
    let mut rig = ArpRig::new();
    rig.wire.fail_open("en0");
    let client = rig.arp.create_client(&en0()).unwrap();

    rig.arp
        .probe(client, Ipv4Addr::UNSPECIFIED, TARGET, 3, &mut rig.timers);

    assert!(rig.wire.sent_on("en0").is_empty());
    let completions = rig.arp.take_completions();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].result.error);
    assert_eq!(completions[0].tag, 3);
    assert!(rig.arp.error_message(client).is_some());
    assert_eq!(rig.arp.open_count("en0"), 0);
}

#[test]
fn cancel_drops_queued_result_and_is_idempotent() {
    let mut rig = ArpRig::new();
    let client = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(client, Ipv4Addr::UNSPECIFIED, TARGET, 1, &mut rig.timers);
    rig.wire
        .inject("en0", reply_from(PEER_HW, TARGET, Ipv4Addr::UNSPECIFIED));
    rig.read("en0");
    assert!(rig.arp.has_completions());

    rig.arp.cancel(client, &mut rig.timers);
    rig.arp.cancel(client, &mut rig.timers);

    assert!(!rig.arp.has_completions());
    assert_eq!(rig.arp.open_count("en0"), 0);
    assert!(rig.manual.pending().is_empty());
}

#[test]
fn completion_of_a_replaced_operation_is_stale() {
    let mut rig = ArpRig::new();
    let client = rig.arp.create_client(&en0()).unwrap();
    rig.arp
        .probe(client, Ipv4Addr::UNSPECIFIED, TARGET, 1, &mut rig.timers);
    rig.wire
        .inject("en0", reply_from(PEER_HW, TARGET, Ipv4Addr::UNSPECIFIED));
    rig.read("en0");
    let old = rig.arp.take_completions();

    // A new operation starts before the old result is delivered
    rig.arp
        .probe(client, Ipv4Addr::UNSPECIFIED, ip(10, 0, 0, 9), 2, &mut rig.timers);

    assert!(!rig.arp.accept(&old[0]));
}

#[test]
fn announce_alone_skips_probing() {
    let mut rig = ArpRig::new();
    let client = rig.arp.create_client(&en0()).unwrap();

    rig.arp
        .announce(client, TARGET, TARGET, false, 1, &mut rig.timers);
    assert_eq!(rig.fire_all(), 2);

    let frames = rig.wire.sent_on("en0");
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| !f.is_probe() && f.sender_ip == TARGET));
    assert!(!rig.arp.take_completions()[0].result.in_use);
}

#[test]
fn announce_skipping_first_sends_one_less() {
    let mut rig = ArpRig::new();
    let client = rig.arp.create_client(&en0()).unwrap();

    rig.arp
        .announce(client, TARGET, TARGET, true, 1, &mut rig.timers);
    // Nothing on the wire until the first interval passes
    assert!(rig.wire.sent_on("en0").is_empty());

    assert_eq!(rig.fire_all(), 2);
    assert_eq!(rig.wire.sent_on("en0").len(), 1);
    assert_eq!(rig.arp.take_completions().len(), 1);
    assert_eq!(rig.arp.open_count("en0"), 0);
}
