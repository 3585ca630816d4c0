//! Contract Test: Startup and Shutdown
//!
//! Constraints verified:
//! - The engine loads interfaces and configuration before reporting Started
//! - Link events posted after startup reach the services
//! - The engine terminates on the shutdown signal and reports Stopped
//!
//! If this test fails, someone has added a detached task, a blocking call in
//! the event loop, or a shutdown path that waits on something that never ends.

mod common;

use common::*;
use ipconfig_core::config::{ConfigSnapshot, InterfaceConfig, MethodConfig, Settings};
use ipconfig_core::engine::EngineNotice;
use ipconfig_core::event::Event;
use ipconfig_core::interface::LinkStatus;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

fn snapshot() -> ConfigSnapshot {
    ConfigSnapshot {
        order: vec!["m0".into()],
        boot_interface: None,
        interfaces: vec![InterfaceConfig::new("en0").with_service(
            "m0",
            MethodConfig::Manual {
                address: Ipv4Addr::new(10, 0, 0, 5),
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                router: None,
            },
        )],
    }
}

async fn next_matching(
    notices: &mut mpsc::Receiver<EngineNotice>,
    matches: impl Fn(&EngineNotice) -> bool,
) -> EngineNotice {
    let wait = async {
        loop {
            match notices.recv().await {
                Some(notice) if matches(&notice) => return notice,
                Some(_) => continue,
                None => panic!("notice channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("notice arrives within 5 seconds")
}

#[tokio::test]
async fn shutdown_signal_terminates_engine() {
    let (source, _link_tx) = StaticLinkSource::new(vec![en0()]);
    let h = Harness::build(Settings::default(), Some(Arc::new(source)));
    h.store.set_snapshot(snapshot()).await;
    let Harness {
        mut engine,
        mut notices,
        control,
        ..
    } = h;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let engine_handle = tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await });

    let started = next_matching(&mut notices, |n| matches!(n, EngineNotice::Started { .. })).await;
    assert_eq!(started, EngineNotice::Started { interfaces: 1 });
    assert!(
        control.calls().is_empty(),
        "nothing is assigned before the probe finishes"
    );

    assert!(shutdown_tx.send(()).is_ok(), "shutdown signal send succeeds");

    let result = tokio::time::timeout(Duration::from_secs(5), engine_handle).await;
    assert!(result.is_ok(), "Engine should terminate within 5 seconds");
    let engine_result = result.unwrap().unwrap();
    assert!(
        engine_result.is_ok(),
        "Engine should shut down successfully: {:?}",
        engine_result
    );

    let stopped = next_matching(&mut notices, |n| matches!(n, EngineNotice::Stopped { .. })).await;
    assert_eq!(
        stopped,
        EngineNotice::Stopped {
            reason: "Shutdown signal".into()
        }
    );
}

#[tokio::test]
async fn link_events_reach_services_while_running() {
    let (source, link_tx) = StaticLinkSource::new(vec![en0()]);
    let h = Harness::build(Settings::default(), Some(Arc::new(source)));
    h.store.set_snapshot(snapshot()).await;
    let Harness {
        mut engine,
        mut notices,
        ..
    } = h;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let engine_handle = tokio::spawn(async move {
        let result = engine.run_with_shutdown(Some(shutdown_rx)).await;
        (engine, result)
    });

    next_matching(&mut notices, |n| matches!(n, EngineNotice::Started { .. })).await;
    link_tx
        .send(Event::InterfacesChanged(Vec::new()))
        .expect("engine is listening");

    let removed = next_matching(&mut notices, |n| {
        matches!(n, EngineNotice::InterfaceRemoved { .. })
    })
    .await;
    assert_eq!(
        removed,
        EngineNotice::InterfaceRemoved {
            interface: "en0".into()
        }
    );

    shutdown_tx.send(()).unwrap();
    let (engine, result) = engine_handle.await.unwrap();
    result.unwrap();
    assert!(engine.service("m0").is_none());
    assert!(engine.ifstate("en0").is_none());
    assert_eq!(engine.armed_timers(), 0);
}

#[tokio::test]
async fn missing_configuration_is_an_empty_start() {
    let (source, _link_tx) = StaticLinkSource::new(vec![en0(), en1()]);
    let h = Harness::build(Settings::default(), Some(Arc::new(source)));
    let Harness {
        mut engine,
        mut notices,
        ..
    } = h;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let engine_handle = tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await });

    let started = next_matching(&mut notices, |n| matches!(n, EngineNotice::Started { .. })).await;
    assert_eq!(started, EngineNotice::Started { interfaces: 0 });

    shutdown_tx.send(()).unwrap();
    engine_handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn link_down_posted_through_sender_is_handled() {
    let mut h = Harness::new();
    h.interfaces(vec![en0()]).await;
    h.configure(snapshot()).await;

    h.engine
        .sender()
        .send(Event::LinkStatusChanged {
            ifname: "en0".into(),
            status: LinkStatus::down(),
        })
        .unwrap();
    assert_eq!(tokio_test::assert_ok!(h.engine.drain().await), 1);

    assert!(h.timers.has(|k| matches!(
        k,
        ipconfig_core::timers::TimerKey::LinkInactive(name) if name == "en0"
    )));
}
