//! Test doubles and common utilities for engine contract tests
//!
//! Everything here is deterministic: frames only arrive when a test injects
//! them and timers only fire when a test fires them. No test sleeps.

#![allow(dead_code)]

use bytes::Bytes;
use ipconfig_core::arp::ArpEngine;
use ipconfig_core::arp::frame::{ArpFrame, ArpOp, FrameLayout};
use ipconfig_core::config::{ArpSettings, ConfigSnapshot, Settings};
use ipconfig_core::engine::{Engine, EngineNotice, EngineParts};
use ipconfig_core::error::{Error, Result};
use ipconfig_core::event::{Event, EventReceiver, event_queue};
use ipconfig_core::interface::{HwAddr, Interface};
use ipconfig_core::store::MemoryStore;
use ipconfig_core::timers::{ServiceTimer, TimerFacility, TimerKey, TimerToken, Timers};
use ipconfig_core::traits::{
    CaptureHandle, CaptureNotifier, DhcpMessage, DhcpMessageKind, DhcpTransport, Dhcpv6Message,
    Dhcpv6Transport, InterfaceControl, LinkCapture, LinkSource,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ops::Range;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::Stream;

pub const EN0_HW: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
pub const EN1_HW: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];
pub const PEER_HW: [u8; 6] = [0x02, 0, 0, 0, 0, 0x99];
pub const ROUTER_HW: [u8; 6] = [0x02, 0, 0, 0, 0, 0xfe];

/// Receive buffer the fake handles report
const BUFFER_SIZE: usize = 4096;

pub fn en0() -> Interface {
    Interface::ethernet("en0", 1, EN0_HW)
}

pub fn en1() -> Interface {
    Interface::ethernet("en1", 2, EN1_HW)
}

pub fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

/// ARP reply from `sender_hw` claiming `sender_ip`
pub fn reply_from(sender_hw: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Bytes {
    FrameLayout::Ethernet.encode(
        ArpOp::Reply,
        &HwAddr::ethernet(sender_hw),
        sender_ip,
        None,
        target_ip,
        None,
    )
}

/// ARP probe from `sender_hw` for `target_ip`
pub fn probe_from(sender_hw: [u8; 6], target_ip: Ipv4Addr) -> Bytes {
    FrameLayout::Ethernet.encode(
        ArpOp::Request,
        &HwAddr::ethernet(sender_hw),
        Ipv4Addr::UNSPECIFIED,
        None,
        target_ip,
        None,
    )
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WireState {
    sent: Vec<(String, Bytes)>,
    pending: HashMap<String, VecDeque<Bytes>>,
    notifiers: HashMap<String, CaptureNotifier>,
    opens: usize,
    live: usize,
    fail_open: HashSet<String>,
}

/// A scripted link shared by every fake capture handle
///
/// Clones share the same state, so a test keeps one and hands the engine a
/// capture built from another.
#[derive(Clone, Default)]
pub struct Wire {
    state: Arc<Mutex<WireState>>,
}

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(&self) -> Arc<dyn LinkCapture> {
        Arc::new(FakeCapture { wire: self.clone() })
    }

    /// Make every open on `ifname` fail
    pub fn fail_open(&self, ifname: &str) {
        self.state.lock().unwrap().fail_open.insert(ifname.to_string());
    }

    /// Queue a frame on `ifname` and wake whoever holds the handle
    ///
    /// Returns whether a notifier was registered for the interface.
    pub fn inject(&self, ifname: &str, frame: Bytes) -> bool {
        let notifier = {
            let mut state = self.state.lock().unwrap();
            state
                .pending
                .entry(ifname.to_string())
                .or_default()
                .push_back(frame);
            state.notifiers.get(ifname).cloned()
        };
        notifier.is_some_and(|n| n.notify())
    }

    /// Frames transmitted on `ifname`, decoded
    pub fn sent_on(&self, ifname: &str) -> Vec<ArpFrame> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(name, _)| name == ifname)
            .map(|(_, frame)| FrameLayout::Ethernet.decode(frame).unwrap())
            .collect()
    }

    /// Raw frames transmitted on `ifname`
    pub fn raw_sent_on(&self, ifname: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(name, _)| name == ifname)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    /// Number of successful opens so far
    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    /// Number of handles currently open
    pub fn live_handles(&self) -> usize {
        self.state.lock().unwrap().live
    }
}

struct FakeCapture {
    wire: Wire,
}

impl LinkCapture for FakeCapture {
    fn name(&self) -> &str {
        "fake"
    }

    fn open(&self, ifname: &str, notifier: CaptureNotifier) -> Result<Box<dyn CaptureHandle>> {
        let mut state = self.wire.state.lock().unwrap();
        if state.fail_open.contains(ifname) {
            return Err(Error::capture(ifname, "no such device"));
        }
        state.opens += 1;
        state.live += 1;
        state.notifiers.insert(ifname.to_string(), notifier);
        Ok(Box::new(FakeHandle {
            ifname: ifname.to_string(),
            wire: self.wire.clone(),
        }))
    }
}

struct FakeHandle {
    ifname: String,
    wire: Wire,
}

impl CaptureHandle for FakeHandle {
    fn set_arp_filter(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_immediate(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn buffer_size(&self) -> Result<usize> {
        Ok(BUFFER_SIZE)
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<Vec<Range<usize>>> {
        let mut state = self.wire.state.lock().unwrap();
        let Some(queue) = state.pending.get_mut(&self.ifname) else {
            return Ok(Vec::new());
        };
        let mut ranges = Vec::new();
        let mut offset = 0;
        while let Some(frame) = queue.front() {
            let end = offset + frame.len();
            if end > buffer.len() {
                break;
            }
            buffer[offset..end].copy_from_slice(frame);
            ranges.push(offset..end);
            offset = end;
            queue.pop_front();
        }
        Ok(ranges)
    }

    fn write(&mut self, frame: &[u8]) -> Result<()> {
        self.wire
            .state
            .lock()
            .unwrap()
            .sent
            .push((self.ifname.clone(), Bytes::copy_from_slice(frame)));
        Ok(())
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        let mut state = self.wire.state.lock().unwrap();
        state.live = state.live.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Timer facility that only records; tests decide when a token fires
#[derive(Clone, Default)]
pub struct ManualTimers {
    armed: Arc<Mutex<Vec<(TimerToken, Duration)>>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens armed and not cancelled
    pub fn pending(&self) -> Vec<TimerToken> {
        self.armed
            .lock()
            .unwrap()
            .iter()
            .map(|(token, _)| token.clone())
            .collect()
    }

    /// Remove and return every armed token whose key matches
    pub fn take(&self, matches: impl Fn(&TimerKey) -> bool) -> Vec<TimerToken> {
        let mut armed = self.armed.lock().unwrap();
        let (taken, kept): (Vec<_>, Vec<_>) = armed.drain(..).partition(|(t, _)| matches(&t.key));
        *armed = kept;
        taken.into_iter().map(|(token, _)| token).collect()
    }

    /// Remove and return the oldest armed token whose key matches
    pub fn take_first(&self, matches: impl Fn(&TimerKey) -> bool) -> Option<TimerToken> {
        let mut armed = self.armed.lock().unwrap();
        let index = armed.iter().position(|(t, _)| matches(&t.key))?;
        Some(armed.remove(index).0)
    }

    /// Delay the most recent token with a matching key was armed with
    pub fn delay_of(&self, matches: impl Fn(&TimerKey) -> bool) -> Option<Duration> {
        self.armed
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| matches(&t.key))
            .map(|(_, delay)| *delay)
    }

    pub fn has(&self, matches: impl Fn(&TimerKey) -> bool) -> bool {
        self.armed.lock().unwrap().iter().any(|(t, _)| matches(&t.key))
    }
}

impl TimerFacility for ManualTimers {
    fn set_relative(&mut self, token: TimerToken, delay: Duration) {
        self.armed.lock().unwrap().push((token, delay));
    }

    fn cancel(&mut self, token: &TimerToken) {
        self.armed.lock().unwrap().retain(|(t, _)| t != token);
    }
}

pub fn is_arp(key: &TimerKey) -> bool {
    matches!(key, TimerKey::Arp(_))
}

pub fn is_service_timer(timer: ServiceTimer) -> impl Fn(&TimerKey) -> bool {
    move |key| matches!(key, TimerKey::Service(_, t) if *t == timer)
}

/// An ARP engine on its own, tagged with plain numbers
pub struct ArpRig {
    pub arp: ArpEngine<u32>,
    pub timers: Timers,
    pub manual: ManualTimers,
    pub wire: Wire,
    pub events: EventReceiver,
}

impl ArpRig {
    pub fn new() -> Self {
        Self::with_settings(ArpSettings::default())
    }

    pub fn with_settings(settings: ArpSettings) -> Self {
        let wire = Wire::new();
        let manual = ManualTimers::new();
        let (tx, rx) = event_queue();
        Self {
            arp: ArpEngine::new(wire.capture(), tx, settings),
            timers: Timers::new(Box::new(manual.clone())),
            manual,
            wire,
            events: rx,
        }
    }

    /// Fire retry timers until the engine stops arming them
    pub fn fire_all(&mut self) -> usize {
        let mut fired = 0;
        for _ in 0..100 {
            let tokens = self.manual.take(is_arp);
            if tokens.is_empty() {
                break;
            }
            for token in tokens {
                if self.timers.accept(&token)
                    && let TimerKey::Arp(id) = token.key
                {
                    self.arp.handle_timer(id, &mut self.timers);
                    fired += 1;
                }
            }
        }
        fired
    }

    /// Fire one round of retry timers
    pub fn fire_once(&mut self) -> usize {
        let mut fired = 0;
        for token in self.manual.take(is_arp) {
            if self.timers.accept(&token)
                && let TimerKey::Arp(id) = token.key
            {
                self.arp.handle_timer(id, &mut self.timers);
                fired += 1;
            }
        }
        fired
    }

    /// Read one batch on `ifname`
    pub fn read(&mut self, ifname: &str) -> usize {
        self.arp.handle_readable(ifname, &mut self.timers).unwrap()
    }
}

// ---------------------------------------------------------------------------
// Interface control and transports
// ---------------------------------------------------------------------------

/// One call made through `InterfaceControl`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    SetIpv4 {
        ifname: String,
        address: Ipv4Addr,
        mask: Ipv4Addr,
    },
    RemoveIpv4 {
        ifname: String,
        address: Ipv4Addr,
    },
    SetIpv6Enabled {
        ifname: String,
        enabled: bool,
        autoconf: bool,
    },
    AddIpv6 {
        ifname: String,
        address: Ipv6Addr,
        prefix_len: u8,
    },
    RemoveIpv6 {
        ifname: String,
        address: Ipv6Addr,
    },
    SolicitRouter(String),
    AdminUp {
        ifname: String,
        up: bool,
    },
    Detach(String),
}

#[derive(Default)]
pub struct RecordingControl {
    calls: Mutex<Vec<ControlCall>>,
}

impl RecordingControl {
    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }

    /// IPv4 addresses on `ifname` after replaying every call
    pub fn ipv4_addresses(&self, ifname: &str) -> Vec<Ipv4Addr> {
        let mut addresses = Vec::new();
        for call in self.calls.lock().unwrap().iter() {
            match call {
                ControlCall::SetIpv4 { ifname: name, address, .. } if name == ifname => {
                    if !addresses.contains(address) {
                        addresses.push(*address);
                    }
                }
                ControlCall::RemoveIpv4 { ifname: name, address } if name == ifname => {
                    addresses.retain(|a| a != address);
                }
                _ => {}
            }
        }
        addresses
    }

    /// Last admin state set on `ifname`
    pub fn admin_up(&self, ifname: &str) -> Option<bool> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|call| match call {
                ControlCall::AdminUp { ifname: name, up } if name == ifname => Some(*up),
                _ => None,
            })
    }

    pub fn detached(&self, ifname: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|call| matches!(call, ControlCall::Detach(name) if name == ifname))
    }

    fn record(&self, call: ControlCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl InterfaceControl for RecordingControl {
    fn set_ipv4_address(&self, ifname: &str, address: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
        self.record(ControlCall::SetIpv4 {
            ifname: ifname.to_string(),
            address,
            mask,
        })
    }

    fn remove_ipv4_address(&self, ifname: &str, address: Ipv4Addr) -> Result<()> {
        self.record(ControlCall::RemoveIpv4 {
            ifname: ifname.to_string(),
            address,
        })
    }

    fn set_ipv6_enabled(&self, ifname: &str, enabled: bool, autoconf: bool) -> Result<()> {
        self.record(ControlCall::SetIpv6Enabled {
            ifname: ifname.to_string(),
            enabled,
            autoconf,
        })
    }

    fn add_ipv6_address(&self, ifname: &str, address: Ipv6Addr, prefix_len: u8) -> Result<()> {
        self.record(ControlCall::AddIpv6 {
            ifname: ifname.to_string(),
            address,
            prefix_len,
        })
    }

    fn remove_ipv6_address(&self, ifname: &str, address: Ipv6Addr, _prefix_len: u8) -> Result<()> {
        self.record(ControlCall::RemoveIpv6 {
            ifname: ifname.to_string(),
            address,
        })
    }

    fn solicit_router(&self, ifname: &str) -> Result<()> {
        self.record(ControlCall::SolicitRouter(ifname.to_string()))
    }

    fn set_admin_up(&self, ifname: &str, up: bool) -> Result<()> {
        self.record(ControlCall::AdminUp {
            ifname: ifname.to_string(),
            up,
        })
    }

    fn detach_protocols(&self, ifname: &str) -> Result<()> {
        self.record(ControlCall::Detach(ifname.to_string()))
    }
}

#[derive(Default)]
pub struct RecordingDhcp {
    sent: Mutex<Vec<(String, DhcpMessage)>>,
}

impl RecordingDhcp {
    pub fn sent(&self) -> Vec<DhcpMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn count(&self, kind: DhcpMessageKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| m.kind == kind)
            .count()
    }

    pub fn last(&self, kind: DhcpMessageKind) -> Option<DhcpMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, m)| m.kind == kind)
            .map(|(_, m)| m.clone())
    }
}

impl DhcpTransport for RecordingDhcp {
    fn send(&self, ifname: &str, message: &DhcpMessage) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((ifname.to_string(), message.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingDhcpv6 {
    sent: Mutex<Vec<(String, Dhcpv6Message)>>,
}

impl RecordingDhcpv6 {
    pub fn sent(&self) -> Vec<Dhcpv6Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Dhcpv6Transport for RecordingDhcpv6 {
    fn send(&self, ifname: &str, message: &Dhcpv6Message) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((ifname.to_string(), message.clone()));
        Ok(())
    }
}

/// Link source with a fixed interface list and a test-driven event stream
pub struct StaticLinkSource {
    interfaces: Vec<Interface>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl StaticLinkSource {
    pub fn new(interfaces: Vec<Interface>) -> (Self, mpsc::UnboundedSender<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            interfaces,
            events: Mutex::new(Some(rx)),
        };
        (source, tx)
    }
}

#[async_trait::async_trait]
impl LinkSource for StaticLinkSource {
    async fn interfaces(&self) -> Result<Vec<Interface>> {
        Ok(self.interfaces.clone())
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = Event> + Send + 'static>> {
        match self.events.lock().unwrap().take() {
            Some(rx) => Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::pending()),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// An engine wired to recording doubles
pub struct Harness {
    pub engine: Engine,
    pub notices: mpsc::Receiver<EngineNotice>,
    pub wire: Wire,
    pub timers: ManualTimers,
    pub control: Arc<RecordingControl>,
    pub dhcp: Arc<RecordingDhcp>,
    pub dhcpv6: Arc<RecordingDhcpv6>,
    pub store: MemoryStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Settings::default(), None)
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self::build(settings, None)
    }

    pub fn build(settings: Settings, link_source: Option<Arc<dyn LinkSource>>) -> Self {
        let wire = Wire::new();
        let timers = ManualTimers::new();
        let control = Arc::new(RecordingControl::default());
        let dhcp = Arc::new(RecordingDhcp::default());
        let dhcpv6 = Arc::new(RecordingDhcpv6::default());
        let store = MemoryStore::new();

        let parts = EngineParts {
            capture: wire.capture(),
            control: control.clone(),
            dhcp: dhcp.clone(),
            dhcpv6: dhcpv6.clone(),
            store: Arc::new(store.clone()),
            link_source,
            timers: Some(Box::new(timers.clone())),
        };
        let (engine, notices) = Engine::new(parts, settings).expect("engine construction succeeds");

        Self {
            engine,
            notices,
            wire,
            timers,
            control,
            dhcp,
            dhcpv6,
            store,
        }
    }

    pub async fn interfaces(&mut self, list: Vec<Interface>) {
        self.engine
            .handle(Event::InterfacesChanged(list))
            .await
            .unwrap();
    }

    pub async fn configure(&mut self, snapshot: ConfigSnapshot) {
        self.engine
            .handle(Event::ConfigChanged(snapshot))
            .await
            .unwrap();
    }

    pub async fn handle(&mut self, event: Event) {
        self.engine.handle(event).await.unwrap();
    }

    /// Fire ARP retry timers until none are armed; returns how many fired
    pub async fn run_arp(&mut self) -> usize {
        let mut fired = 0;
        for _ in 0..100 {
            let tokens = self.timers.take(is_arp);
            if tokens.is_empty() {
                break;
            }
            for token in tokens {
                self.engine.handle(Event::Timer(token)).await.unwrap();
                fired += 1;
            }
        }
        fired
    }

    /// Fire the first armed timer whose key matches; returns whether one fired
    pub async fn fire(&mut self, matches: impl Fn(&TimerKey) -> bool) -> bool {
        let Some(token) = self.timers.take_first(matches) else {
            return false;
        };
        self.engine.handle(Event::Timer(token)).await.unwrap();
        true
    }

    /// Put a frame on the wire and let the engine read it
    pub async fn inject(&mut self, ifname: &str, frame: Bytes) {
        self.wire.inject(ifname, frame);
        self.engine.drain().await.unwrap();
    }

    /// Notices emitted so far
    pub fn drain_notices(&mut self) -> Vec<EngineNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}
