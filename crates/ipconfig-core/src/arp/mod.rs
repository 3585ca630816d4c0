//! ARP session engine
//!
//! Runs probe, resolve, detect, announce and defend operations over a raw
//! capture device.
//!
//! ## Structure
//!
//! ```text
//! ArpEngine
//!  ├── sessions: ifname -> ArpIfSession (one capture handle, ref-counted)
//!  ├── clients:  ArpClientId -> ArpClient (one operation each)
//!  └── completions: results waiting for the next queue pass
//! ```
//!
//! Every client of an interface shares that interface's capture handle. The
//! first client to start an operation opens and filters the device; the last
//! one to finish or cancel closes it.
//!
//! Results are never delivered synchronously. A match found while reading a
//! batch, an expired retry budget, or a failure to open the device all queue
//! an [`ArpCompletion`]; the owner drains the queue with
//! [`ArpEngine::take_completions`] after the current event is handled.

pub mod client;
pub mod frame;
mod session;

pub use client::{ArpCommand, DetectCadence};

use crate::config::ArpSettings;
use crate::error::{Error, Result};
use crate::event::EventSender;
use crate::interface::{HwAddr, Interface};
use crate::timers::{TimerKey, Timers};
use crate::traits::{CaptureNotifier, LinkCapture};
use client::{ArpClient, FrameMatch, Outgoing, Phase, Step};
use frame::FrameLayout;
use serde::Serialize;
use session::ArpIfSession;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Stable identifier of an ARP client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArpClientId(u64);

impl fmt::Display for ArpClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arp#{}", self.0)
    }
}

/// Addresses an operation is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArpAddress {
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
    pub target_hw: Option<HwAddr>,
}

impl Default for ArpAddress {
    fn default() -> Self {
        Self {
            sender_ip: Ipv4Addr::UNSPECIFIED,
            target_ip: Ipv4Addr::UNSPECIFIED,
            target_hw: None,
        }
    }
}

/// Outcome of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArpResult {
    /// The capture device could not be used; see the client's error message
    pub error: bool,
    /// Probe/announce: address is taken. Resolve/detect: target answered.
    pub in_use: bool,
    pub addr: ArpAddress,
}

/// A result waiting to be delivered
#[derive(Debug, Clone)]
pub struct ArpCompletion<T> {
    pub client: ArpClientId,
    pub sequence: u64,
    pub command: ArpCommand,
    pub tag: T,
    pub result: ArpResult,
}

/// ARP session engine, generic over the completion tag
pub struct ArpEngine<T> {
    capture: Arc<dyn LinkCapture>,
    events: EventSender,
    settings: ArpSettings,
    sessions: HashMap<String, ArpIfSession>,
    clients: HashMap<ArpClientId, ArpClient<T>>,
    completions: VecDeque<ArpCompletion<T>>,
    local_hwaddrs: HashSet<HwAddr>,
    next_id: u64,
    next_sequence: u64,
}

impl<T> ArpEngine<T> {
    pub fn new(capture: Arc<dyn LinkCapture>, events: EventSender, settings: ArpSettings) -> Self {
        Self {
            capture,
            events,
            settings,
            sessions: HashMap::new(),
            clients: HashMap::new(),
            completions: VecDeque::new(),
            local_hwaddrs: HashSet::new(),
            next_id: 1,
            next_sequence: 1,
        }
    }

    pub fn settings(&self) -> &ArpSettings {
        &self.settings
    }

    /// Replace the set of hardware addresses that belong to this host
    ///
    /// Frames sent from any of these never match an operation.
    pub fn set_local_hwaddrs(&mut self, hwaddrs: impl IntoIterator<Item = HwAddr>) {
        self.local_hwaddrs = hwaddrs.into_iter().collect();
        for session in self.sessions.values() {
            self.local_hwaddrs.insert(session.hwaddr);
        }
    }

    /// Create a client bound to an interface
    pub fn create_client(&mut self, interface: &Interface) -> Result<ArpClientId> {
        let layout = FrameLayout::for_interface(interface).ok_or_else(|| {
            Error::invalid_input(format!("{} does not support ARP", interface.name))
        })?;
        let hwaddr = interface
            .hwaddr
            .ok_or_else(|| Error::invalid_input(format!("{} has no link address", interface.name)))?;

        let id = ArpClientId(self.next_id);
        self.next_id += 1;

        let session = self
            .sessions
            .entry(interface.name.clone())
            .or_insert_with(|| ArpIfSession::new(layout, hwaddr));
        session.hwaddr = hwaddr;
        session.clients.push(id);
        self.local_hwaddrs.insert(hwaddr);
        self.clients
            .insert(id, ArpClient::new(interface.name.clone()));
        trace!("Created {} on {}", id, interface.name);
        Ok(id)
    }

    /// Destroy a client, dropping its interface session when it was the last
    pub fn free(&mut self, id: ArpClientId, timers: &mut Timers) {
        self.cancel(id, timers);
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(&client.ifname) {
            session.clients.retain(|c| *c != id);
            if session.clients.is_empty() {
                self.sessions.remove(&client.ifname);
                trace!("Removed ARP session for {}", client.ifname);
            }
        }
    }

    /// RFC 5227 probe for `target_ip`, followed by gratuitous announcements
    pub fn probe(
        &mut self,
        id: ArpClientId,
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        tag: T,
        timers: &mut Timers,
    ) {
        if self.begin(id, ArpCommand::Probe, tag, sender_ip, target_ip, timers) {
            self.advance(id, timers);
        }
    }

    /// Resolve the hardware address of `target_ip`
    ///
    /// One request per resolve interval until `timeout` is used up.
    pub fn resolve(
        &mut self,
        id: ArpClientId,
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        timeout: Duration,
        tag: T,
        timers: &mut Timers,
    ) {
        let interval = self.settings.resolve_interval().as_millis().max(1);
        let limit = u32::try_from(timeout.as_millis().div_ceil(interval))
            .unwrap_or(u32::MAX)
            .max(1);
        if self.begin(id, ArpCommand::Resolve, tag, sender_ip, target_ip, timers) {
            if let Some(client) = self.clients.get_mut(&id) {
                client.limit = limit;
            }
            self.advance(id, timers);
        }
    }

    /// Find which of several known (ip, hwaddr) pairs answers
    pub fn detect(
        &mut self,
        id: ArpClientId,
        candidates: Vec<ArpAddress>,
        cadence: DetectCadence,
        tag: T,
        timers: &mut Timers,
    ) {
        let first = candidates.first().copied().unwrap_or_default();
        if self.begin(
            id,
            ArpCommand::Detect,
            tag,
            first.sender_ip,
            first.target_ip,
            timers,
        ) {
            if let Some(client) = self.clients.get_mut(&id) {
                client.candidates = candidates;
                client.cadence = cadence;
            }
            self.advance(id, timers);
        }
    }

    /// Gratuitous announcements only
    ///
    /// With `skip_first` the caller already sent the first announcement.
    pub fn announce(
        &mut self,
        id: ArpClientId,
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        skip_first: bool,
        tag: T,
        timers: &mut Timers,
    ) {
        if !self.begin(id, ArpCommand::Announce, tag, sender_ip, target_ip, timers) {
            return;
        }
        if skip_first {
            if let Some(client) = self.clients.get_mut(&id) {
                client.tries = 1;
            }
            timers.set(TimerKey::Arp(id), self.settings.gratuitous_interval());
        } else {
            self.advance(id, timers);
        }
    }

    /// Send one gratuitous request for `our_ip`, synchronously
    pub fn defend(&mut self, id: ArpClientId, our_ip: Ipv4Addr) -> Result<()> {
        let client = self
            .clients
            .get(&id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        let session = self
            .sessions
            .get_mut(&client.ifname)
            .ok_or_else(|| Error::not_found(client.ifname.clone()))?;

        let transient = !session.is_open();
        if transient {
            let notifier = CaptureNotifier::new(client.ifname.clone(), self.events.clone());
            session.acquire(&client.ifname, self.capture.as_ref(), notifier)?;
        }
        let frame = session.encode(Outgoing::Announcement { ip: our_ip });
        let result = session.transmit(&frame);
        if transient {
            session.release();
        }
        info!("Defended {} on {}", our_ip, client.ifname);
        result
    }

    /// Stop whatever the client is doing
    ///
    /// Safe in every state and idempotent. Drops a queued completion, releases
    /// this client's share of the capture handle and cancels its retry timer.
    pub fn cancel(&mut self, id: ArpClientId, timers: &mut Timers) {
        timers.cancel(&TimerKey::Arp(id));
        self.completions.retain(|c| c.client != id);
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        client.tag = None;
        client.command = ArpCommand::Idle;
        client.phase = Phase::Done;
        if client.holds_handle {
            client.holds_handle = false;
            if let Some(session) = self.sessions.get_mut(&client.ifname) {
                session.release();
            }
        }
    }

    /// Retry timer of a client fired
    pub fn handle_timer(&mut self, id: ArpClientId, timers: &mut Timers) {
        self.advance(id, timers);
    }

    /// Process one readable batch on an interface
    ///
    /// Returns the number of ARP frames examined.
    pub fn handle_readable(&mut self, ifname: &str, timers: &mut Timers) -> Result<usize> {
        let Some(session) = self.sessions.get_mut(ifname) else {
            return Ok(0);
        };
        let frames = session.read_batch().map_err(|e| match e {
            Error::Capture { .. } => e,
            other => Error::capture(ifname, other.to_string()),
        })?;
        let order = session.clients.clone();

        let mut matched = Vec::new();
        for frame in &frames {
            if self.local_hwaddrs.contains(&frame.sender_hw) {
                continue;
            }
            for id in &order {
                let Some(client) = self.clients.get_mut(id) else {
                    continue;
                };
                match client.match_frame(frame) {
                    FrameMatch::None => {}
                    FrameMatch::InUse(addr) => {
                        client.phase = Phase::Reported;
                        matched.push((*id, addr));
                    }
                    FrameMatch::Collision => {
                        client.conflicts += 1;
                        if client.conflicts > self.settings.conflict_retry_count {
                            client.phase = Phase::Reported;
                            matched.push((
                                *id,
                                ArpAddress {
                                    sender_ip: client.sender_ip,
                                    target_ip: client.target_ip,
                                    target_hw: Some(frame.sender_hw),
                                },
                            ));
                        } else {
                            debug!(
                                "{} probe collision on {} ({}/{}), re-probing",
                                id, client.target_ip, client.conflicts, self.settings.conflict_retry_count
                            );
                            client.phase = Phase::ConflictWait;
                            client.tries = 0;
                            timers.set(TimerKey::Arp(*id), self.settings.conflict_retry_delay());
                        }
                    }
                }
            }
        }

        // Handle releases wait until the whole batch has been examined
        for (id, addr) in matched {
            self.finish(id, true, addr, timers);
        }
        Ok(frames.len())
    }

    /// Drain queued completions
    pub fn take_completions(&mut self) -> VecDeque<ArpCompletion<T>> {
        std::mem::take(&mut self.completions)
    }

    pub fn has_completions(&self) -> bool {
        !self.completions.is_empty()
    }

    /// Whether a drained completion is still current for its client
    pub fn accept(&self, completion: &ArpCompletion<T>) -> bool {
        self.clients
            .get(&completion.client)
            .is_some_and(|client| client.sequence == completion.sequence)
    }

    /// Error text of the client's last operation
    pub fn error_message(&self, id: ArpClientId) -> Option<&str> {
        self.clients.get(&id)?.error_message.as_deref()
    }

    /// Current command of a client
    pub fn command(&self, id: ArpClientId) -> Option<ArpCommand> {
        self.clients.get(&id).map(|c| c.command)
    }

    /// References held on an interface's capture handle
    pub fn open_count(&self, ifname: &str) -> usize {
        self.sessions.get(ifname).map_or(0, |s| s.open_count)
    }

    pub fn is_open(&self, ifname: &str) -> bool {
        self.sessions.get(ifname).is_some_and(|s| s.is_open())
    }

    /// Clients registered on an interface
    pub fn client_count(&self, ifname: &str) -> usize {
        self.sessions.get(ifname).map_or(0, |s| s.clients.len())
    }

    /// Start a new operation on a client
    ///
    /// Returns `false` when the operation ended immediately (unknown client,
    /// or the capture device could not be opened).
    fn begin(
        &mut self,
        id: ArpClientId,
        command: ArpCommand,
        tag: T,
        sender_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        timers: &mut Timers,
    ) -> bool {
        self.cancel(id, timers);
        let Some(client) = self.clients.get_mut(&id) else {
            warn!("{} does not exist", id);
            return false;
        };
        let Some(session) = self.sessions.get_mut(&client.ifname) else {
            warn!("{} has no session on {}", id, client.ifname);
            return false;
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        client.reset(command, tag, sequence);
        client.sender_ip = sender_ip;
        client.target_ip = target_ip;

        let notifier = CaptureNotifier::new(client.ifname.clone(), self.events.clone());
        match session.acquire(&client.ifname, self.capture.as_ref(), notifier) {
            Ok(()) => {
                client.holds_handle = true;
                true
            }
            Err(e) => {
                warn!("{} {:?} on {} failed: {}", id, command, client.ifname, e);
                client.error_message = Some(e.to_string());
                client.command = ArpCommand::Idle;
                client.phase = Phase::Done;
                if let Some(tag) = client.tag.take() {
                    self.completions.push_back(ArpCompletion {
                        client: id,
                        sequence,
                        command,
                        tag,
                        result: ArpResult {
                            error: true,
                            in_use: false,
                            addr: client.address(),
                        },
                    });
                }
                false
            }
        }
    }

    /// Run the client's next retry step
    fn advance(&mut self, id: ArpClientId, timers: &mut Timers) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&client.ifname) else {
            return;
        };

        match client.next_step(&self.settings) {
            Step::Send { frames, wait } => {
                let mut failure = None;
                for outgoing in frames {
                    let frame = session.encode(outgoing);
                    if let Err(e) = session.transmit(&frame) {
                        failure = Some(e);
                        break;
                    }
                }
                match failure {
                    None => timers.set(TimerKey::Arp(id), wait),
                    Some(e) => {
                        warn!("{} transmit on {} failed: {}", id, client.ifname, e);
                        client.error_message = Some(e.to_string());
                        let addr = client.address();
                        self.finish_with(id, true, false, addr, timers);
                    }
                }
            }
            Step::Finish => {
                let addr = client.address();
                trace!("{} {:?} finished without a match", id, client.command);
                self.finish(id, false, addr, timers);
            }
            Step::Nothing => {}
        }
    }

    fn finish(&mut self, id: ArpClientId, in_use: bool, addr: ArpAddress, timers: &mut Timers) {
        self.finish_with(id, false, in_use, addr, timers);
    }

    /// End the current operation and queue its completion
    fn finish_with(
        &mut self,
        id: ArpClientId,
        error: bool,
        in_use: bool,
        addr: ArpAddress,
        timers: &mut Timers,
    ) {
        timers.cancel(&TimerKey::Arp(id));
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let command = client.command;
        client.command = ArpCommand::Idle;
        client.phase = Phase::Done;
        if client.holds_handle {
            client.holds_handle = false;
            if let Some(session) = self.sessions.get_mut(&client.ifname) {
                session.release();
            }
        }
        if let Some(tag) = client.tag.take() {
            self.completions.push_back(ArpCompletion {
                client: id,
                sequence: client.sequence,
                command,
                tag,
                result: ArpResult {
                    error,
                    in_use,
                    addr,
                },
            });
        }
    }
}
