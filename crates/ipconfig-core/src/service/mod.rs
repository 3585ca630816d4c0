//! Services
//!
//! A [`Service`] is one configuration attempt: one address family, one method,
//! one interface. It is split in two:
//!
//! - [`ServiceCore`]: what every method shares (status, ready/busy flags,
//!   family payload, router validity, publication bookkeeping)
//! - [`Method`]: the method-specific state, which alone interprets
//!   [`ServiceEvent`]s through the [`MethodHandler`] trait
//!
//! Handlers never call back into the engine. Everything asynchronous (ARP
//! results, timers, protocol replies) comes back as another `ServiceEvent`.

mod dhcp;
mod dhcpv6_pd;
mod failover;
mod inform;
mod linklocal;
mod linklocal_v6;
mod manual;
mod manual_v6;
pub mod router;
mod rtadv;
mod stf;

use crate::arp::{ArpAddress, ArpClientId, ArpCompletion, ArpEngine, ArpResult, DetectCadence};
use crate::config::{AddressFamily, MethodConfig, MethodKind, Settings};
use crate::error::Status;
use crate::event::{Ipv6AddressState, RouterAdvert};
use crate::interface::{HwAddr, Interface};
use crate::timers::{ServiceTimer, TimerKey, Timers};
use crate::traits::{
    DelegatedPrefix, DhcpReply, DhcpTransport, Dhcpv6Reply, Dhcpv6Transport, Entity,
    InterfaceControl,
};
use chrono::{DateTime, Utc};
use router::RouterValidity;
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) use dhcp::DhcpState;
pub(crate) use dhcpv6_pd::PrefixDelegationState;
pub(crate) use failover::FailoverState;
pub(crate) use inform::InformState;
pub(crate) use linklocal::LinkLocalState;
pub(crate) use linklocal_v6::LinkLocalV6State;
pub(crate) use manual::ManualState;
pub(crate) use manual_v6::ManualV6State;
pub(crate) use rtadv::RtadvState;
pub(crate) use stf::StfState;

/// Stable identifier of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceId(u64);

impl ServiceId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "svc#{}", self.0)
    }
}

/// Why a service started an ARP operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArpPurpose {
    /// Conflict probe of a candidate address
    Probe,
    /// Hardware address of the default router
    RouterResolve,
    /// Is a previously known router present on this link
    RouterDetect,
    /// Gratuitous announcements of an assigned address
    Announce,
}

/// Completion tag of ARP operations started by services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpTag {
    pub service: ServiceId,
    pub purpose: ArpPurpose,
}

/// Updated parameters offered through `change`
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRequest {
    /// New configuration from the store
    Config(MethodConfig),
    /// Link-local child: switch address allocation on or off
    LinkLocalAllocate(bool),
}

/// Lifecycle events plus internal continuations
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Start,
    Stop,
    Change(ChangeRequest),
    Renew,
    MediaChanged,
    BssidChanged,
    LinkTimerExpired,
    ArpCollision { address: Ipv4Addr, hwaddr: HwAddr },
    Sleep,
    Wake,
    PowerOff,
    Ipv6AddressChanged(Vec<Ipv6AddressState>),
    Ipv6RouterExpired,
    PlatDiscoveryComplete(bool),
    ActiveDuringSleep(bool),
    ForgetSsid(String),
    GetDhcpInfo,
    GetIpv6Info,
    ProvideSummary,

    /// ARP operation finished
    Arp(ArpCompletion<ArpTag>),
    /// Method timer fired
    Timer(ServiceTimer),
    Dhcp(DhcpReply),
    Dhcpv6(Dhcpv6Reply),
    RouterAdvertisement(RouterAdvert),
    /// Best IPv4 address of the host changed
    PrimaryIpv4(Option<Ipv4Addr>),
}

impl ServiceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceEvent::Start => "start",
            ServiceEvent::Stop => "stop",
            ServiceEvent::Change(_) => "change",
            ServiceEvent::Renew => "renew",
            ServiceEvent::MediaChanged => "media-changed",
            ServiceEvent::BssidChanged => "bssid-changed",
            ServiceEvent::LinkTimerExpired => "link-timer-expired",
            ServiceEvent::ArpCollision { .. } => "arp-collision",
            ServiceEvent::Sleep => "sleep",
            ServiceEvent::Wake => "wake",
            ServiceEvent::PowerOff => "power-off",
            ServiceEvent::Ipv6AddressChanged(_) => "ipv6-address-changed",
            ServiceEvent::Ipv6RouterExpired => "ipv6-router-expired",
            ServiceEvent::PlatDiscoveryComplete(_) => "plat-discovery-complete",
            ServiceEvent::ActiveDuringSleep(_) => "active-during-sleep",
            ServiceEvent::ForgetSsid(_) => "forget-ssid",
            ServiceEvent::GetDhcpInfo => "get-dhcp-info",
            ServiceEvent::GetIpv6Info => "get-ipv6-info",
            ServiceEvent::ProvideSummary => "provide-summary",
            ServiceEvent::Arp(_) => "arp-complete",
            ServiceEvent::Timer(_) => "timer",
            ServiceEvent::Dhcp(_) => "dhcp-reply",
            ServiceEvent::Dhcpv6(_) => "dhcpv6-reply",
            ServiceEvent::RouterAdvertisement(_) => "router-advertisement",
            ServiceEvent::PrimaryIpv4(_) => "primary-ipv4",
        }
    }
}

/// Answer of a handler
#[derive(Debug, Clone, PartialEq)]
pub enum EventReply {
    Done,
    /// Answer to `change`: whether the service must be recreated
    NeedsStop(bool),
    DhcpInfo(Option<Value>),
    Ipv6Info(Option<Value>),
    Summary(Value),
}

/// `Err` carries the status a failed `start` (or any failed event) reports
pub type HandlerResult = std::result::Result<EventReply, Status>;

/// Collaborators methods act through
#[derive(Clone)]
pub struct Collaborators {
    pub control: Arc<dyn InterfaceControl>,
    pub dhcp: Arc<dyn DhcpTransport>,
    pub dhcpv6: Arc<dyn Dhcpv6Transport>,
}

/// Everything a handler may touch besides its own service
pub struct ServiceContext<'a> {
    pub arp: &'a mut ArpEngine<ArpTag>,
    pub timers: &'a mut Timers,
    pub io: &'a Collaborators,
    pub interface: &'a Interface,
    pub settings: &'a Settings,
    /// IPv6-only network with IPv4 translation on this interface
    pub clat46: bool,
    /// Best IPv4 address of the host
    pub primary_ipv4: Option<Ipv4Addr>,
}

impl ServiceContext<'_> {
    pub fn ifname(&self) -> &str {
        &self.interface.name
    }

    pub fn link_usable(&self) -> bool {
        self.interface.link.is_usable()
    }
}

/// Per-method handler
pub(crate) trait MethodHandler {
    fn handle(
        &mut self,
        core: &mut ServiceCore,
        ctx: &mut ServiceContext<'_>,
        event: ServiceEvent,
    ) -> HandlerResult;
}

/// Assigned IPv4 configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ipv4Info {
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
}

/// One configured IPv6 address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ipv6Address {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
}

/// Assigned IPv6 configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ipv6Info {
    pub addresses: Vec<Ipv6Address>,
    pub router: Option<Ipv6Addr>,
    pub prefixes: Vec<DelegatedPrefix>,
}

/// IPv4 payload
#[derive(Debug, Clone, Default)]
pub struct Ipv4State {
    pub requested: Option<(Ipv4Addr, Ipv4Addr)>,
    pub assigned: Option<Ipv4Info>,
    pub router: RouterValidity,
}

/// IPv6 payload
#[derive(Debug, Clone, Default)]
pub struct Ipv6State {
    pub requested: Option<(Ipv6Addr, u8)>,
    pub assigned: Option<Ipv6Info>,
    pub clat46: bool,
    pub dhcpv6_disabled: bool,
}

/// Family payload; the variant always matches the method's family
#[derive(Debug, Clone)]
pub enum FamilyState {
    V4(Ipv4State),
    V6(Ipv6State),
}

impl FamilyState {
    fn for_family(family: AddressFamily) -> Self {
        match family {
            AddressFamily::V4 => FamilyState::V4(Ipv4State::default()),
            AddressFamily::V6 => FamilyState::V6(Ipv6State::default()),
        }
    }
}

/// Facts a successful method publishes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Facts {
    pub ipv4: Option<Ipv4Info>,
    pub ipv6: Option<Ipv6Info>,
    pub dhcp: Option<Value>,
    pub dhcpv6: Option<Value>,
    /// Link-local in no-allocate mode: only the 169.254/16 subnet
    pub link_local_subnet: bool,
}

impl Facts {
    pub fn ipv4(info: Ipv4Info) -> Self {
        Self {
            ipv4: Some(info),
            ..Self::default()
        }
    }

    pub fn ipv6(info: Ipv6Info) -> Self {
        Self {
            ipv6: Some(info),
            ..Self::default()
        }
    }

    pub fn link_local_subnet() -> Self {
        Self {
            link_local_subnet: true,
            ..Self::default()
        }
    }

    pub fn with_dhcp(mut self, value: Value) -> Self {
        self.dhcp = Some(value);
        self
    }

    pub fn with_dhcpv6(mut self, value: Value) -> Self {
        self.dhcpv6 = Some(value);
        self
    }
}

/// Publication bookkeeping
#[derive(Debug, Clone, Default)]
pub struct Publication {
    pub facts: Option<Facts>,
    /// Needs to be written to the store in the next pass
    pub dirty: bool,
    /// When an address was last published (conflict cooldown)
    pub last_assigned: Option<DateTime<Utc>>,
}

/// What the dispatcher watches to decide which recomputations are due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Observed {
    pub status: Status,
    pub ready: bool,
    pub has_address: bool,
    pub busy: bool,
    pub clat46: bool,
}

/// State shared by all methods
#[derive(Debug)]
pub struct ServiceCore {
    pub id: ServiceId,
    /// External service identifier (publish owner)
    pub key: String,
    pub ifname: String,
    pub kind: MethodKind,
    pub status: Status,
    pub ready: bool,
    pub busy: bool,
    pub parent: Option<ServiceId>,
    pub child: Option<ServiceId>,
    pub family: FamilyState,
    pub publication: Publication,
    arp_client: Option<ArpClientId>,
}

impl ServiceCore {
    pub fn new(id: ServiceId, key: impl Into<String>, ifname: impl Into<String>, kind: MethodKind) -> Self {
        Self {
            id,
            key: key.into(),
            ifname: ifname.into(),
            kind,
            status: Status::Success,
            ready: false,
            busy: false,
            parent: None,
            child: None,
            family: FamilyState::for_family(kind.family()),
            publication: Publication::default(),
            arp_client: None,
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.kind.family()
    }

    pub fn v4(&self) -> Option<&Ipv4State> {
        match &self.family {
            FamilyState::V4(state) => Some(state),
            FamilyState::V6(_) => None,
        }
    }

    pub fn v4_mut(&mut self) -> Option<&mut Ipv4State> {
        match &mut self.family {
            FamilyState::V4(state) => Some(state),
            FamilyState::V6(_) => None,
        }
    }

    pub fn v6(&self) -> Option<&Ipv6State> {
        match &self.family {
            FamilyState::V6(state) => Some(state),
            FamilyState::V4(_) => None,
        }
    }

    pub fn v6_mut(&mut self) -> Option<&mut Ipv6State> {
        match &mut self.family {
            FamilyState::V6(state) => Some(state),
            FamilyState::V4(_) => None,
        }
    }

    pub fn router(&self) -> Option<&RouterValidity> {
        self.v4().map(|s| &s.router)
    }

    /// Assigned IPv4 address, if any
    pub fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.v4()?.assigned.as_ref().map(|i| i.address)
    }

    pub fn has_address(&self) -> bool {
        match &self.family {
            FamilyState::V4(s) => s.assigned.is_some(),
            FamilyState::V6(s) => s.assigned.as_ref().is_some_and(|i| !i.addresses.is_empty()),
        }
    }

    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    pub fn clat46(&self) -> bool {
        self.v6().is_some_and(|s| s.clat46)
    }

    pub(crate) fn observe(&self) -> Observed {
        Observed {
            status: self.status,
            ready: self.ready,
            has_address: self.has_address(),
            busy: self.busy,
            clat46: self.clat46(),
        }
    }

    /// Publish success
    ///
    /// Idempotent: publishing the same facts again changes nothing and does
    /// not refresh the last-assigned time. Returns whether anything changed.
    pub fn publish_success(&mut self, facts: Facts) -> bool {
        if self.ready && self.status.is_success() && self.publication.facts.as_ref() == Some(&facts) {
            return false;
        }
        match &mut self.family {
            FamilyState::V4(s) => s.assigned = facts.ipv4.clone(),
            FamilyState::V6(s) => s.assigned = facts.ipv6.clone(),
        }
        if facts.ipv4.is_some() || facts.ipv6.is_some() {
            self.publication.last_assigned = Some(Utc::now());
        }
        self.publication.facts = Some(facts);
        self.publication.dirty = true;
        self.status = Status::Success;
        self.ready = true;
        self.busy = false;
        debug!("{} ({}) published", self.key, self.kind);
        true
    }

    /// Publish a failure, clearing previously published facts
    pub fn publish_failure(&mut self, status: Status) {
        if self.ready && self.status == status && self.publication.facts.is_none() {
            return;
        }
        self.clear_assigned();
        self.publication.facts = None;
        self.publication.dirty = true;
        self.status = status;
        self.ready = true;
        self.busy = false;
        debug!("{} ({}) failed: {}", self.key, self.kind, status);
    }

    /// Withdraw published facts while the method works on a new result
    pub fn unpublish(&mut self) {
        if !self.ready && self.publication.facts.is_none() && self.status.is_success() {
            return;
        }
        self.clear_assigned();
        self.publication.facts = None;
        self.publication.dirty = true;
        self.status = Status::Success;
        self.ready = false;
    }

    fn clear_assigned(&mut self) {
        match &mut self.family {
            FamilyState::V4(s) => s.assigned = None,
            FamilyState::V6(s) => s.assigned = None,
        }
    }

    /// Published facts changed without a status change (router verified)
    pub fn touch_publication(&mut self) {
        if self.publication.facts.is_some() {
            self.publication.dirty = true;
        }
    }

    /// Arm one of this service's timers
    pub fn set_timer(&self, ctx: &mut ServiceContext<'_>, timer: ServiceTimer, delay: Duration) {
        ctx.timers.set(TimerKey::Service(self.id, timer), delay);
    }

    pub fn cancel_timer(&self, ctx: &mut ServiceContext<'_>, timer: ServiceTimer) {
        ctx.timers.cancel(&TimerKey::Service(self.id, timer));
    }

    fn arp_client(&mut self, ctx: &mut ServiceContext<'_>) -> Option<ArpClientId> {
        if self.arp_client.is_none() {
            match ctx.arp.create_client(ctx.interface) {
                Ok(id) => self.arp_client = Some(id),
                Err(e) => {
                    debug!("{}: no ARP on {}: {}", self.key, ctx.interface.name, e);
                    return None;
                }
            }
        }
        self.arp_client
    }

    fn tag(&self, purpose: ArpPurpose) -> ArpTag {
        ArpTag {
            service: self.id,
            purpose,
        }
    }

    /// Probe `address`; returns `false` when the link cannot do ARP
    pub fn arp_probe(&mut self, ctx: &mut ServiceContext<'_>, address: Ipv4Addr) -> bool {
        let Some(client) = self.arp_client(ctx) else {
            return false;
        };
        let tag = self.tag(ArpPurpose::Probe);
        ctx.arp
            .probe(client, Ipv4Addr::UNSPECIFIED, address, tag, ctx.timers);
        self.busy = true;
        true
    }

    /// Announce an address that was assigned without probing
    pub fn arp_announce(&mut self, ctx: &mut ServiceContext<'_>, address: Ipv4Addr) -> bool {
        let Some(client) = self.arp_client(ctx) else {
            return false;
        };
        let tag = self.tag(ArpPurpose::Announce);
        ctx.arp
            .announce(client, address, address, false, tag, ctx.timers);
        true
    }

    /// Look for a known router
    pub fn arp_detect_router(
        &mut self,
        ctx: &mut ServiceContext<'_>,
        our_ip: Ipv4Addr,
        router: Ipv4Addr,
        router_hw: HwAddr,
    ) -> bool {
        let Some(client) = self.arp_client(ctx) else {
            return false;
        };
        let tag = self.tag(ArpPurpose::RouterDetect);
        let candidate = ArpAddress {
            sender_ip: our_ip,
            target_ip: router,
            target_hw: Some(router_hw),
        };
        if let Some(state) = self.v4_mut() {
            state.router.resolve_started();
        }
        ctx.arp
            .detect(client, vec![candidate], DetectCadence::Detect, tag, ctx.timers);
        true
    }

    /// Start resolving the router's hardware address if it is not verified
    pub fn resolve_router(&mut self, ctx: &mut ServiceContext<'_>) {
        let Some(our_ip) = self.ipv4_address() else {
            return;
        };
        let Some(state) = self.v4() else {
            return;
        };
        if !state.router.needs_resolve() {
            return;
        }
        let Some(router) = state.router.address() else {
            return;
        };
        let Some(client) = self.arp_client(ctx) else {
            return;
        };
        let tag = self.tag(ArpPurpose::RouterResolve);
        if let Some(state) = self.v4_mut() {
            state.router.resolve_started();
        }
        let timeout = Duration::from_secs(u64::from(ctx.settings.arp.resolve_timeout_secs));
        ctx.arp
            .resolve(client, our_ip, router, timeout, tag, ctx.timers);
    }

    /// Apply a router resolve result
    ///
    /// Republishes whenever the published router view changes, which covers
    /// a re-resolve that no longer gets an answer.
    pub fn router_resolved(&mut self, result: &ArpResult) {
        let key = self.key.clone();
        let Some(state) = self.v4_mut() else {
            return;
        };
        let before = (state.router.is_arp_verified(), state.router.verified_hwaddr());
        if state.router.resolve_finished(result) {
            debug!("{}: router {:?} verified", key, state.router.address());
        } else if state.router.flags().resolve_timed_out {
            debug!("{}: router {:?} did not answer", key, state.router.address());
        }
        let after = (state.router.is_arp_verified(), state.router.verified_hwaddr());
        if before != after {
            self.touch_publication();
        }
    }

    /// Drop router verification after a renewal or link change
    pub fn router_stale(&mut self) {
        if let Some(state) = self.v4_mut()
            && state.router.clear_arp_verified()
        {
            self.touch_publication();
        }
    }

    /// Send a gratuitous defense of `address`
    pub fn arp_defend(&mut self, ctx: &mut ServiceContext<'_>, address: Ipv4Addr) {
        let Some(client) = self.arp_client(ctx) else {
            return;
        };
        if let Err(e) = ctx.arp.defend(client, address) {
            warn!("{}: defending {} failed: {}", self.key, address, e);
        }
    }

    /// Cancel any ARP operation in flight
    pub fn arp_cancel(&mut self, ctx: &mut ServiceContext<'_>) {
        if let Some(client) = self.arp_client {
            ctx.arp.cancel(client, ctx.timers);
        }
        if let Some(state) = self.v4_mut() {
            state.router.resolve_cancelled();
        }
    }

    /// Cancel every ARP operation and timer owned by this service
    pub fn release(&mut self, ctx: &mut ServiceContext<'_>) {
        self.arp_cancel(ctx);
        ctx.timers.cancel_service(self.id);
        self.busy = false;
    }

    /// Release and free the ARP client (service destruction)
    pub fn free(&mut self, ctx: &mut ServiceContext<'_>) {
        self.release(ctx);
        if let Some(client) = self.arp_client.take() {
            ctx.arp.free(client, ctx.timers);
        }
    }

    /// Remove the assigned IPv4 address from the interface
    pub fn remove_ipv4(&mut self, ctx: &mut ServiceContext<'_>) {
        if let Some(address) = self.ipv4_address()
            && let Err(e) = ctx.io.control.remove_ipv4_address(ctx.ifname(), address)
        {
            warn!("{}: removing {} failed: {}", self.key, address, e);
        }
    }

    /// Apply an IPv4 address to the interface; logs failures
    pub fn apply_ipv4(&self, ctx: &mut ServiceContext<'_>, address: Ipv4Addr, mask: Ipv4Addr) -> bool {
        match ctx.io.control.set_ipv4_address(ctx.ifname(), address, mask) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: setting {} failed: {}", self.key, address, e);
                false
            }
        }
    }

    /// Common part of the `provide-summary` answer
    pub fn summary(&self) -> Value {
        json!({
            "service": self.key,
            "interface": self.ifname,
            "method": self.kind,
            "status": self.status,
            "ready": self.ready,
            "busy": self.busy,
            "parent": self.parent,
            "child": self.child,
            "last_assigned": self.publication.last_assigned,
        })
    }

    /// Entity values to write for this service
    pub fn entity_values(&self) -> Vec<(Entity, Option<Value>)> {
        let facts = self.publication.facts.as_ref();
        let ipv4 = match (facts, &self.family) {
            (Some(f), FamilyState::V4(state)) => match &f.ipv4 {
                Some(info) => Some(json!({
                    "interface": self.ifname,
                    "addresses": [info.address],
                    "subnet_masks": [info.subnet_mask],
                    "router": info.router,
                    "router_hwaddr": state.router.verified_hwaddr(),
                    "router_arp_verified": state.router.is_arp_verified(),
                })),
                None if f.link_local_subnet => Some(json!({
                    "interface": self.ifname,
                    "subnet": "169.254.0.0/16",
                })),
                None => None,
            },
            (Some(_), FamilyState::V6(state)) if state.clat46 => Some(json!({
                "interface": self.ifname,
                "clat46": true,
            })),
            _ => None,
        };
        let ipv6 = facts
            .and_then(|f| f.ipv6.as_ref())
            .map(|info| {
                json!({
                    "interface": self.ifname,
                    "addresses": info.addresses,
                    "router": info.router,
                    "prefixes": info.prefixes,
                })
            });
        let status = self.ready.then(|| json!(self.status));
        vec![
            (Entity::Ipv4, ipv4),
            (Entity::Ipv6, ipv6),
            (Entity::Dhcp, facts.and_then(|f| f.dhcp.clone())),
            (Entity::Dhcpv6, facts.and_then(|f| f.dhcpv6.clone())),
            (Entity::Status, status),
        ]
    }
}

/// Method-specific state
#[derive(Debug)]
pub(crate) enum Method {
    Manual(ManualState),
    Dhcp(DhcpState),
    Inform(InformState),
    LinkLocal(LinkLocalState),
    Failover(FailoverState),
    Rtadv(RtadvState),
    Stf(StfState),
    ManualV6(ManualV6State),
    LinkLocalV6(LinkLocalV6State),
    Dhcpv6Pd(PrefixDelegationState),
}

impl Method {
    /// Build the method state from its parameters
    ///
    /// `link_local_allocate` is only used for link-local services.
    pub fn from_config(config: &MethodConfig, link_local_allocate: bool) -> Self {
        match config {
            MethodConfig::Manual {
                address,
                subnet_mask,
                router,
            } => Method::Manual(ManualState::new(*address, *subnet_mask, *router)),
            MethodConfig::Dhcp { client_id } => Method::Dhcp(DhcpState::new(false, client_id.clone())),
            MethodConfig::Bootp => Method::Dhcp(DhcpState::new(true, None)),
            MethodConfig::Inform {
                address,
                subnet_mask,
                client_id,
            } => Method::Inform(InformState::new(*address, *subnet_mask, client_id.clone())),
            MethodConfig::LinkLocal => Method::LinkLocal(LinkLocalState::new(link_local_allocate)),
            MethodConfig::Failover {
                address,
                subnet_mask,
                timeout_secs,
            } => Method::Failover(FailoverState::new(*address, *subnet_mask, *timeout_secs)),
            MethodConfig::Rtadv { dhcpv6_disabled } => Method::Rtadv(RtadvState::new(*dhcpv6_disabled)),
            MethodConfig::Stf { relay } => Method::Stf(StfState::new(*relay)),
            MethodConfig::ManualV6 {
                address,
                prefix_len,
            } => Method::ManualV6(ManualV6State::new(*address, *prefix_len)),
            MethodConfig::LinkLocalV6 => Method::LinkLocalV6(LinkLocalV6State::default()),
            MethodConfig::Dhcpv6Pd {
                prefix_hint,
                prefix_hint_len,
            } => Method::Dhcpv6Pd(PrefixDelegationState::new(
                (*prefix_hint).zip(*prefix_hint_len),
            )),
        }
    }

    /// Allocation mode of a link-local method
    pub fn link_local_allocate(&self) -> Option<bool> {
        match self {
            Method::LinkLocal(state) => Some(state.allocate()),
            _ => None,
        }
    }

    fn handler(&mut self) -> &mut dyn MethodHandler {
        match self {
            Method::Manual(s) => s,
            Method::Dhcp(s) => s,
            Method::Inform(s) => s,
            Method::LinkLocal(s) => s,
            Method::Failover(s) => s,
            Method::Rtadv(s) => s,
            Method::Stf(s) => s,
            Method::ManualV6(s) => s,
            Method::LinkLocalV6(s) => s,
            Method::Dhcpv6Pd(s) => s,
        }
    }
}

/// One configuration attempt
#[derive(Debug)]
pub struct Service {
    pub core: ServiceCore,
    pub(crate) method: Method,
    /// Parameters the service was started or last changed with; `None` for
    /// spawned children
    pub(crate) config: Option<MethodConfig>,
}

impl Service {
    pub(crate) fn new(core: ServiceCore, method: Method, config: Option<MethodConfig>) -> Self {
        Self {
            core,
            method,
            config,
        }
    }

    pub fn id(&self) -> ServiceId {
        self.core.id
    }

    pub fn key(&self) -> &str {
        &self.core.key
    }

    pub fn kind(&self) -> MethodKind {
        self.core.kind
    }

    /// Allocation mode, for link-local services
    pub fn link_local_allocate(&self) -> Option<bool> {
        self.method.link_local_allocate()
    }

    /// Route one event to the method handler
    ///
    /// Router validity glue runs first: renewals and link changes make the
    /// cached router stale, and router resolve results are applied here for
    /// every IPv4 method alike.
    pub(crate) fn handle(&mut self, ctx: &mut ServiceContext<'_>, event: ServiceEvent) -> HandlerResult {
        if matches!(
            event,
            ServiceEvent::Renew | ServiceEvent::MediaChanged | ServiceEvent::BssidChanged
        ) {
            self.core.router_stale();
        }

        if let ServiceEvent::Arp(completion) = &event
            && completion.tag.purpose == ArpPurpose::RouterResolve
        {
            self.core.router_resolved(&completion.result);
            return Ok(EventReply::Done);
        }

        let Service { core, method, .. } = self;
        method.handler().handle(core, ctx, event)
    }
}

/// Common answers to queries most methods have no data for
pub(crate) fn default_reply(core: &ServiceCore, event: &ServiceEvent) -> HandlerResult {
    match event {
        ServiceEvent::Change(_) => Ok(EventReply::NeedsStop(true)),
        ServiceEvent::GetDhcpInfo => Ok(EventReply::DhcpInfo(None)),
        ServiceEvent::GetIpv6Info => Ok(EventReply::Ipv6Info(None)),
        ServiceEvent::ProvideSummary => Ok(EventReply::Summary(core.summary())),
        _ => Ok(EventReply::Done),
    }
}

/// Merge method-specific fields into the common summary
pub(crate) fn summary_with(core: &ServiceCore, extra: Value) -> HandlerResult {
    let mut summary = core.summary();
    if let (Value::Object(base), Value::Object(extra)) = (&mut summary, extra) {
        base.extend(extra);
    }
    Ok(EventReply::Summary(summary))
}

/// Mask implied by the address class, for servers that send none
pub(crate) fn classful_mask(address: Ipv4Addr) -> Ipv4Addr {
    match address.octets()[0] {
        0..=127 => Ipv4Addr::new(255, 0, 0, 0),
        128..=191 => Ipv4Addr::new(255, 255, 0, 0),
        _ => Ipv4Addr::new(255, 255, 255, 0),
    }
}

/// Whether a mask is a contiguous run of ones
pub(crate) fn is_valid_mask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}
