//! Owned system state
//!
//! [`SystemState`] is everything the event loop mutates: the interface list,
//! per-interface control blocks, the service arena, the ARP engine and the
//! timer table. Only the engine's own task touches it, one event at a time.
//!
//! Handlers never recompute cross-service facts themselves. A dispatch that
//! changes a service's observable state sets [`Attention`] bits, and
//! [`SystemState::attend`] runs the matching recomputations once per pass.

use super::EngineNotice;
use crate::arp::ArpEngine;
use crate::config::{AddressFamily, ConfigSnapshot, MethodConfig, MethodKind, Settings};
use crate::error::Status;
use crate::event::{Event, PowerEvent};
use crate::ifstate::IfState;
use crate::interface::{HwAddr, Interface, LinkStatus};
use crate::service::{
    ArpTag, ChangeRequest, Collaborators, EventReply, HandlerResult, Method, Service,
    ServiceContext, ServiceCore, ServiceEvent, ServiceId,
};
use crate::timers::{TimerKey, Timers};
use crate::traits::Entity;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Entities a service publishes under its key
const SERVICE_ENTITIES: [Entity; 5] = [
    Entity::Ipv4,
    Entity::Ipv6,
    Entity::Dhcp,
    Entity::Dhcpv6,
    Entity::Status,
];

/// Cross-cutting recomputations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attention {
    Ranks,
    PrimaryIpv4,
    Election,
    DisableUntilNeeded,
    Busy,
    Publish,
}

impl Attention {
    const ALL: [Attention; 6] = [
        Attention::Ranks,
        Attention::PrimaryIpv4,
        Attention::Election,
        Attention::DisableUntilNeeded,
        Attention::Busy,
        Attention::Publish,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Set of pending [`Attention`] flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AttentionSet(u8);

impl AttentionSet {
    pub fn insert(&mut self, flag: Attention) {
        self.0 |= flag.bit();
    }

    pub fn insert_all(&mut self) {
        for flag in Attention::ALL {
            self.insert(flag);
        }
    }

    pub fn contains(self, flag: Attention) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Take every pending flag, leaving the set empty
    pub fn take(&mut self) -> AttentionSet {
        std::mem::take(self)
    }
}

/// One entity write for the publish store
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub owner: String,
    pub entity: Entity,
    pub value: Option<Value>,
}

impl PendingWrite {
    fn new(owner: impl Into<String>, entity: Entity, value: Option<Value>) -> Self {
        Self {
            owner: owner.into(),
            entity,
            value,
        }
    }
}

pub(crate) struct SystemState {
    /// Every interface the link facility reports
    pub interfaces: BTreeMap<String, Interface>,
    /// Interfaces that are both configured and present
    pub ifstates: BTreeMap<String, IfState>,
    pub services: BTreeMap<ServiceId, Service>,
    pub arp: ArpEngine<ArpTag>,
    pub timers: Timers,
    pub io: Collaborators,
    pub settings: Settings,
    pub desired: ConfigSnapshot,
    pub primary_ipv4: Option<Ipv4Addr>,
    pub attention: AttentionSet,
    /// Keys whose published entities must be removed
    retired: Vec<String>,
    /// Start failures waiting to be published
    rejected: Vec<(String, Status)>,
    /// Rejected configurations, not retried until they change
    rejected_configs: HashMap<String, (String, MethodConfig)>,
    writes: Vec<PendingWrite>,
    next_service: u64,
    notices: mpsc::Sender<EngineNotice>,
}

impl SystemState {
    pub fn new(
        arp: ArpEngine<ArpTag>,
        timers: Timers,
        io: Collaborators,
        settings: Settings,
        notices: mpsc::Sender<EngineNotice>,
    ) -> Self {
        Self {
            interfaces: BTreeMap::new(),
            ifstates: BTreeMap::new(),
            services: BTreeMap::new(),
            arp,
            timers,
            io,
            settings,
            desired: ConfigSnapshot::default(),
            primary_ipv4: None,
            attention: AttentionSet::default(),
            retired: Vec::new(),
            rejected: Vec::new(),
            rejected_configs: HashMap::new(),
            writes: Vec::new(),
            next_service: 1,
            notices,
        }
    }

    /// Emit a monitoring notice
    pub(crate) fn notify(&self, notice: EngineNotice) {
        if self.notices.try_send(notice).is_err() {
            warn!(
                "Notice channel full, dropping notice. Consider increasing notice_channel_capacity."
            );
        }
    }

    /// Run `f` with a service and a context built from disjoint fields
    fn with_context<R>(
        &mut self,
        id: ServiceId,
        f: impl FnOnce(&mut Service, &mut ServiceContext<'_>) -> R,
    ) -> Option<R> {
        let service = self.services.get_mut(&id)?;
        let ifstate = self.ifstates.get(&service.core.ifname)?;
        let mut ctx = ServiceContext {
            arp: &mut self.arp,
            timers: &mut self.timers,
            io: &self.io,
            interface: &ifstate.interface,
            settings: &self.settings,
            clat46: ifstate.clat46,
            primary_ipv4: self.primary_ipv4,
        };
        Some(f(service, &mut ctx))
    }

    /// Deliver one event to one service
    ///
    /// Returns `None` when the service does not exist.
    pub fn dispatch(&mut self, id: ServiceId, event: ServiceEvent) -> Option<HandlerResult> {
        let name = event.name();
        let (before, result, after, dirty) = self.with_context(id, |service, ctx| {
            let before = service.core.observe();
            let result = service.handle(ctx, event);
            let after = service.core.observe();
            (before, result, after, service.core.publication.dirty)
        })?;
        trace!("{} handled {}: {:?}", id, name, result);

        if before != after {
            self.attention.insert(Attention::Ranks);
            self.attention.insert(Attention::PrimaryIpv4);
            self.attention.insert(Attention::Election);
            self.attention.insert(Attention::DisableUntilNeeded);
        }
        if before.busy != after.busy {
            self.attention.insert(Attention::Busy);
        }
        if dirty {
            self.attention.insert(Attention::Publish);
        }
        Some(result)
    }

    /// Deliver an event to every service on an interface, optionally of one family
    fn dispatch_interface(
        &mut self,
        ifname: &str,
        family: Option<AddressFamily>,
        event: ServiceEvent,
    ) {
        let Some(ifstate) = self.ifstates.get(ifname) else {
            debug!("Dropping {} for unconfigured interface {}", event.name(), ifname);
            return;
        };
        let ids: Vec<ServiceId> = match family {
            Some(family) => ifstate.services_of(family).to_vec(),
            None => ifstate.services().collect(),
        };
        for id in ids {
            self.dispatch(id, event.clone());
        }
    }

    /// Deliver an event to every service
    fn dispatch_all(&mut self, event: ServiceEvent) {
        let ids: Vec<ServiceId> = self.services.keys().copied().collect();
        for id in ids {
            self.dispatch(id, event.clone());
        }
    }

    pub fn find_by_key(&self, key: &str) -> Option<ServiceId> {
        self.services
            .values()
            .find(|s| s.key() == key)
            .map(Service::id)
    }

    /// Create and start a service
    ///
    /// A start failure tears the service down again and records the status
    /// for publishing. Returns the id of a running service.
    pub fn create_service(
        &mut self,
        ifname: &str,
        key: String,
        config: MethodConfig,
        parent: Option<ServiceId>,
        link_local_allocate: bool,
    ) -> Option<ServiceId> {
        let ifstate = self.ifstates.get_mut(ifname)?;
        let id = ServiceId::new(self.next_service);
        self.next_service += 1;

        let kind = config.kind();
        let mut core = ServiceCore::new(id, key.clone(), ifname, kind);
        core.parent = parent;
        core.publication.dirty = true;
        let method = Method::from_config(&config, link_local_allocate);

        ifstate.add_service(id, kind.family());
        if kind == MethodKind::LinkLocal {
            ifstate.link_local = Some(id);
        }
        let stored = parent.is_none().then(|| config.clone());
        self.services.insert(id, Service::new(core, method, stored));
        self.rejected_configs.remove(&key);
        self.attention.insert_all();

        info!("Starting {} ({}) on {}", key, kind, ifname);
        match self.dispatch(id, ServiceEvent::Start) {
            Some(Err(status)) => {
                warn!("{} ({}) on {} rejected: {}", key, kind, ifname, status);
                self.destroy_service(id);
                if parent.is_none() {
                    self.rejected_configs
                        .insert(key.clone(), (ifname.to_string(), config));
                }
                self.rejected.push((key.clone(), status));
                self.notify(EngineNotice::ServiceRejected {
                    service: key,
                    interface: ifname.to_string(),
                    status,
                });
                None
            }
            _ => {
                self.notify(EngineNotice::ServiceStarted {
                    service: key,
                    interface: ifname.to_string(),
                    method: kind,
                });
                Some(id)
            }
        }
    }

    /// Stop and remove a service (and its child first)
    pub fn destroy_service(&mut self, id: ServiceId) {
        let Some(service) = self.services.get(&id) else {
            return;
        };
        if let Some(child) = service.core.child {
            self.destroy_service(child);
        }

        self.dispatch(id, ServiceEvent::Stop);
        self.with_context(id, |service, ctx| service.core.free(ctx));
        let Some(service) = self.services.remove(&id) else {
            return;
        };

        if let Some(parent) = service.core.parent.and_then(|p| self.services.get_mut(&p))
            && parent.core.child == Some(id)
        {
            parent.core.child = None;
        }
        if let Some(ifstate) = self.ifstates.get_mut(&service.core.ifname) {
            ifstate.remove_service(id);
        }
        self.timers.cancel_service(id);
        self.retired.push(service.core.key.clone());
        self.attention.insert_all();

        info!("Stopped {} on {}", service.core.key, service.core.ifname);
        self.notify(EngineNotice::ServiceStopped {
            service: service.core.key,
            interface: service.core.ifname,
        });
    }

    /// Adopt a new configuration snapshot
    pub fn apply_config(&mut self, snapshot: ConfigSnapshot) {
        if let Err(e) = snapshot.validate() {
            warn!("Ignoring invalid configuration: {}", e);
            return;
        }
        debug!(
            "Configuration: {} interfaces, order {:?}",
            snapshot.interfaces.len(),
            snapshot.order
        );
        self.desired = snapshot;
        self.attention.insert_all();
        self.reconcile();
    }

    /// Make the running services match the desired configuration
    fn reconcile(&mut self) {
        let desired = self.desired.clone();

        for ifconfig in &desired.interfaces {
            if !self.ifstates.contains_key(&ifconfig.name)
                && let Some(interface) = self.interfaces.get(&ifconfig.name)
            {
                debug!("{}: now configured", ifconfig.name);
                self.ifstates
                    .insert(ifconfig.name.clone(), IfState::new(interface.clone()));
            }
            if let Some(ifstate) = self.ifstates.get_mut(&ifconfig.name) {
                ifstate.disable_until_needed = ifconfig.disable_until_needed;
            }
        }

        // Changed and removed services
        let existing: Vec<(ServiceId, String, String, Option<MethodConfig>)> = self
            .services
            .values()
            .filter(|s| !s.core.is_child())
            .map(|s| {
                (
                    s.id(),
                    s.key().to_string(),
                    s.core.ifname.clone(),
                    s.config.clone(),
                )
            })
            .collect();
        for (id, key, ifname, current) in existing {
            if !self.services.contains_key(&id) {
                continue;
            }
            let wanted = desired
                .interface(&ifname)
                .and_then(|i| i.services.iter().find(|s| s.id == key))
                .map(|s| s.method.clone());
            match wanted {
                None => self.destroy_service(id),
                Some(config) if current.as_ref() == Some(&config) => {}
                Some(config) => {
                    let reply = self.dispatch(
                        id,
                        ServiceEvent::Change(ChangeRequest::Config(config.clone())),
                    );
                    if let Some(Ok(EventReply::NeedsStop(false))) = reply {
                        debug!("{}: changed in place", key);
                        if let Some(service) = self.services.get_mut(&id) {
                            service.config = Some(config);
                        }
                    } else {
                        info!("{}: restarting for new configuration", key);
                        self.destroy_service(id);
                        self.create_service(&ifname, key, config, None, true);
                    }
                }
            }
        }

        // New services
        for ifconfig in &desired.interfaces {
            if !self.ifstates.contains_key(&ifconfig.name) {
                continue;
            }
            for service in &ifconfig.services {
                if self.find_by_key(&service.id).is_some() {
                    continue;
                }
                let previously_rejected = self
                    .rejected_configs
                    .get(&service.id)
                    .is_some_and(|(ifname, config)| {
                        *ifname == ifconfig.name && *config == service.method
                    });
                if previously_rejected {
                    continue;
                }
                self.create_service(
                    &ifconfig.name,
                    service.id.clone(),
                    service.method.clone(),
                    None,
                    true,
                );
            }
        }

        // Rejections whose configuration went away
        let stale: Vec<String> = self
            .rejected_configs
            .keys()
            .filter(|key| {
                !desired
                    .interfaces
                    .iter()
                    .any(|i| i.services.iter().any(|s| s.id == **key))
            })
            .cloned()
            .collect();
        for key in stale {
            self.rejected_configs.remove(&key);
            self.retired.push(key);
        }

        let unconfigured: Vec<String> = self
            .ifstates
            .iter()
            .filter(|(name, ifstate)| desired.interface(name).is_none() && !ifstate.has_services())
            .map(|(name, _)| name.clone())
            .collect();
        for name in unconfigured {
            self.forget_interface(&name);
        }
    }

    /// Destroy an interface's services and drop its control block
    fn forget_interface(&mut self, ifname: &str) {
        let Some(ifstate) = self.ifstates.get(ifname) else {
            return;
        };
        let ids: Vec<ServiceId> = ifstate.services().collect();
        for id in ids {
            self.destroy_service(id);
        }
        self.timers
            .cancel(&TimerKey::LinkInactive(ifname.to_string()));
        if let Some(ifstate) = self.ifstates.remove(ifname)
            && ifstate.busy_published.is_some()
        {
            self.writes
                .push(PendingWrite::new(ifname, Entity::Busy, None));
        }
        self.attention.insert_all();
        debug!("{}: forgotten", ifname);
    }

    /// Take a fresh interface list from the link facility
    pub fn interfaces_changed(&mut self, list: Vec<Interface>) {
        let fresh: BTreeMap<String, Interface> =
            list.into_iter().map(|i| (i.name.clone(), i)).collect();

        let mut link_updates = Vec::new();
        let names: Vec<String> = self.ifstates.keys().cloned().collect();
        for name in names {
            let Some(ifstate) = self.ifstates.get_mut(&name) else {
                continue;
            };
            match fresh.get(&name) {
                Some(interface) if interface.index == ifstate.interface.index => {
                    let link = ifstate.interface.link;
                    ifstate.interface = Interface {
                        link,
                        ..interface.clone()
                    };
                    link_updates.push((name, interface.link));
                }
                _ => {
                    info!("{}: interface went away", name);
                    self.forget_interface(&name);
                    self.notify(EngineNotice::InterfaceRemoved { interface: name });
                }
            }
        }

        self.interfaces = fresh;
        let hwaddrs: Vec<HwAddr> = self.interfaces.values().filter_map(|i| i.hwaddr).collect();
        self.arp.set_local_hwaddrs(hwaddrs);
        self.reconcile();

        for (name, status) in link_updates {
            self.link_status_changed(&name, status);
        }
    }

    pub fn link_status_changed(&mut self, ifname: &str, status: LinkStatus) {
        if let Some(interface) = self.interfaces.get_mut(ifname) {
            interface.link = status;
        }
        let Some(ifstate) = self.ifstates.get_mut(ifname) else {
            return;
        };
        if !ifstate.set_link(status) {
            return;
        }

        let key = TimerKey::LinkInactive(ifname.to_string());
        if status.is_usable() {
            info!("{}: link up", ifname);
            self.timers.cancel(&key);
        } else {
            info!("{}: link down", ifname);
            let delay = Duration::from_secs(self.settings.engine.link_inactive_secs);
            self.timers.set(key, delay);
        }
        self.dispatch_interface(ifname, None, ServiceEvent::MediaChanged);
    }

    fn link_timer_expired(&mut self, ifname: &str) {
        let usable = self
            .ifstates
            .get(ifname)
            .is_some_and(|s| s.interface.link.is_usable());
        if usable {
            return;
        }
        info!("{}: link inactive", ifname);
        self.dispatch_interface(ifname, None, ServiceEvent::LinkTimerExpired);
    }

    fn bssid_changed(&mut self, ifname: &str, ssid: Option<String>, bssid: Option<HwAddr>) {
        if let Some(interface) = self.interfaces.get_mut(ifname) {
            interface.ssid = ssid.clone();
            interface.bssid = bssid;
        }
        let Some(ifstate) = self.ifstates.get_mut(ifname) else {
            return;
        };
        if ifstate.interface.ssid == ssid && ifstate.interface.bssid == bssid {
            return;
        }
        debug!("{}: associated with {:?} ({:?})", ifname, ssid, bssid);
        ifstate.interface.ssid = ssid;
        ifstate.interface.bssid = bssid;
        self.dispatch_interface(ifname, None, ServiceEvent::BssidChanged);
    }

    fn power(&mut self, event: PowerEvent) {
        match event {
            PowerEvent::Sleep => {
                let names: Vec<String> = self
                    .ifstates
                    .values_mut()
                    .filter(|s| !s.active_during_sleep && !s.asleep)
                    .map(|s| {
                        s.asleep = true;
                        s.name().to_string()
                    })
                    .collect();
                for name in names {
                    self.dispatch_interface(&name, None, ServiceEvent::Sleep);
                }
            }
            PowerEvent::Wake => {
                let names: Vec<String> = self
                    .ifstates
                    .values_mut()
                    .filter(|s| s.asleep)
                    .map(|s| {
                        s.asleep = false;
                        s.wake_generation += 1;
                        s.name().to_string()
                    })
                    .collect();
                for name in names {
                    self.dispatch_interface(&name, None, ServiceEvent::Wake);
                }
            }
            PowerEvent::PowerOff => self.dispatch_all(ServiceEvent::PowerOff),
        }
    }

    /// Apply one queue event
    pub fn process(&mut self, event: Event) {
        trace!("Processing {}", event.name());
        match event {
            Event::InterfacesChanged(list) => self.interfaces_changed(list),
            Event::ConfigChanged(snapshot) => self.apply_config(snapshot),
            Event::LinkStatusChanged { ifname, status } => {
                self.link_status_changed(&ifname, status)
            }
            Event::BssidChanged {
                ifname,
                ssid,
                bssid,
            } => self.bssid_changed(&ifname, ssid, bssid),
            Event::Power(power) => self.power(power),
            Event::Renew { ifname } => {
                self.dispatch_interface(&ifname, None, ServiceEvent::Renew)
            }
            Event::ArpCollision {
                ifname,
                address,
                hwaddr,
            } => self.dispatch_interface(
                &ifname,
                Some(AddressFamily::V4),
                ServiceEvent::ArpCollision { address, hwaddr },
            ),
            Event::Ipv6AddressChanged { ifname, addresses } => self.dispatch_interface(
                &ifname,
                Some(AddressFamily::V6),
                ServiceEvent::Ipv6AddressChanged(addresses),
            ),
            Event::RouterAdvertisement { ifname, advert } => self.dispatch_interface(
                &ifname,
                Some(AddressFamily::V6),
                ServiceEvent::RouterAdvertisement(advert),
            ),
            Event::Ipv6RouterExpired { ifname } => self.dispatch_interface(
                &ifname,
                Some(AddressFamily::V6),
                ServiceEvent::Ipv6RouterExpired,
            ),
            Event::PlatDiscoveryComplete { ifname, success } => {
                if let Some(ifstate) = self.ifstates.get_mut(&ifname) {
                    ifstate.clat46 = success;
                }
                self.attention.insert(Attention::Election);
                self.dispatch_interface(
                    &ifname,
                    Some(AddressFamily::V6),
                    ServiceEvent::PlatDiscoveryComplete(success),
                );
            }
            Event::ActiveDuringSleep { ifname, active } => {
                if let Some(ifstate) = self.ifstates.get_mut(&ifname) {
                    ifstate.active_during_sleep = active;
                }
                self.dispatch_interface(&ifname, None, ServiceEvent::ActiveDuringSleep(active));
            }
            Event::ForgetSsid { ifname, ssid } => self.dispatch_interface(
                &ifname,
                Some(AddressFamily::V4),
                ServiceEvent::ForgetSsid(ssid),
            ),
            Event::Dhcp { ifname, reply } => self.dispatch_interface(
                &ifname,
                Some(AddressFamily::V4),
                ServiceEvent::Dhcp(reply),
            ),
            Event::Dhcpv6 { ifname, reply } => self.dispatch_interface(
                &ifname,
                Some(AddressFamily::V6),
                ServiceEvent::Dhcpv6(reply),
            ),
            Event::CaptureReadable { ifname } => {
                if let Err(e) = self.arp.handle_readable(&ifname, &mut self.timers) {
                    warn!("{}: reading capture failed: {}", ifname, e);
                }
            }
            Event::Timer(token) => {
                if !self.timers.accept(&token) {
                    trace!("Dropping stale timer {:?}", token.key);
                    return;
                }
                match token.key {
                    TimerKey::Arp(client) => self.arp.handle_timer(client, &mut self.timers),
                    TimerKey::Service(id, timer) => {
                        self.dispatch(id, ServiceEvent::Timer(timer));
                    }
                    TimerKey::LinkInactive(ifname) => self.link_timer_expired(&ifname),
                }
            }
        }
    }

    /// Deliver queued ARP completions; returns how many were current
    pub fn deliver_completions(&mut self) -> usize {
        let mut delivered = 0;
        for completion in self.arp.take_completions() {
            if !self.arp.accept(&completion) {
                trace!("Dropping superseded completion for {}", completion.client);
                continue;
            }
            delivered += 1;
            let service = completion.tag.service;
            self.dispatch(service, ServiceEvent::Arp(completion));
        }
        delivered
    }

    /// Run the recomputations pending attention asks for
    ///
    /// Returns `false` when nothing was pending.
    pub fn attend(&mut self) -> bool {
        let pending = self.attention.take();
        if pending.is_empty() {
            return false;
        }
        if pending.contains(Attention::Ranks) {
            self.recompute_ranks();
        }
        if pending.contains(Attention::PrimaryIpv4) {
            self.update_primary_ipv4();
        }
        if pending.contains(Attention::Election) {
            self.elect_link_local();
        }
        if pending.contains(Attention::DisableUntilNeeded) {
            self.disable_until_needed();
        }
        if pending.contains(Attention::Busy) {
            self.aggregate_busy();
        }
        if pending.contains(Attention::Publish) {
            self.collect_writes();
        }
        true
    }

    fn aggregate_busy(&mut self) {
        for (name, ifstate) in self.ifstates.iter_mut() {
            let busy = ifstate
                .services()
                .any(|id| self.services.get(&id).is_some_and(|s| s.core.busy));
            if ifstate.busy_published == Some(busy) {
                continue;
            }
            trace!("{}: busy {}", name, busy);
            ifstate.busy_published = Some(busy);
            self.writes
                .push(PendingWrite::new(name.as_str(), Entity::Busy, Some(json!(busy))));
        }
    }

    fn collect_writes(&mut self) {
        for key in self.retired.drain(..) {
            for entity in SERVICE_ENTITIES {
                self.writes.push(PendingWrite::new(key.as_str(), entity, None));
            }
        }
        for (key, status) in self.rejected.drain(..) {
            self.writes
                .push(PendingWrite::new(key, Entity::Status, Some(json!(status))));
        }
        for service in self.services.values_mut() {
            if !std::mem::take(&mut service.core.publication.dirty) {
                continue;
            }
            for (entity, value) in service.core.entity_values() {
                self.writes
                    .push(PendingWrite::new(service.key(), entity, value));
            }
        }
    }

    /// Drain the writes collected so far
    pub fn take_writes(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.writes)
    }

    /// Ask one service a question (`get-dhcp-info`, `get-ipv6-info`,
    /// `provide-summary`)
    pub fn query(&mut self, key: &str, event: ServiceEvent) -> Option<EventReply> {
        let id = self.find_by_key(key)?;
        self.dispatch(id, event)?.ok()
    }

    /// Per-interface summary of every service
    pub fn summary(&mut self) -> Value {
        let names: Vec<String> = self.ifstates.keys().cloned().collect();
        let mut interfaces = Vec::with_capacity(names.len());
        for name in names {
            let Some(ifstate) = self.ifstates.get(&name) else {
                continue;
            };
            let ids: Vec<ServiceId> = ifstate.services().collect();
            let mut header = json!({
                "interface": name,
                "rank": ifstate.rank,
                "services_ready": ifstate.services_ready,
                "disabled": ifstate.disabled,
                "asleep": ifstate.asleep,
                "clat46": ifstate.clat46,
                "wake_generation": ifstate.wake_generation,
                "link": ifstate.interface.link,
            });
            let services: Vec<Value> = ids
                .into_iter()
                .filter_map(|id| match self.dispatch(id, ServiceEvent::ProvideSummary) {
                    Some(Ok(EventReply::Summary(summary))) => Some(summary),
                    _ => None,
                })
                .collect();
            header["services"] = Value::Array(services);
            interfaces.push(header);
        }
        json!({
            "primary_ipv4": self.primary_ipv4,
            "interfaces": interfaces,
        })
    }
}
