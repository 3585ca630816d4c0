//! DHCP and BOOTP lease acquisition
//!
//! ```text
//!            ┌──────────── NAK / retries exhausted ─────────────┐
//!            v                                                  │
//!  Selecting ──OFFER──> Requesting ──ACK──> Probing ──clear──> Bound ──T1──> Renewing ──T2──> Rebinding
//!      ^                                      │                  ^                                │
//!      └──── decline_retry ── Declined <── in use                └──────────── ACK ───────────────┘
//!
//!  wake / roam:  RebootDetect (ARP for the saved router) ──found──> Bound
//!                                 └──not found──> InitReboot ──ACK──> Probing
//! ```
//!
//! BOOTP uses the same machine without REQUEST, renewal or rebinding: a
//! BOOTREPLY to the BOOTREQUEST goes straight to probing and the lease never
//! expires.
//!
//! The last lease is remembered per wireless network (SSID; wired links use
//! the empty key) so a wake or roam back to a known network can skip
//! discovery.

use super::{
    ArpPurpose, ChangeRequest, EventReply, Facts, HandlerResult, Ipv4Info, MethodHandler,
    ServiceContext, ServiceCore, ServiceEvent, classful_mask, default_reply, summary_with,
};
use crate::config::MethodConfig;
use crate::error::Status;
use crate::interface::HwAddr;
use crate::timers::ServiceTimer;
use crate::traits::{DhcpMessage, DhcpMessageKind, DhcpOptions, DhcpReply, DhcpReplyKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Phase {
    Inactive,
    Selecting,
    Requesting,
    Probing,
    Bound,
    Renewing,
    Rebinding,
    InitReboot,
    RebootDetect,
    Declined,
}

#[derive(Debug, Clone)]
struct Lease {
    address: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    router: Option<Ipv4Addr>,
    /// Only set from a verified router
    router_hwaddr: Option<HwAddr>,
    server_id: Option<Ipv4Addr>,
    options: Arc<dyn DhcpOptions>,
    acquired: DateTime<Utc>,
    /// `None` is an infinite lease
    lease_time: Option<Duration>,
    renewal_time: Option<Duration>,
    rebinding_time: Option<Duration>,
}

impl Lease {
    fn from_reply(reply: &DhcpReply, bootp: bool) -> Self {
        let options = reply.options.clone();
        let lease_time = if bootp { None } else { options.lease_time() };
        Self {
            address: reply.yiaddr,
            subnet_mask: options
                .subnet_mask()
                .unwrap_or_else(|| classful_mask(reply.yiaddr)),
            router: options.find_router(reply.yiaddr),
            router_hwaddr: None,
            server_id: reply.server_id,
            acquired: Utc::now(),
            lease_time,
            renewal_time: options.renewal_time(),
            rebinding_time: options.rebinding_time(),
            options,
        }
    }

    fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired).to_std().unwrap_or(Duration::ZERO)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_time
            .is_some_and(|lease| self.elapsed(now) >= lease)
    }

    fn info(&self) -> Ipv4Info {
        Ipv4Info {
            address: self.address,
            subnet_mask: self.subnet_mask,
            router: self.router,
        }
    }
}

#[derive(Debug)]
pub(crate) struct DhcpState {
    bootp: bool,
    client_id: Option<String>,
    phase: Phase,
    xid: u32,
    tries: u32,
    /// Offered address and server while requesting
    offer: Option<(Ipv4Addr, Option<Ipv4Addr>)>,
    /// Lease being probed or confirmed
    pending: Option<Lease>,
    /// Lease in use
    lease: Option<Lease>,
    /// Network the current lease was obtained on; `None` once forgotten
    save_key: Option<String>,
    saved: HashMap<String, Lease>,
}

impl DhcpState {
    pub fn new(bootp: bool, client_id: Option<String>) -> Self {
        Self {
            bootp,
            client_id,
            phase: Phase::Inactive,
            xid: 0,
            tries: 0,
            offer: None,
            pending: None,
            lease: None,
            save_key: None,
            saved: HashMap::new(),
        }
    }

    fn network_key(ctx: &ServiceContext<'_>) -> String {
        ctx.interface.ssid.clone().unwrap_or_default()
    }

    fn message(&self, ctx: &ServiceContext<'_>, kind: DhcpMessageKind) -> DhcpMessage {
        let mut message = DhcpMessage::new(kind, self.xid);
        message.hwaddr = ctx.interface.hwaddr;
        message.client_id = self.client_id.clone();
        message
    }

    fn send(&self, core: &ServiceCore, ctx: &ServiceContext<'_>, message: &DhcpMessage) {
        if let Err(e) = ctx.io.dhcp.send(ctx.ifname(), message) {
            warn!("{}: sending {:?} failed: {}", core.key, message.kind, e);
        }
    }

    fn new_transaction(&mut self) {
        self.xid = rand::random();
        self.tries = 0;
    }

    fn start_selecting(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        core.cancel_timer(ctx, ServiceTimer::Retransmit);
        core.cancel_timer(ctx, ServiceTimer::Retry);
        self.phase = Phase::Selecting;
        self.offer = None;
        self.pending = None;
        self.new_transaction();
        core.busy = true;
        self.send_discover(core, ctx);
    }

    fn send_discover(&mut self, core: &ServiceCore, ctx: &mut ServiceContext<'_>) {
        self.tries += 1;
        let kind = if self.bootp {
            DhcpMessageKind::BootRequest
        } else {
            DhcpMessageKind::Discover
        };
        let message = self.message(ctx, kind);
        self.send(core, ctx, &message);
        core.set_timer(ctx, ServiceTimer::Retransmit, ctx.settings.dhcp.backoff(self.tries));
    }

    fn send_request(&mut self, core: &ServiceCore, ctx: &mut ServiceContext<'_>) {
        self.tries += 1;
        let mut message = self.message(ctx, DhcpMessageKind::Request);
        match self.phase {
            Phase::Requesting => {
                if let Some((address, server)) = self.offer {
                    message.requested_ip = Some(address);
                    message.server_id = server;
                }
            }
            Phase::InitReboot => {
                message.requested_ip = self.pending.as_ref().map(|l| l.address);
            }
            Phase::Renewing | Phase::Rebinding => {
                message.ciaddr = self.lease.as_ref().map(|l| l.address);
                message.broadcast = self.phase == Phase::Rebinding;
            }
            _ => return,
        }
        self.send(core, ctx, &message);
        let delay = match self.phase {
            Phase::Renewing | Phase::Rebinding => {
                Duration::from_secs(ctx.settings.dhcp.renew_retry_secs)
            }
            _ => ctx.settings.dhcp.backoff(self.tries),
        };
        core.set_timer(ctx, ServiceTimer::Retransmit, delay);
    }

    /// Use the saved lease for this network if there is one
    fn reboot(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        core.arp_cancel(ctx);
        core.cancel_timer(ctx, ServiceTimer::Retransmit);
        let key = Self::network_key(ctx);
        let now = Utc::now();
        if self.saved.get(&key).is_some_and(|l| l.is_expired(now)) {
            debug!("{}: saved lease for {:?} expired", core.key, key);
            self.saved.remove(&key);
        }
        let saved = if self.bootp {
            None
        } else {
            self.saved.get(&key).cloned()
        };
        let Some(lease) = saved else {
            self.drop_address(core, ctx);
            self.start_selecting(core, ctx);
            return;
        };
        if self.lease.as_ref().is_some_and(|l| l.address != lease.address) {
            self.drop_address(core, ctx);
        }
        core.busy = true;
        if let Some(state) = core.v4_mut() {
            state.router.set_address(lease.router);
        }
        if let (Some(router), Some(hwaddr)) = (lease.router, lease.router_hwaddr) {
            self.phase = Phase::RebootDetect;
            let address = lease.address;
            self.pending = Some(lease);
            if core.arp_detect_router(ctx, address, router, hwaddr) {
                debug!("{}: looking for router {} at {}", core.key, router, hwaddr);
                return;
            }
            let Some(lease) = self.pending.take() else {
                return;
            };
            self.init_reboot(core, ctx, lease);
        } else {
            self.init_reboot(core, ctx, lease);
        }
    }

    fn init_reboot(&mut self, core: &ServiceCore, ctx: &mut ServiceContext<'_>, lease: Lease) {
        self.phase = Phase::InitReboot;
        self.pending = Some(lease);
        self.new_transaction();
        self.send_request(core, ctx);
    }

    fn begin_probe(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, lease: Lease) {
        core.cancel_timer(ctx, ServiceTimer::Retransmit);
        self.phase = Phase::Probing;
        let address = lease.address;
        self.pending = Some(lease);
        if !core.arp_probe(ctx, address)
            && let Some(lease) = self.pending.take()
        {
            self.bind(core, ctx, lease);
        }
    }

    fn bind(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, lease: Lease) {
        core.cancel_timer(ctx, ServiceTimer::Retransmit);
        if !core.apply_ipv4(ctx, lease.address, lease.subnet_mask) {
            self.phase = Phase::Inactive;
            core.publish_failure(Status::InternalError);
            let retry = Duration::from_secs(ctx.settings.dhcp.decline_retry_secs);
            core.set_timer(ctx, ServiceTimer::Retry, retry);
            return;
        }
        self.phase = Phase::Bound;
        self.tries = 0;
        if let Some(state) = core.v4_mut() {
            state.requested = Some((lease.address, lease.subnet_mask));
            state.router.set_address(lease.router);
        }
        let facts = Facts::ipv4(lease.info()).with_dhcp(lease.options.to_json());
        if core.publish_success(facts) {
            info!(
                "{}: bound to {} on {} (lease {:?})",
                core.key,
                lease.address,
                ctx.ifname(),
                lease.lease_time
            );
        }
        self.arm_lease_timers(core, ctx, &lease);

        let key = Self::network_key(ctx);
        self.saved.insert(key.clone(), lease.clone());
        self.save_key = Some(key);
        self.lease = Some(lease);
        core.resolve_router(ctx);
    }

    fn arm_lease_timers(&self, core: &ServiceCore, ctx: &mut ServiceContext<'_>, lease: &Lease) {
        for timer in [ServiceTimer::Renew, ServiceTimer::Rebind, ServiceTimer::Expire] {
            core.cancel_timer(ctx, timer);
        }
        let Some(total) = lease.lease_time else {
            return;
        };
        let elapsed = lease.elapsed(Utc::now());
        let t1 = lease.renewal_time.unwrap_or(total / 2);
        let t2 = lease.rebinding_time.unwrap_or(total * 7 / 8);
        core.set_timer(ctx, ServiceTimer::Renew, t1.saturating_sub(elapsed));
        core.set_timer(ctx, ServiceTimer::Rebind, t2.saturating_sub(elapsed));
        core.set_timer(ctx, ServiceTimer::Expire, total.saturating_sub(elapsed));
    }

    /// Remember the router's hardware address with the saved lease
    fn remember_router(&mut self, core: &ServiceCore) {
        let hwaddr = core.router().and_then(|r| r.hwaddr());
        let Some(lease) = self.lease.as_mut() else {
            return;
        };
        if hwaddr.is_some() {
            lease.router_hwaddr = hwaddr;
        }
        if let Some(key) = &self.save_key {
            self.saved.insert(key.clone(), lease.clone());
        }
    }

    fn drop_address(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        for timer in [ServiceTimer::Renew, ServiceTimer::Rebind, ServiceTimer::Expire] {
            core.cancel_timer(ctx, timer);
        }
        if self.lease.take().is_some() {
            core.remove_ipv4(ctx);
            core.unpublish();
        }
    }

    fn forget_current(&mut self) {
        if let Some(key) = self.save_key.take() {
            self.saved.remove(&key);
        }
    }

    fn decline(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, lease: &Lease) {
        let mut message = self.message(ctx, DhcpMessageKind::Decline);
        message.requested_ip = Some(lease.address);
        message.server_id = lease.server_id;
        self.send(core, ctx, &message);

        self.drop_address(core, ctx);
        self.forget_current();
        self.pending = None;
        self.phase = Phase::Declined;
        core.publish_failure(Status::AddressInUse);
        let retry = Duration::from_secs(ctx.settings.dhcp.decline_retry_secs);
        core.set_timer(ctx, ServiceTimer::Retry, retry);
    }

    fn release_lease(&mut self, core: &ServiceCore, ctx: &ServiceContext<'_>) {
        if self.bootp || !ctx.settings.dhcp.release_on_stop {
            return;
        }
        if let Some(lease) = &self.lease {
            let mut message = self.message(ctx, DhcpMessageKind::Release);
            message.ciaddr = Some(lease.address);
            message.server_id = lease.server_id;
            message.broadcast = false;
            self.send(core, ctx, &message);
        }
    }

    fn handle_reply(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, reply: DhcpReply) {
        if reply.xid != self.xid {
            debug!("{}: ignoring reply with xid {:#x}", core.key, reply.xid);
            return;
        }
        match (reply.kind, self.phase) {
            (DhcpReplyKind::Offer, Phase::Selecting) if !self.bootp => {
                debug!("{}: offered {} by {:?}", core.key, reply.yiaddr, reply.server_id);
                self.offer = Some((reply.yiaddr, reply.server_id));
                self.phase = Phase::Requesting;
                self.tries = 0;
                self.send_request(core, ctx);
            }
            (DhcpReplyKind::BootReply, Phase::Selecting) if self.bootp => {
                let lease = Lease::from_reply(&reply, true);
                self.begin_probe(core, ctx, lease);
            }
            (DhcpReplyKind::Ack, Phase::Requesting | Phase::InitReboot) => {
                let lease = Lease::from_reply(&reply, false);
                self.begin_probe(core, ctx, lease);
            }
            (DhcpReplyKind::Ack, Phase::Renewing | Phase::Rebinding) => {
                let lease = Lease::from_reply(&reply, false);
                if self.lease.as_ref().is_some_and(|l| l.address == lease.address) {
                    self.bind(core, ctx, lease);
                } else {
                    self.drop_address(core, ctx);
                    self.begin_probe(core, ctx, lease);
                }
            }
            (
                DhcpReplyKind::Nak,
                Phase::Requesting | Phase::InitReboot | Phase::Renewing | Phase::Rebinding,
            ) => {
                info!("{}: NAK from {:?}", core.key, reply.server_id);
                self.forget_current();
                self.saved.remove(&Self::network_key(ctx));
                self.drop_address(core, ctx);
                self.start_selecting(core, ctx);
            }
            (kind, phase) => {
                debug!("{}: ignoring {:?} while {:?}", core.key, kind, phase);
            }
        }
    }

    fn handle_timer(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, timer: ServiceTimer) {
        match (timer, self.phase) {
            (ServiceTimer::Retransmit, Phase::Selecting) => {
                if self.tries >= ctx.settings.dhcp.tries_before_no_server
                    && core.status != Status::NoServer
                    && !core.has_address()
                {
                    info!("{}: no DHCP server on {}", core.key, ctx.ifname());
                    core.publish_failure(Status::NoServer);
                }
                self.send_discover(core, ctx);
            }
            (ServiceTimer::Retransmit, Phase::Requesting) => {
                if self.tries >= ctx.settings.dhcp.request_tries {
                    self.start_selecting(core, ctx);
                } else {
                    self.send_request(core, ctx);
                }
            }
            (ServiceTimer::Retransmit, Phase::InitReboot) => {
                if self.tries >= ctx.settings.dhcp.init_reboot_tries {
                    debug!("{}: no answer to INIT-REBOOT", core.key);
                    self.drop_address(core, ctx);
                    self.start_selecting(core, ctx);
                } else {
                    self.send_request(core, ctx);
                }
            }
            (ServiceTimer::Retransmit, Phase::Renewing | Phase::Rebinding) => {
                self.send_request(core, ctx);
            }
            (ServiceTimer::Renew, Phase::Bound) => {
                self.phase = Phase::Renewing;
                self.new_transaction();
                self.send_request(core, ctx);
            }
            (ServiceTimer::Rebind, Phase::Bound | Phase::Renewing) => {
                self.phase = Phase::Rebinding;
                self.new_transaction();
                self.send_request(core, ctx);
            }
            (ServiceTimer::Expire, _) => {
                info!("{}: lease expired", core.key);
                self.forget_current();
                self.drop_address(core, ctx);
                core.publish_failure(Status::LeaseExpired);
                self.start_selecting(core, ctx);
            }
            (ServiceTimer::Retry, Phase::Declined | Phase::Inactive) => {
                if ctx.link_usable() {
                    self.start_selecting(core, ctx);
                }
            }
            (timer, phase) => debug!("{}: stale {:?} timer while {:?}", core.key, timer, phase),
        }
    }

    fn link_changed(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        if ctx.link_usable() {
            self.remember_router(core);
            self.reboot(core, ctx);
        } else {
            core.arp_cancel(ctx);
            core.cancel_timer(ctx, ServiceTimer::Retransmit);
            if self.lease.is_none() {
                self.phase = Phase::Inactive;
            }
        }
    }
}

impl MethodHandler for DhcpState {
    fn handle(
        &mut self,
        core: &mut ServiceCore,
        ctx: &mut ServiceContext<'_>,
        event: ServiceEvent,
    ) -> HandlerResult {
        match event {
            ServiceEvent::Start => {
                if self.bootp && !ctx.interface.is_broadcast() {
                    return Err(Status::OperationNotSupported);
                }
                if ctx.link_usable() {
                    self.reboot(core, ctx);
                } else {
                    core.publish_failure(Status::MediaInactive);
                }
            }
            ServiceEvent::Stop => {
                self.release_lease(core, ctx);
                core.remove_ipv4(ctx);
                core.release(ctx);
                self.lease = None;
                self.phase = Phase::Inactive;
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::Dhcp { client_id }))
                if !self.bootp =>
            {
                return Ok(EventReply::NeedsStop(client_id != self.client_id));
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::Bootp)) if self.bootp => {
                return Ok(EventReply::NeedsStop(false));
            }
            ServiceEvent::Change(ChangeRequest::LinkLocalAllocate(_)) => {
                return Ok(EventReply::NeedsStop(false));
            }
            ServiceEvent::Dhcp(reply) => self.handle_reply(core, ctx, reply),
            ServiceEvent::Timer(timer) => self.handle_timer(core, ctx, timer),
            ServiceEvent::Arp(completion) => match (completion.tag.purpose, self.phase) {
                (ArpPurpose::Probe, Phase::Probing) => {
                    let Some(lease) = self.pending.take() else {
                        return Ok(EventReply::Done);
                    };
                    if completion.result.in_use && !completion.result.error {
                        warn!(
                            "{}: offered address {} is in use by {:?}",
                            core.key, lease.address, completion.result.addr.target_hw
                        );
                        self.decline(core, ctx, &lease);
                    } else {
                        self.bind(core, ctx, lease);
                    }
                }
                (ArpPurpose::RouterDetect, Phase::RebootDetect) => {
                    let Some(lease) = self.pending.take() else {
                        return Ok(EventReply::Done);
                    };
                    core.router_resolved(&completion.result);
                    if core.router().is_some_and(|r| r.is_arp_verified()) {
                        info!("{}: router found, reusing {}", core.key, lease.address);
                        self.bind(core, ctx, lease);
                    } else {
                        self.init_reboot(core, ctx, lease);
                    }
                }
                _ => {}
            },
            ServiceEvent::ArpCollision { address, hwaddr } => {
                if let Some(lease) = self.lease.clone().filter(|l| l.address == address) {
                    warn!("{}: {} claimed by {}", core.key, address, hwaddr);
                    self.decline(core, ctx, &lease);
                }
            }
            ServiceEvent::Renew => match self.phase {
                Phase::Bound | Phase::Renewing | Phase::Rebinding => {
                    core.cancel_timer(ctx, ServiceTimer::Renew);
                    self.phase = Phase::Renewing;
                    self.new_transaction();
                    self.send_request(core, ctx);
                }
                _ if ctx.link_usable() => self.start_selecting(core, ctx),
                _ => {}
            },
            ServiceEvent::MediaChanged | ServiceEvent::BssidChanged | ServiceEvent::Wake => {
                self.link_changed(core, ctx);
            }
            ServiceEvent::Sleep => {
                self.remember_router(core);
                core.arp_cancel(ctx);
                core.cancel_timer(ctx, ServiceTimer::Retransmit);
            }
            ServiceEvent::PowerOff => {
                self.release_lease(core, ctx);
                core.release(ctx);
            }
            ServiceEvent::LinkTimerExpired => {
                self.remember_router(core);
                core.release(ctx);
                core.remove_ipv4(ctx);
                self.lease = None;
                self.pending = None;
                self.phase = Phase::Inactive;
                core.publish_failure(Status::MediaInactive);
            }
            ServiceEvent::ForgetSsid(ssid) => {
                self.saved.remove(&ssid);
                if self.save_key.as_deref() == Some(ssid.as_str()) {
                    self.save_key = None;
                }
            }
            ServiceEvent::GetDhcpInfo => {
                let info = self.lease.as_ref().map(|l| l.options.to_json());
                return Ok(EventReply::DhcpInfo(info));
            }
            ServiceEvent::ProvideSummary => {
                let lease = self.lease.as_ref().map(|l| {
                    json!({
                        "address": l.address,
                        "server_id": l.server_id,
                        "acquired": l.acquired,
                        "lease_secs": l.lease_time.map(|d| d.as_secs()),
                    })
                });
                return summary_with(
                    core,
                    json!({
                        "protocol": if self.bootp { "bootp" } else { "dhcp" },
                        "state": self.phase,
                        "lease": lease,
                        "saved_networks": self.saved.len(),
                    }),
                );
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}
