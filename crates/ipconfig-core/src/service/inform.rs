//! Static IPv4 address plus DHCP INFORM
//!
//! The address is probed and assigned like a manual one; options (router and
//! anything else the server knows) come from INFORM/ACK exchanges.

use super::{
    ArpPurpose, ChangeRequest, EventReply, Facts, HandlerResult, Ipv4Info, MethodHandler,
    ServiceContext, ServiceCore, ServiceEvent, classful_mask, default_reply, is_valid_mask,
    summary_with,
};
use crate::config::MethodConfig;
use crate::error::Status;
use crate::timers::ServiceTimer;
use crate::traits::{DhcpMessage, DhcpMessageKind, DhcpOptions, DhcpReplyKind};
use serde_json::{Value, json};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) struct InformState {
    address: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    client_id: Option<String>,
    xid: u32,
    tries: u32,
    options: Option<Arc<dyn DhcpOptions>>,
}

impl InformState {
    pub fn new(address: Ipv4Addr, subnet_mask: Option<Ipv4Addr>, client_id: Option<String>) -> Self {
        Self {
            address,
            subnet_mask: subnet_mask.unwrap_or_else(|| classful_mask(address)),
            client_id,
            xid: 0,
            tries: 0,
            options: None,
        }
    }

    fn router(&self) -> Option<Ipv4Addr> {
        self.options.as_ref()?.find_router(self.address)
    }

    fn facts(&self) -> Facts {
        let facts = Facts::ipv4(Ipv4Info {
            address: self.address,
            subnet_mask: self.subnet_mask,
            router: self.router(),
        });
        match &self.options {
            Some(options) => facts.with_dhcp(options.to_json()),
            None => facts,
        }
    }

    fn verify(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        if ctx.link_usable() && !core.arp_probe(ctx, self.address) {
            self.assign(core, ctx);
        }
    }

    fn assign(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        if !core.apply_ipv4(ctx, self.address, self.subnet_mask) {
            core.publish_failure(Status::InternalError);
            return;
        }
        if let Some(state) = core.v4_mut() {
            state.requested = Some((self.address, self.subnet_mask));
        }
        if core.publish_success(self.facts()) {
            info!("{}: {} assigned on {}", core.key, self.address, ctx.ifname());
        }
        self.tries = 0;
        self.xid = rand::random();
        self.send_inform(core, ctx);
    }

    fn send_inform(&mut self, core: &ServiceCore, ctx: &mut ServiceContext<'_>) {
        self.tries += 1;
        let mut message = DhcpMessage::new(DhcpMessageKind::Inform, self.xid);
        message.hwaddr = ctx.interface.hwaddr;
        message.client_id = self.client_id.clone();
        message.ciaddr = Some(self.address);
        if let Err(e) = ctx.io.dhcp.send(ctx.ifname(), &message) {
            warn!("{}: sending INFORM failed: {}", core.key, e);
        }
        let delay = ctx.settings.dhcp.backoff(self.tries);
        core.set_timer(ctx, ServiceTimer::Retransmit, delay);
    }
}

impl MethodHandler for InformState {
    fn handle(
        &mut self,
        core: &mut ServiceCore,
        ctx: &mut ServiceContext<'_>,
        event: ServiceEvent,
    ) -> HandlerResult {
        match event {
            ServiceEvent::Start => {
                if self.address.is_unspecified() || !is_valid_mask(self.subnet_mask) {
                    return Err(Status::InvalidParameter);
                }
                self.verify(core, ctx);
            }
            ServiceEvent::Stop => {
                core.remove_ipv4(ctx);
                core.release(ctx);
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::Inform {
                address,
                subnet_mask,
                client_id,
            })) => {
                let mask = subnet_mask.unwrap_or_else(|| classful_mask(address));
                let same = address == self.address && mask == self.subnet_mask;
                if same {
                    self.client_id = client_id;
                }
                return Ok(EventReply::NeedsStop(!same));
            }
            ServiceEvent::Arp(completion) if completion.tag.purpose == ArpPurpose::Probe => {
                if completion.result.in_use {
                    warn!("{}: {} is in use", core.key, self.address);
                    core.cancel_timer(ctx, ServiceTimer::Retransmit);
                    core.remove_ipv4(ctx);
                    core.publish_failure(Status::AddressInUse);
                } else {
                    self.assign(core, ctx);
                }
            }
            ServiceEvent::Timer(ServiceTimer::Retransmit) => {
                if core.has_address() && self.options.is_none() {
                    self.send_inform(core, ctx);
                }
            }
            ServiceEvent::Dhcp(reply) => {
                if reply.kind != DhcpReplyKind::Ack || reply.xid != self.xid || !core.has_address() {
                    debug!("{}: ignoring {:?} xid {:#x}", core.key, reply.kind, reply.xid);
                    return Ok(EventReply::Done);
                }
                core.cancel_timer(ctx, ServiceTimer::Retransmit);
                self.options = Some(reply.options);
                let router = self.router();
                if let Some(state) = core.v4_mut() {
                    state.router.set_address(router);
                }
                core.publish_success(self.facts());
                core.resolve_router(ctx);
            }
            ServiceEvent::ArpCollision { address, .. } if address == self.address => {
                core.cancel_timer(ctx, ServiceTimer::Retransmit);
                core.remove_ipv4(ctx);
                core.publish_failure(Status::AddressInUse);
            }
            ServiceEvent::MediaChanged | ServiceEvent::BssidChanged | ServiceEvent::Wake => {
                if !ctx.link_usable() {
                    core.cancel_timer(ctx, ServiceTimer::Retransmit);
                } else if core.has_address() {
                    self.options = None;
                    self.tries = 0;
                    self.xid = rand::random();
                    self.send_inform(core, ctx);
                } else {
                    self.verify(core, ctx);
                }
            }
            ServiceEvent::Renew => {
                if core.has_address() {
                    self.tries = 0;
                    self.xid = rand::random();
                    self.send_inform(core, ctx);
                } else {
                    self.verify(core, ctx);
                }
            }
            ServiceEvent::LinkTimerExpired => {
                core.release(ctx);
                core.remove_ipv4(ctx);
                core.publish_failure(Status::MediaInactive);
            }
            ServiceEvent::GetDhcpInfo => {
                let info = self.options.as_ref().map(|o| o.to_json());
                return Ok(EventReply::DhcpInfo(info));
            }
            ServiceEvent::ProvideSummary => {
                return summary_with(
                    core,
                    json!({
                        "address": self.address,
                        "subnet_mask": self.subnet_mask,
                        "options": self.options.as_ref().map_or(Value::Null, |o| o.to_json()),
                    }),
                );
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}
