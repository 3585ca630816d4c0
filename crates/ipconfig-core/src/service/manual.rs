//! Static IPv4 address
//!
//! Probe the configured address; assign and publish it when nobody answers.
//! The configured router is resolved once the address is up.

use super::{
    ArpPurpose, ChangeRequest, EventReply, Facts, HandlerResult, Ipv4Info, MethodHandler,
    ServiceContext, ServiceCore, ServiceEvent, default_reply, is_valid_mask, summary_with,
};
use crate::config::MethodConfig;
use crate::error::Status;
use serde_json::json;
use std::net::Ipv4Addr;
use tracing::{info, warn};

#[derive(Debug)]
pub(crate) struct ManualState {
    address: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    router: Option<Ipv4Addr>,
    /// Another host answered for the address at the last probe
    conflict: bool,
}

impl ManualState {
    pub fn new(address: Ipv4Addr, subnet_mask: Ipv4Addr, router: Option<Ipv4Addr>) -> Self {
        Self {
            address,
            subnet_mask,
            router,
            conflict: false,
        }
    }

    fn info(&self) -> Ipv4Info {
        Ipv4Info {
            address: self.address,
            subnet_mask: self.subnet_mask,
            router: self.router,
        }
    }

    fn verify(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        if !ctx.link_usable() {
            return;
        }
        if !core.arp_probe(ctx, self.address) {
            // No ARP on this link
            self.assign(core, ctx);
        }
    }

    fn assign(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        self.conflict = false;
        if !core.apply_ipv4(ctx, self.address, self.subnet_mask) {
            core.publish_failure(Status::InternalError);
            return;
        }
        if let Some(state) = core.v4_mut() {
            state.requested = Some((self.address, self.subnet_mask));
            state.router.set_address(self.router);
        }
        if core.publish_success(Facts::ipv4(self.info())) {
            info!("{}: {} assigned on {}", core.key, self.address, ctx.ifname());
        }
        core.resolve_router(ctx);
    }
}

impl MethodHandler for ManualState {
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
                if !ctx.link_usable() {
                    core.publish_failure(Status::MediaInactive);
                }
                self.verify(core, ctx);
            }
            ServiceEvent::Stop => {
                core.remove_ipv4(ctx);
                core.release(ctx);
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::Manual {
                address,
                subnet_mask,
                router,
            })) if address == self.address && subnet_mask == self.subnet_mask => {
                if router != self.router {
                    self.router = router;
                    if let Some(state) = core.v4_mut() {
                        state.router.set_address(router);
                    }
                    if core.has_address() {
                        core.publish_success(Facts::ipv4(self.info()));
                        core.resolve_router(ctx);
                    }
                }
                return Ok(EventReply::NeedsStop(false));
            }
            ServiceEvent::Arp(completion) if completion.tag.purpose == ArpPurpose::Probe => {
                let result = completion.result;
                if result.error {
                    warn!(
                        "{}: probe of {} failed, assigning anyway",
                        core.key, self.address
                    );
                    self.assign(core, ctx);
                } else if result.in_use {
                    warn!(
                        "{}: {} is in use by {:?}",
                        core.key, self.address, result.addr.target_hw
                    );
                    self.conflict = true;
                    core.remove_ipv4(ctx);
                    core.publish_failure(Status::AddressInUse);
                } else {
                    self.assign(core, ctx);
                }
            }
            ServiceEvent::ArpCollision { address, hwaddr } if address == self.address => {
                warn!("{}: {} claimed by {}", core.key, address, hwaddr);
                self.conflict = true;
                core.remove_ipv4(ctx);
                core.publish_failure(Status::AddressInUse);
            }
            ServiceEvent::MediaChanged | ServiceEvent::BssidChanged | ServiceEvent::Wake => {
                if ctx.link_usable() {
                    if core.has_address() {
                        core.resolve_router(ctx);
                    } else {
                        self.verify(core, ctx);
                    }
                }
            }
            ServiceEvent::Renew => {
                if core.has_address() {
                    core.resolve_router(ctx);
                } else {
                    self.verify(core, ctx);
                }
            }
            ServiceEvent::LinkTimerExpired => {
                core.arp_cancel(ctx);
                core.remove_ipv4(ctx);
                core.publish_failure(Status::MediaInactive);
            }
            ServiceEvent::ProvideSummary => {
                return summary_with(
                    core,
                    json!({
                        "address": self.address,
                        "subnet_mask": self.subnet_mask,
                        "router": self.router,
                        "conflict": self.conflict,
                    }),
                );
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}
