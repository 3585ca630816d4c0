//! Static IPv4 address held for a bounded time
//!
//! Used while another configuration is unavailable. The address is probed
//! before use; once its lifetime runs out the service reports
//! `AddressTimedOut` and removes it.

use super::{
    ArpPurpose, ChangeRequest, EventReply, Facts, HandlerResult, Ipv4Info, MethodHandler,
    ServiceContext, ServiceCore, ServiceEvent, default_reply, is_valid_mask, summary_with,
};
use crate::config::MethodConfig;
use crate::error::Status;
use crate::timers::ServiceTimer;
use serde_json::json;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug)]
pub(crate) struct FailoverState {
    address: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    timeout_secs: Option<u64>,
    expired: bool,
}

impl FailoverState {
    pub fn new(address: Ipv4Addr, subnet_mask: Ipv4Addr, timeout_secs: Option<u64>) -> Self {
        Self {
            address,
            subnet_mask,
            timeout_secs,
            expired: false,
        }
    }

    fn verify(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        if self.expired || !ctx.link_usable() {
            return;
        }
        if !core.arp_probe(ctx, self.address) {
            self.assign(core, ctx);
        }
    }

    fn assign(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        if !core.apply_ipv4(ctx, self.address, self.subnet_mask) {
            core.publish_failure(Status::InternalError);
            return;
        }
        let info = Ipv4Info {
            address: self.address,
            subnet_mask: self.subnet_mask,
            router: None,
        };
        if core.publish_success(Facts::ipv4(info)) {
            info!("{}: failover address {} assigned", core.key, self.address);
            if let Some(secs) = self.timeout_secs.filter(|s| *s > 0) {
                core.set_timer(ctx, ServiceTimer::Timeout, Duration::from_secs(secs));
            }
        }
    }
}

impl MethodHandler for FailoverState {
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
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::Failover {
                address,
                subnet_mask,
                timeout_secs,
            })) => {
                let same = address == self.address
                    && subnet_mask == self.subnet_mask
                    && timeout_secs == self.timeout_secs;
                return Ok(EventReply::NeedsStop(!same));
            }
            ServiceEvent::Arp(completion) if completion.tag.purpose == ArpPurpose::Probe => {
                if completion.result.in_use {
                    warn!("{}: failover address {} is in use", core.key, self.address);
                    core.publish_failure(Status::AddressInUse);
                    let retry = Duration::from_secs(ctx.settings.engine.failover_retry_secs);
                    core.set_timer(ctx, ServiceTimer::Retry, retry);
                } else {
                    self.assign(core, ctx);
                }
            }
            ServiceEvent::Timer(ServiceTimer::Retry) => self.verify(core, ctx),
            ServiceEvent::Timer(ServiceTimer::Timeout) => {
                info!("{}: failover address {} timed out", core.key, self.address);
                self.expired = true;
                core.release(ctx);
                core.remove_ipv4(ctx);
                core.publish_failure(Status::AddressTimedOut);
            }
            ServiceEvent::ArpCollision { address, .. } if address == self.address => {
                core.remove_ipv4(ctx);
                core.publish_failure(Status::AddressInUse);
                let retry = Duration::from_secs(ctx.settings.engine.failover_retry_secs);
                core.set_timer(ctx, ServiceTimer::Retry, retry);
            }
            ServiceEvent::MediaChanged | ServiceEvent::Wake => {
                if !core.has_address() {
                    self.verify(core, ctx);
                }
            }
            ServiceEvent::LinkTimerExpired => {
                core.arp_cancel(ctx);
                core.cancel_timer(ctx, ServiceTimer::Retry);
                core.remove_ipv4(ctx);
                if !self.expired {
                    core.publish_failure(Status::MediaInactive);
                }
            }
            ServiceEvent::ProvideSummary => {
                return summary_with(
                    core,
                    json!({
                        "address": self.address,
                        "timeout_secs": self.timeout_secs,
                        "expired": self.expired,
                    }),
                );
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}
