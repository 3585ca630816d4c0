//! Static IPv6 address
//!
//! Published once duplicate address detection settles.

use super::{
    ChangeRequest, EventReply, Facts, HandlerResult, Ipv6Address, Ipv6Info, MethodHandler,
    ServiceContext, ServiceCore, ServiceEvent, default_reply, summary_with,
};
use crate::config::MethodConfig;
use crate::error::Status;
use crate::event::Ipv6AddressState;
use serde_json::json;
use std::net::Ipv6Addr;
use tracing::{info, warn};

#[derive(Debug)]
pub(crate) struct ManualV6State {
    address: Ipv6Addr,
    prefix_len: u8,
    added: bool,
}

impl ManualV6State {
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
            added: false,
        }
    }

    fn add(&mut self, core: &mut ServiceCore, ctx: &ServiceContext<'_>) -> Result<(), Status> {
        let control = &ctx.io.control;
        control
            .set_ipv6_enabled(ctx.ifname(), true, false)
            .and_then(|()| control.add_ipv6_address(ctx.ifname(), self.address, self.prefix_len))
            .map_err(|e| {
                warn!("{}: adding {} failed: {}", core.key, self.address, e);
                Status::InternalError
            })?;
        self.added = true;
        Ok(())
    }

    fn remove(&mut self, core: &ServiceCore, ctx: &ServiceContext<'_>) {
        if !std::mem::take(&mut self.added) {
            return;
        }
        if let Err(e) = ctx.io.control.remove_ipv6_address(ctx.ifname(), self.address, self.prefix_len) {
            warn!("{}: removing {} failed: {}", core.key, self.address, e);
        }
    }

    fn addresses_changed(&mut self, core: &mut ServiceCore, ctx: &ServiceContext<'_>, list: &[Ipv6AddressState]) {
        let Some(state) = list.iter().find(|a| a.address == self.address) else {
            if core.has_address() {
                core.unpublish();
            }
            return;
        };
        if state.duplicated {
            warn!("{}: {} is a duplicate", core.key, self.address);
            self.remove(core, ctx);
            core.publish_failure(Status::AddressInUse);
        } else if state.is_usable() {
            let info = Ipv6Info {
                addresses: vec![Ipv6Address {
                    address: self.address,
                    prefix_len: self.prefix_len,
                }],
                router: None,
                prefixes: Vec::new(),
            };
            if core.publish_success(Facts::ipv6(info)) {
                info!("{}: {} configured", core.key, self.address);
            }
        }
    }
}

impl MethodHandler for ManualV6State {
    fn handle(
        &mut self,
        core: &mut ServiceCore,
        ctx: &mut ServiceContext<'_>,
        event: ServiceEvent,
    ) -> HandlerResult {
        match event {
            ServiceEvent::Start => {
                if self.prefix_len > 128 || self.address.is_unspecified() || self.address.is_multicast() {
                    return Err(Status::InvalidParameter);
                }
                if let Some(state) = core.v6_mut() {
                    state.requested = Some((self.address, self.prefix_len));
                }
                self.add(core, ctx)?;
            }
            ServiceEvent::Stop => {
                self.remove(core, ctx);
                core.release(ctx);
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::ManualV6 {
                address,
                prefix_len,
            })) => {
                let same = address == self.address && prefix_len == self.prefix_len;
                return Ok(EventReply::NeedsStop(!same));
            }
            ServiceEvent::Ipv6AddressChanged(list) => self.addresses_changed(core, ctx, &list),
            ServiceEvent::MediaChanged | ServiceEvent::Wake => {
                if ctx.link_usable() && !self.added {
                    if let Err(status) = self.add(core, ctx) {
                        core.publish_failure(status);
                    }
                }
            }
            ServiceEvent::LinkTimerExpired => {
                core.publish_failure(Status::MediaInactive);
            }
            ServiceEvent::GetIpv6Info => {
                let info = core
                    .v6()
                    .and_then(|s| s.assigned.as_ref())
                    .map(|i| json!(i));
                return Ok(EventReply::Ipv6Info(info));
            }
            ServiceEvent::ProvideSummary => {
                return summary_with(
                    core,
                    json!({
                        "address": self.address,
                        "prefix_len": self.prefix_len,
                    }),
                );
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}
