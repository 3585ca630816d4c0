//! 6to4 tunnel addressing
//!
//! The address is `2002:AABB:CCDD::1/16` where `AA.BB.CC.DD` is the host's
//! best IPv4 address; it follows that address as it changes.

use super::{
    ChangeRequest, EventReply, Facts, HandlerResult, Ipv6Address, Ipv6Info, MethodHandler,
    ServiceContext, ServiceCore, ServiceEvent, default_reply, summary_with,
};
use crate::config::MethodConfig;
use crate::error::Status;
use serde_json::json;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{info, warn};

/// 6to4 relay anycast address
pub(crate) const DEFAULT_RELAY: Ipv4Addr = Ipv4Addr::new(192, 88, 99, 1);

const STF_PREFIX_LEN: u8 = 16;

/// `2002:V4HI:V4LO::` with the given interface identifier
fn stf_address(v4: Ipv4Addr, host: [u16; 4]) -> Ipv6Addr {
    let [a, b, c, d] = v4.octets();
    Ipv6Addr::new(
        0x2002,
        u16::from_be_bytes([a, b]),
        u16::from_be_bytes([c, d]),
        0,
        host[0],
        host[1],
        host[2],
        host[3],
    )
}

/// Whether an IPv4 address can anchor a 6to4 prefix
fn is_routable(v4: Ipv4Addr) -> bool {
    !(v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_broadcast()
        || v4.is_multicast())
}

#[derive(Debug)]
pub(crate) struct StfState {
    relay: Ipv4Addr,
    anchor: Option<Ipv4Addr>,
}

impl StfState {
    pub fn new(relay: Option<Ipv4Addr>) -> Self {
        Self {
            relay: relay.unwrap_or(DEFAULT_RELAY),
            anchor: None,
        }
    }

    fn address(&self) -> Option<Ipv6Addr> {
        self.anchor.map(|v4| stf_address(v4, [0, 0, 0, 1]))
    }

    /// Relay expressed as a 6to4 address
    fn relay_router(&self) -> Ipv6Addr {
        let [a, b, c, d] = self.relay.octets();
        stf_address(
            self.relay,
            [0, 0, u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])],
        )
    }

    fn remove(&mut self, core: &mut ServiceCore, ctx: &ServiceContext<'_>) {
        if let Some(address) = self.address()
            && let Err(e) = ctx.io.control.remove_ipv6_address(ctx.ifname(), address, STF_PREFIX_LEN)
        {
            warn!("{}: removing {} failed: {}", core.key, address, e);
        }
        self.anchor = None;
    }

    fn follow(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, primary: Option<Ipv4Addr>) {
        let anchor = primary.filter(|v4| is_routable(*v4));
        if anchor == self.anchor {
            return;
        }
        self.remove(core, ctx);
        let Some(v4) = anchor else {
            core.unpublish();
            return;
        };
        self.anchor = Some(v4);
        let address = stf_address(v4, [0, 0, 0, 1]);
        if let Err(e) = ctx
            .io
            .control
            .add_ipv6_address(ctx.ifname(), address, STF_PREFIX_LEN)
        {
            warn!("{}: adding {} failed: {}", core.key, address, e);
            self.anchor = None;
            core.publish_failure(Status::InternalError);
            return;
        }
        let info = Ipv6Info {
            addresses: vec![Ipv6Address {
                address,
                prefix_len: STF_PREFIX_LEN,
            }],
            router: Some(self.relay_router()),
            prefixes: Vec::new(),
        };
        if core.publish_success(Facts::ipv6(info)) {
            info!("{}: 6to4 address {} from {}", core.key, address, v4);
        }
    }
}

impl MethodHandler for StfState {
    fn handle(
        &mut self,
        core: &mut ServiceCore,
        ctx: &mut ServiceContext<'_>,
        event: ServiceEvent,
    ) -> HandlerResult {
        match event {
            ServiceEvent::Start => {
                if self.relay.is_unspecified() {
                    return Err(Status::InvalidParameter);
                }
                let primary = ctx.primary_ipv4;
                self.follow(core, ctx, primary);
            }
            ServiceEvent::Stop => {
                self.remove(core, ctx);
                core.release(ctx);
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::Stf { relay })) => {
                return Ok(EventReply::NeedsStop(relay.unwrap_or(DEFAULT_RELAY) != self.relay));
            }
            ServiceEvent::PrimaryIpv4(primary) => self.follow(core, ctx, primary),
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
                        "relay": self.relay,
                        "anchor": self.anchor,
                        "address": self.address(),
                    }),
                );
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}
