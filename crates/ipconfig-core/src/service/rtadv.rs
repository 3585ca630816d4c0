//! IPv6 stateless autoconfiguration
//!
//! Enables IPv6 with autoconf, solicits a router and publishes once the
//! kernel reports usable autoconfigured addresses.

use super::{
    ChangeRequest, EventReply, Facts, HandlerResult, Ipv6Address, Ipv6Info, MethodHandler,
    ServiceContext, ServiceCore, ServiceEvent, default_reply, summary_with,
};
use crate::config::MethodConfig;
use crate::error::Status;
use crate::event::{Ipv6AddressState, RouterAdvert};
use crate::timers::ServiceTimer;
use serde_json::json;
use std::net::Ipv6Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) struct RtadvState {
    dhcpv6_disabled: bool,
    solicits: u32,
    router: Option<Ipv6Addr>,
    /// Last advertisement asked for stateful configuration
    stateful_requested: bool,
    addresses: Vec<Ipv6Address>,
}

impl RtadvState {
    pub fn new(dhcpv6_disabled: bool) -> Self {
        Self {
            dhcpv6_disabled,
            solicits: 0,
            router: None,
            stateful_requested: false,
            addresses: Vec::new(),
        }
    }

    fn solicit(&mut self, core: &ServiceCore, ctx: &mut ServiceContext<'_>) {
        if !ctx.link_usable() || self.router.is_some() {
            return;
        }
        if self.solicits >= ctx.settings.engine.router_solicit_count {
            debug!("{}: no router answered on {}", core.key, ctx.ifname());
            return;
        }
        self.solicits += 1;
        if let Err(e) = ctx.io.control.solicit_router(ctx.ifname()) {
            warn!("{}: router solicitation failed: {}", core.key, e);
        }
        let interval = Duration::from_secs(ctx.settings.engine.router_solicit_interval_secs);
        core.set_timer(ctx, ServiceTimer::Solicit, interval);
    }

    fn restart(&mut self, core: &ServiceCore, ctx: &mut ServiceContext<'_>) {
        self.solicits = 0;
        self.router = None;
        core.cancel_timer(ctx, ServiceTimer::Solicit);
        self.solicit(core, ctx);
    }

    fn publish(&self, core: &mut ServiceCore) {
        if self.addresses.is_empty() {
            core.unpublish();
            return;
        }
        let info = Ipv6Info {
            addresses: self.addresses.clone(),
            router: self.router,
            prefixes: Vec::new(),
        };
        if core.publish_success(Facts::ipv6(info)) {
            info!("{}: {} autoconfigured address(es)", core.key, self.addresses.len());
        }
    }

    fn addresses_changed(&mut self, core: &mut ServiceCore, list: &[Ipv6AddressState]) {
        self.addresses = list
            .iter()
            .filter(|a| a.autoconf && a.is_usable() && !a.is_link_local())
            .map(|a| Ipv6Address {
                address: a.address,
                prefix_len: a.prefix_len,
            })
            .collect();
        self.publish(core);
    }

    fn advert(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, advert: RouterAdvert) {
        if advert.lifetime_secs == 0 {
            debug!("{}: {} is not a default router", core.key, advert.router);
            return;
        }
        core.cancel_timer(ctx, ServiceTimer::Solicit);
        self.stateful_requested = advert.managed || advert.other_config;
        if self.router != Some(advert.router) {
            self.router = Some(advert.router);
            if !self.addresses.is_empty() {
                self.publish(core);
            }
        }
    }
}

impl MethodHandler for RtadvState {
    fn handle(
        &mut self,
        core: &mut ServiceCore,
        ctx: &mut ServiceContext<'_>,
        event: ServiceEvent,
    ) -> HandlerResult {
        match event {
            ServiceEvent::Start => {
                if let Some(state) = core.v6_mut() {
                    state.dhcpv6_disabled = self.dhcpv6_disabled;
                    state.clat46 = ctx.clat46;
                }
                if let Err(e) = ctx.io.control.set_ipv6_enabled(ctx.ifname(), true, true) {
                    warn!("{}: enabling IPv6 failed: {}", core.key, e);
                    return Err(Status::InternalError);
                }
                self.solicit(core, ctx);
            }
            ServiceEvent::Stop => {
                core.release(ctx);
                if let Err(e) = ctx.io.control.set_ipv6_enabled(ctx.ifname(), false, false) {
                    warn!("{}: disabling IPv6 failed: {}", core.key, e);
                }
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::Rtadv { dhcpv6_disabled })) => {
                self.dhcpv6_disabled = dhcpv6_disabled;
                if let Some(state) = core.v6_mut() {
                    state.dhcpv6_disabled = dhcpv6_disabled;
                }
                return Ok(EventReply::NeedsStop(false));
            }
            ServiceEvent::Timer(ServiceTimer::Solicit) => self.solicit(core, ctx),
            ServiceEvent::RouterAdvertisement(advert) => self.advert(core, ctx, advert),
            ServiceEvent::Ipv6AddressChanged(list) => self.addresses_changed(core, &list),
            ServiceEvent::Ipv6RouterExpired => {
                info!("{}: router {:?} expired", core.key, self.router);
                self.restart(core, ctx);
                self.publish(core);
            }
            ServiceEvent::PlatDiscoveryComplete(found) => {
                if let Some(state) = core.v6_mut()
                    && state.clat46 != found
                {
                    state.clat46 = found;
                    core.touch_publication();
                }
            }
            ServiceEvent::MediaChanged | ServiceEvent::BssidChanged | ServiceEvent::Wake => {
                if ctx.link_usable() {
                    self.restart(core, ctx);
                } else {
                    core.cancel_timer(ctx, ServiceTimer::Solicit);
                }
            }
            ServiceEvent::Renew => self.restart(core, ctx),
            ServiceEvent::LinkTimerExpired => {
                core.release(ctx);
                self.router = None;
                self.addresses.clear();
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
                        "router": self.router,
                        "addresses": self.addresses,
                        "solicitations": self.solicits,
                        "stateful_requested": self.stateful_requested,
                        "dhcpv6_disabled": self.dhcpv6_disabled,
                    }),
                );
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}
