//! IPv6 link-local only

use super::{
    EventReply, Facts, HandlerResult, Ipv6Address, Ipv6Info, MethodHandler, ServiceContext,
    ServiceCore, ServiceEvent, default_reply,
};
use crate::config::MethodConfig;
use crate::error::Status;
use crate::event::Ipv6AddressState;
use crate::service::ChangeRequest;
use serde_json::json;
use tracing::warn;

#[derive(Debug, Default)]
pub(crate) struct LinkLocalV6State {
    enabled: bool,
}

impl LinkLocalV6State {
    fn addresses_changed(&self, core: &mut ServiceCore, list: &[Ipv6AddressState]) {
        let link_local: Vec<_> = list.iter().filter(|a| a.is_link_local()).collect();
        if link_local.iter().any(|a| a.duplicated) {
            core.publish_failure(Status::AddressInUse);
            return;
        }
        let usable: Vec<Ipv6Address> = link_local
            .iter()
            .filter(|a| a.is_usable())
            .map(|a| Ipv6Address {
                address: a.address,
                prefix_len: a.prefix_len,
            })
            .collect();
        if usable.is_empty() {
            core.unpublish();
        } else {
            core.publish_success(Facts::ipv6(Ipv6Info {
                addresses: usable,
                ..Ipv6Info::default()
            }));
        }
    }
}

impl MethodHandler for LinkLocalV6State {
    fn handle(
        &mut self,
        core: &mut ServiceCore,
        ctx: &mut ServiceContext<'_>,
        event: ServiceEvent,
    ) -> HandlerResult {
        match event {
            ServiceEvent::Start => {
                if let Err(e) = ctx.io.control.set_ipv6_enabled(ctx.ifname(), true, false) {
                    warn!("{}: enabling IPv6 failed: {}", core.key, e);
                    return Err(Status::InternalError);
                }
                self.enabled = true;
            }
            ServiceEvent::Stop => {
                if std::mem::take(&mut self.enabled)
                    && let Err(e) = ctx.io.control.set_ipv6_enabled(ctx.ifname(), false, false)
                {
                    warn!("{}: disabling IPv6 failed: {}", core.key, e);
                }
                core.release(ctx);
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::LinkLocalV6)) => {
                return Ok(EventReply::NeedsStop(false));
            }
            ServiceEvent::Ipv6AddressChanged(list) => self.addresses_changed(core, &list),
            ServiceEvent::LinkTimerExpired => core.publish_failure(Status::MediaInactive),
            ServiceEvent::GetIpv6Info => {
                let info = core
                    .v6()
                    .and_then(|s| s.assigned.as_ref())
                    .map(|i| json!(i));
                return Ok(EventReply::Ipv6Info(info));
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}
