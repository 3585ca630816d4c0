//! DHCPv6 prefix delegation
//!
//! Solicit -> Request -> Bound, then Renew at T1 and Rebind at T2 until the
//! shortest prefix lifetime runs out.

use super::{
    ChangeRequest, EventReply, Facts, HandlerResult, Ipv6Info, MethodHandler, ServiceContext,
    ServiceCore, ServiceEvent, default_reply, summary_with,
};
use crate::config::MethodConfig;
use crate::error::Status;
use crate::timers::ServiceTimer;
use crate::traits::{DelegatedPrefix, Dhcpv6Message, Dhcpv6MessageKind, Dhcpv6Reply, Dhcpv6ReplyKind};
use serde::Serialize;
use serde_json::json;
use std::net::Ipv6Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Phase {
    Inactive,
    Soliciting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
}

#[derive(Debug)]
pub(crate) struct PrefixDelegationState {
    hint: Option<(Ipv6Addr, u8)>,
    phase: Phase,
    transaction_id: u32,
    tries: u32,
    server_id: Option<Vec<u8>>,
    /// Advertised, then bound, prefixes
    prefixes: Vec<DelegatedPrefix>,
}

impl PrefixDelegationState {
    pub fn new(hint: Option<(Ipv6Addr, u8)>) -> Self {
        Self {
            hint,
            phase: Phase::Inactive,
            transaction_id: 0,
            tries: 0,
            server_id: None,
            prefixes: Vec::new(),
        }
    }

    fn transmit(&mut self, core: &ServiceCore, ctx: &mut ServiceContext<'_>) {
        let kind = match self.phase {
            Phase::Soliciting => Dhcpv6MessageKind::Solicit,
            Phase::Requesting => Dhcpv6MessageKind::Request,
            Phase::Renewing => Dhcpv6MessageKind::Renew,
            Phase::Rebinding => Dhcpv6MessageKind::Rebind,
            Phase::Inactive | Phase::Bound => return,
        };
        self.tries += 1;
        let message = Dhcpv6Message {
            kind,
            transaction_id: self.transaction_id,
            server_id: match kind {
                Dhcpv6MessageKind::Solicit | Dhcpv6MessageKind::Rebind => None,
                _ => self.server_id.clone(),
            },
            prefixes: self.prefixes.clone(),
            prefix_hint: self.hint,
        };
        if let Err(e) = ctx.io.dhcpv6.send(ctx.ifname(), &message) {
            warn!("{}: sending {:?} failed: {}", core.key, kind, e);
        }
        let delay = match self.phase {
            Phase::Renewing | Phase::Rebinding => {
                Duration::from_secs(ctx.settings.dhcp.renew_retry_secs)
            }
            _ => ctx.settings.dhcp.backoff(self.tries),
        };
        core.set_timer(ctx, ServiceTimer::Retransmit, delay);
    }

    fn enter(&mut self, core: &ServiceCore, ctx: &mut ServiceContext<'_>, phase: Phase) {
        self.phase = phase;
        self.tries = 0;
        self.transaction_id = rand::random::<u32>() & 0x00ff_ffff;
        self.transmit(core, ctx);
    }

    fn solicit(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        for timer in [ServiceTimer::Renew, ServiceTimer::Rebind, ServiceTimer::Expire] {
            core.cancel_timer(ctx, timer);
        }
        self.server_id = None;
        self.prefixes.clear();
        core.busy = true;
        self.enter(core, ctx, Phase::Soliciting);
    }

    fn bind(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, reply: Dhcpv6Reply) {
        core.cancel_timer(ctx, ServiceTimer::Retransmit);
        self.phase = Phase::Bound;
        self.server_id = Some(reply.server_id);
        self.prefixes = reply.prefixes;

        let valid = self
            .prefixes
            .iter()
            .map(|p| p.valid_secs)
            .min()
            .unwrap_or(0);
        if valid != u32::MAX {
            let t1 = if reply.t1_secs > 0 { reply.t1_secs } else { valid / 2 };
            let t2 = if reply.t2_secs > 0 { reply.t2_secs } else { valid / 5 * 4 };
            let secs = |s: u32| Duration::from_secs(u64::from(s));
            core.set_timer(ctx, ServiceTimer::Renew, secs(t1));
            core.set_timer(ctx, ServiceTimer::Rebind, secs(t2));
            core.set_timer(ctx, ServiceTimer::Expire, secs(valid));
        }

        let facts = Facts::ipv6(Ipv6Info {
            prefixes: self.prefixes.clone(),
            ..Ipv6Info::default()
        })
        .with_dhcpv6(json!({ "prefixes": self.prefixes }));
        if core.publish_success(facts) {
            info!("{}: delegated {:?}", core.key, self.prefixes);
        }
    }

    fn handle_reply(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, reply: Dhcpv6Reply) {
        if reply.transaction_id != self.transaction_id {
            debug!("{}: ignoring transaction {:#x}", core.key, reply.transaction_id);
            return;
        }
        match (reply.kind, self.phase) {
            (Dhcpv6ReplyKind::Advertise, Phase::Soliciting) => {
                if !reply.success || reply.prefixes.is_empty() {
                    debug!("{}: advertisement without prefixes", core.key);
                    return;
                }
                self.server_id = Some(reply.server_id);
                self.prefixes = reply.prefixes;
                self.enter(core, ctx, Phase::Requesting);
            }
            (Dhcpv6ReplyKind::Reply, Phase::Requesting | Phase::Renewing | Phase::Rebinding) => {
                if reply.success && !reply.prefixes.is_empty() {
                    self.bind(core, ctx, reply);
                } else {
                    info!("{}: server refused the delegation", core.key);
                    core.unpublish();
                    self.solicit(core, ctx);
                }
            }
            (kind, phase) => debug!("{}: ignoring {:?} while {:?}", core.key, kind, phase),
        }
    }
}

impl MethodHandler for PrefixDelegationState {
    fn handle(
        &mut self,
        core: &mut ServiceCore,
        ctx: &mut ServiceContext<'_>,
        event: ServiceEvent,
    ) -> HandlerResult {
        match event {
            ServiceEvent::Start => {
                if self.hint.is_some_and(|(_, len)| len > 128) {
                    return Err(Status::InvalidParameter);
                }
                if ctx.link_usable() {
                    self.solicit(core, ctx);
                } else {
                    core.publish_failure(Status::MediaInactive);
                }
            }
            ServiceEvent::Stop => {
                if self.phase == Phase::Bound {
                    self.phase = Phase::Inactive;
                    let message = Dhcpv6Message {
                        kind: Dhcpv6MessageKind::Release,
                        transaction_id: self.transaction_id,
                        server_id: self.server_id.clone(),
                        prefixes: self.prefixes.clone(),
                        prefix_hint: None,
                    };
                    if let Err(e) = ctx.io.dhcpv6.send(ctx.ifname(), &message) {
                        warn!("{}: sending release failed: {}", core.key, e);
                    }
                }
                core.release(ctx);
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::Dhcpv6Pd {
                prefix_hint,
                prefix_hint_len,
            })) => {
                return Ok(EventReply::NeedsStop(prefix_hint.zip(prefix_hint_len) != self.hint));
            }
            ServiceEvent::Dhcpv6(reply) => self.handle_reply(core, ctx, reply),
            ServiceEvent::Timer(ServiceTimer::Retransmit) => match self.phase {
                Phase::Requesting if self.tries >= ctx.settings.dhcp.request_tries => {
                    self.solicit(core, ctx);
                }
                _ => self.transmit(core, ctx),
            },
            ServiceEvent::Timer(ServiceTimer::Renew) if self.phase == Phase::Bound => {
                self.enter(core, ctx, Phase::Renewing);
            }
            ServiceEvent::Timer(ServiceTimer::Rebind) => {
                if matches!(self.phase, Phase::Bound | Phase::Renewing) {
                    self.enter(core, ctx, Phase::Rebinding);
                }
            }
            ServiceEvent::Timer(ServiceTimer::Expire) => {
                info!("{}: delegated prefixes expired", core.key);
                core.publish_failure(Status::LeaseExpired);
                self.solicit(core, ctx);
            }
            ServiceEvent::MediaChanged | ServiceEvent::Wake | ServiceEvent::Renew => {
                if !ctx.link_usable() {
                    core.cancel_timer(ctx, ServiceTimer::Retransmit);
                } else if matches!(self.phase, Phase::Bound | Phase::Renewing) {
                    core.cancel_timer(ctx, ServiceTimer::Renew);
                    self.enter(core, ctx, Phase::Rebinding);
                } else if self.phase != Phase::Rebinding {
                    self.solicit(core, ctx);
                }
            }
            ServiceEvent::LinkTimerExpired => {
                core.release(ctx);
                self.phase = Phase::Inactive;
                self.prefixes.clear();
                core.publish_failure(Status::MediaInactive);
            }
            ServiceEvent::GetIpv6Info => {
                let info = (!self.prefixes.is_empty() && self.phase != Phase::Soliciting)
                    .then(|| json!({ "prefixes": self.prefixes }));
                return Ok(EventReply::Ipv6Info(info));
            }
            ServiceEvent::ProvideSummary => {
                return summary_with(
                    core,
                    json!({
                        "state": self.phase,
                        "prefixes": self.prefixes,
                        "hint": self.hint.map(|(p, l)| format!("{p}/{l}")),
                    }),
                );
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}
