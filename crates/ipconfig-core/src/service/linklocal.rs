//! IPv4 link-local (169.254/16)
//!
//! In allocate mode a random address in 169.254.1.0 - 169.254.254.255 is
//! probed and assigned. After `max_conflicts` conflicts, new candidates are
//! only tried once per `rate_limit_secs`. An assigned address is defended
//! once per `defend_interval_secs`; a second claim within that window moves
//! the service to a new address.
//!
//! In no-allocate mode only the 169.254/16 subnet is published, so link-local
//! peers stay reachable next to a routable address.

use super::{
    ArpPurpose, ChangeRequest, EventReply, Facts, HandlerResult, Ipv4Info, MethodHandler,
    ServiceContext, ServiceCore, ServiceEvent, default_reply, summary_with,
};
use crate::config::MethodConfig;
use crate::error::Status;
use crate::timers::ServiceTimer;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

const LINK_LOCAL_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 0, 0);

/// Random address from the usable link-local range
fn random_address() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    Ipv4Addr::new(169, 254, rng.gen_range(1..=254), rng.gen_range(0..=255))
}

#[derive(Debug)]
pub(crate) struct LinkLocalState {
    allocate: bool,
    /// Address being probed or in use; kept across restarts of the probe
    candidate: Option<Ipv4Addr>,
    conflicts: u32,
    last_defended: Option<DateTime<Utc>>,
}

impl LinkLocalState {
    pub fn new(allocate: bool) -> Self {
        Self {
            allocate,
            candidate: None,
            conflicts: 0,
            last_defended: None,
        }
    }

    pub fn allocate(&self) -> bool {
        self.allocate
    }

    fn begin(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        if !self.allocate {
            core.release(ctx);
            core.remove_ipv4(ctx);
            core.publish_success(Facts::link_local_subnet());
            return;
        }
        if !ctx.link_usable() {
            return;
        }
        let address = *self.candidate.get_or_insert_with(random_address);
        if !core.arp_probe(ctx, address) {
            warn!("{}: cannot probe {} on {}", core.key, address, ctx.ifname());
            core.publish_failure(Status::ResourceUnavailable);
        }
    }

    fn next_candidate(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        self.conflicts += 1;
        self.candidate = Some(random_address());
        if self.conflicts >= ctx.settings.link_local.max_conflicts {
            let delay = Duration::from_secs(ctx.settings.link_local.rate_limit_secs);
            debug!(
                "{}: {} conflicts, next probe in {:?}",
                core.key, self.conflicts, delay
            );
            core.set_timer(ctx, ServiceTimer::Retry, delay);
        } else {
            self.begin(core, ctx);
        }
    }

    fn assign(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, address: Ipv4Addr) {
        if !core.apply_ipv4(ctx, address, LINK_LOCAL_MASK) {
            core.publish_failure(Status::InternalError);
            return;
        }
        self.conflicts = 0;
        let info = Ipv4Info {
            address,
            subnet_mask: LINK_LOCAL_MASK,
            router: None,
        };
        if core.publish_success(Facts::ipv4(info)) {
            info!("{}: link-local {} on {}", core.key, address, ctx.ifname());
        }
    }

    fn set_allocate(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>, allocate: bool) {
        if allocate == self.allocate {
            return;
        }
        debug!("{}: allocate {} -> {}", core.key, self.allocate, allocate);
        self.allocate = allocate;
        core.arp_cancel(ctx);
        core.remove_ipv4(ctx);
        core.unpublish();
        self.begin(core, ctx);
    }

    fn lose_address(&mut self, core: &mut ServiceCore, ctx: &mut ServiceContext<'_>) {
        core.remove_ipv4(ctx);
        core.unpublish();
        self.next_candidate(core, ctx);
    }
}

impl MethodHandler for LinkLocalState {
    fn handle(
        &mut self,
        core: &mut ServiceCore,
        ctx: &mut ServiceContext<'_>,
        event: ServiceEvent,
    ) -> HandlerResult {
        match event {
            ServiceEvent::Start => {
                if self.allocate && ctx.interface.skips_link_local() {
                    return Err(Status::OperationNotSupported);
                }
                self.begin(core, ctx);
            }
            ServiceEvent::Stop => {
                core.remove_ipv4(ctx);
                core.release(ctx);
            }
            ServiceEvent::Change(ChangeRequest::LinkLocalAllocate(allocate)) => {
                self.set_allocate(core, ctx, allocate);
                return Ok(EventReply::NeedsStop(false));
            }
            ServiceEvent::Change(ChangeRequest::Config(MethodConfig::LinkLocal)) => {
                return Ok(EventReply::NeedsStop(false));
            }
            ServiceEvent::Arp(completion) if completion.tag.purpose == ArpPurpose::Probe => {
                let result = completion.result;
                if result.error {
                    warn!("{}: link-local probe failed", core.key);
                    core.publish_failure(Status::ResourceUnavailable);
                    let delay = Duration::from_secs(ctx.settings.link_local.rate_limit_secs);
                    core.set_timer(ctx, ServiceTimer::Retry, delay);
                } else if result.in_use {
                    debug!("{}: {} is taken", core.key, result.addr.target_ip);
                    self.next_candidate(core, ctx);
                } else {
                    self.assign(core, ctx, result.addr.target_ip);
                }
            }
            ServiceEvent::Timer(ServiceTimer::Retry) => self.begin(core, ctx),
            ServiceEvent::ArpCollision { address, hwaddr } => {
                if !self.allocate || core.ipv4_address() != Some(address) {
                    return Ok(EventReply::Done);
                }
                let now = Utc::now();
                let window = chrono::Duration::seconds(
                    i64::try_from(ctx.settings.link_local.defend_interval_secs).unwrap_or(i64::MAX),
                );
                let recently = self.last_defended.is_some_and(|t| now - t < window);
                if recently {
                    info!("{}: {} claimed again by {}, moving", core.key, address, hwaddr);
                    self.last_defended = None;
                    self.lose_address(core, ctx);
                } else {
                    debug!("{}: defending {} against {}", core.key, address, hwaddr);
                    self.last_defended = Some(now);
                    core.arp_defend(ctx, address);
                }
            }
            ServiceEvent::MediaChanged | ServiceEvent::BssidChanged | ServiceEvent::Wake => {
                if ctx.link_usable() {
                    // Re-check the current address on the new link, or bring
                    // back the subnet withdrawn while the link was gone
                    self.begin(core, ctx);
                }
            }
            ServiceEvent::LinkTimerExpired => {
                core.release(ctx);
                core.remove_ipv4(ctx);
                core.publish_failure(Status::MediaInactive);
            }
            ServiceEvent::ProvideSummary => {
                return summary_with(
                    core,
                    json!({
                        "allocate": self.allocate,
                        "candidate": self.candidate,
                        "conflicts": self.conflicts,
                    }),
                );
            }
            other => return default_reply(core, &other),
        }
        Ok(EventReply::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::ArpEngine;
    use crate::config::{MethodKind, Settings};
    use crate::error::{Error, Result};
    use crate::event::event_queue;
    use crate::interface::{Interface, LinkStatus};
    use crate::service::{Collaborators, ServiceId};
    use crate::timers::{TimerFacility, TimerToken, Timers};
    use crate::traits::transport::{DhcpMessage, DhcpTransport, Dhcpv6Message, Dhcpv6Transport};
    use crate::traits::{CaptureHandle, CaptureNotifier, InterfaceControl, LinkCapture};
    use std::net::Ipv6Addr;
    use std::sync::Arc;

    struct Offline;

    impl LinkCapture for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        fn open(&self, ifname: &str, _notifier: CaptureNotifier) -> Result<Box<dyn CaptureHandle>> {
            Err(Error::not_found(ifname.to_string()))
        }
    }

    impl InterfaceControl for Offline {
        fn set_ipv4_address(&self, _: &str, _: Ipv4Addr, _: Ipv4Addr) -> Result<()> {
            Ok(())
        }
        fn remove_ipv4_address(&self, _: &str, _: Ipv4Addr) -> Result<()> {
            Ok(())
        }
        fn set_ipv6_enabled(&self, _: &str, _: bool, _: bool) -> Result<()> {
            Ok(())
        }
        fn add_ipv6_address(&self, _: &str, _: Ipv6Addr, _: u8) -> Result<()> {
            Ok(())
        }
        fn remove_ipv6_address(&self, _: &str, _: Ipv6Addr, _: u8) -> Result<()> {
            Ok(())
        }
        fn solicit_router(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn set_admin_up(&self, _: &str, _: bool) -> Result<()> {
            Ok(())
        }
        fn detach_protocols(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    impl DhcpTransport for Offline {
        fn send(&self, _: &str, _: &DhcpMessage) -> Result<()> {
            Ok(())
        }
    }

    impl Dhcpv6Transport for Offline {
        fn send(&self, _: &str, _: &Dhcpv6Message) -> Result<()> {
            Ok(())
        }
    }

    impl TimerFacility for Offline {
        fn set_relative(&mut self, _: TimerToken, _: Duration) {}
        fn cancel(&mut self, _: &TimerToken) {}
    }

    /// Drive a subnet-only service through `events` on a link in `link` state
    fn run(
        state: &mut LinkLocalState,
        core: &mut ServiceCore,
        link: LinkStatus,
        events: Vec<ServiceEvent>,
    ) {
        let settings = Settings::default();
        let (tx, _rx) = event_queue();
        let mut arp = ArpEngine::new(Arc::new(Offline), tx, settings.arp.clone());
        let mut timers = Timers::new(Box::new(Offline));
        let io = Collaborators {
            control: Arc::new(Offline),
            dhcp: Arc::new(Offline),
            dhcpv6: Arc::new(Offline),
        };
        let mut interface = Interface::ethernet("en0", 1, [2, 0, 0, 0, 0, 1]);
        interface.link = link;
        let mut ctx = ServiceContext {
            arp: &mut arp,
            timers: &mut timers,
            io: &io,
            interface: &interface,
            settings: &settings,
            clat46: false,
            primary_ipv4: None,
        };
        for event in events {
            assert!(state.handle(core, &mut ctx, event).is_ok());
        }
    }

    #[test]
    fn test_subnet_withdrawn_when_link_stays_down() {
        let mut state = LinkLocalState::new(false);
        let mut core = ServiceCore::new(ServiceId::new(2), "svc-linklocal", "en0", MethodKind::LinkLocal);

        run(&mut state, &mut core, LinkStatus::up(), vec![ServiceEvent::Start]);
        assert_eq!(core.publication.facts, Some(Facts::link_local_subnet()));

        run(
            &mut state,
            &mut core,
            LinkStatus::down(),
            vec![ServiceEvent::MediaChanged, ServiceEvent::LinkTimerExpired],
        );
        assert_eq!(core.publication.facts, None);
        assert_eq!(core.status, Status::MediaInactive);
        assert!(core.publication.dirty);

        // The subnet comes back with the link
        run(&mut state, &mut core, LinkStatus::up(), vec![ServiceEvent::MediaChanged]);
        assert_eq!(core.publication.facts, Some(Facts::link_local_subnet()));
        assert!(core.status.is_success());
    }

    #[test]
    fn test_random_address_in_usable_range() {
        for _ in 0..256 {
            let octets = random_address().octets();
            assert_eq!(&octets[..2], &[169, 254]);
            assert!((1..=254).contains(&octets[2]));
        }
    }
}
