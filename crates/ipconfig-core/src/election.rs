//! Cross-service decisions made once per coalescing pass
//!
//! - **Ranks**: a service's rank is its position in the configured service
//!   order; an interface ranks as its best non-link-local service.
//! - **Link-local election**: per interface, pick the IPv4 service that owns
//!   the auto-spawned link-local child and keep the child's allocation mode in
//!   line with the parent's address state.
//! - **Disable-until-needed**: administratively down lower-priority
//!   interfaces while a better one has working services.
//!
//! Every step only reads the current service states, so running a pass twice
//! without an intervening change is a no-op.

use crate::config::{AddressFamily, MethodConfig, MethodKind};
use crate::engine::EngineNotice;
use crate::engine::state::SystemState;
use crate::error::Status;
use crate::service::{ChangeRequest, ServiceEvent, ServiceId};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Service/interface priority; lower is better
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Rank(u32);

impl Rank {
    /// Interface carrying the boot-time configuration
    pub const BOOT: Rank = Rank(0);

    /// Not in the service order
    pub const NONE: Rank = Rank(u32::MAX);

    /// Position `index` (0-based) in the service order
    pub fn listed(index: usize) -> Rank {
        let position = u32::try_from(index).unwrap_or(u32::MAX);
        Rank(position.saturating_add(1).min(u32::MAX - 1))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Rank::NONE => f.write_str("none"),
            Rank::BOOT => f.write_str("boot"),
            Rank(n) => write!(f, "{n}"),
        }
    }
}

/// What the link-local election decided for one interface
#[derive(Debug, Clone, PartialEq)]
enum Decision {
    /// Destroy a child that no longer has a reason to exist
    DestroyChild(ServiceId),
    /// Spawn a child under `parent`
    Spawn { parent: ServiceId, allocate: bool },
    /// Flip the allocation mode of an existing child
    Toggle { child: ServiceId, allocate: bool },
}

impl SystemState {
    /// Rank of a service on an interface
    pub(crate) fn service_rank(&self, ifname: &str, key: &str) -> Rank {
        if self.desired.boot_interface.as_deref() == Some(ifname) {
            return Rank::BOOT;
        }
        self.desired
            .order
            .iter()
            .position(|k| k == key)
            .map_or(Rank::NONE, Rank::listed)
    }

    /// Recompute interface ranks and services-ready flags
    pub(crate) fn recompute_ranks(&mut self) {
        let mut computed = Vec::with_capacity(self.ifstates.len());
        for (name, ifstate) in &self.ifstates {
            let mut rank = Rank::NONE;
            let mut ready = false;
            for id in ifstate.services() {
                let Some(service) = self.services.get(&id) else {
                    continue;
                };
                if service.kind().is_link_local() {
                    continue;
                }
                if service.core.ready && service.core.status.is_success() {
                    ready = true;
                }
                if !service.core.is_child() {
                    rank = rank.min(self.service_rank(name, service.key()));
                }
            }
            computed.push((name.clone(), rank, ready));
        }
        for (name, rank, ready) in computed {
            if let Some(ifstate) = self.ifstates.get_mut(&name) {
                if ifstate.rank != rank || ifstate.services_ready != ready {
                    debug!("{}: rank {} ready {}", name, rank, ready);
                }
                ifstate.rank = rank;
                ifstate.services_ready = ready;
            }
        }
    }

    /// Best IPv4 address of the host: the address of the best-ranked service
    /// on the best-ranked interface
    pub(crate) fn update_primary_ipv4(&mut self) {
        let mut best: Option<((Rank, Rank, &str), Ipv4Addr)> = None;
        for (name, ifstate) in &self.ifstates {
            for id in ifstate.services_of(AddressFamily::V4) {
                let Some(service) = self.services.get(id) else {
                    continue;
                };
                if service.kind().is_link_local() {
                    continue;
                }
                let Some(address) = service.core.ipv4_address() else {
                    continue;
                };
                let key = (ifstate.rank, self.service_rank(name, service.key()), name.as_str());
                if best.as_ref().is_none_or(|(b, _)| key < *b) {
                    best = Some((key, address));
                }
            }
        }
        let primary = best.map(|(_, address)| address);
        if primary == self.primary_ipv4 {
            return;
        }
        info!("Primary IPv4 address is now {:?}", primary);
        self.primary_ipv4 = primary;

        let followers: Vec<ServiceId> = self
            .services
            .values()
            .filter(|s| s.kind() == MethodKind::Stf)
            .map(|s| s.id())
            .collect();
        for id in followers {
            self.dispatch(id, ServiceEvent::PrimaryIpv4(primary));
        }
    }

    /// Run link-local election on every eligible interface
    pub(crate) fn elect_link_local(&mut self) {
        let names: Vec<String> = self.ifstates.keys().cloned().collect();
        for name in names {
            for decision in self.link_local_decisions(&name) {
                self.apply_decision(&name, decision);
            }
        }
    }

    fn link_local_decisions(&self, ifname: &str) -> Vec<Decision> {
        let Some(ifstate) = self.ifstates.get(ifname) else {
            return Vec::new();
        };
        if ifstate.interface.skips_link_local() {
            return Vec::new();
        }

        let v4: Vec<_> = ifstate
            .services_of(AddressFamily::V4)
            .iter()
            .filter_map(|id| self.services.get(id))
            .collect();
        let children: Vec<ServiceId> = v4
            .iter()
            .filter(|s| s.kind() == MethodKind::LinkLocal && s.core.is_child())
            .map(|s| s.id())
            .collect();

        // A configured link-local service that holds an address stands unchallenged
        if v4.iter().any(|s| {
            s.kind() == MethodKind::LinkLocal && !s.core.is_child() && s.core.has_address()
        }) {
            return children.into_iter().map(Decision::DestroyChild).collect();
        }

        let winner = v4
            .iter()
            .filter(|s| !s.kind().is_link_local() && !s.core.is_child())
            .filter(|s| {
                s.core.has_address()
                    || (s.kind().failure_configures_link_local()
                        && s.core.status == Status::NoServer
                        && !ifstate.clat46)
            })
            .min_by_key(|s| {
                (
                    !s.core.has_address(),
                    self.service_rank(ifname, s.key()),
                    s.id(),
                )
            });

        let mut decisions = Vec::new();
        let Some(winner) = winner else {
            decisions.extend(children.into_iter().map(Decision::DestroyChild));
            return decisions;
        };

        let allocate = !winner.core.has_address();
        let current = winner
            .core
            .child
            .and_then(|id| self.services.get(&id))
            .filter(|child| child.kind() == MethodKind::LinkLocal);

        // Children of anyone but the winner go away
        decisions.extend(
            children
                .iter()
                .filter(|id| Some(**id) != current.map(|c| c.id()))
                .copied()
                .map(Decision::DestroyChild),
        );

        match current {
            None => decisions.push(Decision::Spawn {
                parent: winner.id(),
                allocate,
            }),
            Some(child) if child.link_local_allocate() != Some(allocate) => {
                decisions.push(Decision::Toggle {
                    child: child.id(),
                    allocate,
                })
            }
            Some(_) => {}
        }
        decisions
    }

    fn apply_decision(&mut self, ifname: &str, decision: Decision) {
        match decision {
            Decision::DestroyChild(child) => {
                debug!("{}: destroying link-local child {}", ifname, child);
                self.destroy_service(child);
            }
            Decision::Spawn { parent, allocate } => {
                let Some(parent_key) = self.services.get(&parent).map(|s| s.key().to_string())
                else {
                    return;
                };
                info!(
                    "{}: link-local follows {} ({})",
                    ifname,
                    parent_key,
                    if allocate { "allocate" } else { "subnet only" }
                );
                let key = format!("{parent_key}-linklocal");
                let child = self.create_service(
                    ifname,
                    key,
                    MethodConfig::LinkLocal,
                    Some(parent),
                    allocate,
                );
                if let Some(child) = child
                    && let Some(parent) = self.services.get_mut(&parent)
                {
                    parent.core.child = Some(child);
                }
                self.notify(EngineNotice::LinkLocalElected {
                    interface: ifname.to_string(),
                    parent: parent_key,
                    allocate,
                });
            }
            Decision::Toggle { child, allocate } => {
                debug!("{}: link-local child {} allocate={}", ifname, child, allocate);
                let reply = self.dispatch(
                    child,
                    ServiceEvent::Change(ChangeRequest::LinkLocalAllocate(allocate)),
                );
                if let Some(Err(status)) = reply {
                    warn!("{}: toggling {} failed: {}", ifname, child, status);
                }
            }
        }
    }

    /// Apply the disable-until-needed policy across interfaces
    pub(crate) fn disable_until_needed(&mut self) {
        let mut order: Vec<(_, String)> = self
            .ifstates
            .values()
            .map(|s| (s.rank, s.name().to_string()))
            .collect();
        order.sort();

        let mut better_ready = false;
        for (_, name) in order {
            let Some(ifstate) = self.ifstates.get_mut(&name) else {
                continue;
            };
            let disable = better_ready && ifstate.disable_until_needed;
            better_ready |= ifstate.services_ready;
            if disable == ifstate.disabled {
                continue;
            }
            ifstate.disabled = disable;
            let detach = disable && !ifstate.has_services();

            info!(
                "{}: {} until needed",
                name,
                if disable { "disabled" } else { "enabled" }
            );
            let control = &self.io.control;
            if let Err(e) = control.set_admin_up(&name, !disable) {
                warn!("{}: changing admin state failed: {}", name, e);
            }
            if detach && let Err(e) = control.detach_protocols(&name) {
                warn!("{}: detaching protocols failed: {}", name, e);
            }
            self.notify(EngineNotice::InterfaceDisabled {
                interface: name,
                disabled: disable,
            });
        }
    }
}
