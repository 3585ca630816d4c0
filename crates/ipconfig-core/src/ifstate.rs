//! Per-interface control block
//!
//! An [`IfState`] exists for every interface the configuration names and the
//! link facility reports. It owns a copy of the interface, the ids of its
//! services (per family) and the bookkeeping the election pass reads and
//! writes.

use crate::config::AddressFamily;
use crate::election::Rank;
use crate::interface::{Interface, LinkStatus};
use crate::service::ServiceId;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct IfState {
    pub interface: Interface,
    pub v4: Vec<ServiceId>,
    pub v6: Vec<ServiceId>,
    /// Link-local service: user configured, or the child of an elected parent
    pub link_local: Option<ServiceId>,
    /// Bumped on every wake
    pub wake_generation: u64,
    /// Policy: take the interface down while a better one is ready
    pub disable_until_needed: bool,
    /// Currently administratively downed by that policy
    pub disabled: bool,
    pub active_during_sleep: bool,
    pub asleep: bool,
    /// IPv6-only network with IPv4 translation
    pub clat46: bool,
    pub rank: Rank,
    pub services_ready: bool,
    /// Last busy value written to the store
    pub busy_published: Option<bool>,
}

impl IfState {
    pub fn new(interface: Interface) -> Self {
        Self {
            interface,
            v4: Vec::new(),
            v6: Vec::new(),
            link_local: None,
            wake_generation: 0,
            disable_until_needed: false,
            disabled: false,
            active_during_sleep: false,
            asleep: false,
            clat46: false,
            rank: Rank::NONE,
            services_ready: false,
            busy_published: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.interface.name
    }

    /// All services, IPv4 first
    pub fn services(&self) -> impl Iterator<Item = ServiceId> + '_ {
        self.v4.iter().chain(self.v6.iter()).copied()
    }

    pub fn services_of(&self, family: AddressFamily) -> &[ServiceId] {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    pub fn has_services(&self) -> bool {
        !self.v4.is_empty() || !self.v6.is_empty()
    }

    pub fn add_service(&mut self, id: ServiceId, family: AddressFamily) {
        let list = match family {
            AddressFamily::V4 => &mut self.v4,
            AddressFamily::V6 => &mut self.v6,
        };
        if !list.contains(&id) {
            list.push(id);
        }
    }

    /// Forget a service; returns whether it was listed
    pub fn remove_service(&mut self, id: ServiceId) -> bool {
        let before = self.v4.len() + self.v6.len();
        self.v4.retain(|s| *s != id);
        self.v6.retain(|s| *s != id);
        if self.link_local == Some(id) {
            self.link_local = None;
        }
        before != self.v4.len() + self.v6.len()
    }

    /// Record a link status; returns whether usability changed
    pub fn set_link(&mut self, status: LinkStatus) -> bool {
        let was = self.interface.link.is_usable();
        self.interface.link = status;
        was != status.is_usable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_service_clears_link_local() {
        let mut ifstate = IfState::new(Interface::ethernet("en0", 1, [2, 0, 0, 0, 0, 1]));
        let dhcp = ServiceId::new(1);
        let ll = ServiceId::new(2);
        ifstate.add_service(dhcp, AddressFamily::V4);
        ifstate.add_service(ll, AddressFamily::V4);
        ifstate.link_local = Some(ll);

        assert!(ifstate.remove_service(ll));
        assert_eq!(ifstate.link_local, None);
        assert_eq!(ifstate.v4, vec![dhcp]);
        assert!(!ifstate.remove_service(ll));
    }

    #[test]
    fn test_set_link_reports_usability_changes() {
        let mut ifstate = IfState::new(Interface::ethernet("en0", 1, [2, 0, 0, 0, 0, 1]));
        assert!(!ifstate.set_link(LinkStatus::up()));
        assert!(ifstate.set_link(LinkStatus::down()));
        assert!(ifstate.set_link(LinkStatus::default()));
    }
}
