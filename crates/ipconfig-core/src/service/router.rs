//! Router validity
//!
//! Cached default router of an IPv4 service. The router address comes from
//! protocol data (DHCP options, manual configuration); its hardware address
//! and the "verified" bit only ever come from a successful ARP resolve or
//! detect. `arp_verified` implies `hwaddr_valid` implies `address_valid`.

use crate::arp::ArpResult;
use crate::interface::HwAddr;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Router validity flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterFlags {
    pub address_valid: bool,
    pub hwaddr_valid: bool,
    pub arp_verified: bool,
    pub resolve_in_progress: bool,
    pub resolve_timed_out: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterValidity {
    flags: RouterFlags,
    address: Option<Ipv4Addr>,
    hwaddr: Option<HwAddr>,
}

impl RouterValidity {
    pub fn flags(&self) -> RouterFlags {
        self.flags
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address.filter(|_| self.flags.address_valid)
    }

    pub fn hwaddr(&self) -> Option<HwAddr> {
        self.hwaddr.filter(|_| self.flags.hwaddr_valid)
    }

    pub fn is_arp_verified(&self) -> bool {
        self.flags.arp_verified
    }

    /// Hardware address as published: only while verified
    pub fn verified_hwaddr(&self) -> Option<HwAddr> {
        self.hwaddr().filter(|_| self.flags.arp_verified)
    }

    /// Record the router named by protocol data
    ///
    /// A different address invalidates the cached hardware address.
    pub fn set_address(&mut self, address: Option<Ipv4Addr>) {
        match address {
            Some(ip) if self.address() == Some(ip) => {}
            Some(ip) => {
                *self = Self::default();
                self.address = Some(ip);
                self.flags.address_valid = true;
            }
            None => *self = Self::default(),
        }
    }

    /// Forget everything
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// The cached router may be stale (link change, renewal); returns
    /// whether it had been verified
    pub fn clear_arp_verified(&mut self) -> bool {
        std::mem::replace(&mut self.flags.arp_verified, false)
    }

    /// Whether an ARP resolve should be started
    pub fn needs_resolve(&self) -> bool {
        self.flags.address_valid && !self.flags.arp_verified && !self.flags.resolve_in_progress
    }

    pub fn resolve_started(&mut self) {
        self.flags.resolve_in_progress = true;
        self.flags.resolve_timed_out = false;
    }

    pub fn resolve_cancelled(&mut self) {
        self.flags.resolve_in_progress = false;
    }

    /// Apply a resolve or detect result; returns whether the router is now verified
    pub fn resolve_finished(&mut self, result: &ArpResult) -> bool {
        self.flags.resolve_in_progress = false;
        if result.error {
            return false;
        }
        let answered = result.in_use && self.address() == Some(result.addr.target_ip);
        match result.addr.target_hw.filter(|_| answered) {
            Some(hw) => {
                self.hwaddr = Some(hw);
                self.flags.hwaddr_valid = true;
                self.flags.arp_verified = true;
                true
            }
            None => {
                self.flags.resolve_timed_out = true;
                false
            }
        }
    }
}
