//! Interface control trait
//!
//! Applies the facts the core decides on: addresses, IPv6 enablement, admin
//! state. Calls are fire-and-forget from the engine's point of view; a failure
//! is logged by the caller and never stops the event loop.

use crate::error::Result;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Address and admin-state control of interfaces
///
/// # Trust Level: Semi-Trusted
///
/// ## Allowed Capabilities
/// - ✅ Platform calls (ioctl, netlink) that change interface state
///
/// ## Forbidden Capabilities
/// - ❌ Block waiting for the change to settle (the core waits on events)
/// - ❌ Decide which address to use
pub trait InterfaceControl: Send + Sync {
    fn set_ipv4_address(&self, ifname: &str, address: Ipv4Addr, mask: Ipv4Addr) -> Result<()>;

    fn remove_ipv4_address(&self, ifname: &str, address: Ipv4Addr) -> Result<()>;

    /// Enable or disable IPv6, optionally with stateless autoconfiguration
    fn set_ipv6_enabled(&self, ifname: &str, enabled: bool, autoconf: bool) -> Result<()>;

    fn add_ipv6_address(&self, ifname: &str, address: Ipv6Addr, prefix_len: u8) -> Result<()>;

    fn remove_ipv6_address(&self, ifname: &str, address: Ipv6Addr, prefix_len: u8)
    -> Result<()>;

    /// Send one router solicitation
    fn solicit_router(&self, ifname: &str) -> Result<()>;

    /// Administratively bring the interface up or down
    fn set_admin_up(&self, ifname: &str, up: bool) -> Result<()>;

    /// Detach all protocol stacks from the interface
    fn detach_protocols(&self, ifname: &str) -> Result<()>;
}
