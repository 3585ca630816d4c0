//! DHCP and DHCPv6 transport traits
//!
//! Wire encoding lives outside the core. Methods hand a [`DhcpMessage`] to a
//! [`DhcpTransport`]; the transport's receive side parses replies and posts
//! them to the engine as [`Event::Dhcp`](crate::event::Event::Dhcp). Parsed
//! options are only reachable through the [`DhcpOptions`] accessor.

use crate::error::Result;
use crate::interface::HwAddr;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

/// DHCP/BOOTP client message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DhcpMessageKind {
    Discover,
    Request,
    Decline,
    Release,
    Inform,
    /// Plain BOOTP request (no DHCP message type option)
    BootRequest,
}

/// Outgoing DHCP/BOOTP message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpMessage {
    pub kind: DhcpMessageKind,
    pub xid: u32,
    pub hwaddr: Option<HwAddr>,
    pub client_id: Option<String>,
    /// Client address field (renewing, informing)
    pub ciaddr: Option<Ipv4Addr>,
    /// Requested address option
    pub requested_ip: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    /// Send to the broadcast address instead of the server
    pub broadcast: bool,
}

impl DhcpMessage {
    pub fn new(kind: DhcpMessageKind, xid: u32) -> Self {
        Self {
            kind,
            xid,
            hwaddr: None,
            client_id: None,
            ciaddr: None,
            requested_ip: None,
            server_id: None,
            broadcast: true,
        }
    }
}

/// Accessor over a parsed DHCP option set
pub trait DhcpOptions: Send + Sync + Debug {
    /// Default router to use with `our_ip`
    fn find_router(&self, our_ip: Ipv4Addr) -> Option<Ipv4Addr>;

    fn subnet_mask(&self) -> Option<Ipv4Addr>;

    /// Lease duration; `None` means infinite
    fn lease_time(&self) -> Option<Duration>;

    fn renewal_time(&self) -> Option<Duration>;

    fn rebinding_time(&self) -> Option<Duration>;

    /// Options as JSON, for publishing
    fn to_json(&self) -> serde_json::Value;
}

/// Option set built from already-known values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticOptions {
    #[serde(default)]
    pub routers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub subnet_mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub lease_secs: Option<u32>,
    #[serde(default)]
    pub renewal_secs: Option<u32>,
    #[serde(default)]
    pub rebinding_secs: Option<u32>,
}

impl StaticOptions {
    pub fn with_router(mut self, router: Ipv4Addr) -> Self {
        self.routers.push(router);
        self
    }

    pub fn with_subnet_mask(mut self, mask: Ipv4Addr) -> Self {
        self.subnet_mask = Some(mask);
        self
    }

    pub fn with_lease_secs(mut self, secs: u32) -> Self {
        self.lease_secs = Some(secs);
        self
    }
}

impl DhcpOptions for StaticOptions {
    fn find_router(&self, our_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        // A router equal to our own address means proxy ARP: use it only if
        // nothing better is offered
        let usable = self.routers.iter().copied().filter(|r| !r.is_unspecified());
        let mut fallback = None;
        for router in usable {
            if router != our_ip {
                return Some(router);
            }
            fallback = Some(router);
        }
        fallback
    }

    fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.subnet_mask
    }

    fn lease_time(&self) -> Option<Duration> {
        match self.lease_secs {
            None | Some(u32::MAX) => None,
            Some(secs) => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    fn renewal_time(&self) -> Option<Duration> {
        self.renewal_secs
            .map(|secs| Duration::from_secs(u64::from(secs)))
    }

    fn rebinding_time(&self) -> Option<Duration> {
        self.rebinding_secs
            .map(|secs| Duration::from_secs(u64::from(secs)))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Server reply type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DhcpReplyKind {
    Offer,
    Ack,
    Nak,
    BootReply,
}

/// Parsed DHCP/BOOTP reply
#[derive(Debug, Clone)]
pub struct DhcpReply {
    pub kind: DhcpReplyKind,
    pub xid: u32,
    /// Offered/assigned address
    pub yiaddr: Ipv4Addr,
    pub server_id: Option<Ipv4Addr>,
    pub options: Arc<dyn DhcpOptions>,
}

/// Transmits DHCP/BOOTP messages
pub trait DhcpTransport: Send + Sync {
    fn send(&self, ifname: &str, message: &DhcpMessage) -> Result<()>;
}

/// DHCPv6 client message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dhcpv6MessageKind {
    Solicit,
    Request,
    Renew,
    Rebind,
    Release,
}

/// One delegated prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedPrefix {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub valid_secs: u32,
    pub preferred_secs: u32,
}

/// Outgoing DHCPv6 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dhcpv6Message {
    pub kind: Dhcpv6MessageKind,
    pub transaction_id: u32,
    pub server_id: Option<Vec<u8>>,
    /// Prefixes being requested, renewed or released
    pub prefixes: Vec<DelegatedPrefix>,
    pub prefix_hint: Option<(Ipv6Addr, u8)>,
}

/// Server reply type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dhcpv6ReplyKind {
    Advertise,
    Reply,
}

/// Parsed DHCPv6 reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dhcpv6Reply {
    pub kind: Dhcpv6ReplyKind,
    pub transaction_id: u32,
    pub server_id: Vec<u8>,
    /// Status code option was success (or absent)
    pub success: bool,
    pub prefixes: Vec<DelegatedPrefix>,
    pub t1_secs: u32,
    pub t2_secs: u32,
}

/// Transmits DHCPv6 messages
pub trait Dhcpv6Transport: Send + Sync {
    fn send(&self, ifname: &str, message: &Dhcpv6Message) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_router_skips_own_address_when_possible() {
        let ours = Ipv4Addr::new(10, 0, 0, 5);
        let options = StaticOptions::default()
            .with_router(ours)
            .with_router(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(options.find_router(ours), Some(Ipv4Addr::new(10, 0, 0, 1)));

        let proxy = StaticOptions::default().with_router(ours);
        assert_eq!(proxy.find_router(ours), Some(ours));
        assert_eq!(StaticOptions::default().find_router(ours), None);
    }

    #[test]
    fn test_infinite_lease() {
        let options = StaticOptions::default().with_lease_secs(u32::MAX);
        assert_eq!(options.lease_time(), None);
        let options = StaticOptions::default().with_lease_secs(3600);
        assert_eq!(options.lease_time(), Some(Duration::from_secs(3600)));
    }
}
