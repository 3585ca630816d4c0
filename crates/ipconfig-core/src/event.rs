//! Events delivered to the engine's serialized queue
//!
//! Every mutation of interface, service and ARP state happens while handling
//! one of these. Producers (link sources, capture notifiers, timers, protocol
//! transports) only ever post to the queue.

use crate::config::ConfigSnapshot;
use crate::interface::{HwAddr, Interface, LinkStatus};
use crate::timers::TimerToken;
use crate::traits::transport::{DhcpReply, Dhcpv6Reply};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::sync::mpsc;

/// Sending half of the engine queue
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving half of the engine queue
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the engine queue
pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// System power transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerEvent {
    Sleep,
    Wake,
    PowerOff,
}

/// One IPv6 address as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6AddressState {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    /// Duplicate address detection still running
    #[serde(default)]
    pub tentative: bool,
    /// Duplicate address detection failed
    #[serde(default)]
    pub duplicated: bool,
    #[serde(default)]
    pub autoconf: bool,
}

impl Ipv6AddressState {
    /// A settled (non-tentative, non-duplicated) address
    pub fn settled(address: Ipv6Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
            tentative: false,
            duplicated: false,
            autoconf: false,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.tentative && !self.duplicated
    }

    pub fn is_link_local(&self) -> bool {
        (self.address.segments()[0] & 0xffc0) == 0xfe80
    }
}

/// Parsed router advertisement, as far as the core needs it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterAdvert {
    pub router: Ipv6Addr,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub other_config: bool,
    #[serde(default)]
    pub lifetime_secs: u32,
}

/// Everything the engine reacts to
#[derive(Debug, Clone)]
pub enum Event {
    /// Fresh interface list from the link facility
    InterfacesChanged(Vec<Interface>),

    /// New configuration snapshot from the configuration store
    ConfigChanged(ConfigSnapshot),

    /// Link went up/down
    LinkStatusChanged { ifname: String, status: LinkStatus },

    /// Wireless association changed (roam or new network)
    BssidChanged {
        ifname: String,
        ssid: Option<String>,
        bssid: Option<HwAddr>,
    },

    /// System power transition
    Power(PowerEvent),

    /// Renew all leases on an interface
    Renew { ifname: String },

    /// Another host claimed one of our addresses
    ArpCollision {
        ifname: String,
        address: Ipv4Addr,
        hwaddr: HwAddr,
    },

    /// The IPv6 address list of an interface changed
    Ipv6AddressChanged {
        ifname: String,
        addresses: Vec<Ipv6AddressState>,
    },

    /// A router advertisement was received
    RouterAdvertisement { ifname: String, advert: RouterAdvert },

    /// The IPv6 default router went away
    Ipv6RouterExpired { ifname: String },

    /// NAT64 prefix discovery finished
    PlatDiscoveryComplete { ifname: String, success: bool },

    /// Interface stays up while the system sleeps
    ActiveDuringSleep { ifname: String, active: bool },

    /// Drop the saved lease for a wireless network
    ForgetSsid { ifname: String, ssid: String },

    /// Parsed DHCP reply
    Dhcp { ifname: String, reply: DhcpReply },

    /// Parsed DHCPv6 reply
    Dhcpv6 { ifname: String, reply: Dhcpv6Reply },

    /// A capture handle has frames to read
    CaptureReadable { ifname: String },

    /// A timer armed through [`Timers`](crate::timers::Timers) fired
    Timer(TimerToken),
}

impl Event {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Event::InterfacesChanged(_) => "interfaces-changed",
            Event::ConfigChanged(_) => "config-changed",
            Event::LinkStatusChanged { .. } => "link-status-changed",
            Event::BssidChanged { .. } => "bssid-changed",
            Event::Power(_) => "power",
            Event::Renew { .. } => "renew",
            Event::ArpCollision { .. } => "arp-collision",
            Event::Ipv6AddressChanged { .. } => "ipv6-address-changed",
            Event::RouterAdvertisement { .. } => "router-advertisement",
            Event::Ipv6RouterExpired { .. } => "ipv6-router-expired",
            Event::PlatDiscoveryComplete { .. } => "plat-discovery-complete",
            Event::ActiveDuringSleep { .. } => "active-during-sleep",
            Event::ForgetSsid { .. } => "forget-ssid",
            Event::Dhcp { .. } => "dhcp",
            Event::Dhcpv6 { .. } => "dhcpv6",
            Event::CaptureReadable { .. } => "capture-readable",
            Event::Timer(_) => "timer",
        }
    }
}
