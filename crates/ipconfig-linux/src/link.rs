//! Interface enumeration and link notifications
//!
//! The interface list comes from `getifaddrs(3)`, IPv6 address state from
//! `/proc/net/if_inet6`. A `NETLINK_ROUTE` socket subscribed to the link and
//! address groups only serves as a trigger: every burst of messages leads to a
//! fresh enumeration, and the differences are posted as engine events.

use async_trait::async_trait;
use ipconfig_core::event::{Event, Ipv6AddressState};
use ipconfig_core::interface::{ARPHRD_ETHER, ARPHRD_IEEE1394};
use ipconfig_core::traits::LinkSource;
use ipconfig_core::{Error, HwAddr, Interface, LinkStatus, LinkType, Result};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sys::socket::LinkAddr;
use std::collections::BTreeMap;
use std::io;
use std::net::Ipv6Addr;
use std::pin::Pin;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace};

const ARPHRD_LOOPBACK: u16 = 772;

const RTMGRP_LINK: u32 = 0x1;
const RTMGRP_IPV4_IFADDR: u32 = 0x10;
const RTMGRP_IPV6_IFADDR: u32 = 0x100;

const IFA_F_DADFAILED: u32 = 0x08;
const IFA_F_TENTATIVE: u32 = 0x40;
const IFA_F_PERMANENT: u32 = 0x80;

const IF_INET6: &str = "/proc/net/if_inet6";
const RECV_BUFFER: usize = 16 * 1024;

/// Link facility backed by getifaddrs and rtnetlink
#[derive(Debug, Default)]
pub struct LinuxLinkSource;

impl LinuxLinkSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LinkSource for LinuxLinkSource {
    async fn interfaces(&self) -> Result<Vec<Interface>> {
        tokio::task::spawn_blocking(enumerate)
            .await
            .map_err(|e| Error::not_found(format!("Interface enumeration aborted: {}", e)))?
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = Event> + Send + 'static>> {
        let (tx, rx) = mpsc::unbounded_channel();
        match subscribe() {
            Ok(socket) => {
                tokio::spawn(watch_netlink(socket, tx));
            }
            Err(e) => {
                // Stream ends immediately; the engine keeps running on injected events
                error!("Failed to subscribe to link notifications: {}", e);
            }
        }
        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

fn subscribe() -> io::Result<AsyncFd<Socket>> {
    let mut socket = Socket::new(NETLINK_ROUTE)?;
    socket.bind(&SocketAddr::new(
        0,
        RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR,
    ))?;
    socket.set_non_blocking(true)?;
    AsyncFd::new(socket)
}

/// Interface indices named by a batch of rtnetlink messages
///
/// Messages that fail to decode end the batch; the enumeration that follows
/// does not depend on them.
fn changed_indices(buffer: &[u8]) -> Vec<u32> {
    let mut indices = Vec::new();
    let mut offset = 0;
    while offset < buffer.len() {
        let message = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buffer[offset..]) {
            Ok(message) => message,
            Err(e) => {
                trace!("Undecodable netlink message: {}", e);
                break;
            }
        };
        let length = message.header.length as usize;
        if length == 0 {
            break;
        }
        offset += (length + 3) & !3;

        let index = match &message.payload {
            NetlinkPayload::InnerMessage(
                RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link),
            ) => link.header.index,
            NetlinkPayload::InnerMessage(
                RouteNetlinkMessage::NewAddress(address)
                | RouteNetlinkMessage::DelAddress(address),
            ) => address.header.index,
            _ => continue,
        };
        if !indices.contains(&index) {
            indices.push(index);
        }
    }
    indices
}

/// What was last reported for one interface
#[derive(Debug, Clone, PartialEq)]
struct Seen {
    interface: Interface,
    ipv6: Vec<Ipv6AddressState>,
}

async fn watch_netlink(socket: AsyncFd<Socket>, tx: mpsc::UnboundedSender<Event>) {
    let mut seen = match snapshot() {
        Ok(seen) => seen,
        Err(e) => {
            error!("Initial interface enumeration failed: {}", e);
            BTreeMap::new()
        }
    };
    info!("Watching link notifications ({} interfaces)", seen.len());

    let mut buffer: Vec<u8> = Vec::with_capacity(RECV_BUFFER);
    loop {
        let mut guard = match socket.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                error!("Netlink readability watch failed: {}", e);
                return;
            }
        };
        guard.clear_ready();

        let mut touched = Vec::new();
        loop {
            buffer.clear();
            match socket.get_ref().recv(&mut buffer, 0) {
                Ok(_) => touched.extend(changed_indices(&buffer)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // ENOBUFS: messages were lost, a full re-enumeration covers it
                    debug!("Netlink receive error: {}", e);
                    break;
                }
            }
        }
        trace!("Netlink activity on interfaces {:?}", touched);

        let current = match snapshot() {
            Ok(current) => current,
            Err(e) => {
                error!("Interface enumeration failed: {}", e);
                continue;
            }
        };
        for event in diff(&seen, &current) {
            if tx.send(event).is_err() {
                debug!("Link event receiver dropped, stopping watcher");
                return;
            }
        }
        seen = current;
    }
}

fn snapshot() -> Result<BTreeMap<String, Seen>> {
    let mut ipv6 = read_ipv6_addresses();
    Ok(enumerate()?
        .into_iter()
        .map(|interface| {
            let name = interface.name.clone();
            let addresses = ipv6.remove(&name).unwrap_or_default();
            (
                name,
                Seen {
                    interface,
                    ipv6: addresses,
                },
            )
        })
        .collect())
}

/// Events that turn `before` into `after`
fn diff(before: &BTreeMap<String, Seen>, after: &BTreeMap<String, Seen>) -> Vec<Event> {
    let mut events = Vec::new();

    let identity = |m: &BTreeMap<String, Seen>| -> Vec<(String, u32, Option<HwAddr>)> {
        m.values()
            .map(|s| (s.interface.name.clone(), s.interface.index, s.interface.hwaddr))
            .collect()
    };
    if identity(before) != identity(after) {
        events.push(Event::InterfacesChanged(
            after.values().map(|s| s.interface.clone()).collect(),
        ));
    }

    for (name, now) in after {
        let Some(was) = before.get(name) else {
            continue;
        };
        if was.interface.link != now.interface.link {
            events.push(Event::LinkStatusChanged {
                ifname: name.clone(),
                status: now.interface.link,
            });
        }
    }

    for (name, now) in after {
        let before_v6 = before.get(name).map(|s| s.ipv6.as_slice()).unwrap_or(&[]);
        if before_v6 != now.ipv6.as_slice() {
            events.push(Event::Ipv6AddressChanged {
                ifname: name.clone(),
                addresses: now.ipv6.clone(),
            });
        }
    }
    events
}

/// Walk getifaddrs and build one [`Interface`] per AF_PACKET entry
fn enumerate() -> Result<Vec<Interface>> {
    let mut interfaces: Vec<Interface> = getifaddrs()
        .map_err(io::Error::from)?
        .filter_map(|entry| {
            let link = entry.address.as_ref()?.as_link_addr()?;
            Some(interface_from(entry.interface_name.clone(), entry.flags, link))
        })
        .collect();
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(interfaces)
}

fn interface_from(name: String, flags: InterfaceFlags, ll: &LinkAddr) -> Interface {
    let hatype = ll.hatype();
    let link_type = match hatype {
        ARPHRD_ETHER => LinkType::Ethernet,
        ARPHRD_IEEE1394 => LinkType::Ieee1394,
        ARPHRD_LOOPBACK => LinkType::Loopback,
        _ if flags.contains(InterfaceFlags::IFF_POINTOPOINT) => LinkType::PointToPoint,
        _ if flags.contains(InterfaceFlags::IFF_LOOPBACK) => LinkType::Loopback,
        _ => LinkType::Other,
    };
    let hwaddr = match ll.halen() {
        0 => None,
        // Longer than the six bytes LinkAddr exposes
        n if n > 6 => sysfs_hwaddr(&name),
        n => ll.addr().map(|bytes| HwAddr::new(&bytes[..n])),
    }
    .filter(|hw| !hw.is_zero());
    let link = match link_type {
        // Loopback has no carrier to report
        LinkType::Loopback => LinkStatus::default(),
        _ => LinkStatus {
            valid: true,
            active: flags.contains(InterfaceFlags::IFF_RUNNING),
        },
    };

    Interface {
        name,
        index: u32::try_from(ll.ifindex()).unwrap_or_default(),
        link_type,
        hwaddr,
        arp_hwtype: hatype,
        link,
        ssid: None,
        bssid: None,
    }
}

fn sysfs_hwaddr(ifname: &str) -> Option<HwAddr> {
    let path = format!("/sys/class/net/{ifname}/address");
    match std::fs::read_to_string(&path) {
        Ok(text) => text.trim().parse().ok(),
        Err(e) => {
            trace!("Cannot read {}: {}", path, e);
            None
        }
    }
}

fn read_ipv6_addresses() -> BTreeMap<String, Vec<Ipv6AddressState>> {
    match std::fs::read_to_string(IF_INET6) {
        Ok(text) => parse_if_inet6(&text),
        Err(e) => {
            // IPv6 disabled in the kernel
            trace!("Cannot read {}: {}", IF_INET6, e);
            BTreeMap::new()
        }
    }
}

/// Parse `/proc/net/if_inet6`
///
/// Each line: address (32 hex digits), ifindex, prefix length, scope, flags
/// (all hex) and the interface name.
fn parse_if_inet6(text: &str) -> BTreeMap<String, Vec<Ipv6AddressState>> {
    let mut out: BTreeMap<String, Vec<Ipv6AddressState>> = BTreeMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [hex, _index, prefix, _scope, flags, name] = fields[..] else {
            continue;
        };
        let (Ok(bits), Ok(prefix_len), Ok(flags)) = (
            u128::from_str_radix(hex, 16),
            u8::from_str_radix(prefix, 16),
            u32::from_str_radix(flags, 16),
        ) else {
            continue;
        };
        if hex.len() != 32 {
            continue;
        }
        out.entry(name.to_string()).or_default().push(Ipv6AddressState {
            address: Ipv6Addr::from(bits),
            prefix_len,
            tentative: flags & IFA_F_TENTATIVE != 0,
            duplicated: flags & IFA_F_DADFAILED != 0,
            autoconf: flags & IFA_F_PERMANENT == 0,
        });
    }
    for addresses in out.values_mut() {
        addresses.sort_by_key(|a| a.address);
    }
    out
}
