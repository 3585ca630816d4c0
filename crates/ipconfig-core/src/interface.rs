//! Interface model
//!
//! A copy of what the link facility reports about one interface. The engine
//! keeps one per [`IfState`](crate::ifstate::IfState) and refreshes it whenever
//! the interface list changes.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// ARP hardware type for Ethernet
pub const ARPHRD_ETHER: u16 = 1;

/// ARP hardware type for IEEE 1394 (RFC 2734)
pub const ARPHRD_IEEE1394: u16 = 24;

/// Link-layer hardware address (up to 8 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub struct HwAddr {
    bytes: [u8; 8],
    len: u8,
}

impl HwAddr {
    /// Build from raw bytes, truncating anything past 8 bytes
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len().min(8);
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            bytes: buf,
            len: len as u8,
        }
    }

    /// Ethernet (EUI-48) address
    pub fn ethernet(bytes: [u8; 6]) -> Self {
        Self::new(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether every byte is zero (also true for the empty address)
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HwAddr({self})")
    }
}

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl std::str::FromStr for HwAddr {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = Vec::with_capacity(8);
        for part in s.split(':') {
            let byte = u8::from_str_radix(part, 16)
                .map_err(|_| crate::Error::invalid_input(format!("Bad hardware address: {s}")))?;
            bytes.push(byte);
        }
        if bytes.is_empty() || bytes.len() > 8 {
            return Err(crate::Error::invalid_input(format!(
                "Bad hardware address length: {s}"
            )));
        }
        Ok(Self::new(&bytes))
    }
}

impl TryFrom<String> for HwAddr {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Link type, as far as address configuration cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Ethernet,
    Ieee1394,
    Loopback,
    PointToPoint,
    Other,
}

impl LinkType {
    /// Whether the link supports broadcast (and therefore ARP)
    pub fn is_broadcast(self) -> bool {
        matches!(self, LinkType::Ethernet | LinkType::Ieee1394)
    }
}

/// Link status as reported by the link facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkStatus {
    /// Whether the driver reports link state at all
    pub valid: bool,
    /// Whether the link is up
    pub active: bool,
}

impl LinkStatus {
    /// Status for a link that is known to be up
    pub fn up() -> Self {
        Self {
            valid: true,
            active: true,
        }
    }

    /// Status for a link that is known to be down
    pub fn down() -> Self {
        Self {
            valid: true,
            active: false,
        }
    }

    /// Link is usable: either status is unknown or it is active
    pub fn is_usable(&self) -> bool {
        !self.valid || self.active
    }
}

/// One network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub link_type: LinkType,
    #[serde(default)]
    pub hwaddr: Option<HwAddr>,
    pub arp_hwtype: u16,
    #[serde(default)]
    pub link: LinkStatus,
    /// Wireless network name, when associated
    #[serde(default)]
    pub ssid: Option<String>,
    /// Access point hardware address, when associated
    #[serde(default)]
    pub bssid: Option<HwAddr>,
}

impl Interface {
    /// An Ethernet interface with a valid, active link
    pub fn ethernet(name: impl Into<String>, index: u32, hwaddr: [u8; 6]) -> Self {
        Self {
            name: name.into(),
            index,
            link_type: LinkType::Ethernet,
            hwaddr: Some(HwAddr::ethernet(hwaddr)),
            arp_hwtype: ARPHRD_ETHER,
            link: LinkStatus::up(),
            ssid: None,
            bssid: None,
        }
    }

    /// A loopback interface
    pub fn loopback(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            link_type: LinkType::Loopback,
            hwaddr: None,
            arp_hwtype: 0,
            link: LinkStatus::default(),
            ssid: None,
            bssid: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.link_type.is_broadcast()
    }

    /// Loopback and point-to-point links never take part in link-local election
    pub fn skips_link_local(&self) -> bool {
        matches!(self.link_type, LinkType::Loopback | LinkType::PointToPoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hwaddr_display_and_parse() {
        let addr = HwAddr::ethernet([0x00, 0x1b, 0x63, 0xaa, 0x0b, 0xff]);
        assert_eq!(addr.to_string(), "00:1b:63:aa:0b:ff");
        let parsed: HwAddr = "00:1b:63:aa:0b:ff".parse().unwrap();
        assert_eq!(parsed, addr);
        assert!("zz:00".parse::<HwAddr>().is_err());
    }

    #[test]
    fn test_link_status_usable() {
        assert!(LinkStatus::default().is_usable());
        assert!(LinkStatus::up().is_usable());
        assert!(!LinkStatus::down().is_usable());
    }
}
