//! ARP frame codec
//!
//! Two link layouts are supported, fixed per interface:
//!
//! ```text
//! Ethernet:  dst(6) src(6) type(2) | htype ptype hlen plen op sha(6) spa(4) tha(6) tpa(4)
//! IEEE1394:  dst(8) src(8) type(2) | htype ptype hlen plen op uid(8) max_rec sspd
//!                                    fifo_hi(2) fifo_lo(4) spa(4) tpa(4)
//! ```
//!
//! The IEEE1394 body (RFC 2734) carries no target hardware address.

use crate::error::{Error, Result};
use crate::interface::{ARPHRD_ETHER, ARPHRD_IEEE1394, HwAddr, Interface, LinkType};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// ARP EtherType
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// IPv4 protocol type
pub const PTYPE_IPV4: u16 = 0x0800;

const ETHER_HEADER_LEN: usize = 14;
const ETHER_BODY_LEN: usize = 28;
const ETHER_HLEN: u8 = 6;

const IEEE1394_HEADER_LEN: usize = 18;
const IEEE1394_BODY_LEN: usize = 32;
const IEEE1394_HLEN: u8 = 16;
const IEEE1394_MAX_REC: u8 = 10;
const IEEE1394_SSPD_S400: u8 = 2;
const IEEE1394_FIFO_HI: u16 = 0xffff;
const IEEE1394_FIFO_LO: u32 = 0xf000_0000;

/// ARP operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl ArpOp {
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            1 => Some(Self::Request),
            2 => Some(Self::Reply),
            _ => None,
        }
    }
}

/// Decoded ARP frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpFrame {
    pub op: ArpOp,
    pub sender_hw: HwAddr,
    pub sender_ip: Ipv4Addr,
    /// Absent on IEEE1394
    pub target_hw: Option<HwAddr>,
    pub target_ip: Ipv4Addr,
}

impl ArpFrame {
    /// A probe: request with an unspecified sender address
    pub fn is_probe(&self) -> bool {
        self.op == ArpOp::Request && self.sender_ip.is_unspecified()
    }
}

/// Link layout of ARP frames on one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameLayout {
    Ethernet,
    Ieee1394,
}

impl FrameLayout {
    /// Layout for an interface, if it can carry ARP at all
    pub fn for_interface(interface: &Interface) -> Option<Self> {
        match (interface.link_type, interface.arp_hwtype) {
            (LinkType::Ieee1394, _) | (_, ARPHRD_IEEE1394) => Some(Self::Ieee1394),
            (LinkType::Ethernet, _) | (_, ARPHRD_ETHER) => Some(Self::Ethernet),
            _ => None,
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            Self::Ethernet => ETHER_HEADER_LEN,
            Self::Ieee1394 => IEEE1394_HEADER_LEN,
        }
    }

    pub fn body_len(self) -> usize {
        match self {
            Self::Ethernet => ETHER_BODY_LEN,
            Self::Ieee1394 => IEEE1394_BODY_LEN,
        }
    }

    pub fn frame_len(self) -> usize {
        self.header_len() + self.body_len()
    }

    /// ARP hardware type carried in the body
    pub fn hw_type(self) -> u16 {
        match self {
            Self::Ethernet => ARPHRD_ETHER,
            Self::Ieee1394 => ARPHRD_IEEE1394,
        }
    }

    fn hw_len(self) -> usize {
        match self {
            Self::Ethernet => 6,
            Self::Ieee1394 => 8,
        }
    }

    fn broadcast(self) -> HwAddr {
        HwAddr::new(&[0xff; 8][..self.hw_len()])
    }

    /// Encode a frame
    ///
    /// `destination == None` broadcasts. `target_hw` is ignored on IEEE1394.
    pub fn encode(
        self,
        op: ArpOp,
        sender_hw: &HwAddr,
        sender_ip: Ipv4Addr,
        target_hw: Option<&HwAddr>,
        target_ip: Ipv4Addr,
        destination: Option<&HwAddr>,
    ) -> Bytes {
        let hw_len = self.hw_len();
        let mut buf = BytesMut::with_capacity(self.frame_len());

        let destination = destination.copied().unwrap_or_else(|| self.broadcast());
        put_hw(&mut buf, &destination, hw_len);
        put_hw(&mut buf, sender_hw, hw_len);
        buf.put_u16(ETHERTYPE_ARP);

        buf.put_u16(self.hw_type());
        buf.put_u16(PTYPE_IPV4);
        match self {
            Self::Ethernet => {
                buf.put_u8(ETHER_HLEN);
                buf.put_u8(4);
                buf.put_u16(op as u16);
                put_hw(&mut buf, sender_hw, hw_len);
                buf.put_slice(&sender_ip.octets());
                put_hw(&mut buf, &target_hw.copied().unwrap_or_default(), hw_len);
                buf.put_slice(&target_ip.octets());
            }
            Self::Ieee1394 => {
                buf.put_u8(IEEE1394_HLEN);
                buf.put_u8(4);
                buf.put_u16(op as u16);
                put_hw(&mut buf, sender_hw, hw_len);
                buf.put_u8(IEEE1394_MAX_REC);
                buf.put_u8(IEEE1394_SSPD_S400);
                buf.put_u16(IEEE1394_FIFO_HI);
                buf.put_u32(IEEE1394_FIFO_LO);
                buf.put_slice(&sender_ip.octets());
                buf.put_slice(&target_ip.octets());
            }
        }
        buf.freeze()
    }

    /// Decode and validate a captured frame
    pub fn decode(self, frame: &[u8]) -> Result<ArpFrame> {
        if frame.len() < self.frame_len() {
            return Err(Error::frame(format!(
                "short frame: {} < {}",
                frame.len(),
                self.frame_len()
            )));
        }
        let hw_len = self.hw_len();
        let mut buf = &frame[..self.frame_len()];
        buf.advance(2 * hw_len);
        let ethertype = buf.get_u16();
        if ethertype != ETHERTYPE_ARP {
            return Err(Error::frame(format!("not ARP: ethertype {ethertype:#06x}")));
        }

        let htype = buf.get_u16();
        if htype != self.hw_type() {
            return Err(Error::frame(format!("hardware type {htype}")));
        }
        let ptype = buf.get_u16();
        if ptype != PTYPE_IPV4 {
            return Err(Error::frame(format!("protocol type {ptype:#06x}")));
        }
        let hlen = buf.get_u8();
        let plen = buf.get_u8();
        let expected_hlen = match self {
            Self::Ethernet => ETHER_HLEN,
            Self::Ieee1394 => IEEE1394_HLEN,
        };
        if hlen != expected_hlen || plen != 4 {
            return Err(Error::frame(format!("address lengths {hlen}/{plen}")));
        }
        let op = ArpOp::from_u16(buf.get_u16())
            .ok_or_else(|| Error::frame("operation is neither request nor reply"))?;

        let sender_hw = HwAddr::new(&buf[..hw_len]);
        buf.advance(hw_len);
        let (target_hw, sender_ip, target_ip) = match self {
            Self::Ethernet => {
                let sender_ip = get_ipv4(&mut buf);
                let target_hw = HwAddr::new(&buf[..hw_len]);
                buf.advance(hw_len);
                (Some(target_hw), sender_ip, get_ipv4(&mut buf))
            }
            Self::Ieee1394 => {
                // max_rec, sspd, unicast FIFO
                buf.advance(1 + 1 + 2 + 4);
                let sender_ip = get_ipv4(&mut buf);
                (None, sender_ip, get_ipv4(&mut buf))
            }
        };

        Ok(ArpFrame {
            op,
            sender_hw,
            sender_ip,
            target_hw,
            target_ip,
        })
    }
}

fn put_hw(buf: &mut BytesMut, hw: &HwAddr, len: usize) {
    let bytes = hw.as_bytes();
    for i in 0..len {
        buf.put_u8(bytes.get(i).copied().unwrap_or(0));
    }
}

fn get_ipv4(buf: &mut &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(buf.get_u32())
}
