//! Interface control through ioctls and IPv6 sysctls

use crate::sys;
use ipconfig_core::traits::InterfaceControl;
use ipconfig_core::{Error, Result};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use tracing::{debug, info};

/// `struct in6_ifreq` from `<linux/ipv6.h>`
#[repr(C)]
struct In6Ifreq {
    addr: libc::in6_addr,
    prefix_len: u32,
    ifindex: libc::c_int,
}

const ICMPV6_ROUTER_SOLICIT: u8 = 133;

/// Applies addresses and admin state on Linux
#[derive(Debug)]
pub struct LinuxInterfaceControl {
    sysctl_root: PathBuf,
}

impl Default for LinuxInterfaceControl {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxInterfaceControl {
    pub fn new() -> Self {
        Self {
            sysctl_root: PathBuf::from("/proc/sys/net/ipv6/conf"),
        }
    }

    fn inet_socket() -> io::Result<OwnedFd> {
        sys::socket(libc::AF_INET, libc::SOCK_DGRAM, 0)
    }

    fn set_inet(fd: &OwnedFd, ifname: &str, request: libc::Ioctl, address: Ipv4Addr) -> io::Result<()> {
        let mut req = sys::ifreq(ifname)?;
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from(address).to_be(),
            },
            sin_zero: [0; 8],
        };
        unsafe {
            std::ptr::write((&mut req.ifr_ifru.ifru_addr as *mut libc::sockaddr).cast(), sin);
        }
        sys::ioctl(fd.as_raw_fd(), request, &mut req)
    }

    fn ipv6_request(ifname: &str, request: libc::Ioctl, address: Ipv6Addr, prefix_len: u8) -> io::Result<()> {
        let fd = sys::socket(libc::AF_INET6, libc::SOCK_DGRAM, 0)?;
        let mut req = In6Ifreq {
            addr: libc::in6_addr {
                s6_addr: address.octets(),
            },
            prefix_len: u32::from(prefix_len),
            ifindex: sys::if_index(ifname)? as libc::c_int,
        };
        sys::ioctl(fd.as_raw_fd(), request, &mut req)
    }

    fn write_sysctl(&self, ifname: &str, name: &str, value: bool) -> io::Result<()> {
        let path = self.sysctl_root.join(ifname).join(name);
        std::fs::write(path, if value { "1\n" } else { "0\n" })
    }

    fn flags(fd: &OwnedFd, ifname: &str) -> io::Result<libc::ifreq> {
        let mut req = sys::ifreq(ifname)?;
        sys::ioctl(fd.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req)?;
        Ok(req)
    }
}

fn control_error(ifname: &str, what: &str, e: io::Error) -> Error {
    Error::control(format!("{} on {}: {}", what, ifname, e))
}

impl InterfaceControl for LinuxInterfaceControl {
    fn set_ipv4_address(&self, ifname: &str, address: Ipv4Addr, mask: Ipv4Addr) -> Result<()> {
        let result = Self::inet_socket().and_then(|fd| {
            Self::set_inet(&fd, ifname, libc::SIOCSIFADDR, address)?;
            Self::set_inet(&fd, ifname, libc::SIOCSIFNETMASK, mask)
        });
        result.map_err(|e| control_error(ifname, "set IPv4 address", e))?;
        info!("Assigned {}/{} to {}", address, mask, ifname);
        Ok(())
    }

    fn remove_ipv4_address(&self, ifname: &str, address: Ipv4Addr) -> Result<()> {
        // Setting 0.0.0.0 deletes the primary address
        Self::inet_socket()
            .and_then(|fd| Self::set_inet(&fd, ifname, libc::SIOCSIFADDR, Ipv4Addr::UNSPECIFIED))
            .map_err(|e| control_error(ifname, "remove IPv4 address", e))?;
        info!("Removed {} from {}", address, ifname);
        Ok(())
    }

    fn set_ipv6_enabled(&self, ifname: &str, enabled: bool, autoconf: bool) -> Result<()> {
        self.write_sysctl(ifname, "autoconf", enabled && autoconf)
            .and_then(|_| self.write_sysctl(ifname, "accept_ra", enabled && autoconf))
            .and_then(|_| self.write_sysctl(ifname, "disable_ipv6", !enabled))
            .map_err(|e| control_error(ifname, "set IPv6 state", e))?;
        debug!("IPv6 on {}: enabled={} autoconf={}", ifname, enabled, autoconf);
        Ok(())
    }

    fn add_ipv6_address(&self, ifname: &str, address: Ipv6Addr, prefix_len: u8) -> Result<()> {
        Self::ipv6_request(ifname, libc::SIOCSIFADDR, address, prefix_len)
            .map_err(|e| control_error(ifname, "add IPv6 address", e))?;
        info!("Assigned {}/{} to {}", address, prefix_len, ifname);
        Ok(())
    }

    fn remove_ipv6_address(&self, ifname: &str, address: Ipv6Addr, prefix_len: u8) -> Result<()> {
        Self::ipv6_request(ifname, libc::SIOCDIFADDR, address, prefix_len)
            .map_err(|e| control_error(ifname, "remove IPv6 address", e))?;
        info!("Removed {}/{} from {}", address, prefix_len, ifname);
        Ok(())
    }

    fn solicit_router(&self, ifname: &str) -> Result<()> {
        let result = (|| -> io::Result<()> {
            let ifindex = sys::if_index(ifname)?;
            let fd = sys::socket(libc::AF_INET6, libc::SOCK_RAW, libc::IPPROTO_ICMPV6)?;
            let hops: libc::c_int = 255;
            sys::setsockopt(&fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, &hops)?;
            sys::setsockopt(&fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_IF, &(ifindex as libc::c_int))?;

            let all_routers = SocketAddrV6::new(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2), 0, 0, ifindex);
            let mut dest: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            dest.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            dest.sin6_addr.s6_addr = all_routers.ip().octets();
            dest.sin6_scope_id = all_routers.scope_id();

            // Type, code, checksum (kernel fills it in), reserved
            let message = [ICMPV6_ROUTER_SOLICIT, 0, 0, 0, 0, 0, 0, 0];
            sys::sendto(&fd, &message, &dest)
        })();
        result.map_err(|e| control_error(ifname, "router solicitation", e))?;
        debug!("Sent router solicitation on {}", ifname);
        Ok(())
    }

    fn set_admin_up(&self, ifname: &str, up: bool) -> Result<()> {
        let result = Self::inet_socket().and_then(|fd| {
            let mut req = Self::flags(&fd, ifname)?;
            unsafe {
                let flags = &mut req.ifr_ifru.ifru_flags;
                if up {
                    *flags |= libc::IFF_UP as libc::c_short;
                } else {
                    *flags &= !(libc::IFF_UP as libc::c_short);
                }
            }
            sys::ioctl(fd.as_raw_fd(), libc::SIOCSIFFLAGS, &mut req)
        });
        result.map_err(|e| control_error(ifname, "set admin state", e))?;
        info!("{} administratively {}", ifname, if up { "up" } else { "down" });
        Ok(())
    }

    fn detach_protocols(&self, ifname: &str) -> Result<()> {
        let cleared = Self::inet_socket()
            .and_then(|fd| Self::set_inet(&fd, ifname, libc::SIOCSIFADDR, Ipv4Addr::UNSPECIFIED));
        match cleared {
            Ok(()) => {}
            // Nothing was assigned
            Err(e) if e.raw_os_error() == Some(libc::EADDRNOTAVAIL) => {}
            Err(e) => return Err(control_error(ifname, "detach IPv4", e)),
        }
        self.set_ipv6_enabled(ifname, false, false)?;
        info!("Detached protocols from {}", ifname);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysctl_writes_go_under_the_interface() {
        let dir = std::env::temp_dir().join(format!("ipconfig-sysctl-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("eth9")).unwrap();
        let control = LinuxInterfaceControl {
            sysctl_root: dir.clone(),
        };

        control.set_ipv6_enabled("eth9", true, false).unwrap();

        let read = |name: &str| std::fs::read_to_string(dir.join("eth9").join(name)).unwrap();
        assert_eq!(read("disable_ipv6"), "0\n");
        assert_eq!(read("autoconf"), "0\n");
        assert_eq!(read("accept_ra"), "0\n");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_unknown_interface_is_a_control_error() {
        let err = LinuxInterfaceControl::new()
            .add_ipv6_address("nosuchif0", Ipv6Addr::LOCALHOST, 128)
            .unwrap_err();
        assert!(matches!(err, Error::Control(_)));
    }
}
