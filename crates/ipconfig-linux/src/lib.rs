// # Linux Backends
//
// Platform implementations of the ipconfig-core seams:
//
// - `PacketCapture`: AF_PACKET raw sockets for the ARP session engine
// - `LinuxLinkSource`: getifaddrs enumeration, rtnetlink-triggered refreshes
// - `LinuxInterfaceControl`: SIOC* ioctls and IPv6 sysctls
//
// ## Privileges
//
// Opening packet sockets and changing addresses needs CAP_NET_RAW and
// CAP_NET_ADMIN. Failures surface as capture/control errors per call; the
// engine logs them and keeps running.
//
// ## Platform Support
//
// On other platforms the crate still builds, but every constructor returns a
// configuration error so the daemon can report it at startup.

#[cfg(target_os = "linux")]
mod capture;
#[cfg(target_os = "linux")]
mod control;
#[cfg(target_os = "linux")]
mod link;
#[cfg(target_os = "linux")]
mod sys;

#[cfg(target_os = "linux")]
pub use capture::PacketCapture;
#[cfg(target_os = "linux")]
pub use control::LinuxInterfaceControl;
#[cfg(target_os = "linux")]
pub use link::LinuxLinkSource;

use ipconfig_core::BackendRegistry;
use ipconfig_core::traits::{InterfaceControl, LinkCapture, LinkCaptureFactory, LinkSource};
use ipconfig_core::Result;
#[cfg(not(target_os = "linux"))]
use ipconfig_core::Error;
use std::sync::Arc;

/// Registry name of the packet capture backend
pub const PACKET_CAPTURE: &str = "packet";

/// Factory for AF_PACKET capture backends
pub struct PacketCaptureFactory;

#[cfg(target_os = "linux")]
impl LinkCaptureFactory for PacketCaptureFactory {
    fn create(&self) -> Result<Box<dyn LinkCapture>> {
        Ok(Box::new(PacketCapture::new()))
    }
}

#[cfg(not(target_os = "linux"))]
impl LinkCaptureFactory for PacketCaptureFactory {
    fn create(&self) -> Result<Box<dyn LinkCapture>> {
        Err(Error::config("Packet capture is only supported on Linux"))
    }
}

/// Link source for this platform
pub fn link_source() -> Result<Arc<dyn LinkSource>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxLinkSource::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(Error::config("Link notifications are only supported on Linux"))
    }
}

/// Interface control for this platform
pub fn interface_control() -> Result<Arc<dyn InterfaceControl>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxInterfaceControl::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(Error::config("Interface control is only supported on Linux"))
    }
}

/// Register the Linux capture backend with a registry
pub fn register(registry: &BackendRegistry) {
    registry.register_capture(PACKET_CAPTURE, Box::new(PacketCaptureFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_adds_packet_backend() {
        let registry = BackendRegistry::new();
        register(&registry);
        assert!(registry.has_capture(PACKET_CAPTURE));
        assert_eq!(registry.list_captures(), vec![PACKET_CAPTURE.to_string()]);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_factory_creation() {
        let capture = PacketCaptureFactory.create().unwrap();
        assert_eq!(capture.name(), PACKET_CAPTURE);
        assert!(link_source().is_ok());
        assert!(interface_control().is_ok());
    }

    #[test]
    #[cfg(not(target_os = "linux"))]
    fn test_factory_unsupported() {
        assert!(PacketCaptureFactory.create().is_err());
        assert!(link_source().is_err());
        assert!(interface_control().is_err());
    }
}
