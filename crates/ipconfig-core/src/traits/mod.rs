//! Collaborator traits
//!
//! The core never talks to the operating system directly. Everything it needs
//! from the outside comes through one of these seams:
//!
//! - [`LinkCapture`] / [`CaptureHandle`]: raw, ARP-filtered frame I/O
//! - [`LinkSource`]: interface enumeration and link/power notifications
//! - [`InterfaceControl`]: address assignment and admin state
//! - [`DhcpTransport`] / [`Dhcpv6Transport`]: protocol message transmission
//! - [`Publisher`] / [`ConfigSource`]: the publish/configuration store

pub mod capture;
pub mod control;
pub mod link_source;
pub mod store;
pub mod transport;

pub use capture::{CaptureHandle, CaptureNotifier, LinkCapture, LinkCaptureFactory};
pub use control::InterfaceControl;
pub use link_source::LinkSource;
pub use store::{ConfigSource, Entity, Publisher, Store, StoreConfig, StoreFactory};
pub use transport::{
    DelegatedPrefix, DhcpMessage, DhcpMessageKind, DhcpOptions, DhcpReply, DhcpReplyKind, DhcpTransport,
    Dhcpv6Message, Dhcpv6MessageKind, Dhcpv6Reply, Dhcpv6ReplyKind, Dhcpv6Transport,
    StaticOptions,
};
