// # Link Source Trait
//
// Interface enumeration plus the stream of notifications the engine reacts
// to (interface list changes, link status, power, IPv6 address changes).
//
// ## Implementations
//
// - getifaddrs + netlink (Linux): `ipconfig-linux` crate
//
// ## Usage
//
// ```rust,ignore
// let interfaces = source.interfaces().await?;
// let mut stream = source.watch();
// while let Some(event) = stream.next().await {
//     sender.send(event)?;
// }
// ```

use crate::error::Result;
use crate::event::Event;
use crate::interface::Interface;
use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

/// Trait for interface/link notification sources
///
/// # Trust Level: Semi-Trusted
///
/// ## Allowed Capabilities
/// - ✅ Perform platform-specific I/O (netlink, ioctl, getifaddrs)
/// - ⚠️ Spawn tasks ONLY for event monitoring (not polling loops)
///
/// ## Forbidden Capabilities
/// - ❌ Change interface state (use `InterfaceControl`)
/// - ❌ Touch services or ARP state (owned by the engine)
#[async_trait]
pub trait LinkSource: Send + Sync {
    /// Current interface list
    async fn interfaces(&self) -> Result<Vec<Interface>>;

    /// Notifications, already expressed as engine events
    ///
    /// The stream should run indefinitely and be cancellation-safe.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = Event> + Send + 'static>>;
}
