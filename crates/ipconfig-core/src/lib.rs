// # ipconfig-core
//
// Core library for event-driven interface configuration.
//
// ## Architecture Overview
//
// - **ArpEngine**: ARP probe/announce/resolve/detect sessions over a shared,
//   ref-counted capture handle per interface
// - **Service**: one configuration method (DHCP, manual, link-local, ...)
//   running on one interface, driven by lifecycle events
// - **Engine**: owns all state, serializes events, runs the coalescing pass
//   (ranks, link-local election, disable-until-needed) and publishes facts
// - **Traits**: the seams to the platform (capture, link notifications,
//   interface control, protocol transports, publish/configuration store)
// - **BackendRegistry**: named factories for capture backends and stores
//
// ## Design Principles
//
// 1. **Single owner**: every mutation happens on the engine's task
// 2. **Event-Driven**: producers only post events; timers are tokens
// 3. **Library-First**: the daemon is a thin wrapper around `Engine`

pub mod arp;
pub mod config;
pub mod election;
pub mod engine;
pub mod error;
pub mod event;
pub mod ifstate;
pub mod interface;
pub mod registry;
pub mod service;
pub mod store;
pub mod timers;
pub mod traits;

// Re-export core types for convenience
pub use config::{ConfigSnapshot, InterfaceConfig, MethodConfig, MethodKind, Settings};
pub use engine::{Engine, EngineNotice, EngineParts};
pub use error::{Error, Result, Status};
pub use event::{Event, EventSender, PowerEvent};
pub use interface::{HwAddr, Interface, LinkStatus, LinkType};
pub use registry::BackendRegistry;
pub use store::{FileStore, MemoryStore};
pub use traits::{InterfaceControl, LinkCapture, LinkSource, Publisher, Store};
