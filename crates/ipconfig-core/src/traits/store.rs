// # Publish / Configuration Store Traits
//
// The core reads what should run from a `ConfigSource` and writes the facts
// it established through a `Publisher`. Both are called from the engine's
// coalescing pass only, never from inside a method handler.
//
// ## Implementations
//
// - In-memory: `MemoryStore`
// - JSON files with atomic writes: `FileStore`

use crate::config::ConfigSnapshot;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Published entity names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    /// IPv4 addresses, masks and router of a service
    Ipv4,
    /// IPv6 addresses and router of a service
    Ipv6,
    /// DHCP lease details
    Dhcp,
    /// DHCPv6 delegated prefix details
    Dhcpv6,
    /// Method outcome code
    Status,
    /// Per-interface busy flag (owner is the interface name)
    Busy,
}

impl Entity {
    pub fn as_str(self) -> &'static str {
        match self {
            Entity::Ipv4 => "ipv4",
            Entity::Ipv6 => "ipv6",
            Entity::Dhcp => "dhcp",
            Entity::Dhcpv6 => "dhcpv6",
            Entity::Status => "status",
            Entity::Busy => "busy",
        }
    }
}

/// Destination for established facts
///
/// `value == None` removes the entity.
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Perform I/O for persistent storage
/// - ✅ Cache in memory (with explicit flush)
///
/// ## Forbidden Capabilities
/// - ❌ Implement configuration logic (owned by the engine)
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        owner: &str,
        entity: Entity,
        value: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Persist all pending changes
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Source of the desired configuration
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn read_snapshot(&self) -> Result<ConfigSnapshot>;
}

/// A store that is both publisher and configuration source
pub trait Store: Publisher + ConfigSource {}

impl<T: Publisher + ConfigSource> Store for T {}

/// Where a store keeps its data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Configuration snapshot file
    #[serde(default)]
    pub config_path: Option<PathBuf>,

    /// Published facts file
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

/// Helper trait for constructing stores by name
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn create(&self, config: &StoreConfig) -> Result<Arc<dyn Store>>;
}
