//! Configuration types for the ipconfig system
//!
//! Two kinds of configuration live here:
//! - [`Settings`]: protocol tunables (ARP cadence, DHCP retransmission, ...)
//! - [`ConfigSnapshot`]: what the configuration store says should run, i.e.
//!   the services per interface and their priority order

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Protocol tunables for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// ARP session engine settings
    #[serde(default)]
    pub arp: ArpSettings,

    /// DHCP client settings
    #[serde(default)]
    pub dhcp: DhcpSettings,

    /// IPv4 link-local settings
    #[serde(default)]
    pub link_local: LinkLocalSettings,

    /// Engine-wide settings
    #[serde(default)]
    pub engine: EngineSettings,
}

impl Settings {
    /// Validate the settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.arp.validate()?;
        self.dhcp.validate()?;
        if self.link_local.max_conflicts == 0 {
            return Err(crate::Error::config("link_local.max_conflicts must be > 0"));
        }
        if self.engine.notice_channel_capacity == 0 {
            return Err(crate::Error::config(
                "engine.notice_channel_capacity must be > 0",
            ));
        }
        Ok(())
    }
}

/// ARP probe/announce/resolve/detect cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpSettings {
    /// Number of probes sent before announcing
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,

    /// Delay between probes (milliseconds)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Number of gratuitous announcements after probing
    #[serde(default = "default_gratuitous_count")]
    pub gratuitous_count: u32,

    /// Delay between announcements (milliseconds)
    #[serde(default = "default_gratuitous_interval_ms")]
    pub gratuitous_interval_ms: u64,

    /// Probe collisions tolerated before reporting the address in use
    #[serde(default = "default_conflict_retry_count")]
    pub conflict_retry_count: u32,

    /// Delay before re-probing after a collision (milliseconds)
    #[serde(default = "default_conflict_retry_delay_ms")]
    pub conflict_retry_delay_ms: u64,

    /// Number of detect cycles
    #[serde(default = "default_detect_count")]
    pub detect_count: u32,

    /// Delay between detect cycles at the detect cadence (milliseconds)
    #[serde(default = "default_detect_interval_ms")]
    pub detect_interval_ms: u64,

    /// Delay between resolve requests (milliseconds)
    #[serde(default = "default_resolve_interval_ms")]
    pub resolve_interval_ms: u64,

    /// Number of resolve requests used for router resolution
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u32,
}

impl ArpSettings {
    /// Validate the ARP settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.probe_count == 0 {
            return Err(crate::Error::config("arp.probe_count must be > 0"));
        }
        if self.detect_count == 0 {
            return Err(crate::Error::config("arp.detect_count must be > 0"));
        }
        if self.probe_interval_ms == 0
            || self.gratuitous_interval_ms == 0
            || self.detect_interval_ms == 0
            || self.resolve_interval_ms == 0
        {
            return Err(crate::Error::config("arp intervals must be > 0"));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn gratuitous_interval(&self) -> Duration {
        Duration::from_millis(self.gratuitous_interval_ms)
    }

    pub fn conflict_retry_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_retry_delay_ms)
    }

    pub fn detect_interval(&self) -> Duration {
        Duration::from_millis(self.detect_interval_ms)
    }

    pub fn resolve_interval(&self) -> Duration {
        Duration::from_millis(self.resolve_interval_ms)
    }
}

impl Default for ArpSettings {
    fn default() -> Self {
        Self {
            probe_count: default_probe_count(),
            probe_interval_ms: default_probe_interval_ms(),
            gratuitous_count: default_gratuitous_count(),
            gratuitous_interval_ms: default_gratuitous_interval_ms(),
            conflict_retry_count: default_conflict_retry_count(),
            conflict_retry_delay_ms: default_conflict_retry_delay_ms(),
            detect_count: default_detect_count(),
            detect_interval_ms: default_detect_interval_ms(),
            resolve_interval_ms: default_resolve_interval_ms(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
        }
    }
}

fn default_probe_count() -> u32 {
    3
}

fn default_probe_interval_ms() -> u64 {
    320
}

fn default_gratuitous_count() -> u32 {
    2
}

fn default_gratuitous_interval_ms() -> u64 {
    320
}

fn default_conflict_retry_count() -> u32 {
    2
}

fn default_conflict_retry_delay_ms() -> u64 {
    500
}

fn default_detect_count() -> u32 {
    3
}

fn default_detect_interval_ms() -> u64 {
    150
}

fn default_resolve_interval_ms() -> u64 {
    1000
}

fn default_resolve_timeout_secs() -> u32 {
    3
}

/// DHCP client retransmission policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhcpSettings {
    /// First retransmission delay (seconds), doubled on each retry
    #[serde(default = "default_initial_retransmit_secs")]
    pub initial_retransmit_secs: u64,

    /// Upper bound of the retransmission delay (seconds)
    #[serde(default = "default_max_retransmit_secs")]
    pub max_retransmit_secs: u64,

    /// DISCOVER transmissions without an OFFER before reporting no server
    #[serde(default = "default_tries_before_no_server")]
    pub tries_before_no_server: u32,

    /// REQUEST transmissions before falling back to INIT
    #[serde(default = "default_request_tries")]
    pub request_tries: u32,

    /// INIT-REBOOT transmissions before falling back to INIT
    #[serde(default = "default_init_reboot_tries")]
    pub init_reboot_tries: u32,

    /// Wait after DECLINE before restarting (seconds)
    #[serde(default = "default_decline_retry_secs")]
    pub decline_retry_secs: u64,

    /// Retransmission delay while renewing or rebinding (seconds)
    #[serde(default = "default_renew_retry_secs")]
    pub renew_retry_secs: u64,

    /// Send RELEASE when the service stops
    #[serde(default)]
    pub release_on_stop: bool,
}

impl DhcpSettings {
    /// Validate the DHCP settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.initial_retransmit_secs == 0 {
            return Err(crate::Error::config(
                "dhcp.initial_retransmit_secs must be > 0",
            ));
        }
        if self.max_retransmit_secs < self.initial_retransmit_secs {
            return Err(crate::Error::config(
                "dhcp.max_retransmit_secs must be >= initial_retransmit_secs",
            ));
        }
        if self.request_tries == 0 || self.tries_before_no_server == 0 {
            return Err(crate::Error::config("dhcp try counts must be > 0"));
        }
        Ok(())
    }

    /// Retransmission delay for the given (1-based) attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let secs = self
            .initial_retransmit_secs
            .saturating_mul(1u64 << shift)
            .min(self.max_retransmit_secs);
        Duration::from_secs(secs)
    }
}

impl Default for DhcpSettings {
    fn default() -> Self {
        Self {
            initial_retransmit_secs: default_initial_retransmit_secs(),
            max_retransmit_secs: default_max_retransmit_secs(),
            tries_before_no_server: default_tries_before_no_server(),
            request_tries: default_request_tries(),
            init_reboot_tries: default_init_reboot_tries(),
            decline_retry_secs: default_decline_retry_secs(),
            renew_retry_secs: default_renew_retry_secs(),
            release_on_stop: false,
        }
    }
}

fn default_initial_retransmit_secs() -> u64 {
    4
}

fn default_max_retransmit_secs() -> u64 {
    64
}

fn default_tries_before_no_server() -> u32 {
    3
}

fn default_request_tries() -> u32 {
    3
}

fn default_init_reboot_tries() -> u32 {
    2
}

fn default_decline_retry_secs() -> u64 {
    10
}

fn default_renew_retry_secs() -> u64 {
    60
}

/// IPv4 link-local (169.254/16) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkLocalSettings {
    /// Conflicts tolerated before probing is rate limited
    #[serde(default = "default_max_conflicts")]
    pub max_conflicts: u32,

    /// Delay between probes once rate limited (seconds)
    #[serde(default = "default_rate_limit_secs")]
    pub rate_limit_secs: u64,

    /// Minimum time between two defenses of the same address (seconds)
    #[serde(default = "default_defend_interval_secs")]
    pub defend_interval_secs: u64,
}

impl Default for LinkLocalSettings {
    fn default() -> Self {
        Self {
            max_conflicts: default_max_conflicts(),
            rate_limit_secs: default_rate_limit_secs(),
            defend_interval_secs: default_defend_interval_secs(),
        }
    }
}

fn default_max_conflicts() -> u32 {
    10
}

fn default_rate_limit_secs() -> u64 {
    60
}

fn default_defend_interval_secs() -> u64 {
    10
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// How long a link may stay inactive before services drop their state (seconds)
    #[serde(default = "default_link_inactive_secs")]
    pub link_inactive_secs: u64,

    /// Capacity of the monitoring notice channel
    ///
    /// When full, new notices are dropped with a warning log.
    #[serde(default = "default_notice_channel_capacity")]
    pub notice_channel_capacity: usize,

    /// Router solicitations sent by the router-advertisement method
    #[serde(default = "default_router_solicit_count")]
    pub router_solicit_count: u32,

    /// Delay between router solicitations (seconds)
    #[serde(default = "default_router_solicit_interval_secs")]
    pub router_solicit_interval_secs: u64,

    /// Delay before a failover service re-probes a conflicting address (seconds)
    #[serde(default = "default_failover_retry_secs")]
    pub failover_retry_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            link_inactive_secs: default_link_inactive_secs(),
            notice_channel_capacity: default_notice_channel_capacity(),
            router_solicit_count: default_router_solicit_count(),
            router_solicit_interval_secs: default_router_solicit_interval_secs(),
            failover_retry_secs: default_failover_retry_secs(),
        }
    }
}

fn default_link_inactive_secs() -> u64 {
    4
}

fn default_notice_channel_capacity() -> usize {
    256
}

fn default_router_solicit_count() -> u32 {
    3
}

fn default_router_solicit_interval_secs() -> u64 {
    4
}

fn default_failover_retry_secs() -> u64 {
    10
}

/// Everything the configuration store says should be running
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Service ids in priority order (first is best)
    #[serde(default)]
    pub order: Vec<String>,

    /// Interface that carries the boot-time configuration, if any
    #[serde(default)]
    pub boot_interface: Option<String>,

    /// Per-interface configuration
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

impl ConfigSnapshot {
    /// Validate the snapshot
    pub fn validate(&self) -> Result<(), crate::Error> {
        let mut seen = std::collections::HashSet::new();
        for interface in &self.interfaces {
            if interface.name.is_empty() {
                return Err(crate::Error::config("Interface name cannot be empty"));
            }
            for service in &interface.services {
                if service.id.is_empty() {
                    return Err(crate::Error::config(format!(
                        "Service on {} has an empty id",
                        interface.name
                    )));
                }
                if !seen.insert(service.id.as_str()) {
                    return Err(crate::Error::config(format!(
                        "Duplicate service id: {}",
                        service.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up the configuration of one interface
    pub fn interface(&self, name: &str) -> Option<&InterfaceConfig> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

/// Configuration of one interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name (e.g., "en0")
    pub name: String,

    /// Keep the interface down while a better interface has working services
    #[serde(default)]
    pub disable_until_needed: bool,

    /// Services to run on this interface
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl InterfaceConfig {
    /// Create an interface configuration with no services
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disable_until_needed: false,
            services: Vec::new(),
        }
    }

    /// Add a service
    pub fn with_service(mut self, id: impl Into<String>, method: MethodConfig) -> Self {
        self.services.push(ServiceConfig {
            id: id.into(),
            method,
        });
        self
    }

    /// Set the disable-until-needed policy
    pub fn with_disable_until_needed(mut self, enabled: bool) -> Self {
        self.disable_until_needed = enabled;
        self
    }
}

/// One configured service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Stable service identifier (used for ordering and publishing)
    pub id: String,

    /// Method and its parameters
    #[serde(flatten)]
    pub method: MethodConfig,
}

/// Configuration method and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MethodConfig {
    /// Static IPv4 address
    Manual {
        address: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        #[serde(default)]
        router: Option<Ipv4Addr>,
    },

    /// DHCP lease acquisition
    Dhcp {
        #[serde(default)]
        client_id: Option<String>,
    },

    /// BOOTP (broadcast links only)
    Bootp,

    /// Static IPv4 address plus DHCP INFORM for options
    Inform {
        address: Ipv4Addr,
        #[serde(default)]
        subnet_mask: Option<Ipv4Addr>,
        #[serde(default)]
        client_id: Option<String>,
    },

    /// IPv4 link-local
    LinkLocal,

    /// Static IPv4 address held for a bounded time
    Failover {
        address: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },

    /// IPv6 stateless autoconfiguration driven by router advertisements
    Rtadv {
        #[serde(default)]
        dhcpv6_disabled: bool,
    },

    /// 6to4 (2002::/16) tunnel addressing
    #[serde(rename = "6to4")]
    Stf {
        #[serde(default)]
        relay: Option<Ipv4Addr>,
    },

    /// Static IPv6 address
    ManualV6 { address: Ipv6Addr, prefix_len: u8 },

    /// IPv6 link-local only
    LinkLocalV6,

    /// DHCPv6 prefix delegation
    Dhcpv6Pd {
        #[serde(default)]
        prefix_hint: Option<Ipv6Addr>,
        #[serde(default)]
        prefix_hint_len: Option<u8>,
    },
}

impl MethodConfig {
    /// The method tag for this configuration
    pub fn kind(&self) -> MethodKind {
        match self {
            MethodConfig::Manual { .. } => MethodKind::Manual,
            MethodConfig::Dhcp { .. } => MethodKind::Dhcp,
            MethodConfig::Bootp => MethodKind::Bootp,
            MethodConfig::Inform { .. } => MethodKind::Inform,
            MethodConfig::LinkLocal => MethodKind::LinkLocal,
            MethodConfig::Failover { .. } => MethodKind::Failover,
            MethodConfig::Rtadv { .. } => MethodKind::Rtadv,
            MethodConfig::Stf { .. } => MethodKind::Stf,
            MethodConfig::ManualV6 { .. } => MethodKind::ManualV6,
            MethodConfig::LinkLocalV6 => MethodKind::LinkLocalV6,
            MethodConfig::Dhcpv6Pd { .. } => MethodKind::Dhcpv6Pd,
        }
    }
}

/// Method tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Manual,
    Dhcp,
    Bootp,
    Inform,
    LinkLocal,
    Failover,
    Rtadv,
    #[serde(rename = "6to4")]
    Stf,
    ManualV6,
    LinkLocalV6,
    Dhcpv6Pd,
}

impl MethodKind {
    /// Address family the method configures
    pub fn family(self) -> AddressFamily {
        match self {
            MethodKind::Manual
            | MethodKind::Dhcp
            | MethodKind::Bootp
            | MethodKind::Inform
            | MethodKind::LinkLocal
            | MethodKind::Failover => AddressFamily::V4,
            MethodKind::Rtadv
            | MethodKind::Stf
            | MethodKind::ManualV6
            | MethodKind::LinkLocalV6
            | MethodKind::Dhcpv6Pd => AddressFamily::V6,
        }
    }

    /// Whether the method only ever configures a link-local address
    pub fn is_link_local(self) -> bool {
        matches!(self, MethodKind::LinkLocal | MethodKind::LinkLocalV6)
    }

    /// Whether a failure of this method is covered by an auto-spawned link-local service
    pub fn failure_configures_link_local(self) -> bool {
        self == MethodKind::Dhcp
    }

    /// Human-readable method name
    pub fn name(self) -> &'static str {
        match self {
            MethodKind::Manual => "MANUAL",
            MethodKind::Dhcp => "DHCP",
            MethodKind::Bootp => "BOOTP",
            MethodKind::Inform => "INFORM",
            MethodKind::LinkLocal => "LINKLOCAL",
            MethodKind::Failover => "FAILOVER",
            MethodKind::Rtadv => "RTADV",
            MethodKind::Stf => "6TO4",
            MethodKind::ManualV6 => "MANUAL-V6",
            MethodKind::LinkLocalV6 => "LINKLOCAL-V6",
            MethodKind::Dhcpv6Pd => "DHCPV6-PD",
        }
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_config_tagged_json() {
        let json = serde_json::json!({
            "id": "svc-1",
            "method": "manual",
            "address": "192.168.1.10",
            "subnet_mask": "255.255.255.0"
        });
        let service: ServiceConfig = serde_json::from_value(json).unwrap();
        assert_eq!(service.id, "svc-1");
        assert_eq!(service.method.kind(), MethodKind::Manual);

        let stf: ServiceConfig =
            serde_json::from_value(serde_json::json!({"id": "t", "method": "6to4"})).unwrap();
        assert_eq!(stf.method.kind(), MethodKind::Stf);
        assert_eq!(stf.method.kind().family(), AddressFamily::V6);
    }

    #[test]
    fn test_snapshot_rejects_duplicate_ids() {
        let snapshot = ConfigSnapshot {
            order: vec![],
            boot_interface: None,
            interfaces: vec![
                InterfaceConfig::new("en0").with_service("a", MethodConfig::LinkLocal),
                InterfaceConfig::new("en1").with_service("a", MethodConfig::LinkLocal),
            ],
        };
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_dhcp_backoff_is_capped() {
        let dhcp = DhcpSettings::default();
        assert_eq!(dhcp.backoff(1), Duration::from_secs(4));
        assert_eq!(dhcp.backoff(2), Duration::from_secs(8));
        assert_eq!(dhcp.backoff(10), Duration::from_secs(64));
    }

    #[test]
    fn test_default_settings_validate() {
        assert!(Settings::default().validate().is_ok());
        let mut settings = Settings::default();
        settings.arp.probe_count = 0;
        assert!(settings.validate().is_err());
    }
}
