// # ipconfigd - Interface Configuration Daemon
//
// A thin integration layer around `ipconfig_core::Engine`. All configuration
// and conflict-detection logic lives in ipconfig-core; this binary only:
//
// 1. Reads configuration from environment variables
// 2. Initializes logging and the tokio runtime
// 3. Registers platform backends and builds the engine from them
// 4. Runs the engine until SIGTERM/SIGINT
//
// ## Configuration
//
// - `IPCONFIG_CONFIG_PATH`: JSON configuration snapshot (interfaces, services, order)
// - `IPCONFIG_STATE_PATH`: Published facts file (required for the file store)
// - `IPCONFIG_STORE_TYPE`: Store type (file, memory); default `file`
// - `IPCONFIG_CAPTURE_TYPE`: Capture backend; default `packet`
// - `IPCONFIG_SETTINGS_PATH`: Optional JSON protocol settings
// - `IPCONFIG_LOG_LEVEL`: trace, debug, info, warn, error; default `info`
//
// ## Example
//
// ```bash
// export IPCONFIG_CONFIG_PATH=/etc/ipconfig/config.json
// export IPCONFIG_STATE_PATH=/run/ipconfig/state.json
//
// ipconfigd
// ```
//
// ## DHCP transports
//
// Wire encoding of DHCP/DHCPv6 is not part of this daemon. The transports
// installed here log each outgoing message; methods that depend on replies
// report `no_server` once their retransmissions run out.

use anyhow::{Context, Result};
use ipconfig_core::traits::{
    DhcpMessage, DhcpTransport, Dhcpv6Message, Dhcpv6Transport, InterfaceControl, LinkSource,
    StoreConfig,
};
use ipconfig_core::{BackendRegistry, Engine, EngineNotice, EngineParts, Settings};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long the engine may take to stop after a signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum IpconfigExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<IpconfigExitCode> for ExitCode {
    fn from(code: IpconfigExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration
#[derive(Debug)]
struct Config {
    config_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
    store_type: String,
    capture_type: String,
    settings_path: Option<PathBuf>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let path = |name: &str| env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from);
        Self {
            config_path: path("IPCONFIG_CONFIG_PATH"),
            state_path: path("IPCONFIG_STATE_PATH"),
            store_type: env::var("IPCONFIG_STORE_TYPE").unwrap_or_else(|_| "file".to_string()),
            capture_type: env::var("IPCONFIG_CAPTURE_TYPE").unwrap_or_else(|_| "packet".to_string()),
            settings_path: path("IPCONFIG_SETTINGS_PATH"),
            log_level: env::var("IPCONFIG_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    fn validate(&self) -> Result<()> {
        match self.store_type.as_str() {
            "file" | "memory" => {}
            other => anyhow::bail!(
                "IPCONFIG_STORE_TYPE '{}' is not supported. \
                Supported types: file, memory",
                other
            ),
        }

        if self.store_type == "file" {
            let Some(state_path) = &self.state_path else {
                anyhow::bail!(
                    "IPCONFIG_STATE_PATH is required when IPCONFIG_STORE_TYPE=file. \
                    Set it via: export IPCONFIG_STATE_PATH=/run/ipconfig/state.json"
                );
            };
            if state_path.is_dir() {
                anyhow::bail!(
                    "IPCONFIG_STATE_PATH must name a file, got directory {}",
                    state_path.display()
                );
            }
        }

        if let Some(config_path) = &self.config_path {
            check_parent("IPCONFIG_CONFIG_PATH", config_path)?;
        }

        if let Some(settings_path) = &self.settings_path
            && !settings_path.is_file()
        {
            anyhow::bail!(
                "IPCONFIG_SETTINGS_PATH does not exist: {}",
                settings_path.display()
            );
        }

        if self.capture_type.is_empty() {
            anyhow::bail!("IPCONFIG_CAPTURE_TYPE cannot be empty");
        }

        parse_level(&self.log_level)?;
        Ok(())
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            config_path: self.config_path.clone(),
            state_path: self.state_path.clone(),
        }
    }

    /// Protocol settings, defaults unless a settings file is given
    fn settings(&self) -> Result<Settings> {
        let Some(path) = &self.settings_path else {
            return Ok(Settings::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }
}

fn check_parent(name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        anyhow::bail!(
            "{} parent directory does not exist: {}",
            name,
            parent.display()
        );
    }
    Ok(())
}

fn parse_level(level: &str) -> Result<Level> {
    Ok(match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => anyhow::bail!(
            "IPCONFIG_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            level
        ),
    })
}

/// DHCP transport that records outgoing messages in the log
struct LoggingDhcpTransport;

impl DhcpTransport for LoggingDhcpTransport {
    fn send(&self, ifname: &str, message: &DhcpMessage) -> ipconfig_core::Result<()> {
        debug!(
            "DHCP {:?} xid={:#010x} on {} (requested {:?})",
            message.kind, message.xid, ifname, message.requested_ip
        );
        Ok(())
    }
}

/// DHCPv6 transport that records outgoing messages in the log
struct LoggingDhcpv6Transport;

impl Dhcpv6Transport for LoggingDhcpv6Transport {
    fn send(&self, ifname: &str, message: &Dhcpv6Message) -> ipconfig_core::Result<()> {
        debug!(
            "DHCPv6 {:?} txid={:#08x} on {} ({} prefixes)",
            message.kind,
            message.transaction_id,
            ifname,
            message.prefixes.len()
        );
        Ok(())
    }
}

fn main() -> ExitCode {
    let config = Config::from_env();

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return IpconfigExitCode::ConfigError.into();
    }

    let log_level = parse_level(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return IpconfigExitCode::ConfigError.into();
    }

    info!("Starting ipconfigd daemon");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return IpconfigExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        let engine = match build_engine(&config).await {
            Ok(engine) => engine,
            Err(e) => {
                error!("Startup error: {:#}", e);
                return IpconfigExitCode::ConfigError;
            }
        };
        match run_daemon(engine).await {
            Ok(()) => IpconfigExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {:#}", e);
                IpconfigExitCode::RuntimeError
            }
        }
    })
    .into()
}

/// Resolve backends by name and assemble the engine
async fn build_engine(config: &Config) -> Result<(Engine, mpsc::Receiver<EngineNotice>)> {
    let settings = config.settings()?;

    let registry = BackendRegistry::with_builtin_stores();
    #[cfg(feature = "linux")]
    {
        info!("Registering Linux backends");
        ipconfig_linux::register(&registry);
    }

    let capture = registry
        .create_capture(&config.capture_type)
        .with_context(|| format!("Capture backend '{}'", config.capture_type))?;
    let store = registry
        .create_store(&config.store_type, &config.store_config())
        .await
        .with_context(|| format!("Store '{}'", config.store_type))?;

    let (link_source, control) = platform()?;

    info!(
        "Capture backend: {}, store: {}",
        capture.name(),
        config.store_type
    );

    let parts = EngineParts {
        capture,
        control,
        dhcp: Arc::new(LoggingDhcpTransport),
        dhcpv6: Arc::new(LoggingDhcpv6Transport),
        store,
        link_source: Some(link_source),
        timers: None,
    };
    Ok(Engine::new(parts, settings)?)
}

/// Link notifications and interface control for this build
fn platform() -> Result<(Arc<dyn LinkSource>, Arc<dyn InterfaceControl>)> {
    #[cfg(feature = "linux")]
    {
        Ok((ipconfig_linux::link_source()?, ipconfig_linux::interface_control()?))
    }
    #[cfg(not(feature = "linux"))]
    {
        anyhow::bail!("Built without a platform backend; enable the `linux` feature")
    }
}

/// Run the engine until a shutdown signal arrives
async fn run_daemon((mut engine, mut notices): (Engine, mpsc::Receiver<EngineNotice>)) -> Result<()> {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            info!("Engine notice: {:?}", notice);
        }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut engine_task = tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await });

    tokio::select! {
        signal = wait_for_shutdown() => {
            let signal = signal?;
            info!("Received shutdown signal: {}", signal);
            if shutdown_tx.send(()).is_err() {
                warn!("Engine already stopped");
            }
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, engine_task).await {
                Ok(joined) => joined.context("Engine task panicked")??,
                Err(_) => anyhow::bail!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT),
            }
        }
        joined = &mut engine_task => {
            joined.context("Engine task panicked")??;
            anyhow::bail!("Engine stopped without a shutdown signal");
        }
    }

    info!("Shutting down daemon");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for CTRL-C")?;
    Ok("SIGINT")
}
