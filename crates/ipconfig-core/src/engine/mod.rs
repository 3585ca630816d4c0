//! Core configuration engine
//!
//! The Engine is responsible for:
//! - Serializing every event (link, power, timers, capture, protocol replies)
//!   onto one queue
//! - Routing events to the services they concern
//! - Running the coalescing pass (ranks, link-local election,
//!   disable-until-needed, busy aggregation) after each event
//! - Writing established facts to the publish store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  ┌─────────────┐  ┌─────────────┐
//! │ LinkSource  │  │ CaptureNot. │  │   Timers    │
//! └─────────────┘  └─────────────┘  └─────────────┘
//!        │                │                │
//!        └────────────────┼────────────────┘
//!                         ▼  Event
//!                ┌────────────────┐
//!                │     Engine     │──── EngineNotice ───▶ monitoring
//!                └────────────────┘
//!                         │
//!         ┌───────────────┼─────────────────┐
//!         ▼               ▼                 ▼
//! ┌─────────────┐ ┌───────────────┐ ┌─────────────┐
//! │  Services   │ │  ARP engine   │ │  Publisher  │
//! │ (handlers)  │ │ (completions) │ │  (store)    │
//! └─────────────┘ └───────────────┘ └─────────────┘
//! ```
//!
//! ## Event Flow
//!
//! 1. Take one event off the queue and apply it
//! 2. Deliver queued ARP completions to their services
//! 3. Run the recomputations the handlers asked for
//! 4. Repeat 2-3 until nothing is pending
//! 5. Publish the collected writes and flush the store

pub(crate) mod state;

pub use state::PendingWrite;

use crate::arp::ArpEngine;
use crate::config::{ConfigSnapshot, MethodKind, Settings};
use crate::error::{Result, Status};
use crate::event::{Event, EventReceiver, EventSender, event_queue};
use crate::ifstate::IfState;
use crate::interface::Interface;
use crate::service::{Collaborators, EventReply, Service, ServiceEvent};
use crate::timers::{TimerFacility, Timers, TokioTimerFacility};
use crate::traits::{DhcpTransport, Dhcpv6Transport, InterfaceControl, LinkCapture, LinkSource, Store};
use serde_json::Value;
use state::SystemState;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

/// Upper bound on completion/attention rounds per event
const MAX_SETTLE_ROUNDS: usize = 64;

/// Notices emitted by the Engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    /// Engine started
    Started { interfaces: usize },

    /// Engine stopped
    Stopped { reason: String },

    /// A service started
    ServiceStarted {
        service: String,
        interface: String,
        method: MethodKind,
    },

    /// A service failed to start and was torn down
    ServiceRejected {
        service: String,
        interface: String,
        status: Status,
    },

    /// A service was stopped and removed
    ServiceStopped { service: String, interface: String },

    /// A link-local child was spawned
    LinkLocalElected {
        interface: String,
        parent: String,
        allocate: bool,
    },

    /// Disable-until-needed changed an interface's admin state
    InterfaceDisabled { interface: String, disabled: bool },

    /// An interface disappeared or changed index
    InterfaceRemoved { interface: String },
}

/// Collaborators the engine is built from
pub struct EngineParts {
    pub capture: Arc<dyn LinkCapture>,
    pub control: Arc<dyn InterfaceControl>,
    pub dhcp: Arc<dyn DhcpTransport>,
    pub dhcpv6: Arc<dyn Dhcpv6Transport>,
    pub store: Arc<dyn Store>,
    /// Interface list and notifications; `None` when events are injected
    pub link_source: Option<Arc<dyn LinkSource>>,
    /// Defaults to tokio sleeps posting to the engine queue
    pub timers: Option<Box<dyn TimerFacility>>,
}

/// Core configuration engine
///
/// ## Lifecycle
///
/// 1. Create with [`Engine::new()`]
/// 2. Start with [`Engine::run()`]
/// 3. Engine runs until a shutdown signal is received
/// 4. Drop to cleanup (pending timers are aborted)
///
/// ## Threading
///
/// All state lives in the engine and is only touched from the task that
/// runs it. Producers post [`Event`]s through [`Engine::sender()`].
pub struct Engine {
    state: SystemState,
    store: Arc<dyn Store>,
    link_source: Option<Arc<dyn LinkSource>>,
    events_tx: EventSender,
    events_rx: EventReceiver,
}

impl Engine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, notice_receiver) where notice_receiver yields engine notices
    pub fn new(parts: EngineParts, settings: Settings) -> Result<(Self, mpsc::Receiver<EngineNotice>)> {
        settings.validate()?;

        let (notice_tx, notice_rx) = mpsc::channel(settings.engine.notice_channel_capacity);
        let (events_tx, events_rx) = event_queue();

        let facility = parts
            .timers
            .unwrap_or_else(|| Box::new(TokioTimerFacility::new(events_tx.clone())));
        let arp = ArpEngine::new(parts.capture, events_tx.clone(), settings.arp.clone());
        let io = Collaborators {
            control: parts.control,
            dhcp: parts.dhcp,
            dhcpv6: parts.dhcpv6,
        };
        let state = SystemState::new(arp, Timers::new(facility), io, settings, notice_tx);

        let engine = Self {
            state,
            store: parts.store,
            link_source: parts.link_source,
            events_tx,
            events_rx,
        };
        Ok((engine, notice_rx))
    }

    /// Handle for posting events to the engine queue
    pub fn sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Apply one event without settling
    pub fn process(&mut self, event: Event) {
        self.state.process(event);
    }

    /// Deliver completions and run recomputations until quiet, then publish
    pub async fn settle(&mut self) -> Result<()> {
        let mut quiet = false;
        for _ in 0..MAX_SETTLE_ROUNDS {
            let delivered = self.state.deliver_completions();
            let attended = self.state.attend();
            if delivered == 0 && !attended {
                quiet = true;
                break;
            }
        }
        if !quiet {
            warn!("State did not settle after {} rounds", MAX_SETTLE_ROUNDS);
        }
        self.publish().await
    }

    /// Apply one event and settle
    pub async fn handle(&mut self, event: Event) -> Result<()> {
        debug!("Handling {}", event.name());
        self.process(event);
        self.settle().await
    }

    /// Handle every event already waiting on the queue; returns how many
    pub async fn drain(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Read the configuration snapshot from the store and apply it
    pub async fn load_config(&mut self) -> Result<()> {
        let snapshot = self.store.read_snapshot().await?;
        self.handle(Event::ConfigChanged(snapshot)).await
    }

    async fn publish(&mut self) -> Result<()> {
        let writes = self.state.take_writes();
        if writes.is_empty() {
            return Ok(());
        }
        for write in writes {
            if let Err(e) = self
                .store
                .publish(&write.owner, write.entity, write.value)
                .await
            {
                error!(
                    "Failed to publish {} for {}: {}",
                    write.entity.as_str(),
                    write.owner,
                    e
                );
            }
        }
        self.store.flush().await
    }

    /// Run the engine
    ///
    /// Loads the interface list and configuration, then processes events
    /// until a shutdown signal is received.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Fatal error
    pub async fn run(&mut self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Internal run implementation that accepts an optional shutdown signal
    ///
    /// # Parameters
    ///
    /// - `shutdown_rx`: Optional oneshot receiver to trigger shutdown (for testing)
    async fn run_internal(&mut self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let mut link_stream: Pin<Box<dyn Stream<Item = Event> + Send>> = match self.link_source.clone() {
            Some(source) => {
                let interfaces = source.interfaces().await?;
                info!("Found {} interfaces", interfaces.len());
                self.handle(Event::InterfacesChanged(interfaces)).await?;
                source.watch()
            }
            None => Box::pin(tokio_stream::pending()),
        };
        self.load_config().await?;
        self.state.notify(EngineNotice::Started {
            interfaces: self.state.ifstates.len(),
        });

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    if let Err(e) = self.handle(event).await {
                        error!("Failed to handle event: {}", e);
                    }
                }

                Some(event) = link_stream.next() => {
                    if let Err(e) = self.handle(event).await {
                        error!("Failed to handle link event: {}", e);
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    self.state.notify(EngineNotice::Stopped {
                        reason: "Shutdown signal".to_string(),
                    });
                    break;
                }
            }
        }

        // Flush the store before exiting
        self.store.flush().await?;
        info!("Store flushed, engine stopped");

        Ok(())
    }

    /// Test-only helper to run the engine with a controlled shutdown signal
    ///
    /// # Visibility
    ///
    /// This is `pub` for testing purposes only.
    ///
    /// **TESTING ONLY**: Contract tests require controlled shutdown.
    /// Production daemon code should use `run()` instead, which manages shutdown
    /// via OS signals (SIGINT) rather than programmatic channels.
    pub async fn run_with_shutdown(&mut self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    /// Answer of a service to `get-dhcp-info`
    pub fn dhcp_info(&mut self, service: &str) -> Option<Value> {
        match self.state.query(service, ServiceEvent::GetDhcpInfo)? {
            EventReply::DhcpInfo(info) => info,
            _ => None,
        }
    }

    /// Answer of a service to `get-ipv6-info`
    pub fn ipv6_info(&mut self, service: &str) -> Option<Value> {
        match self.state.query(service, ServiceEvent::GetIpv6Info)? {
            EventReply::Ipv6Info(info) => info,
            _ => None,
        }
    }

    /// Summary of every interface and service
    pub fn summary(&mut self) -> Value {
        self.state.summary()
    }

    /// Look up a service by its configured key
    pub fn service(&self, key: &str) -> Option<&Service> {
        let id = self.state.find_by_key(key)?;
        self.state.services.get(&id)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.state.services.values()
    }

    /// Control block of a configured interface
    pub fn ifstate(&self, ifname: &str) -> Option<&IfState> {
        self.state.ifstates.get(ifname)
    }

    /// Every interface the link facility reported
    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.state.interfaces.values()
    }

    /// Configuration currently applied
    pub fn desired(&self) -> &ConfigSnapshot {
        &self.state.desired
    }

    /// Capture references held on an interface by the ARP engine
    pub fn arp_open_count(&self, ifname: &str) -> usize {
        self.state.arp.open_count(ifname)
    }

    /// Number of armed timers
    pub fn armed_timers(&self) -> usize {
        self.state.timers.armed_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_notice_clone() {
        let notice = EngineNotice::ServiceRejected {
            service: "svc-1".to_string(),
            interface: "en0".to_string(),
            status: Status::OperationNotSupported,
        };
        assert_eq!(notice.clone(), notice);
    }
}
