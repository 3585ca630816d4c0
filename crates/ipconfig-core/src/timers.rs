//! Generation-checked timer table
//!
//! The external timer facility only knows how to fire a token after a delay.
//! [`Timers`] remembers which generation of each [`TimerKey`] is armed, so an
//! expiry that raced with a cancel or a re-arm is recognized and dropped.

use crate::arp::ArpClientId;
use crate::event::{Event, EventSender};
use crate::service::ServiceId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Per-service timer slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceTimer {
    /// Protocol retransmission
    Retransmit,
    /// Lease renewal (T1)
    Renew,
    /// Lease rebinding (T2)
    Rebind,
    /// Lease expiry
    Expire,
    /// Delayed restart after a failure or conflict
    Retry,
    /// Router solicitation
    Solicit,
    /// Method-specific deadline (failover lifetime)
    Timeout,
}

/// What a timer belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Arp(ArpClientId),
    Service(ServiceId, ServiceTimer),
    LinkInactive(String),
}

/// A fired (or to-be-fired) timer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub key: TimerKey,
    pub generation: u64,
}

/// One-shot relative timer facility
///
/// `set_relative` fires the token at most once, by posting
/// [`Event::Timer`] to the engine queue. `cancel` prevents a pending fire.
/// A fire that was already posted when `cancel` ran is tolerated: the
/// [`Timers`] table rejects it.
pub trait TimerFacility: Send {
    fn set_relative(&mut self, token: TimerToken, delay: Duration);

    fn cancel(&mut self, token: &TimerToken);
}

/// Armed-timer table
pub struct Timers {
    facility: Box<dyn TimerFacility>,
    armed: HashMap<TimerKey, u64>,
    next_generation: u64,
}

impl Timers {
    pub fn new(facility: Box<dyn TimerFacility>) -> Self {
        Self {
            facility,
            armed: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Arm `key`, replacing any pending expiry for it
    pub fn set(&mut self, key: TimerKey, delay: Duration) {
        self.cancel(&key);
        let generation = self.next_generation;
        self.next_generation += 1;
        trace!("Arming {:?} (gen {}) for {:?}", key, generation, delay);
        self.armed.insert(key.clone(), generation);
        self.facility
            .set_relative(TimerToken { key, generation }, delay);
    }

    /// Cancel `key` if armed
    pub fn cancel(&mut self, key: &TimerKey) {
        if let Some(generation) = self.armed.remove(key) {
            self.facility.cancel(&TimerToken {
                key: key.clone(),
                generation,
            });
        }
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }

    /// Accept a fired token
    ///
    /// Returns `true` exactly once for the current generation of a key; stale
    /// or canceled tokens return `false`.
    pub fn accept(&mut self, token: &TimerToken) -> bool {
        match self.armed.get(&token.key) {
            Some(generation) if *generation == token.generation => {
                self.armed.remove(&token.key);
                true
            }
            _ => false,
        }
    }

    /// Cancel every timer owned by a service
    pub fn cancel_service(&mut self, service: ServiceId) {
        let keys: Vec<TimerKey> = self
            .armed
            .keys()
            .filter(|k| matches!(k, TimerKey::Service(id, _) if *id == service))
            .cloned()
            .collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    /// Number of armed timers
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

/// Timer facility backed by tokio sleeps
///
/// Each armed token is a spawned task that sleeps and then posts
/// [`Event::Timer`]. Must be used from within a tokio runtime.
pub struct TokioTimerFacility {
    sender: EventSender,
    tasks: HashMap<TimerKey, JoinHandle<()>>,
}

impl TokioTimerFacility {
    pub fn new(sender: EventSender) -> Self {
        Self {
            sender,
            tasks: HashMap::new(),
        }
    }
}

impl TimerFacility for TokioTimerFacility {
    fn set_relative(&mut self, token: TimerToken, delay: Duration) {
        self.tasks.retain(|_, task| !task.is_finished());
        let sender = self.sender.clone();
        let key = token.key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the engine stopped
            let _ = sender.send(Event::Timer(token));
        });
        if let Some(previous) = self.tasks.insert(key, task) {
            previous.abort();
        }
    }

    fn cancel(&mut self, token: &TimerToken) {
        if let Some(task) = self.tasks.remove(&token.key) {
            task.abort();
        }
    }
}

impl Drop for TokioTimerFacility {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}
