//! Event bus between workers, background services and the control task
//!
//! Every asynchronous completion is delivered as a timestamped [`Event`]
//! tagged with the attempt it belongs to. Unsolicited notifications from a
//! background service carry no attempt. Delivery is unbounded and in arrival
//! order; duplicates are allowed and must be tolerated by the consumer.

use crate::grant::GrantOutcome;
use crate::probe::ReachabilityResult;
use chrono::{DateTime, Utc};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Monotonically increasing start attempt tag
pub type AttemptId = u64;

/// Event payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Capability grant round trip finished
    GrantResolved(GrantOutcome),
    /// Reachability probe finished
    ProbeCompleted(ReachabilityResult),
    /// Core accepted `start_as_client`; the tunnel is next
    CoreStarted,
    /// Core and tunnel both started
    StartSucceeded,
    /// Core failed to start; carries the raw cause
    StartFailed(String),
    /// Tunnel failed after the core started and the core was asked to stop;
    /// carries the raw cause
    StartRolledBack(String),
    /// Tunnel torn down after the core went away on its own
    TunnelCleanedUp,
    /// Core announced that it stopped
    CoreStopped,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::GrantResolved(outcome) => write!(f, "grant {}", outcome),
            EventKind::ProbeCompleted(result) => write!(f, "probe {}", result),
            EventKind::CoreStarted => write!(f, "core started"),
            EventKind::StartSucceeded => write!(f, "start succeeded"),
            EventKind::StartFailed(cause) => write!(f, "start failed: {}", cause),
            EventKind::StartRolledBack(cause) => write!(f, "start rolled back: {}", cause),
            EventKind::TunnelCleanedUp => write!(f, "tunnel cleaned up"),
            EventKind::CoreStopped => write!(f, "core stopped"),
        }
    }
}

/// A single bus event
#[derive(Debug, Clone)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub attempt: Option<AttemptId>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(attempt: Option<AttemptId>, kind: EventKind) -> Self {
        Event {
            at: Utc::now(),
            attempt,
            kind,
        }
    }
}

/// Cloneable producer side of the bus
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Publish an event. Returns false once the consumer is gone.
    pub fn send(&self, attempt: Option<AttemptId>, kind: EventKind) -> bool {
        let event = Event::new(attempt, kind);
        debug!("Event {:?}: {}", event.attempt, event.kind);
        self.tx.send(event).is_ok()
    }

    /// Publish an event belonging to a start attempt
    pub fn attempt(&self, attempt: AttemptId, kind: EventKind) -> bool {
        self.send(Some(attempt), kind)
    }

    /// Out-of-band "core stopped" notification
    pub fn core_stopped(&self) -> bool {
        self.send(None, EventKind::CoreStopped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The bus: one consumer, any number of producers
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        EventBus { tx, rx }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn into_parts(self) -> (EventSender, mpsc::UnboundedReceiver<Event>) {
        (EventSender { tx: self.tx }, self.rx)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let (_own, mut rx) = bus.into_parts();

        assert!(sender.attempt(1, EventKind::GrantResolved(GrantOutcome::Granted)));
        assert!(sender.attempt(1, EventKind::ProbeCompleted(ReachabilityResult::Both)));
        assert!(sender.core_stopped());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();

        assert_eq!(first.attempt, Some(1));
        assert_eq!(first.kind, EventKind::GrantResolved(GrantOutcome::Granted));
        assert_eq!(second.kind, EventKind::ProbeCompleted(ReachabilityResult::Both));
        assert_eq!(third.attempt, None);
        assert_eq!(third.kind, EventKind::CoreStopped);
        assert!(first.at <= third.at);
    }

    #[tokio::test]
    async fn test_sender_reports_closed_bus() {
        let bus = EventBus::new();
        let sender = bus.sender();
        drop(bus);

        assert!(sender.is_closed());
        assert!(!sender.core_stopped());
    }
}
