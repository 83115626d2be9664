//! Fire-and-forget notifications between subsystems.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Published when the set of installed TLS certificates changes.
pub const CERTIFICATE_CHANGE: &str = "certificate.change";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish `name`. Having no subscribers is not an error.
    pub fn publish(&self, name: &str) {
        let event = Event {
            name: name.to_string(),
            timestamp: Utc::now(),
        };
        let receivers = self.tx.send(event).unwrap_or(0);
        tracing::debug!(event = name, receivers, "Event published");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
