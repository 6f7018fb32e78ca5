//! Engine events, fanned out to any number of subscribers

use crate::connection::{ConnectReason, DisconnectReason};
use bridge_protocol::Response;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Connect(ConnectReason),
    Disconnect(DisconnectReason),
    /// Every decoded inbound message
    Message(Response),
    /// Anomaly worth surfacing that did not fail any request
    Error(String),
    /// Latest round-trip latency
    Ping(Duration),
}

/// Broadcast hub for [`EngineEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit to current subscribers; having none is fine
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("⚠️  {}", message);
        self.emit(EngineEvent::Error(message));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
