//! Connection state machine.
//!
//! Connectivity is learned two ways: heartbeat probes (inferred locally) and
//! connect/disconnect events pushed by the peer ("realtime"). Both go through
//! [`ConnectionMachine::handle_connect`] and [`ConnectionMachine::handle_disconnect`],
//! which only report a transition when the `connected` flag actually flips.

use std::collections::HashMap;
use strum::{AsRefStr, Display};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Starting,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectReason {
    Start,
    Heartbeat,
    Realtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum DisconnectReason {
    Heartbeat,
    Realtime,
}

/// A heartbeat probe in flight; a realtime connect cancels its token
#[derive(Debug, Clone)]
pub struct HeartbeatTicket {
    id: u64,
    token: CancellationToken,
}

impl HeartbeatTicket {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct ConnectionMachine {
    state: ConnectionState,
    connected: bool,
    heartbeats: HashMap<u64, CancellationToken>,
    next_ticket: u64,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Closed,
            connected: false,
            heartbeats: HashMap::new(),
            next_ticket: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// `Closed -> Starting`; false if the engine was not closed
    pub fn begin_start(&mut self) -> bool {
        if self.state != ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Starting;
        self.connected = false;
        true
    }

    /// Mark connected. Returns the reason to emit, or `None` if nothing changed.
    ///
    /// The first connection after `start()` is always reported as `Start`.
    pub fn handle_connect(&mut self, reason: ConnectReason) -> Option<ConnectReason> {
        match self.state {
            ConnectionState::Closed => None,
            ConnectionState::Starting => {
                self.state = ConnectionState::Started;
                self.connected = true;
                Some(ConnectReason::Start)
            }
            ConnectionState::Started if self.connected => None,
            ConnectionState::Started => {
                self.connected = true;
                Some(reason)
            }
        }
    }

    /// Mark disconnected. Returns the reason to emit, or `None` if nothing changed.
    pub fn handle_disconnect(&mut self, reason: DisconnectReason) -> Option<DisconnectReason> {
        if self.state != ConnectionState::Started || !self.connected {
            return None;
        }
        self.connected = false;
        Some(reason)
    }

    /// Register a heartbeat probe before awaiting it
    pub fn begin_heartbeat(&mut self) -> HeartbeatTicket {
        let id = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);

        let token = CancellationToken::new();
        self.heartbeats.insert(id, token.clone());
        HeartbeatTicket { id, token }
    }

    /// Settle a heartbeat probe. Failure disconnects unless a realtime connect
    /// cancelled this probe while it was in flight.
    pub fn finish_heartbeat(&mut self, ticket: &HeartbeatTicket, ok: bool) -> HeartbeatOutcome {
        self.heartbeats.remove(&ticket.id);

        if ok {
            return match self.handle_connect(ConnectReason::Heartbeat) {
                Some(reason) => HeartbeatOutcome::Connected(reason),
                None => HeartbeatOutcome::Unchanged,
            };
        }

        if ticket.is_cancelled() {
            return HeartbeatOutcome::Cancelled;
        }

        match self.handle_disconnect(DisconnectReason::Heartbeat) {
            Some(reason) => HeartbeatOutcome::Disconnected(reason),
            None => HeartbeatOutcome::Unchanged,
        }
    }

    /// Cancel every heartbeat probe currently in flight
    pub fn cancel_heartbeats(&mut self) {
        for (_, token) in self.heartbeats.drain() {
            token.cancel();
        }
    }

    pub fn pending_heartbeats(&self) -> usize {
        self.heartbeats.len()
    }

    /// Back to `Closed` without reporting a disconnect
    pub fn close(&mut self) {
        self.cancel_heartbeats();
        self.state = ConnectionState::Closed;
        self.connected = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Connected(ConnectReason),
    Disconnected(DisconnectReason),
    /// Failed, but a realtime connect superseded this probe
    Cancelled,
    Unchanged,
}
