//! Client engine for the UDP bridge to a Live control-surface script.
//!
//! [`Engine`] owns the socket, correlates requests with responses, watches the
//! connection through heartbeats and peer-pushed events, and caches
//! etag-versioned responses.

pub mod cache;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod limiter;
pub mod listeners;
pub mod transport;

pub use bridge_protocol::{CacheResponse, Command, Response, ResponseKind};
pub use config::{CacheConfig, DiscoveryConfig, EngineConfig};
pub use connection::{ConnectReason, ConnectionState, DisconnectReason};
pub use engine::Engine;
pub use error::{BridgeError, Result};
pub use events::EngineEvent;
pub use listeners::ListenerHandle;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a state mutex; a panic elsewhere must not wedge the engine
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
