use bridge_protocol::CodecError;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Timed out after {timeout:?} waiting for {command}")]
    Timeout { command: String, timeout: Duration },

    #[error("Peer disconnected while waiting for {command}")]
    Disconnected { command: String },

    #[error("Peer returned an error for {command}: {message}")]
    Command { command: String, message: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("tried to use cache that does not exist (key: {key})")]
    CacheMissing { key: String },

    #[error("Subscription to {prop} failed: {message}")]
    Subscribe { prop: String, message: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Engine is not started")]
    NotStarted,

    #[error("Engine is already started")]
    AlreadyStarted,

    #[error("No connection to the peer within {0:?}")]
    StartTimeout(Duration),

    #[error("No peer address known yet")]
    NoPeer,

    #[error("Engine closed before a response arrived")]
    Closed,
}

impl BridgeError {
    /// True for failures caused by the peer not answering (timeout or disconnect)
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout { .. } | BridgeError::Disconnected { .. } | BridgeError::NoPeer
        )
    }
}
