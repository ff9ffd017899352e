use relay_bus::RelayError;
use thiserror::Error;

use crate::connection::ConnectionError;
use crate::framing::FrameError;

/// Internal failures. Logged against the peer they concern, never returned
/// from notify/remove calls.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("a connection record already exists for peer {0}")]
    DuplicateRecord(String),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of a [`crate::PeerManager::request_client`] call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request {name} to {peer_id} timed out")]
    Timeout { peer_id: String, name: String },
    #[error("peer manager stopped")]
    Stopped,
    #[error("no connection record for peer {0}")]
    UnknownPeer(String),
}

/// Failure reported by a host request handler.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
