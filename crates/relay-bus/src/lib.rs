//! Relay side channel shared by peer-link managers.
//!
//! A relay is anything that can fan an [`Envelope`] out to every member of a
//! room (a server round-trip, a websocket hub, an in-process broadcast). The
//! core only needs fire-and-forget delivery; echoes and unicast filtering are
//! the receiver's job.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

const ROOM_CAPACITY: usize = 256;

/// Transport-agnostic notification envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_client_id: Option<String>,
    pub notification_name: String,
    #[serde(default)]
    pub notification_payload: Value,
}

impl Envelope {
    pub fn broadcast(from: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            from_client_id: from.into(),
            to_client_id: None,
            notification_name: name.into(),
            notification_payload: payload,
        }
    }

    pub fn unicast(
        from: impl Into<String>,
        to: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            from_client_id: from.into(),
            to_client_id: Some(to.into()),
            notification_name: name.into(),
            notification_payload: payload,
        }
    }

    /// Whether the identity `local_id` should act on this envelope.
    pub fn is_addressed_to(&self, local_id: &str) -> bool {
        if self.from_client_id == local_id {
            return false;
        }
        match &self.to_client_id {
            Some(to) => to == local_id,
            None => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay closed")]
    Closed,
    #[error("relay transport error: {0}")]
    Transport(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Fan-out primitive consumed by the manager. Must not block.
pub trait Relay: Send + Sync {
    fn broadcast(&self, envelope: Envelope) -> RelayResult<()>;
}

impl<R: Relay + ?Sized> Relay for Arc<R> {
    fn broadcast(&self, envelope: Envelope) -> RelayResult<()> {
        (**self).broadcast(envelope)
    }
}

/// In-memory relay keyed by room name, for tests and in-process demos.
#[derive(Debug, Default, Clone)]
pub struct LocalRelayHub {
    rooms: Arc<RwLock<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl LocalRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, room: &str) -> broadcast::Sender<Envelope> {
        if let Some(sender) = self.rooms.read().get(room) {
            return sender.clone();
        }
        let mut guard = self.rooms.write();
        guard
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }

    /// Handle for publishing into and following one room.
    pub fn room(&self, room: &str) -> RoomRelay {
        RoomRelay {
            room: room.to_string(),
            sender: self.sender_for(room),
        }
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms.read().keys().cloned().collect()
    }
}

/// One room of a [`LocalRelayHub`].
#[derive(Debug, Clone)]
pub struct RoomRelay {
    room: String,
    sender: broadcast::Sender<Envelope>,
}

impl RoomRelay {
    pub fn name(&self) -> &str {
        &self.room
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

impl Relay for RoomRelay {
    fn broadcast(&self, envelope: Envelope) -> RelayResult<()> {
        trace!(
            room = %self.room,
            from = %envelope.from_client_id,
            name = %envelope.notification_name,
            "relay broadcast"
        );
        // Nobody listening yet is not a delivery failure for a fire-and-forget relay.
        let _ = self.sender.send(envelope);
        Ok(())
    }
}
