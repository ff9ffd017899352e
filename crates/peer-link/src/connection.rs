//! Contract of the point-to-point connection primitive.
//!
//! The manager never talks to a network stack directly. A [`Connector`]
//! allocates one [`PeerConnection`] plus its pre-negotiated [`DataChannel`]
//! per remote peer and reports everything that happens on them through the
//! [`EventSink`] it was handed.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::manager::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

/// A discovered network path, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Aggregate connectivity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Fold the transport-level and ICE-level readings into one state.
    ///
    /// The two signals disagree for short windows (ICE reconnects before the
    /// transport notices, or vice versa). Terminal readings win, then a
    /// disconnect on either side, then any side being connected.
    pub fn aggregate(transport: ConnectionState, ice: ConnectionState) -> ConnectionState {
        use ConnectionState::*;
        match (transport, ice) {
            (Closed, _) | (_, Closed) => Closed,
            (Failed, _) | (_, Failed) => Failed,
            (Disconnected, _) | (_, Disconnected) => Disconnected,
            (Connected, _) | (_, Connected) => Connected,
            (Connecting, _) | (_, Connecting) => Connecting,
            (New, New) => New,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("operation invalid in signaling state {0:?}")]
    InvalidState(SignalingState),
    #[error("connection closed")]
    Closed,
    #[error("connection backend error: {0}")]
    Backend(String),
}

/// Callbacks of the primitive, reported back to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    CandidateDiscovered(IceCandidate),
    NegotiationNeeded,
    StateChanged(ConnectionState),
    ChannelOpened,
    ChannelClosed,
    ChannelMessage(String),
}

/// Where a connection reports its events. Tagged with the record generation
/// so events from a torn-down connection are recognisable as stale.
#[derive(Debug, Clone)]
pub struct EventSink {
    peer_id: Arc<str>,
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl EventSink {
    pub(crate) fn new(
        peer_id: &str,
        generation: u64,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            peer_id: Arc::from(peer_id),
            generation,
            commands,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Report an event. Silently dropped once the manager has shut down.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.commands.send(Command::Connection {
            peer_id: self.peer_id.to_string(),
            generation: self.generation,
            event,
        });
    }
}

/// How both sides open the data channel without negotiating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub id: u16,
    pub label: String,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;
    /// Return the local description to a neutral state.
    async fn rollback(&self) -> Result<(), ConnectionError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;
    async fn has_remote_description(&self) -> bool;
    fn signaling_state(&self) -> SignalingState;
    /// Live aggregate state read from the primitive, never cached.
    fn connection_state(&self) -> ConnectionState;
    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> Result<(), ConnectionError>;
    async fn close(&self);
}

/// Connection and channel owned by one record.
pub struct PeerLink {
    pub connection: Arc<dyn PeerConnection>,
    pub channel: Arc<dyn DataChannel>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Allocate the primitive for `peer_id`, wire its callbacks into `events`
    /// and create the data channel eagerly.
    async fn connect(
        &self,
        peer_id: &str,
        channel: &ChannelSpec,
        events: EventSink,
    ) -> Result<PeerLink, ConnectionError>;
}
