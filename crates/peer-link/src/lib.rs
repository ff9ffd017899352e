//! Peer-to-peer connection manager.
//!
//! Keeps one direct connection per remote peer, negotiated over a relay that
//! fans envelopes out to every participant. Once a connection's data channel
//! is open, notifications and request/response traffic move onto it; until
//! then, and whenever it drops, they fall back to the relay.

pub mod config;
pub mod connection;
mod dispatch;
pub mod error;
pub mod events;
pub mod framing;
pub mod manager;
pub mod mock;
pub mod negotiation;
pub mod notification;
mod record;
mod recovery;
pub mod requests;
#[cfg(feature = "webrtc")]
pub mod rtc;
mod timer;

pub use config::ManagerConfig;
pub use connection::{
    ChannelSpec, ConnectionError, ConnectionEvent, ConnectionState, Connector, DataChannel,
    EventSink, IceCandidate, PeerConnection, PeerLink, SdpKind, SessionDescription,
    SignalingState,
};
pub use error::{HandlerError, ManagerError, RequestError};
pub use events::{PeerEvent, RemovalReason};
pub use manager::{PeerManager, PeerManagerBuilder, Transport};
pub use negotiation::is_polite;
pub use record::{NegotiationState, PeerSnapshot};
pub use relay_bus::{Envelope, LocalRelayHub, Relay, RelayError, RoomRelay};
pub use requests::{InboundRequest, RequestHandlers};
#[cfg(feature = "webrtc")]
pub use rtc::RtcConnector;
