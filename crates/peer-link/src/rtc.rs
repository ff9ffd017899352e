//! webrtc-rs backed connection primitive.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::connection::{
    ChannelSpec, ConnectionError, ConnectionEvent, ConnectionState, Connector, DataChannel,
    EventSink, IceCandidate, PeerConnection, PeerLink, SdpKind, SessionDescription,
    SignalingState,
};

fn backend<E: std::fmt::Display>(err: E) -> ConnectionError {
    ConnectionError::Backend(err.to_string())
}

fn build_api() -> Result<API, ConnectionError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(backend)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(backend)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Allocates one `RTCPeerConnection` per remote peer.
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, ConnectionError> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        if self.ice_servers.is_empty() {
            return RTCConfiguration::default();
        }
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for RtcConnector {
    async fn connect(
        &self,
        peer_id: &str,
        channel: &ChannelSpec,
        events: EventSink,
    ) -> Result<PeerLink, ConnectionError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(backend)?,
        );
        let states = Arc::new(Mutex::new(StateFold::default()));

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(ConnectionEvent::CandidateDiscovered(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(err) => {
                        warn!(peer_id = %sink.peer_id(), error = %err, "failed to serialize local candidate")
                    }
                }
            })
        }));

        let sink = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(ConnectionEvent::NegotiationNeeded);
            })
        }));

        let sink = events.clone();
        let fold = states.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            let fold = fold.clone();
            Box::pin(async move {
                trace!(peer_id = %sink.peer_id(), ?state, "peer connection state");
                if let Some(aggregate) = fold.lock().transport(map_peer_state(state)) {
                    sink.emit(ConnectionEvent::StateChanged(aggregate));
                }
            })
        }));

        let sink = events.clone();
        let fold = states.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let sink = sink.clone();
            let fold = fold.clone();
            Box::pin(async move {
                trace!(peer_id = %sink.peer_id(), ?state, "ice connection state");
                if let Some(aggregate) = fold.lock().ice(map_ice_state(state)) {
                    sink.emit(ConnectionEvent::StateChanged(aggregate));
                }
            })
        }));

        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(channel.id),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(&channel.label, Some(init))
            .await
            .map_err(backend)?;

        let sink = events.clone();
        dc.on_open(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                debug!(peer_id = %sink.peer_id(), "data channel opened");
                sink.emit(ConnectionEvent::ChannelOpened);
            })
        }));
        let sink = events.clone();
        dc.on_close(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(ConnectionEvent::ChannelClosed);
            })
        }));
        let sink = events;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                if !msg.is_string {
                    warn!(peer_id = %sink.peer_id(), "binary channel message ignored");
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => sink.emit(ConnectionEvent::ChannelMessage(text)),
                    Err(err) => {
                        warn!(peer_id = %sink.peer_id(), error = %err, "non utf-8 channel text dropped")
                    }
                }
            })
        }));

        debug!(peer_id, label = %channel.label, id = channel.id, "rtc peer connection allocated");
        Ok(PeerLink {
            connection: Arc::new(RtcPeerConnection { pc }),
            channel: Arc::new(RtcDataChannel { dc }),
        })
    }
}

/// Last transport and ICE readings, plus the aggregate last reported.
struct StateFold {
    transport: ConnectionState,
    ice: ConnectionState,
    reported: ConnectionState,
}

impl Default for StateFold {
    fn default() -> Self {
        Self {
            transport: ConnectionState::New,
            ice: ConnectionState::New,
            reported: ConnectionState::New,
        }
    }
}

impl StateFold {
    fn transport(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        self.transport = state;
        self.refold()
    }

    fn ice(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        self.ice = state;
        self.refold()
    }

    fn refold(&mut self) -> Option<ConnectionState> {
        let next = ConnectionState::aggregate(self.transport, self.ice);
        if next == self.reported {
            return None;
        }
        self.reported = next;
        Some(next)
    }
}

fn map_peer_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> ConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => ConnectionState::New,
        RTCIceConnectionState::Checking => ConnectionState::Connecting,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            ConnectionState::Connected
        }
        RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCIceConnectionState::Failed => ConnectionState::Failed,
        RTCIceConnectionState::Closed => ConnectionState::Closed,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(backend),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(backend),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp).map_err(backend),
        SdpKind::Rollback => rollback_description(),
    }
}

/// The constructors only cover parsed kinds, so rollback goes through serde.
fn rollback_description() -> Result<RTCSessionDescription, ConnectionError> {
    serde_json::from_value(serde_json::json!({"type": "rollback", "sdp": ""})).map_err(backend)
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, ConnectionError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(ConnectionError::Backend("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        from_rtc(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(backend)
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Ok(());
        }
        self.pc
            .set_local_description(rollback_description()?)
            .await
            .map_err(backend)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(backend)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::aggregate(
            map_peer_state(self.pc.connection_state()),
            map_ice_state(self.pc.ice_connection_state()),
        )
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close reported an error");
        }
    }
}

struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        self.dc.send_text(text).await.map(|_| ()).map_err(backend)
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(error = %err, "data channel close reported an error");
        }
    }
}
