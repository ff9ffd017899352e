//! In-memory connection primitive.
//!
//! A [`MockNetwork`] hands out one [`Connector`] per local identity. The
//! connections it creates follow the browser signaling state machine closely
//! enough to exercise negotiation, and with auto-connect on (the default) a
//! pair whose descriptions match both ways becomes `connected` and opens its
//! channel. Channel text is delivered to the remote side's event sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::connection::{
    ChannelSpec, ConnectionError, ConnectionEvent, ConnectionState, Connector, DataChannel,
    EventSink, IceCandidate, PeerConnection, PeerLink, SdpKind, SessionDescription,
    SignalingState,
};

type PairKey = (String, String);

struct NetworkInner {
    auto_connect: bool,
    connections: Mutex<HashMap<PairKey, Arc<MockConnection>>>,
    created: AtomicUsize,
    fail_offers: AtomicBool,
}

#[derive(Clone)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNetwork {
    /// Network whose negotiated pairs connect on their own.
    pub fn new() -> Self {
        Self::with_auto_connect(true)
    }

    /// Network where connectivity is driven by hand through
    /// [`MockConnection::set_state`] and [`MockConnection::open_channel`].
    pub fn manual() -> Self {
        Self::with_auto_connect(false)
    }

    fn with_auto_connect(auto_connect: bool) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                auto_connect,
                connections: Mutex::new(HashMap::new()),
                created: AtomicUsize::new(0),
                fail_offers: AtomicBool::new(false),
            }),
        }
    }

    pub fn connector(&self, local_id: impl Into<String>) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            local_id: local_id.into(),
            network: self.inner.clone(),
        })
    }

    /// Latest connection `local_id` allocated towards `remote_id`.
    pub fn connection(&self, local_id: &str, remote_id: &str) -> Option<Arc<MockConnection>> {
        self.inner
            .connections
            .lock()
            .get(&(local_id.to_string(), remote_id.to_string()))
            .cloned()
    }

    /// Force both sides of a pair to `connected` with open channels.
    pub fn link(&self, a: &str, b: &str) -> bool {
        match (self.connection(a, b), self.connection(b, a)) {
            (Some(left), Some(right)) => {
                left.become_connected();
                right.become_connected();
                true
            }
            _ => false,
        }
    }

    /// Make offer generation fail on connections allocated from now on.
    pub fn fail_offers(&self, fail: bool) {
        self.inner.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Connections allocated since the network was created.
    pub fn connection_count(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }
}

pub struct MockConnector {
    local_id: String,
    network: Arc<NetworkInner>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        peer_id: &str,
        channel: &ChannelSpec,
        events: EventSink,
    ) -> Result<PeerLink, ConnectionError> {
        let connection = Arc::new(MockConnection {
            local_id: self.local_id.clone(),
            remote_id: peer_id.to_string(),
            channel_label: channel.label.clone(),
            events,
            network: Arc::downgrade(&self.network),
            state: Mutex::new(MockState {
                fail_offers: self.network.fail_offers.load(Ordering::SeqCst),
                ..MockState::default()
            }),
        });
        self.network.created.fetch_add(1, Ordering::SeqCst);
        self.network.connections.lock().insert(
            (self.local_id.clone(), peer_id.to_string()),
            connection.clone(),
        );
        trace!(local_id = %self.local_id, peer_id, label = %channel.label, "mock connection allocated");
        connection.events.emit(ConnectionEvent::NegotiationNeeded);
        Ok(PeerLink {
            connection: connection.clone(),
            channel: Arc::new(MockChannel { connection }),
        })
    }
}

struct MockState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    channel_open: bool,
    closed: bool,
    offers: usize,
    applied_candidates: Vec<IceCandidate>,
    sent: Vec<String>,
    reject_candidates: bool,
    fail_offers: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            local: None,
            remote: None,
            channel_open: false,
            closed: false,
            offers: 0,
            applied_candidates: Vec::new(),
            sent: Vec::new(),
            reject_candidates: false,
            fail_offers: false,
        }
    }
}

pub struct MockConnection {
    local_id: String,
    remote_id: String,
    channel_label: String,
    events: EventSink,
    network: Weak<NetworkInner>,
    state: Mutex<MockState>,
}

impl MockConnection {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn channel_label(&self) -> &str {
        &self.channel_label
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// Every text message written to the channel, frames and terminators.
    pub fn sent_frames(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_channel_open(&self) -> bool {
        self.state.lock().channel_open
    }

    pub fn set_reject_candidates(&self, reject: bool) {
        self.state.lock().reject_candidates = reject;
    }

    pub fn set_fail_offers(&self, fail: bool) {
        self.state.lock().fail_offers = fail;
    }

    /// Change the aggregate state and report it.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.lock().connection = state;
        self.events.emit(ConnectionEvent::StateChanged(state));
    }

    pub fn open_channel(&self) {
        self.state.lock().channel_open = true;
        self.events.emit(ConnectionEvent::ChannelOpened);
    }

    pub fn close_channel(&self) {
        self.state.lock().channel_open = false;
        self.events.emit(ConnectionEvent::ChannelClosed);
    }

    /// Deliver `text` as if the remote side had written it to the channel.
    pub fn receive_text(&self, text: String) {
        self.events.emit(ConnectionEvent::ChannelMessage(text));
    }

    /// Report a locally discovered candidate.
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        self.events.emit(ConnectionEvent::CandidateDiscovered(candidate));
    }

    fn become_connected(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.connection == ConnectionState::Connected {
                return;
            }
            state.connection = ConnectionState::Connected;
            state.channel_open = true;
        }
        self.events
            .emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
        self.events.emit(ConnectionEvent::ChannelOpened);
    }

    fn peer(&self) -> Option<Arc<MockConnection>> {
        let network = self.network.upgrade()?;
        let peer = network
            .connections
            .lock()
            .get(&(self.remote_id.clone(), self.local_id.clone()))
            .cloned();
        peer
    }

    fn is_current(&self, network: &NetworkInner) -> bool {
        network
            .connections
            .lock()
            .get(&(self.local_id.clone(), self.remote_id.clone()))
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self))
    }

    /// Connect the pair once both sides hold the other's descriptions.
    fn settle(&self) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        if !network.auto_connect || !self.is_current(&network) {
            return;
        }
        let Some(peer) = self.peer() else {
            return;
        };
        let (local, remote) = {
            let state = self.state.lock();
            if state.signaling != SignalingState::Stable {
                return;
            }
            (state.local.clone(), state.remote.clone())
        };
        let matched = {
            let state = peer.state.lock();
            state.signaling == SignalingState::Stable
                && local.is_some()
                && remote.is_some()
                && state.remote == local
                && state.local == remote
        };
        if matched {
            self.become_connected();
            peer.become_connected();
        }
    }

    fn check_open(state: &MockState) -> Result<(), ConnectionError> {
        if state.closed {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.fail_offers {
            return Err(ConnectionError::Backend("offer generation failed".into()));
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "offer {}->{} #{}",
            self.local_id, self.remote_id, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let state = self.state.lock();
        Self::check_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(ConnectionError::InvalidState(state.signaling));
        }
        Ok(SessionDescription::answer(format!(
            "answer {}->{}",
            self.local_id, self.remote_id
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            state.signaling = match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpKind::Answer | SdpKind::Pranswer, SignalingState::HaveRemoteOffer) => {
                    SignalingState::Stable
                }
                (SdpKind::Rollback, _) => {
                    state.local = None;
                    state.signaling = SignalingState::Stable;
                    return Ok(());
                }
                (_, current) => return Err(ConnectionError::InvalidState(current)),
            };
            state.local = Some(description);
        }
        self.settle();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            state.signaling = match (description.kind, state.signaling) {
                // A remote offer in have-local-offer rolls the local one back.
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.local = None;
                    SignalingState::HaveRemoteOffer
                }
                (SdpKind::Answer | SdpKind::Pranswer, SignalingState::HaveLocalOffer) => {
                    SignalingState::Stable
                }
                (_, current) => return Err(ConnectionError::InvalidState(current)),
            };
            state.remote = Some(description);
        }
        self.settle();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.signaling == SignalingState::HaveLocalOffer {
            state.local = None;
            state.signaling = SignalingState::Stable;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.remote.is_none() {
            return Err(ConnectionError::InvalidState(state.signaling));
        }
        if state.reject_candidates {
            return Err(ConnectionError::Backend("candidate rejected".into()));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.channel_open = false;
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
        }
        self.events
            .emit(ConnectionEvent::StateChanged(ConnectionState::Closed));
    }
}

struct MockChannel {
    connection: Arc<MockConnection>,
}

#[async_trait]
impl DataChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.connection.is_channel_open()
    }

    async fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        {
            let mut state = self.connection.state.lock();
            if !state.channel_open {
                return Err(ConnectionError::Closed);
            }
            state.sent.push(text.clone());
        }
        if let Some(peer) = self.connection.peer() {
            if peer.is_channel_open() {
                peer.events.emit(ConnectionEvent::ChannelMessage(text));
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let was_open = {
            let mut state = self.connection.state.lock();
            std::mem::replace(&mut state.channel_open, false)
        };
        if was_open {
            self.connection.events.emit(ConnectionEvent::ChannelClosed);
        }
    }
}
