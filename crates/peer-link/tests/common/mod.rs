#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use peer_link::mock::MockNetwork;
use peer_link::notification::{CANDIDATE, DESCRIPTION, JOIN, LEAVE};
use peer_link::{
    Envelope, IceCandidate, LocalRelayHub, ManagerConfig, PeerEvent, PeerManager, Relay,
    RelayError, RequestHandlers, RoomRelay, SessionDescription,
};
use serde_json::Value;
use tokio::sync::broadcast;

/// Relay that only records what the manager sends.
#[derive(Default)]
pub struct RecordingRelay {
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingRelay {
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn named(&self, name: &str) -> Vec<Envelope> {
        self.sent
            .lock()
            .iter()
            .filter(|envelope| envelope.notification_name == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Relay for RecordingRelay {
    fn broadcast(&self, envelope: Envelope) -> Result<(), RelayError> {
        self.sent.lock().push(envelope);
        Ok(())
    }
}

/// Let every ready task run. Under a paused clock this returns once the
/// runtime is idle, well before any manager timer.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn spawn_recorded(
    local_id: &str,
    network: &MockNetwork,
    config: ManagerConfig,
) -> (PeerManager, Arc<RecordingRelay>) {
    let relay = Arc::new(RecordingRelay::default());
    let manager = PeerManager::builder(local_id)
        .config(config)
        .spawn(relay.clone(), network.connector(local_id));
    (manager, relay)
}

pub fn spawn_in_room(
    local_id: &str,
    room: &RoomRelay,
    network: &MockNetwork,
    handlers: RequestHandlers,
) -> PeerManager {
    let manager = PeerManager::builder(local_id)
        .handlers(handlers)
        .spawn(Arc::new(room.clone()), network.connector(local_id));
    manager.follow(room.subscribe());
    manager
}

/// Two managers in one room, connected over the mock network.
pub struct Pair {
    pub hub: LocalRelayHub,
    pub room: RoomRelay,
    pub network: MockNetwork,
    pub alice: PeerManager,
    pub bob: PeerManager,
    pub bob_events: broadcast::Receiver<PeerEvent>,
}

pub async fn connected_pair(alice_handlers: RequestHandlers, bob_handlers: RequestHandlers) -> Pair {
    let hub = LocalRelayHub::new();
    let room = hub.room("session");
    let network = MockNetwork::new();
    let alice = spawn_in_room("alice", &room, &network, alice_handlers);
    let bob = spawn_in_room("bob", &room, &network, bob_handlers);
    let bob_events = bob.subscribe();
    alice.start();
    settle().await;
    assert_eq!(alice.connected_client_ids().await, vec!["bob".to_string()]);
    assert_eq!(bob.connected_client_ids().await, vec!["alice".to_string()]);
    Pair {
        hub,
        room,
        network,
        alice,
        bob,
        bob_events,
    }
}

pub fn join_from(peer_id: &str) -> Envelope {
    Envelope::broadcast(peer_id, JOIN, Value::Null)
}

pub fn leave_from(peer_id: &str) -> Envelope {
    Envelope::broadcast(peer_id, LEAVE, Value::Null)
}

pub fn description_from(peer_id: &str, to: &str, description: &SessionDescription) -> Envelope {
    Envelope::unicast(
        peer_id,
        to,
        DESCRIPTION,
        serde_json::to_value(description).expect("serialize description"),
    )
}

pub fn candidate_from(peer_id: &str, to: &str, candidate: &IceCandidate) -> Envelope {
    Envelope::unicast(
        peer_id,
        to,
        CANDIDATE,
        serde_json::to_value(candidate).expect("serialize candidate"),
    )
}

/// Events currently queued on `events`, without waiting.
pub fn drain(events: &mut broadcast::Receiver<PeerEvent>) -> Vec<PeerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn drain_relay(tap: &mut broadcast::Receiver<Envelope>) -> Vec<Envelope> {
    let mut seen = Vec::new();
    while let Ok(envelope) = tap.try_recv() {
        seen.push(envelope);
    }
    seen
}
