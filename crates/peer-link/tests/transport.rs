mod common;

use common::*;
use peer_link::framing::TERMINATOR;
use peer_link::mock::MockNetwork;
use peer_link::{Envelope, PeerEvent, RequestHandlers, Transport};
use serde_json::{Value, json};

fn notifications(events: Vec<PeerEvent>) -> Vec<Envelope> {
    events
        .into_iter()
        .filter_map(|event| match event {
            PeerEvent::Notification(envelope) => Some(envelope),
            _ => None,
        })
        .collect()
}

#[test_timeout::paused_clock_test]
async fn auto_prefers_the_open_channel() {
    let mut pair = connected_pair(RequestHandlers::new(), RequestHandlers::new()).await;
    let mut tap = pair.room.subscribe();
    drain(&mut pair.bob_events);

    pair.alice
        .notify_client("bob", "cursor", json!({"line": 4}), Transport::Auto);
    settle().await;

    assert!(drain_relay(&mut tap).is_empty());
    let received = notifications(drain(&mut pair.bob_events));
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from_client_id, "alice");
    assert_eq!(received[0].notification_name, "cursor");
    assert_eq!(received[0].notification_payload, json!({"line": 4}));
}

#[test_timeout::paused_clock_test]
async fn relay_transport_bypasses_the_channel() {
    let mut pair = connected_pair(RequestHandlers::new(), RequestHandlers::new()).await;
    let mut tap = pair.room.subscribe();
    drain(&mut pair.bob_events);
    let frames_before = pair
        .network
        .connection("alice", "bob")
        .expect("connection")
        .sent_frames()
        .len();

    pair.alice
        .notify_client("bob", "cursor", json!(1), Transport::Relay);
    settle().await;

    let relayed = drain_relay(&mut tap);
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].to_client_id.as_deref(), Some("bob"));
    assert_eq!(
        pair.network
            .connection("alice", "bob")
            .expect("connection")
            .sent_frames()
            .len(),
        frames_before
    );
    assert_eq!(notifications(drain(&mut pair.bob_events)).len(), 1);
}

#[test_timeout::paused_clock_test]
async fn broadcast_over_relay_is_one_untargeted_envelope() {
    let mut pair = connected_pair(RequestHandlers::new(), RequestHandlers::new()).await;
    let mut tap = pair.room.subscribe();
    drain(&mut pair.bob_events);

    pair.alice
        .notify_all_clients("presence", json!({"typing": true}), Transport::Relay);
    settle().await;

    let relayed = drain_relay(&mut tap);
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].to_client_id, None);
    assert_eq!(notifications(drain(&mut pair.bob_events)).len(), 1);
}

#[test_timeout::paused_clock_test]
async fn broadcast_with_auto_goes_peer_by_peer() {
    let mut pair = connected_pair(RequestHandlers::new(), RequestHandlers::new()).await;
    let mut tap = pair.room.subscribe();
    drain(&mut pair.bob_events);

    pair.alice
        .notify_all_clients("presence", json!("away"), Transport::Auto);
    settle().await;

    assert!(drain_relay(&mut tap).is_empty());
    let received = notifications(drain(&mut pair.bob_events));
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].to_client_id.as_deref(), Some("bob"));
}

#[test_timeout::paused_clock_test]
async fn large_payload_is_sliced_and_reassembled() {
    let mut pair = connected_pair(RequestHandlers::new(), RequestHandlers::new()).await;
    drain(&mut pair.bob_events);
    let connection = pair.network.connection("alice", "bob").expect("connection");
    let already_sent = connection.sent_frames().len();
    let text: String = "αβγδε".repeat(3_000);

    pair.alice
        .notify_client("bob", "document", json!({ "text": text.clone() }), Transport::Direct);
    settle().await;

    let frames: Vec<String> = connection.sent_frames().split_off(already_sent);
    assert!(frames.len() >= 5, "expected several slices, got {}", frames.len());
    assert_eq!(frames.last().map(String::as_str), Some(TERMINATOR));
    for frame in &frames[..frames.len() - 1] {
        assert!(frame.chars().count() <= 5_000);
        assert_ne!(frame.as_str(), TERMINATOR);
    }
    let received = notifications(drain(&mut pair.bob_events));
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].notification_payload["text"], Value::String(text));
}

#[test_timeout::paused_clock_test]
async fn reserved_names_are_refused() {
    let mut pair = connected_pair(RequestHandlers::new(), RequestHandlers::new()).await;
    let mut tap = pair.room.subscribe();
    drain(&mut pair.bob_events);
    let connection = pair.network.connection("alice", "bob").expect("connection");
    let already_sent = connection.sent_frames().len();

    for name in ["join", "leave", "request", "requestResult", "rtcDescription", "rtcCandidate"] {
        pair.alice.notify_client("bob", name, Value::Null, Transport::Auto);
        pair.alice.notify_all_clients(name, Value::Null, Transport::Relay);
    }
    settle().await;

    assert!(drain_relay(&mut tap).is_empty());
    assert_eq!(connection.sent_frames().len(), already_sent);
    assert_eq!(pair.alice.connected_client_ids().await, vec!["bob".to_string()]);
}

#[test_timeout::paused_clock_test]
async fn notify_without_a_record_is_a_no_op() {
    let network = MockNetwork::manual();
    let (alice, relay) = spawn_recorded("alice", &network, peer_link::ManagerConfig::default());

    for transport in [Transport::Auto, Transport::Relay, Transport::Direct] {
        alice.notify_client("nobody", "cursor", json!(1), transport);
    }
    settle().await;
    assert!(relay.sent().is_empty());
    assert_eq!(network.connection_count(), 0);
}

#[test_timeout::paused_clock_test]
async fn auto_falls_back_to_the_relay_while_the_channel_is_closed() {
    let network = MockNetwork::manual();
    let (alice, relay) = spawn_recorded("alice", &network, peer_link::ManagerConfig::default());
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;
    relay.clear();

    alice.notify_client("bob", "cursor", json!(2), Transport::Auto);
    settle().await;
    let sent = relay.named("cursor");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to_client_id.as_deref(), Some("bob"));
    assert!(alice.peer_snapshot("bob").await.expect("record").eviction_scheduled);
}

#[test_timeout::paused_clock_test]
async fn forged_sender_on_a_channel_is_dropped() {
    let mut pair = connected_pair(RequestHandlers::new(), RequestHandlers::new()).await;
    drain(&mut pair.bob_events);

    // Text claiming to come from carol, arriving on bob's channel to alice.
    let forged = Envelope::unicast("carol", "bob", "cursor", json!(0));
    let text = serde_json::to_string(&forged).expect("serialize");
    let connection = pair.network.connection("bob", "alice").expect("connection");
    connection.receive_text(text);
    connection.receive_text(TERMINATOR.to_string());
    settle().await;
    assert!(notifications(drain(&mut pair.bob_events)).is_empty());
    assert!(connection.is_channel_open());
    assert_eq!(pair.bob.connected_client_ids().await, vec!["alice".to_string()]);
}
