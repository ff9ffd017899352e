mod common;

use std::time::Duration;

use common::*;
use peer_link::mock::MockNetwork;
use peer_link::{ConnectionState, ManagerConfig, PeerEvent, RemovalReason, Transport};
use serde_json::json;

const GRACE: Duration = Duration::from_secs(10);

fn removed(peer_id: &str, reason: RemovalReason) -> PeerEvent {
    PeerEvent::Removed {
        peer_id: peer_id.into(),
        reason,
    }
}

#[test_timeout::paused_clock_test]
async fn zombie_is_evicted_after_the_grace_period() {
    let network = MockNetwork::manual();
    let (alice, _relay) = spawn_recorded("alice", &network, ManagerConfig::default());
    let mut events = alice.subscribe();

    // The offer goes out while the channel is still closed, arming the check.
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;
    assert!(alice.peer_snapshot("bob").await.expect("record").eviction_scheduled);

    tokio::time::sleep(GRACE - Duration::from_millis(100)).await;
    assert!(alice.peer_snapshot("bob").await.is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    settle().await;
    assert!(alice.peer_snapshot("bob").await.is_none());
    assert!(network.connection("alice", "bob").expect("connection").is_closed());
    assert!(drain(&mut events).contains(&removed("bob", RemovalReason::Zombie)));
}

#[test_timeout::paused_clock_test]
async fn channel_opening_in_time_cancels_eviction() {
    let network = MockNetwork::manual();
    let (alice, _relay) = spawn_recorded("alice", &network, ManagerConfig::default());
    let mut events = alice.subscribe();
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    network.connection("alice", "bob").expect("connection").open_channel();
    settle().await;
    let snapshot = alice.peer_snapshot("bob").await.expect("record");
    assert!(snapshot.channel_open);
    assert!(!snapshot.eviction_scheduled);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(alice.peer_snapshot("bob").await.is_some());
    let seen = drain(&mut events);
    assert!(seen.contains(&PeerEvent::ChannelOpen {
        peer_id: "bob".into()
    }));
    assert!(!seen.iter().any(|event| matches!(event, PeerEvent::Removed { .. })));
}

#[test_timeout::paused_clock_test]
async fn direct_send_on_closed_channel_is_dropped_and_arms_eviction() {
    let network = MockNetwork::manual();
    let (alice, relay) = spawn_recorded("alice", &network, ManagerConfig::default());
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;
    let connection = network.connection("alice", "bob").expect("connection");
    connection.open_channel();
    settle().await;
    assert!(!alice.peer_snapshot("bob").await.expect("record").eviction_scheduled);

    connection.close_channel();
    relay.clear();
    alice.notify_client("bob", "cursor", json!({"x": 1}), Transport::Direct);
    settle().await;
    assert!(relay.sent().is_empty());
    assert!(connection.sent_frames().is_empty());
    assert!(alice.peer_snapshot("bob").await.expect("record").eviction_scheduled);

    tokio::time::sleep(GRACE).await;
    settle().await;
    assert!(alice.peer_snapshot("bob").await.is_none());
}

#[test_timeout::paused_clock_test]
async fn disconnect_that_persists_triggers_a_hard_reset() {
    let network = MockNetwork::manual();
    let (alice, _relay) = spawn_recorded("alice", &network, ManagerConfig::default());
    let mut events = alice.subscribe();
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;
    let connection = network.connection("alice", "bob").expect("connection");
    connection.open_channel();
    connection.set_state(ConnectionState::Connected);
    settle().await;
    let before = alice.peer_snapshot("bob").await.expect("record");
    assert_eq!(alice.connected_client_ids().await, vec!["bob".to_string()]);

    connection.set_state(ConnectionState::Disconnected);
    settle().await;
    assert!(alice.peer_snapshot("bob").await.expect("record").recovery_scheduled);

    tokio::time::sleep(ManagerConfig::default().link_recovery_delay).await;
    settle().await;
    let after = alice.peer_snapshot("bob").await.expect("record recreated");
    assert!(after.generation > before.generation);
    assert!(connection.is_closed());
    assert_eq!(network.connection_count(), 2);
    assert!(drain(&mut events).contains(&removed("bob", RemovalReason::Reset)));
}

#[test_timeout::paused_clock_test]
async fn self_healed_link_is_left_alone() {
    let network = MockNetwork::manual();
    let (alice, _relay) = spawn_recorded("alice", &network, ManagerConfig::default());
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;
    let connection = network.connection("alice", "bob").expect("connection");
    connection.open_channel();
    connection.set_state(ConnectionState::Connected);
    settle().await;
    let before = alice.peer_snapshot("bob").await.expect("record");

    connection.set_state(ConnectionState::Disconnected);
    settle().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    connection.set_state(ConnectionState::Connected);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let after = alice.peer_snapshot("bob").await.expect("record");
    assert_eq!(after.generation, before.generation);
    assert!(!after.recovery_scheduled);
    assert!(!connection.is_closed());
    assert_eq!(network.connection_count(), 1);
}

#[test_timeout::paused_clock_test]
async fn repeated_disconnects_schedule_one_recovery() {
    let network = MockNetwork::manual();
    let (alice, _relay) = spawn_recorded("alice", &network, ManagerConfig::default());
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;
    let connection = network.connection("alice", "bob").expect("connection");
    connection.open_channel();

    for _ in 0..3 {
        connection.set_state(ConnectionState::Disconnected);
        settle().await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    // One reset: the original connection plus exactly one replacement.
    assert_eq!(network.connection_count(), 2);
}

#[test_timeout::paused_clock_test]
async fn failed_connection_is_removed_without_recovery() {
    let network = MockNetwork::manual();
    let (alice, _relay) = spawn_recorded("alice", &network, ManagerConfig::default());
    let mut events = alice.subscribe();
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;
    let connection = network.connection("alice", "bob").expect("connection");

    connection.set_state(ConnectionState::Failed);
    settle().await;
    assert!(alice.peer_snapshot("bob").await.is_none());
    assert!(connection.is_closed());
    assert!(drain(&mut events).contains(&removed("bob", RemovalReason::Failed)));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(network.connection_count(), 1);
}

#[test_timeout::paused_clock_test]
async fn remotely_closed_connection_is_removed() {
    let network = MockNetwork::manual();
    let (alice, _relay) = spawn_recorded("alice", &network, ManagerConfig::default());
    let mut events = alice.subscribe();
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;

    network
        .connection("alice", "bob")
        .expect("connection")
        .set_state(ConnectionState::Closed);
    settle().await;
    assert!(alice.peer_snapshot("bob").await.is_none());
    assert!(drain(&mut events).contains(&removed("bob", RemovalReason::Closed)));
}

#[test_timeout::paused_clock_test]
async fn local_close_never_triggers_recovery() {
    let network = MockNetwork::manual();
    let (alice, _relay) = spawn_recorded("alice", &network, ManagerConfig::default());
    let mut events = alice.subscribe();
    alice.handle_relay_envelope(join_from("bob"));
    settle().await;
    let connection = network.connection("alice", "bob").expect("connection");
    connection.open_channel();
    connection.set_state(ConnectionState::Disconnected);
    settle().await;
    assert!(alice.peer_snapshot("bob").await.expect("record").recovery_scheduled);

    alice.remove_client("bob");
    settle().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(connection.is_closed());
    assert!(alice.peer_snapshot("bob").await.is_none());
    assert_eq!(network.connection_count(), 1);
    let removals: Vec<PeerEvent> = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, PeerEvent::Removed { .. }))
        .collect();
    assert_eq!(removals, vec![removed("bob", RemovalReason::Local)]);
}

#[test_timeout::paused_clock_test]
async fn remote_reset_is_followed_onto_a_fresh_connection() {
    let pair = connected_pair(
        peer_link::RequestHandlers::new(),
        peer_link::RequestHandlers::new(),
    )
    .await;
    let bob_generation = pair.bob.peer_snapshot("alice").await.expect("record").generation;

    // Alice's link drops for good; she resets and re-offers on a new connection.
    pair.network
        .connection("alice", "bob")
        .expect("connection")
        .set_state(ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    assert_eq!(pair.alice.connected_client_ids().await, vec!["bob".to_string()]);
    assert_eq!(pair.bob.connected_client_ids().await, vec!["alice".to_string()]);
    let bob_after = pair.bob.peer_snapshot("alice").await.expect("record");
    assert!(bob_after.generation > bob_generation);
    assert_eq!(pair.network.connection_count(), 4);
}
