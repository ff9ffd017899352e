//! Reacts to connection events: state observers, delayed hard resets and
//! zombie eviction.

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionEvent, ConnectionState};
use crate::events::{PeerEvent, RemovalReason};
use crate::manager::{Actor, Command, Transport};
use crate::notification::Notification;
use crate::timer::Timer;

impl Actor {
    pub(crate) async fn on_connection_event(
        &mut self,
        peer_id: &str,
        generation: u64,
        event: ConnectionEvent,
    ) {
        if self.registry.current_mut(peer_id, generation).is_none() {
            trace!(peer_id, generation, ?event, "event from a retired connection ignored");
            return;
        }
        match event {
            ConnectionEvent::CandidateDiscovered(candidate) => {
                self.send_to(peer_id, &Notification::Candidate(candidate), Transport::Auto)
                    .await;
            }
            ConnectionEvent::NegotiationNeeded => {
                self.on_negotiation_needed(peer_id, generation).await
            }
            ConnectionEvent::StateChanged(state) => {
                self.on_connection_state(peer_id, generation, state).await
            }
            ConnectionEvent::ChannelOpened => {
                if let Some(record) = self.registry.current_mut(peer_id, generation) {
                    if let Some(timer) = record.eviction_timer.take() {
                        timer.cancel();
                    }
                }
                debug!(peer_id, "data channel open");
                self.publish(PeerEvent::ChannelOpen {
                    peer_id: peer_id.to_string(),
                });
            }
            ConnectionEvent::ChannelClosed => debug!(peer_id, "data channel closed"),
            ConnectionEvent::ChannelMessage(text) => {
                let Some(record) = self.registry.current_mut(peer_id, generation) else {
                    return;
                };
                let Some(message) = record.reassembler.ingest(&text) else {
                    return;
                };
                if let Some(envelope) = self.decode_channel_text(peer_id, &message) {
                    self.dispatch_inbound(envelope, Transport::Direct).await;
                }
            }
        }
    }

    async fn on_connection_state(&mut self, peer_id: &str, generation: u64, state: ConnectionState) {
        debug!(peer_id, generation, %state, "connection state changed");
        match state {
            ConnectionState::Connected => {
                info!(peer_id, "peer connected");
                self.publish(PeerEvent::Connected {
                    peer_id: peer_id.to_string(),
                });
            }
            ConnectionState::Disconnected => {
                self.schedule_recovery(peer_id, generation, self.config.link_recovery_delay)
            }
            ConnectionState::Failed => self.remove_record(peer_id, RemovalReason::Failed).await,
            ConnectionState::Closed => self.remove_record(peer_id, RemovalReason::Closed).await,
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    /// Arm a single recovery attempt for the record; a pending one wins.
    pub(crate) fn schedule_recovery(&mut self, peer_id: &str, generation: u64, delay: Duration) {
        let commands = self.commands.clone();
        let Some(record) = self.registry.current_mut(peer_id, generation) else {
            return;
        };
        if record.recovery_timer.is_some() {
            trace!(peer_id, "recovery already scheduled");
            return;
        }
        debug!(peer_id, generation, delay_ms = delay.as_millis() as u64, "recovery scheduled");
        record.recovery_timer = Some(Timer::schedule(
            &commands,
            delay,
            Command::RecoveryDue {
                peer_id: peer_id.to_string(),
                generation,
            },
        ));
    }

    pub(crate) async fn on_recovery_due(&mut self, peer_id: &str, generation: u64) {
        let Some(record) = self.registry.current_mut(peer_id, generation) else {
            return;
        };
        record.recovery_timer = None;
        // Read the primitive itself; cached flags can lag behind.
        let state = record.connection.connection_state();
        if matches!(state, ConnectionState::Connected | ConnectionState::Closed) {
            debug!(peer_id, %state, "recovery not needed");
            return;
        }
        info!(peer_id, %state, "hard-resetting connection");
        if let Err(err) = self.create_record(peer_id, true).await {
            warn!(peer_id, error = %err, "failed to recreate connection record");
        }
    }

    /// Start the zombie check unless one is already running.
    pub(crate) fn arm_eviction(&mut self, peer_id: &str) {
        let commands = self.commands.clone();
        let grace = self.config.zombie_grace;
        let Some(record) = self.registry.get_mut(peer_id) else {
            return;
        };
        if record.eviction_timer.is_some() {
            return;
        }
        debug!(peer_id, grace_ms = grace.as_millis() as u64, "channel not open; zombie check armed");
        record.eviction_timer = Some(Timer::schedule(
            &commands,
            grace,
            Command::EvictionDue {
                peer_id: peer_id.to_string(),
                generation: record.generation,
            },
        ));
    }

    pub(crate) async fn on_eviction_due(&mut self, peer_id: &str, generation: u64) {
        let Some(record) = self.registry.current_mut(peer_id, generation) else {
            return;
        };
        record.eviction_timer = None;
        if record.channel.is_open() {
            return;
        }
        warn!(peer_id, "channel never opened; evicting zombie peer");
        self.remove_record(peer_id, RemovalReason::Zombie).await;
    }
}
