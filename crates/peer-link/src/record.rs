//! Per-peer connection records and their lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::connection::{
    ConnectionState, DataChannel, EventSink, IceCandidate, PeerConnection, SignalingState,
};
use crate::error::ManagerError;
use crate::events::{PeerEvent, RemovalReason};
use crate::framing::{FrameConfig, Reassembler};
use crate::manager::Actor;
use crate::timer::Timer;

/// Where a record stands in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    /// Created, nothing exchanged yet.
    Idle,
    /// Generating a local offer.
    OfferPending,
    /// Local offer sent, waiting for the answer.
    AnswerPending,
    /// An offer/answer pair has been applied.
    Stable,
    /// Yielding to a colliding remote offer.
    Rollback,
    Closed,
    Failed,
}

pub(crate) struct ConnectionRecord {
    pub(crate) peer_id: String,
    pub(crate) generation: u64,
    pub(crate) connection: Arc<dyn PeerConnection>,
    pub(crate) channel: Arc<dyn DataChannel>,
    pub(crate) negotiation: NegotiationState,
    pub(crate) pending_candidates: Vec<IceCandidate>,
    pub(crate) recovery_timer: Option<Timer>,
    pub(crate) eviction_timer: Option<Timer>,
    pub(crate) reassembler: Reassembler,
}

impl ConnectionRecord {
    pub(crate) fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            negotiation: self.negotiation,
            signaling: self.connection.signaling_state(),
            connection: self.connection.connection_state(),
            channel_open: self.channel.is_open(),
            pending_candidates: self.pending_candidates.len(),
            recovery_scheduled: self.recovery_timer.is_some(),
            eviction_scheduled: self.eviction_timer.is_some(),
        }
    }

    async fn close(mut self) {
        if let Some(timer) = self.recovery_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.eviction_timer.take() {
            timer.cancel();
        }
        self.negotiation = NegotiationState::Closed;
        self.channel.close().await;
        self.connection.close().await;
    }
}

/// Point-in-time view of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub generation: u64,
    pub negotiation: NegotiationState,
    pub signaling: SignalingState,
    pub connection: ConnectionState,
    pub channel_open: bool,
    pub pending_candidates: usize,
    pub recovery_scheduled: bool,
    pub eviction_scheduled: bool,
}

/// Records keyed by peer id. Only the actor touches it.
#[derive(Default)]
pub(crate) struct Registry {
    records: HashMap<String, ConnectionRecord>,
    next_generation: u64,
}

impl Registry {
    pub(crate) fn get(&self, peer_id: &str) -> Option<&ConnectionRecord> {
        self.records.get(peer_id)
    }

    pub(crate) fn get_mut(&mut self, peer_id: &str) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(peer_id)
    }

    /// Record for `peer_id` only if it is still the given generation.
    pub(crate) fn current_mut(
        &mut self,
        peer_id: &str,
        generation: u64,
    ) -> Option<&mut ConnectionRecord> {
        self.records
            .get_mut(peer_id)
            .filter(|record| record.generation == generation)
    }

    pub(crate) fn contains(&self, peer_id: &str) -> bool {
        self.records.contains_key(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }

    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn insert(&mut self, record: ConnectionRecord) {
        self.records.insert(record.peer_id.clone(), record);
    }

    fn remove(&mut self, peer_id: &str) -> Option<ConnectionRecord> {
        self.records.remove(peer_id)
    }
}

impl Actor {
    /// Allocate the primitive for `peer_id` and register its record.
    ///
    /// Fails with [`ManagerError::DuplicateRecord`] when one exists, unless
    /// `replace` is set, in which case the old record is torn down first.
    pub(crate) async fn create_record(
        &mut self,
        peer_id: &str,
        replace: bool,
    ) -> Result<(), ManagerError> {
        if self.registry.contains(peer_id) {
            if !replace {
                return Err(ManagerError::DuplicateRecord(peer_id.to_string()));
            }
            self.remove_record(peer_id, RemovalReason::Reset).await;
        }

        let generation = self.registry.allocate_generation();
        let sink = EventSink::new(peer_id, generation, self.commands.clone());
        let link = self
            .connector
            .connect(peer_id, &self.channel_spec, sink)
            .await?;
        info!(peer_id, generation, "connection record created");
        self.registry.insert(ConnectionRecord {
            peer_id: peer_id.to_string(),
            generation,
            connection: link.connection,
            channel: link.channel,
            negotiation: NegotiationState::Idle,
            pending_candidates: Vec::new(),
            recovery_timer: None,
            eviction_timer: None,
            reassembler: Reassembler::new(FrameConfig::from(&self.config)),
        });
        Ok(())
    }

    /// Cancel timers, close channel and connection, drop the record.
    /// No-op when there is no record.
    pub(crate) async fn remove_record(&mut self, peer_id: &str, reason: RemovalReason) {
        // Unregister before closing so state callbacks fired by the close
        // find no record and cannot trigger recovery.
        let Some(record) = self.registry.remove(peer_id) else {
            debug!(peer_id, ?reason, "remove requested for unknown peer");
            return;
        };
        info!(peer_id, generation = record.generation, ?reason, "removing connection record");
        record.close().await;
        self.publish(PeerEvent::Removed {
            peer_id: peer_id.to_string(),
            reason,
        });
    }

    pub(crate) async fn remove_all_records(&mut self, reason: RemovalReason) {
        for peer_id in self.registry.peer_ids() {
            self.remove_record(&peer_id, reason).await;
        }
    }
}
