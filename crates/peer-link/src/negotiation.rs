//! Offer/answer exchange, glare resolution and candidate buffering.
//!
//! Every method here runs on the actor, so between two awaits nothing else
//! touches the registry. Remote ordering races (both sides offering at once)
//! are settled by [`is_polite`] rather than by locking.

use std::mem;

use tracing::{debug, info, warn};

use crate::connection::{
    ConnectionError, IceCandidate, PeerConnection, SessionDescription, SignalingState,
};
use crate::manager::{Actor, Transport};
use crate::notification::Notification;
use crate::record::NegotiationState;

/// Whether the local side yields when both peers offer at the same time.
///
/// The side whose id sorts after the remote's is polite. Exactly one side of
/// any pair of distinct ids is polite.
pub fn is_polite(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

impl Actor {
    pub(crate) async fn on_join(&mut self, peer_id: &str) {
        if let Err(err) = self.create_record(peer_id, true).await {
            warn!(peer_id, error = %err, "failed to create record on join");
        }
    }

    /// Generation of the record for `peer_id`, creating one on first contact.
    async fn ensure_record(&mut self, peer_id: &str) -> Option<u64> {
        if let Some(record) = self.registry.get(peer_id) {
            return Some(record.generation);
        }
        debug!(peer_id, "first contact through signaling");
        if let Err(err) = self.create_record(peer_id, false).await {
            warn!(peer_id, error = %err, "failed to create record for signaling peer");
            return None;
        }
        self.registry.get(peer_id).map(|record| record.generation)
    }

    pub(crate) async fn on_negotiation_needed(&mut self, peer_id: &str, generation: u64) {
        let Some(record) = self.registry.current_mut(peer_id, generation) else {
            return;
        };
        // The channel is pre-negotiated and broken links are hard-reset, so
        // only a fresh record ever needs a local offer.
        if record.negotiation != NegotiationState::Idle {
            debug!(peer_id, state = ?record.negotiation, "negotiation already under way");
            return;
        }
        record.negotiation = NegotiationState::OfferPending;
        let connection = record.connection.clone();

        let outcome = make_offer(connection.as_ref()).await;
        let Some(record) = self.registry.current_mut(peer_id, generation) else {
            return;
        };
        match outcome {
            Ok(Some(offer)) => {
                record.negotiation = NegotiationState::AnswerPending;
                debug!(peer_id, generation, "sending offer");
                self.send_to(peer_id, &Notification::Description(offer), Transport::Auto)
                    .await;
            }
            Ok(None) => {
                debug!(peer_id, "remote offer arrived while offering; local offer abandoned");
                if record.negotiation == NegotiationState::OfferPending {
                    record.negotiation = NegotiationState::Idle;
                }
            }
            Err(err) => {
                warn!(peer_id, error = %err, "failed to create local offer");
                record.negotiation = NegotiationState::Idle;
                self.schedule_recovery(peer_id, generation, self.config.signaling_recovery_delay);
            }
        }
    }

    pub(crate) async fn on_remote_description(
        &mut self,
        peer_id: &str,
        description: SessionDescription,
    ) {
        let Some(mut generation) = self.ensure_record(peer_id).await else {
            return;
        };
        let settled = self
            .registry
            .get(peer_id)
            .is_some_and(|record| record.negotiation == NegotiationState::Stable);
        if description.is_offer() && settled {
            // Records negotiate once, so a new offer means the remote side
            // reset its connection. Follow it onto a fresh one.
            info!(peer_id, "offer on a settled connection; resetting to match remote");
            if let Err(err) = self.create_record(peer_id, true).await {
                warn!(peer_id, error = %err, "failed to recreate record for remote reset");
                return;
            }
            let Some(record) = self.registry.get(peer_id) else {
                return;
            };
            generation = record.generation;
        }
        let Some(record) = self.registry.current_mut(peer_id, generation) else {
            return;
        };
        let connection = record.connection.clone();
        let signaling = connection.signaling_state();
        let previous = record.negotiation;

        if description.is_offer() {
            let collision = previous == NegotiationState::OfferPending
                || previous == NegotiationState::AnswerPending
                || signaling != SignalingState::Stable;
            if collision && !is_polite(&self.local_id, peer_id) {
                debug!(peer_id, ?signaling, "offer collision; impolite side ignores remote offer");
                return;
            }
            let applied = if collision {
                info!(peer_id, ?signaling, "offer collision; rolling back local offer");
                record.negotiation = NegotiationState::Rollback;
                let (rolled_back, applied) = tokio::join!(
                    connection.rollback(),
                    connection.set_remote_description(description)
                );
                if let Err(err) = rolled_back {
                    debug!(peer_id, error = %err, "rollback reported an error");
                }
                applied
            } else {
                connection.set_remote_description(description).await
            };
            if let Err(err) = applied {
                self.negotiation_failed(peer_id, generation, previous, "apply remote offer", err);
                return;
            }
            self.flush_candidates(peer_id, generation).await;

            let answer = async {
                let answer = connection.create_answer().await?;
                connection.set_local_description(answer.clone()).await?;
                Ok::<_, ConnectionError>(answer)
            }
            .await;
            match answer {
                Ok(answer) => {
                    if let Some(record) = self.registry.current_mut(peer_id, generation) {
                        record.negotiation = NegotiationState::Stable;
                    }
                    debug!(peer_id, generation, "sending answer");
                    self.send_to(peer_id, &Notification::Description(answer), Transport::Auto)
                        .await;
                }
                Err(err) => {
                    self.negotiation_failed(peer_id, generation, previous, "answer remote offer", err)
                }
            }
            return;
        }

        if signaling != SignalingState::HaveLocalOffer {
            debug!(peer_id, kind = ?description.kind, ?signaling, "no local offer outstanding; ignoring description");
            return;
        }
        if let Err(err) = connection.set_remote_description(description).await {
            self.negotiation_failed(peer_id, generation, previous, "apply remote answer", err);
            return;
        }
        if let Some(record) = self.registry.current_mut(peer_id, generation) {
            record.negotiation = NegotiationState::Stable;
        }
        self.flush_candidates(peer_id, generation).await;
    }

    pub(crate) async fn on_remote_candidate(&mut self, peer_id: &str, candidate: IceCandidate) {
        let Some(record) = self.registry.get(peer_id) else {
            debug!(peer_id, "candidate for unknown peer dropped");
            return;
        };
        let connection = record.connection.clone();
        if !connection.has_remote_description().await {
            if let Some(record) = self.registry.get_mut(peer_id) {
                record.pending_candidates.push(candidate);
                debug!(peer_id, buffered = record.pending_candidates.len(), "candidate buffered");
            }
            return;
        }
        if let Err(err) = connection.add_ice_candidate(candidate).await {
            warn!(peer_id, error = %err, "failed to apply remote candidate");
        }
    }

    /// Apply buffered candidates in arrival order and empty the queue.
    async fn flush_candidates(&mut self, peer_id: &str, generation: u64) {
        let Some(record) = self.registry.current_mut(peer_id, generation) else {
            return;
        };
        let candidates = mem::take(&mut record.pending_candidates);
        if candidates.is_empty() {
            return;
        }
        let connection = record.connection.clone();
        debug!(peer_id, count = candidates.len(), "applying buffered candidates");
        for candidate in candidates {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                warn!(peer_id, error = %err, "failed to apply buffered candidate");
            }
        }
    }

    fn negotiation_failed(
        &mut self,
        peer_id: &str,
        generation: u64,
        previous: NegotiationState,
        step: &'static str,
        err: ConnectionError,
    ) {
        warn!(peer_id, step, error = %err, "negotiation step failed");
        if let Some(record) = self.registry.current_mut(peer_id, generation) {
            record.negotiation = previous;
        }
        self.schedule_recovery(peer_id, generation, self.config.signaling_recovery_delay);
    }
}

/// Create an offer and apply it, unless a remote offer got applied in the
/// meantime (`Ok(None)`).
async fn make_offer(
    connection: &dyn PeerConnection,
) -> Result<Option<SessionDescription>, ConnectionError> {
    let offer = connection.create_offer().await?;
    if connection.signaling_state() != SignalingState::Stable {
        return Ok(None);
    }
    connection.set_local_description(offer.clone()).await?;
    Ok(Some(offer))
}
