//! Signaling dispatcher: routes inbound envelopes by notification and picks
//! the path for outbound ones.

use relay_bus::Envelope;
use tracing::{debug, trace, warn};

use crate::connection::DataChannel;
use crate::error::ManagerError;
use crate::events::{PeerEvent, RemovalReason};
use crate::framing::{self, FrameConfig};
use crate::manager::{Actor, Transport};
use crate::notification::Notification;

impl Actor {
    pub(crate) async fn dispatch_inbound(&mut self, envelope: Envelope, via: Transport) {
        if !envelope.is_addressed_to(&self.local_id) {
            return;
        }
        self.log_traffic("inbound", &envelope, via);

        let notification = match Notification::from_envelope(&envelope) {
            Ok(notification) => notification,
            Err(err) => {
                warn!(
                    from = %envelope.from_client_id,
                    name = %envelope.notification_name,
                    error = %err,
                    "dropping malformed notification"
                );
                return;
            }
        };

        let from = envelope.from_client_id.as_str();
        match notification {
            Notification::Join => self.on_join(from).await,
            Notification::Leave => self.remove_record(from, RemovalReason::Left).await,
            Notification::Description(description) => {
                self.on_remote_description(from, description).await
            }
            Notification::Candidate(candidate) => self.on_remote_candidate(from, candidate).await,
            Notification::Request(body) => self.on_request(from, body, via),
            Notification::RequestResult(body) => self.on_request_result(from, body),
            Notification::Custom { .. } => self.publish(PeerEvent::Notification(envelope)),
        }
    }

    /// Deliver `notification` to one peer.
    ///
    /// Peers without a record are skipped whatever the transport. A closed
    /// channel arms the zombie check for any transport but `Relay`.
    pub(crate) async fn send_to(
        &mut self,
        peer_id: &str,
        notification: &Notification,
        transport: Transport,
    ) {
        if self.is_stopped() {
            return;
        }
        let Some(record) = self.registry.get(peer_id) else {
            debug!(peer_id, name = notification.name(), "no record for peer; dropping notification");
            return;
        };
        let channel = record.channel.clone();
        let envelope = match notification.to_envelope(&self.local_id, Some(peer_id)) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(peer_id, error = %err, "failed to encode notification");
                return;
            }
        };

        if transport != Transport::Relay {
            if channel.is_open() {
                self.log_traffic("direct", &envelope, Transport::Direct);
                match self.send_over_channel(channel.as_ref(), &envelope).await {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(peer_id, error = %err, "data channel send failed");
                        if transport == Transport::Direct {
                            return;
                        }
                    }
                }
            } else {
                self.arm_eviction(peer_id);
                if transport == Transport::Direct {
                    debug!(peer_id, "data channel not open; dropping direct notification");
                    return;
                }
            }
        }
        self.broadcast(envelope);
    }

    pub(crate) async fn send_to_all(&mut self, notification: &Notification, transport: Transport) {
        if self.is_stopped() {
            return;
        }
        if transport == Transport::Relay {
            match notification.to_envelope(&self.local_id, None) {
                Ok(envelope) => self.broadcast(envelope),
                Err(err) => warn!(error = %err, "failed to encode notification"),
            }
            return;
        }
        for peer_id in self.registry.peer_ids() {
            self.send_to(&peer_id, notification, transport).await;
        }
    }

    async fn send_over_channel(
        &self,
        channel: &dyn DataChannel,
        envelope: &Envelope,
    ) -> Result<(), ManagerError> {
        let frames = framing::encode_envelope(envelope, &FrameConfig::from(&self.config))?;
        for frame in frames {
            channel.send_text(frame).await?;
        }
        Ok(())
    }

    pub(crate) fn broadcast(&self, envelope: Envelope) {
        if self.is_stopped() {
            return;
        }
        self.relay_broadcast(envelope);
    }

    /// Relay send that ignores the stopped flag; only shutdown uses it directly.
    pub(crate) fn relay_broadcast(&self, envelope: Envelope) {
        self.log_traffic("relay", &envelope, Transport::Relay);
        if let Err(err) = self.relay.broadcast(envelope) {
            warn!(error = %err, "relay broadcast failed");
        }
    }

    pub(crate) fn log_traffic(&self, direction: &'static str, envelope: &Envelope, via: Transport) {
        if self.config.verbose {
            debug!(
                direction,
                ?via,
                from = %envelope.from_client_id,
                to = ?envelope.to_client_id,
                name = %envelope.notification_name,
                "envelope"
            );
        } else {
            trace!(
                direction,
                ?via,
                from = %envelope.from_client_id,
                to = ?envelope.to_client_id,
                name = %envelope.notification_name,
                "envelope"
            );
        }
    }

    pub(crate) fn decode_channel_text(&self, peer_id: &str, text: &str) -> Option<Envelope> {
        match framing::decode_envelope(text) {
            Ok(envelope) if envelope.from_client_id == peer_id => Some(envelope),
            Ok(envelope) => {
                warn!(
                    peer_id,
                    claimed = %envelope.from_client_id,
                    "channel envelope claims a different sender; dropping"
                );
                None
            }
            Err(err) => {
                warn!(peer_id, error = %err, "failed to decode channel message");
                None
            }
        }
    }
}
