//! Public handle and the actor that owns every connection record.
//!
//! All state transitions run on one task: the [`Actor`] drains a single
//! command inbox fed by the public [`PeerManager`] handle, by connection
//! callbacks ([`crate::connection::EventSink`]), by timers and by request
//! handlers. The registry therefore needs no locking; ordering races between
//! peers are settled by the negotiation rules instead.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use relay_bus::{Envelope, Relay};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::connection::{ChannelSpec, ConnectionEvent, Connector};
use crate::error::{HandlerError, RequestError};
use crate::events::{PeerEvent, RemovalReason};
use crate::notification::Notification;
use crate::record::{PeerSnapshot, Registry};
use crate::requests::{InboundRequest, PendingRequests, RequestHandlers};

const EVENT_CAPACITY: usize = 256;

/// Which path an outbound notification takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Open data channel if there is one, relay otherwise.
    #[default]
    Auto,
    /// Always the relay.
    Relay,
    /// Data channel only; dropped when it is not open.
    Direct,
}

pub(crate) enum Command {
    Announce,
    Inbound {
        envelope: Envelope,
        via: Transport,
    },
    Connection {
        peer_id: String,
        generation: u64,
        event: ConnectionEvent,
    },
    NotifyClient {
        peer_id: String,
        name: String,
        payload: Value,
        transport: Transport,
    },
    NotifyAll {
        name: String,
        payload: Value,
        transport: Transport,
    },
    Request {
        peer_id: String,
        name: String,
        payload: Value,
        transport: Transport,
        reply: oneshot::Sender<Result<Value, RequestError>>,
    },
    RequestExpired {
        request_id: u64,
    },
    HandlerFinished {
        peer_id: String,
        request_id: u64,
        result: Value,
        via: Transport,
    },
    RemoveClient {
        peer_id: String,
    },
    CloseAll,
    ConnectedIds {
        reply: oneshot::Sender<Vec<String>>,
    },
    Snapshot {
        peer_id: String,
        reply: oneshot::Sender<Option<PeerSnapshot>>,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    RecoveryDue {
        peer_id: String,
        generation: u64,
    },
    EvictionDue {
        peer_id: String,
        generation: u64,
    },
    Stop,
}

pub struct PeerManagerBuilder {
    local_id: String,
    config: ManagerConfig,
    handlers: RequestHandlers,
}

impl PeerManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handlers(mut self, handlers: RequestHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Register the handler for inbound requests named `name`.
    pub fn handler<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.handlers.register(name, handler);
        self
    }

    /// Start the actor on the current tokio runtime.
    pub fn spawn(self, relay: Arc<dyn Relay>, connector: Arc<dyn Connector>) -> PeerManager {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let stopped = Arc::new(AtomicBool::new(false));
        let actor = Actor {
            local_id: self.local_id.clone(),
            channel_spec: ChannelSpec {
                id: self.config.channel_id,
                label: self.config.channel_label.clone(),
            },
            config: self.config,
            registry: Registry::default(),
            pending: PendingRequests::default(),
            handlers: Arc::new(self.handlers),
            relay,
            connector,
            commands: commands.clone(),
            events: events.clone(),
            stopped: stopped.clone(),
        };
        info!(local_id = %self.local_id, "peer manager started");
        tokio::spawn(actor.run(inbox));
        PeerManager {
            shared: Arc::new(Shared {
                local_id: self.local_id,
                commands,
                stopped,
                events,
            }),
        }
    }
}

struct Shared {
    local_id: String,
    commands: mpsc::UnboundedSender<Command>,
    stopped: Arc<AtomicBool>,
    events: broadcast::Sender<PeerEvent>,
}

/// Cloneable handle to a running manager.
#[derive(Clone)]
pub struct PeerManager {
    shared: Arc<Shared>,
}

impl PeerManager {
    pub fn builder(local_id: impl Into<String>) -> PeerManagerBuilder {
        PeerManagerBuilder {
            local_id: local_id.into(),
            config: ManagerConfig::default(),
            handlers: RequestHandlers::default(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.shared.commands.send(command).is_ok()
    }

    /// Announce this identity to the room; every receiver connects back.
    pub fn start(&self) {
        self.send(Command::Announce);
    }

    /// Feed an envelope received from the relay.
    pub fn handle_relay_envelope(&self, envelope: Envelope) {
        self.send(Command::Inbound {
            envelope,
            via: Transport::Relay,
        });
    }

    /// Pump a relay subscription into the manager until either side closes.
    pub fn follow(&self, mut receiver: broadcast::Receiver<Envelope>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if manager.is_stopped() {
                            break;
                        }
                        manager.handle_relay_envelope(envelope);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(local_id = %manager.local_id(), skipped, "relay subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn notify_client(
        &self,
        peer_id: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
        transport: Transport,
    ) {
        self.send(Command::NotifyClient {
            peer_id: peer_id.into(),
            name: name.into(),
            payload,
            transport,
        });
    }

    pub fn notify_all_clients(&self, name: impl Into<String>, payload: Value, transport: Transport) {
        self.send(Command::NotifyAll {
            name: name.into(),
            payload,
            transport,
        });
    }

    /// Send a named request to one peer and wait for its single reply.
    pub async fn request_client(
        &self,
        peer_id: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
        transport: Transport,
    ) -> Result<Value, RequestError> {
        let (reply, response) = oneshot::channel();
        let sent = self.send(Command::Request {
            peer_id: peer_id.into(),
            name: name.into(),
            payload,
            transport,
            reply,
        });
        if !sent {
            return Err(RequestError::Stopped);
        }
        response.await.unwrap_or(Err(RequestError::Stopped))
    }

    pub fn remove_client(&self, peer_id: impl Into<String>) {
        self.send(Command::RemoveClient {
            peer_id: peer_id.into(),
        });
    }

    pub fn close_all_connections(&self) {
        self.send(Command::CloseAll);
    }

    /// Peers whose connection currently reports `connected`.
    pub async fn connected_client_ids(&self) -> Vec<String> {
        let (reply, response) = oneshot::channel();
        if !self.send(Command::ConnectedIds { reply }) {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    pub async fn peer_snapshot(&self, peer_id: impl Into<String>) -> Option<PeerSnapshot> {
        let (reply, response) = oneshot::channel();
        let sent = self.send(Command::Snapshot {
            peer_id: peer_id.into(),
            reply,
        });
        if !sent {
            return None;
        }
        response.await.ok().flatten()
    }

    pub async fn pending_requests(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if !self.send(Command::PendingCount { reply }) {
            return 0;
        }
        response.await.unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    /// Shut the manager down. Every later call becomes a no-op; the actor
    /// announces the departure and closes all connections. Idempotent.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.commands.send(Command::Stop);
    }
}

pub(crate) struct Actor {
    pub(crate) local_id: String,
    pub(crate) config: ManagerConfig,
    pub(crate) channel_spec: ChannelSpec,
    pub(crate) registry: Registry,
    pub(crate) pending: PendingRequests,
    pub(crate) handlers: Arc<RequestHandlers>,
    pub(crate) relay: Arc<dyn Relay>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) events: broadcast::Sender<PeerEvent>,
    pub(crate) stopped: Arc<AtomicBool>,
}

impl Actor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.recv().await {
            if matches!(command, Command::Stop) {
                self.shutdown().await;
                break;
            }
            if self.is_stopped() {
                continue;
            }
            self.handle(command).await;
        }
        debug!(local_id = %self.local_id, "peer manager actor exited");
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Announce => {
                self.broadcast(Envelope::broadcast(&self.local_id, crate::notification::JOIN, Value::Null));
            }
            Command::Inbound { envelope, via } => self.dispatch_inbound(envelope, via).await,
            Command::Connection {
                peer_id,
                generation,
                event,
            } => self.on_connection_event(&peer_id, generation, event).await,
            Command::NotifyClient {
                peer_id,
                name,
                payload,
                transport,
            } => {
                if let Some(notification) = self.custom_notification(name, payload) {
                    self.send_to(&peer_id, &notification, transport).await;
                }
            }
            Command::NotifyAll {
                name,
                payload,
                transport,
            } => {
                if let Some(notification) = self.custom_notification(name, payload) {
                    self.send_to_all(&notification, transport).await;
                }
            }
            Command::Request {
                peer_id,
                name,
                payload,
                transport,
                reply,
            } => {
                self.start_request(peer_id, name, payload, transport, reply)
                    .await
            }
            Command::RequestExpired { request_id } => self.on_request_expired(request_id),
            Command::HandlerFinished {
                peer_id,
                request_id,
                result,
                via,
            } => self.on_handler_finished(&peer_id, request_id, result, via).await,
            Command::RemoveClient { peer_id } => {
                self.remove_record(&peer_id, RemovalReason::Local).await
            }
            Command::CloseAll => self.remove_all_records(RemovalReason::Local).await,
            Command::ConnectedIds { reply } => {
                let _ = reply.send(self.connected_ids());
            }
            Command::Snapshot { peer_id, reply } => {
                let _ = reply.send(self.registry.get(&peer_id).map(|record| record.snapshot()));
            }
            Command::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
            Command::RecoveryDue {
                peer_id,
                generation,
            } => self.on_recovery_due(&peer_id, generation).await,
            Command::EvictionDue {
                peer_id,
                generation,
            } => self.on_eviction_due(&peer_id, generation).await,
            Command::Stop => {}
        }
    }

    fn custom_notification(&self, name: String, payload: Value) -> Option<Notification> {
        if crate::notification::is_reserved(&name) {
            warn!(name = %name, "refusing to send a reserved notification name");
            return None;
        }
        Some(Notification::Custom { name, payload })
    }

    fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .values()
            .filter(|record| {
                record.connection.connection_state() == crate::connection::ConnectionState::Connected
            })
            .map(|record| record.peer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn publish(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    async fn shutdown(&mut self) {
        info!(local_id = %self.local_id, "peer manager stopping");
        self.relay_broadcast(Envelope::broadcast(
            &self.local_id,
            crate::notification::LEAVE,
            Value::Null,
        ));
        self.remove_all_records(RemovalReason::Local).await;
        // Dropping the reply senders resolves waiting callers with `Stopped`.
        self.pending.clear();
    }
}
