//! Request/response on top of notifications.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{HandlerError, RequestError};
use crate::manager::{Actor, Command, Transport};
use crate::notification::{Notification, RequestBody, RequestResultBody};
use crate::timer::Timer;

/// An inbound request as seen by a host handler.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub from_client_id: String,
    pub payload: Value,
}

pub type RequestHandler =
    Arc<dyn Fn(InboundRequest) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Host handlers for inbound requests, keyed by request name.
#[derive(Clone, Default)]
pub struct RequestHandlers {
    handlers: HashMap<String, RequestHandler>,
}

impl RequestHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |request| handler(request).boxed());
        self.handlers.insert(name.into(), handler);
    }

    pub fn with<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<RequestHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub(crate) struct PendingRequest {
    peer_id: String,
    name: String,
    reply: oneshot::Sender<Result<Value, RequestError>>,
    timeout: Timer,
}

/// Outstanding outbound requests. Ids are process-local and never reused.
#[derive(Default)]
pub(crate) struct PendingRequests {
    next_id: u64,
    entries: HashMap<u64, PendingRequest>,
}

impl PendingRequests {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert(&mut self, request_id: u64, request: PendingRequest) {
        self.entries.insert(request_id, request);
    }

    fn take(&mut self, request_id: u64) -> Option<PendingRequest> {
        self.entries.remove(&request_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry; waiting callers see their reply sender go away.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Actor {
    pub(crate) async fn start_request(
        &mut self,
        peer_id: String,
        name: String,
        payload: Value,
        transport: Transport,
        reply: oneshot::Sender<Result<Value, RequestError>>,
    ) {
        if !self.registry.contains(&peer_id) {
            debug!(peer_id = %peer_id, name = %name, "request for unknown peer");
            let _ = reply.send(Err(RequestError::UnknownPeer(peer_id)));
            return;
        }

        let request_id = self.pending.allocate_id();
        let timeout = Timer::schedule(
            &self.commands,
            self.config.request_timeout,
            Command::RequestExpired { request_id },
        );
        let notification = Notification::Request(RequestBody {
            request_id,
            request_name: name.clone(),
            request_payload: payload,
        });
        self.pending.insert(
            request_id,
            PendingRequest {
                peer_id: peer_id.clone(),
                name,
                reply,
                timeout,
            },
        );
        self.send_to(&peer_id, &notification, transport).await;
    }

    pub(crate) fn on_request_result(&mut self, from: &str, body: RequestResultBody) {
        let Some(pending) = self.pending.entries.get(&body.request_id) else {
            debug!(from, request_id = body.request_id, "result for unknown or expired request");
            return;
        };
        if pending.peer_id != from {
            warn!(
                from,
                expected = %pending.peer_id,
                request_id = body.request_id,
                "request result from unexpected peer"
            );
            return;
        }
        let Some(pending) = self.pending.take(body.request_id) else {
            return;
        };
        pending.timeout.cancel();
        let _ = pending.reply.send(Ok(body.result));
    }

    pub(crate) fn on_request_expired(&mut self, request_id: u64) {
        let Some(pending) = self.pending.take(request_id) else {
            return;
        };
        warn!(peer_id = %pending.peer_id, name = %pending.name, request_id, "request timed out");
        let _ = pending.reply.send(Err(RequestError::Timeout {
            peer_id: pending.peer_id,
            name: pending.name,
        }));
    }

    /// Run the host handler on its own task so it can call back into the
    /// manager; the result comes back as [`Command::HandlerFinished`].
    pub(crate) fn on_request(&mut self, from: &str, body: RequestBody, via: Transport) {
        let handler = self.handlers.get(&body.request_name);
        let commands = self.commands.clone();
        let peer_id = from.to_string();
        let request = InboundRequest {
            from_client_id: peer_id.clone(),
            payload: body.request_payload,
        };
        let name = body.request_name;
        let request_id = body.request_id;
        tokio::spawn(async move {
            let result = match handler {
                Some(handler) => match handler(request).await {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(peer_id = %peer_id, name = %name, error = %err, "request handler failed");
                        Value::Null
                    }
                },
                None => {
                    warn!(peer_id = %peer_id, name = %name, "no handler for request");
                    Value::Null
                }
            };
            let _ = commands.send(Command::HandlerFinished {
                peer_id,
                request_id,
                result,
                via,
            });
        });
    }

    /// Reply on the path the request came in on: relay requests get relay
    /// replies, channel requests prefer the channel.
    pub(crate) async fn on_handler_finished(
        &mut self,
        peer_id: &str,
        request_id: u64,
        result: Value,
        via: Transport,
    ) {
        let transport = match via {
            Transport::Relay => Transport::Relay,
            Transport::Auto | Transport::Direct => Transport::Auto,
        };
        let notification = Notification::RequestResult(RequestResultBody { request_id, result });
        self.send_to(peer_id, &notification, transport).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handlers_are_looked_up_by_name() {
        let handlers = RequestHandlers::new()
            .with("echo", |request: InboundRequest| async move { Ok(request.payload) })
            .with("fail", |_| async { Err(HandlerError::new("nope")) });
        assert_eq!(handlers.len(), 2);
        assert!(handlers.get("missing").is_none());

        let echo = handlers.get("echo").expect("echo handler");
        let result = futures::executor::block_on(echo(InboundRequest {
            from_client_id: "alice".into(),
            payload: json!({"n": 1}),
        }))
        .expect("echo succeeds");
        assert_eq!(result, json!({"n": 1}));

        let fail = handlers.get("fail").expect("fail handler");
        let err = futures::executor::block_on(fail(InboundRequest {
            from_client_id: "alice".into(),
            payload: Value::Null,
        }))
        .expect_err("fail handler errors");
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn request_ids_increase() {
        let mut pending = PendingRequests::default();
        let first = pending.allocate_id();
        let second = pending.allocate_id();
        assert!(second > first);
        assert_eq!(pending.len(), 0);
    }
}
