//! An established WAMP session.
//!
//! `Session` allocates request ids, tracks in-flight calls and router
//! subscriptions, and routes inbound messages. It is cheap to clone; all
//! clones refer to the same session. Once closed, every operation fails
//! with [`RealtimeError::SessionClosed`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::realtime::client::RealtimeError;
use crate::realtime::lock;
use crate::realtime::proto::{code, Dict, WampMessage};
use crate::realtime::subscription::{Notification, SubscriptionRegistry};

/// Reason sent when acknowledging a router-initiated GOODBYE.
pub const GOODBYE_AND_OUT: &str = "wamp.close.goodbye_and_out";

pub(crate) type CallReply = oneshot::Sender<Result<Value, RealtimeError>>;

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    outbound: Option<mpsc::UnboundedSender<WampMessage>>,
    next_request: u64,
    calls: HashMap<u64, CallReply>,
    pending_subscribes: HashMap<u64, String>,
    topics: HashMap<u64, String>,
    subscription_ids: HashMap<String, u64>,
}

impl SessionState {
    fn request_id(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }

    fn send(&self, message: WampMessage) -> Result<(), RealtimeError> {
        let outbound = self.outbound.as_ref().ok_or(RealtimeError::SessionClosed)?;
        outbound
            .send(message)
            .map_err(|_| RealtimeError::SessionClosed)
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscription_ids.contains_key(topic)
            || self.pending_subscribes.values().any(|pending| pending == topic)
    }
}

impl Session {
    pub(crate) fn new(id: u64, outbound: mpsc::UnboundedSender<WampMessage>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                state: Mutex::new(SessionState {
                    outbound: Some(outbound),
                    ..SessionState::default()
                }),
            }),
        }
    }

    /// Router-assigned session id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).outbound.is_none()
    }

    /// Publishes `args` on `topic`. No acknowledgement is requested.
    pub fn publish(
        &self,
        topic: &str,
        args: Vec<Value>,
        options: Dict,
    ) -> Result<(), RealtimeError> {
        let mut state = lock(&self.inner.state);
        let request = state.request_id();
        state.send(WampMessage::Publish {
            request,
            options,
            topic: topic.to_string(),
            args,
            kwargs: Dict::new(),
        })
    }

    /// Calls `procedure` with `args`. The receiver resolves with the remote
    /// result, the remote error, or `SessionClosed` if the session ends first.
    pub fn call(
        &self,
        procedure: &str,
        args: Vec<Value>,
    ) -> oneshot::Receiver<Result<Value, RealtimeError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.call_with(procedure, args, reply_tx);
        reply_rx
    }

    pub(crate) fn call_with(&self, procedure: &str, args: Vec<Value>, reply_tx: CallReply) {
        let mut state = lock(&self.inner.state);
        let request = state.request_id();
        let sent = state.send(WampMessage::Call {
            request,
            options: Dict::new(),
            procedure: procedure.to_string(),
            args,
            kwargs: Dict::new(),
        });

        match sent {
            Ok(()) => {
                state.calls.insert(request, reply_tx);
            }
            Err(err) => {
                drop(state);
                let _ = reply_tx.send(Err(err));
            }
        }
    }

    /// Subscribes to `topic` on the router unless already subscribed.
    pub(crate) fn subscribe(&self, topic: &str) -> Result<(), RealtimeError> {
        let mut state = lock(&self.inner.state);
        if state.is_subscribed(topic) {
            return Ok(());
        }
        let request = state.request_id();
        state.send(WampMessage::Subscribe {
            request,
            options: Dict::new(),
            topic: topic.to_string(),
        })?;
        state.pending_subscribes.insert(request, topic.to_string());
        Ok(())
    }

    /// Releases the router subscription on `topic`, if any.
    ///
    /// A subscribe still awaiting its acknowledgement is released when the
    /// acknowledgement arrives.
    pub(crate) fn unsubscribe(&self, topic: &str) -> Result<(), RealtimeError> {
        let mut state = lock(&self.inner.state);
        let Some(subscription) = state.subscription_ids.remove(topic) else {
            return Ok(());
        };
        state.topics.remove(&subscription);
        let request = state.request_id();
        state.send(WampMessage::Unsubscribe {
            request,
            subscription,
        })
    }

    /// Sends GOODBYE with `reason` and closes the session.
    pub(crate) fn goodbye(&self, reason: &str) -> Result<(), RealtimeError> {
        let sent = lock(&self.inner.state).send(WampMessage::goodbye(reason, "client closing"));
        self.close();
        sent
    }

    /// Drops the link and rejects in-flight calls.
    pub(crate) fn close(&self) {
        let calls = {
            let mut state = lock(&self.inner.state);
            state.outbound = None;
            state.pending_subscribes.clear();
            state.topics.clear();
            state.subscription_ids.clear();
            std::mem::take(&mut state.calls)
        };

        for (_, reply) in calls {
            let _ = reply.send(Err(RealtimeError::SessionClosed));
        }
    }

    /// Routes one inbound message. Returns the close reason when the router
    /// ended the session.
    pub(crate) fn handle(
        &self,
        message: WampMessage,
        registry: &SubscriptionRegistry,
    ) -> Option<String> {
        match message {
            WampMessage::Result {
                request,
                args,
                kwargs,
                ..
            } => {
                let reply = lock(&self.inner.state).calls.remove(&request);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Ok(call_result(args, kwargs)));
                    }
                    None => debug!(event = "realtime_result_unmatched", request),
                }
            }
            WampMessage::Error {
                request_type,
                request,
                error,
                args,
                kwargs,
                ..
            } => self.handle_error(request_type, request, error, args, kwargs),
            WampMessage::Subscribed {
                request,
                subscription,
            } => {
                let mut state = lock(&self.inner.state);
                let Some(topic) = state.pending_subscribes.remove(&request) else {
                    return None;
                };
                if registry.contains_topic(&topic) {
                    state.topics.insert(subscription, topic.clone());
                    state.subscription_ids.insert(topic, subscription);
                } else {
                    let request = state.request_id();
                    let _ = state.send(WampMessage::Unsubscribe {
                        request,
                        subscription,
                    });
                }
            }
            WampMessage::Event {
                subscription,
                publication,
                args,
                kwargs,
                ..
            } => {
                let topic = lock(&self.inner.state).topics.get(&subscription).cloned();
                match topic {
                    Some(topic) => {
                        registry.dispatch(Notification::new(topic, publication, args, kwargs));
                    }
                    None => debug!(event = "realtime_event_unmatched", subscription),
                }
            }
            WampMessage::Goodbye { reason, .. } => {
                let _ = lock(&self.inner.state)
                    .send(WampMessage::goodbye(GOODBYE_AND_OUT, "acknowledged"));
                self.close();
                return Some(reason);
            }
            WampMessage::Abort { reason, .. } => {
                self.close();
                return Some(reason);
            }
            WampMessage::Published { .. } | WampMessage::Unsubscribed { .. } => {}
            other => {
                debug!(
                    event = "realtime_message_ignored",
                    message_type = other.message_type()
                );
            }
        }
        None
    }

    fn handle_error(
        &self,
        request_type: u64,
        request: u64,
        error: String,
        args: Vec<Value>,
        kwargs: Dict,
    ) {
        let mut state = lock(&self.inner.state);
        match request_type {
            code::CALL => {
                let Some(reply) = state.calls.remove(&request) else {
                    return;
                };
                drop(state);
                let _ = reply.send(Err(RealtimeError::Remote {
                    error,
                    args,
                    kwargs,
                }));
            }
            code::SUBSCRIBE => {
                let topic = state.pending_subscribes.remove(&request);
                warn!(event = "realtime_subscribe_rejected", ?topic, error = %error);
            }
            _ => debug!(event = "realtime_request_failed", request_type, error = %error),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// A lone positional result is returned as-is; anything richer keeps its shape.
fn call_result(mut args: Vec<Value>, kwargs: Dict) -> Value {
    if kwargs.is_empty() {
        match args.len() {
            0 => return Value::Null,
            1 => return args.remove(0),
            _ => {}
        }
    }
    json!({ "args": args, "kwargs": kwargs })
}
