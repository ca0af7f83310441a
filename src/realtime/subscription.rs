//! Subscription descriptors, cancellable handles, and local dispatch.
//!
//! The router sees at most one subscription per topic and session; any
//! number of local handlers can hang off that topic. Handlers live in the
//! connection's registry so they survive reconnects.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::realtime::connection::ConnectionHandle;
use crate::realtime::envelope::{Envelope, MessageOp};
use crate::realtime::lock;
use crate::realtime::proto::Dict;

type Handler = Arc<dyn Fn(Notification) + Send + Sync>;
type Filter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Inbound event delivered to subscription handlers.
#[derive(Clone, Debug)]
pub struct Notification {
    /// Topic the handler subscribed to.
    pub topic: String,
    /// Router-assigned publication id.
    pub publication: u64,
    /// Decoded envelope when the first positional argument carries one.
    pub envelope: Option<Envelope>,
    pub args: Vec<Value>,
    pub kwargs: Dict,
}

impl Notification {
    pub(crate) fn new(topic: String, publication: u64, args: Vec<Value>, kwargs: Dict) -> Self {
        let envelope = args.first().and_then(decode_envelope);
        Self {
            topic,
            publication,
            envelope,
            args,
            kwargs,
        }
    }
}

// Publishers send the envelope as a JSON string; tolerate a bare object too.
fn decode_envelope(value: &Value) -> Option<Envelope> {
    match value {
        Value::String(text) => Envelope::from_text(text).ok(),
        Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}

/// What to listen to and how to handle it.
#[derive(Clone)]
pub struct SubscriptionDescriptor {
    topic: String,
    op: Option<MessageOp>,
    filter: Option<Filter>,
    handler: Handler,
}

impl SubscriptionDescriptor {
    pub fn new<F>(topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        Self {
            topic: topic.into(),
            op: None,
            filter: None,
            handler: Arc::new(handler),
        }
    }

    /// Only deliver notifications whose envelope carries `op`.
    pub fn with_op(mut self, op: MessageOp) -> Self {
        self.op = Some(op);
        self
    }

    /// Only deliver notifications whose envelope satisfies `filter`.
    pub fn with_filter<P>(mut self, filter: P) -> Self
    where
        P: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn op(&self) -> Option<MessageOp> {
        self.op
    }

    fn accepts(&self, notification: &Notification) -> bool {
        if self.op.is_none() && self.filter.is_none() {
            return true;
        }
        let Some(envelope) = notification.envelope.as_ref() else {
            return false;
        };
        if self.op.is_some_and(|op| op != envelope.op) {
            return false;
        }
        self.filter.as_ref().map_or(true, |filter| filter(envelope))
    }
}

impl fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("topic", &self.topic)
            .field("op", &self.op)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Handle to a registered subscription.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to stop delivery.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: String,
    connection: ConnectionHandle,
}

impl Subscription {
    pub(crate) fn new(id: u64, topic: String, connection: ConnectionHandle) -> Self {
        Self {
            id,
            topic,
            connection,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes the handler. The router subscription is released once no
    /// other local handler listens on the topic.
    pub fn unsubscribe(self) {
        self.connection.unsubscribe(self.id);
    }
}

/// Local handlers keyed by topic.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    by_topic: HashMap<String, Vec<(u64, Arc<SubscriptionDescriptor>)>>,
    // Topics in first-registration order.
    order: Vec<String>,
}

impl SubscriptionRegistry {
    /// Adds a descriptor and returns its local id.
    pub(crate) fn insert(&self, descriptor: SubscriptionDescriptor) -> u64 {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        if !state.by_topic.contains_key(&descriptor.topic) {
            state.order.push(descriptor.topic.clone());
        }
        state
            .by_topic
            .entry(descriptor.topic.clone())
            .or_default()
            .push((id, Arc::new(descriptor)));
        id
    }

    /// Removes a descriptor. Returns its topic and whether it was the last
    /// handler on that topic.
    pub(crate) fn remove(&self, id: u64) -> Option<(String, bool)> {
        let mut state = lock(&self.state);
        let topic = state
            .by_topic
            .iter()
            .find_map(|(topic, entries)| {
                entries
                    .iter()
                    .any(|(entry_id, _)| *entry_id == id)
                    .then(|| topic.clone())
            })?;

        let entries = state.by_topic.get_mut(&topic)?;
        entries.retain(|(entry_id, _)| *entry_id != id);
        let last = entries.is_empty();
        if last {
            state.by_topic.remove(&topic);
            state.order.retain(|kept| kept != &topic);
        }
        Some((topic, last))
    }

    pub(crate) fn contains_topic(&self, topic: &str) -> bool {
        lock(&self.state).by_topic.contains_key(topic)
    }

    /// Live topics in the order they were first registered.
    pub(crate) fn topics(&self) -> Vec<String> {
        lock(&self.state).order.clone()
    }

    /// Runs every accepting handler on `topic`, in registration order.
    pub(crate) fn dispatch(&self, notification: Notification) {
        // Handlers may register or cancel subscriptions, so run them unlocked.
        let handlers: Vec<Arc<SubscriptionDescriptor>> = lock(&self.state)
            .by_topic
            .get(&notification.topic)
            .map(|entries| entries.iter().map(|(_, desc)| Arc::clone(desc)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(
                event = "realtime_event_without_handler",
                topic = %notification.topic
            );
            return;
        }

        for descriptor in handlers {
            if descriptor.accepts(&notification) {
                (descriptor.handler)(notification.clone());
            }
        }
    }
}
