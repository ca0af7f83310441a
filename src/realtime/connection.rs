//! One physical realtime connection per application.
//!
//! The handle owns a background worker that connects, performs the WAMP
//! handshake, and reconnects after a fixed delay whenever the session ends.
//! Callers never wait on the connection directly: operations are queued
//! behind a session slot and released in issue order when a session opens.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::realtime::client::RealtimeError;
use crate::realtime::lock;
use crate::realtime::proto::WampMessage;
use crate::realtime::session::Session;
use crate::realtime::subscription::{Subscription, SubscriptionDescriptor, SubscriptionRegistry};
use crate::realtime::transport::{ConnectParams, Connector, Link};
use crate::retry::with_timeout;

/// Realm every application joins.
pub const DEFAULT_REALM: &str = "default";
/// Delay between a session ending and the next connection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Close reason used for an orderly client shutdown.
pub const CLOSE_NORMAL: &str = "wamp.close.normal";

/// Tuning for realtime connections.
#[derive(Clone, Debug)]
pub struct RealtimeOptions {
    /// WAMP realm to join.
    pub realm: String,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Upper bound on how long `call` and `session` wait. `None` waits
    /// until a session opens.
    pub session_timeout: Option<Duration>,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            realm: DEFAULT_REALM.to_string(),
            reconnect_delay: RECONNECT_DELAY,
            session_timeout: None,
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// What happened to an operation handed to [`ConnectionHandle::with_session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// Ran against the open session.
    Dispatched,
    /// Waiting for the next session to open.
    Queued,
    /// Dropped because the connection was closed for good.
    Discarded,
}

type SessionOp = Box<dyn FnOnce(&Session) + Send>;

enum SessionSlot {
    Pending(VecDeque<SessionOp>),
    Ready(Session),
}

impl SessionSlot {
    fn pending() -> Self {
        Self::Pending(VecDeque::new())
    }
}

/// Shared handle to one application's connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    app_id: String,
    params: ConnectParams,
    options: RealtimeOptions,
    slot: Mutex<SessionSlot>,
    state: watch::Sender<ConnectionState>,
    closing: watch::Sender<Option<String>>,
    subscriptions: SubscriptionRegistry,
}

enum SessionOutcome {
    Shutdown,
    Reconnect(String),
}

impl ConnectionHandle {
    /// Creates the handle and starts connecting in the background.
    pub(crate) fn start(
        app_id: String,
        params: ConnectParams,
        options: RealtimeOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (closing, closing_rx) = watch::channel(None);
        let inner = Arc::new(HandleInner {
            app_id,
            params,
            options,
            slot: Mutex::new(SessionSlot::pending()),
            state,
            closing,
            subscriptions: SubscriptionRegistry::default(),
        });

        inner.set_state(ConnectionState::Connecting);
        tokio::spawn(connection_worker(Arc::clone(&inner), connector, closing_rx));

        Self { inner }
    }

    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    pub fn params(&self) -> &ConnectParams {
        &self.inner.params
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Waits until the connection reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// True when both handles share one physical connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs `op` against the open session, or queues it for the next one.
    ///
    /// Queued operations run in issue order as soon as a session opens. `op`
    /// runs with the session slot locked and must not call back into the
    /// handle.
    pub fn with_session<F>(&self, op: F) -> SendStatus
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        let mut slot = lock(&self.inner.slot);
        if self.inner.closing.borrow().is_some() {
            return SendStatus::Discarded;
        }
        match &mut *slot {
            SessionSlot::Ready(session) => {
                op(session);
                SendStatus::Dispatched
            }
            SessionSlot::Pending(queue) => {
                queue.push_back(Box::new(op));
                SendStatus::Queued
            }
        }
    }

    /// Resolves with the current session once one is open.
    pub async fn session(&self) -> Result<Session, RealtimeError> {
        let (tx, rx) = oneshot::channel();
        self.with_session(move |session| {
            let _ = tx.send(session.clone());
        });
        self.bounded(async { rx.await.map_err(|_| RealtimeError::SessionClosed) })
            .await
    }

    /// Calls `procedure` on the router once a session is open.
    pub async fn call(&self, procedure: &str, args: Vec<Value>) -> Result<Value, RealtimeError> {
        let (tx, rx) = oneshot::channel();
        let procedure = procedure.to_string();
        self.with_session(move |session| session.call_with(&procedure, args, tx));
        self.bounded(async {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(RealtimeError::SessionClosed),
            }
        })
        .await
    }

    /// Registers `descriptor` and subscribes its topic on the router.
    ///
    /// The registration outlives reconnects until the returned handle is
    /// unsubscribed.
    pub fn subscribe(&self, descriptor: SubscriptionDescriptor) -> Subscription {
        let topic = descriptor.topic().to_string();
        let id = self.inner.subscriptions.insert(descriptor);

        let router_topic = topic.clone();
        self.with_session(move |session| {
            if let Err(err) = session.subscribe(&router_topic) {
                debug!(event = "realtime_subscribe_deferred", topic = %router_topic, error = %err);
            }
        });

        Subscription::new(id, topic, self.clone())
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        let Some((topic, last)) = self.inner.subscriptions.remove(id) else {
            return;
        };
        if !last {
            return;
        }
        if let SessionSlot::Ready(session) = &*lock(&self.inner.slot) {
            if let Err(err) = session.unsubscribe(&topic) {
                debug!(event = "realtime_unsubscribe_skipped", topic = %topic, error = %err);
            }
        }
    }

    /// Ends the session with GOODBYE(`reason`) and stops reconnecting.
    ///
    /// Queued operations are dropped; their awaiting callers fail with
    /// `SessionClosed`.
    pub fn close(&self, reason: &str) -> Result<(), RealtimeError> {
        let dropped = {
            let mut slot = lock(&self.inner.slot);
            let previous = self.inner.closing.send_replace(Some(reason.to_string()));
            if previous.is_some() {
                return Err(RealtimeError::SessionClosed);
            }
            match &mut *slot {
                SessionSlot::Pending(queue) => std::mem::take(queue),
                SessionSlot::Ready(_) => VecDeque::new(),
            }
        };

        debug!(
            event = "realtime_connection_closing",
            app_id = %self.inner.app_id,
            reason,
            dropped_ops = dropped.len()
        );
        Ok(())
    }

    async fn bounded<T, Fut>(&self, future: Fut) -> Result<T, RealtimeError>
    where
        Fut: std::future::Future<Output = Result<T, RealtimeError>>,
    {
        match self.inner.options.session_timeout {
            Some(timeout) => with_timeout(timeout, future)
                .await
                .map_err(|_| RealtimeError::SessionTimeout)?,
            None => future.await,
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("app_id", &self.inner.app_id)
            .field("url", &self.inner.params.url)
            .field("state", &self.state())
            .finish()
    }
}

impl HandleInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    // Installs the new session, releases queued operations in order, then
    // restores router subscriptions the queue did not already cover.
    fn open(&self, session: &Session) {
        let mut slot = lock(&self.slot);
        let queued = match std::mem::replace(&mut *slot, SessionSlot::Ready(session.clone())) {
            SessionSlot::Pending(queue) => queue,
            SessionSlot::Ready(stale) => {
                stale.close();
                VecDeque::new()
            }
        };

        for op in queued {
            op(session);
        }
        for topic in self.subscriptions.topics() {
            if let Err(err) = session.subscribe(&topic) {
                warn!(event = "realtime_resubscribe_failed", topic = %topic, error = %err);
            }
        }
        drop(slot);

        self.set_state(ConnectionState::Open);
    }

    fn reset_slot(&self) {
        let mut slot = lock(&self.slot);
        if let SessionSlot::Ready(session) = &*slot {
            session.close();
            *slot = SessionSlot::pending();
        }
    }
}

async fn connection_worker(
    inner: Arc<HandleInner>,
    connector: Arc<dyn Connector>,
    mut closing: watch::Receiver<Option<String>>,
) {
    loop {
        if closing.borrow_and_update().is_some() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);

        let outcome = run_session(&inner, connector.as_ref(), &mut closing).await;
        inner.reset_slot();
        inner.set_state(ConnectionState::Closed);

        match outcome {
            SessionOutcome::Shutdown => break,
            SessionOutcome::Reconnect(reason) => {
                info!(
                    event = "realtime_connection_lost",
                    app_id = %inner.app_id,
                    reason = %reason,
                    retry_in_ms = inner.options.reconnect_delay.as_millis() as u64
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.options.reconnect_delay) => {}
            _ = closing.changed() => {}
        }
    }

    info!(event = "realtime_connection_closed", app_id = %inner.app_id);
}

async fn run_session(
    inner: &HandleInner,
    connector: &dyn Connector,
    closing: &mut watch::Receiver<Option<String>>,
) -> SessionOutcome {
    let link = tokio::select! {
        result = connector.connect(&inner.params) => match result {
            Ok(link) => link,
            Err(err) => return SessionOutcome::Reconnect(err.to_string()),
        },
        _ = closing.changed() => return SessionOutcome::Shutdown,
    };
    let Link {
        outbound,
        mut inbound,
    } = link;

    if outbound
        .send(WampMessage::hello(inner.params.realm.clone()))
        .is_err()
    {
        return SessionOutcome::Reconnect("link closed before HELLO".to_string());
    }

    let session_id = loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(WampMessage::Welcome { session, .. }) => break session,
                Some(WampMessage::Abort { reason, .. }) => {
                    return SessionOutcome::Reconnect(format!("aborted: {reason}"));
                }
                Some(other) => {
                    return SessionOutcome::Reconnect(format!(
                        "unexpected message type {} before WELCOME",
                        other.message_type()
                    ));
                }
                None => return SessionOutcome::Reconnect("link closed before WELCOME".to_string()),
            },
            _ = closing.changed() => return SessionOutcome::Shutdown,
        }
    };

    let session = Session::new(session_id, outbound);
    inner.open(&session);
    info!(
        event = "realtime_session_open",
        app_id = %inner.app_id,
        session_id
    );

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    if let Some(reason) = session.handle(message, &inner.subscriptions) {
                        return SessionOutcome::Reconnect(reason);
                    }
                }
                None => {
                    session.close();
                    return SessionOutcome::Reconnect("link closed".to_string());
                }
            },
            _ = closing.changed() => {
                let reason = closing
                    .borrow_and_update()
                    .clone()
                    .unwrap_or_else(|| CLOSE_NORMAL.to_string());
                if let Err(err) = session.goodbye(&reason) {
                    debug!(event = "realtime_goodbye_not_sent", error = %err);
                }
                return SessionOutcome::Shutdown;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Instant};

    use super::*;
    use crate::realtime::proto::Dict;
    use crate::realtime::transport::testing::{next_router, MockConnector, RouterSide};

    fn params() -> ConnectParams {
        ConnectParams {
            url: "ws://router.test/ws".to_string(),
            realm: DEFAULT_REALM.to_string(),
        }
    }

    fn start(
        connector: MockConnector,
        options: RealtimeOptions,
    ) -> ConnectionHandle {
        ConnectionHandle::start("app1".to_string(), params(), options, Arc::new(connector))
    }

    fn publish(handle: &ConnectionHandle, topic: &'static str) -> SendStatus {
        handle.with_session(move |session| {
            let _ = session.publish(topic, vec![json!(topic)], Dict::new());
        })
    }

    async fn expect_subscribe(router: &mut RouterSide) -> (u64, String) {
        match router.expect().await {
            WampMessage::Subscribe { request, topic, .. } => (request, topic),
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_operations_run_in_issue_order_once_open() {
        let (connector, mut routers) = MockConnector::new();
        let handle = start(connector, RealtimeOptions::default());
        assert_eq!(handle.state(), ConnectionState::Connecting);

        assert_eq!(publish(&handle, "t1"), SendStatus::Queued);
        assert_eq!(publish(&handle, "t2"), SendStatus::Queued);
        assert_eq!(publish(&handle, "t3"), SendStatus::Queued);

        let mut router = next_router(&mut routers).await;
        router.accept(1).await;

        for expected in ["t1", "t2", "t3"] {
            match router.expect().await {
                WampMessage::Publish { topic, .. } => assert_eq!(topic, expected),
                other => panic!("expected PUBLISH, got {other:?}"),
            }
        }

        handle.wait_for(ConnectionState::Open).await;
        assert_eq!(publish(&handle, "t4"), SendStatus::Dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_publishes_and_subscribes_keep_issue_order() {
        let (connector, mut routers) = MockConnector::new();
        let handle = start(connector, RealtimeOptions::default());

        assert_eq!(publish(&handle, "first-publish"), SendStatus::Queued);
        let topics: Vec<String> = (0..8).map(|n| format!("app1.t{n}.create")).collect();
        let _subscriptions: Vec<_> = topics
            .iter()
            .map(|topic| handle.subscribe(SubscriptionDescriptor::new(topic.clone(), |_| {})))
            .collect();
        assert_eq!(publish(&handle, "last-publish"), SendStatus::Queued);

        let mut router = next_router(&mut routers).await;
        router.accept(1).await;

        let mut seen = Vec::new();
        for _ in 0..10 {
            match router.expect().await {
                WampMessage::Publish { topic, .. } => seen.push(format!("PUBLISH:{topic}")),
                WampMessage::Subscribe { topic, .. } => seen.push(topic),
                other => panic!("unexpected {other:?}"),
            }
        }

        let mut expected = vec!["PUBLISH:first-publish".to_string()];
        expected.extend(topics);
        expected.push("PUBLISH:last-publish".to_string());
        assert_eq!(seen, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_fixed_delay() {
        let (connector, mut routers) = MockConnector::new();
        let handle = start(connector, RealtimeOptions::default());

        let mut router = next_router(&mut routers).await;
        router.accept(1).await;
        handle.wait_for(ConnectionState::Open).await;

        drop(router);
        handle.wait_for(ConnectionState::Closed).await;
        let closed_at = Instant::now();

        assert!(timeout(
            Duration::from_millis(1999),
            handle.wait_for(ConnectionState::Connecting)
        )
        .await
        .is_err());
        handle.wait_for(ConnectionState::Connecting).await;
        let waited = closed_at.elapsed();
        assert!(waited >= RECONNECT_DELAY, "reconnected after {waited:?}");
        assert!(waited < RECONNECT_DELAY + Duration::from_millis(100));

        let mut router = next_router(&mut routers).await;
        router.accept(2).await;
        handle.wait_for(ConnectionState::Open).await;
        assert_eq!(handle.session().await.expect("session").id(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_is_retried() {
        let (connector, mut routers) = MockConnector::scripted([false]);
        let handle = start(connector, RealtimeOptions::default());

        let mut router = next_router(&mut routers).await;
        router.accept(3).await;
        handle.wait_for(ConnectionState::Open).await;
        assert_eq!(handle.session().await.expect("session").id(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_survive_reconnects() {
        let (connector, mut routers) = MockConnector::new();
        let handle = start(connector, RealtimeOptions::default());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let _subscription = handle.subscribe(SubscriptionDescriptor::new(
            "app1.todos.create",
            move |notification| {
                let _ = seen_tx.send(notification.publication);
            },
        ));

        let mut router = next_router(&mut routers).await;
        router.accept(1).await;
        let (request, topic) = expect_subscribe(&mut router).await;
        assert_eq!(topic, "app1.todos.create");
        router.send(WampMessage::Subscribed {
            request,
            subscription: 10,
        });
        drop(router);

        let mut router = next_router(&mut routers).await;
        router.accept(2).await;
        let (request, topic) = expect_subscribe(&mut router).await;
        assert_eq!(topic, "app1.todos.create");
        router.send(WampMessage::Subscribed {
            request,
            subscription: 11,
        });
        router.send(WampMessage::Event {
            subscription: 11,
            publication: 77,
            details: Dict::new(),
            args: vec![json!("{}")],
            kwargs: Dict::new(),
        });

        assert_eq!(seen_rx.recv().await, Some(77));
    }

    #[tokio::test]
    async fn unsubscribe_releases_router_subscription() {
        let (connector, mut routers) = MockConnector::new();
        let handle = start(connector, RealtimeOptions::default());
        let subscription =
            handle.subscribe(SubscriptionDescriptor::new("app1.todos.delete", |_| {}));

        let mut router = next_router(&mut routers).await;
        router.accept(1).await;
        let (request, _) = expect_subscribe(&mut router).await;
        router.send(WampMessage::Subscribed {
            request,
            subscription: 4,
        });
        // Round-trip a call so the acknowledgement is processed first.
        let caller = tokio::spawn({
            let handle = handle.clone();
            async move { handle.call("data.read", Vec::new()).await }
        });
        match router.expect().await {
            WampMessage::Call { request, .. } => router.send(WampMessage::Result {
                request,
                details: Dict::new(),
                args: Vec::new(),
                kwargs: Dict::new(),
            }),
            other => panic!("expected CALL, got {other:?}"),
        }
        caller.await.expect("join").expect("call");

        subscription.unsubscribe();
        match router.expect().await {
            WampMessage::Unsubscribe { subscription, .. } => assert_eq!(subscription, 4),
            other => panic!("expected UNSUBSCRIBE, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn calls_in_flight_fail_when_session_drops() {
        let (connector, mut routers) = MockConnector::new();
        let handle = start(connector, RealtimeOptions::default());
        let mut router = next_router(&mut routers).await;
        router.accept(1).await;

        let caller = tokio::spawn({
            let handle = handle.clone();
            async move { handle.call("data.read", vec![json!("{}")]).await }
        });
        assert!(matches!(router.expect().await, WampMessage::Call { .. }));
        drop(router);

        let result = caller.await.expect("join");
        assert!(matches!(result, Err(RealtimeError::SessionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn session_timeout_bounds_waiting_callers() {
        let (connector, _routers) = MockConnector::new();
        let options = RealtimeOptions {
            session_timeout: Some(Duration::from_secs(5)),
            ..RealtimeOptions::default()
        };
        let handle = start(connector, options);

        let started = Instant::now();
        let err = handle.session().await.expect_err("no session opens");
        assert!(matches!(err, RealtimeError::SessionTimeout));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn close_sends_goodbye_and_stops_reconnecting() {
        let (connector, mut routers) = MockConnector::new();
        let handle = start(connector, RealtimeOptions::default());
        let mut router = next_router(&mut routers).await;
        router.accept(1).await;
        handle.wait_for(ConnectionState::Open).await;

        handle.close(CLOSE_NORMAL).expect("first close");
        match router.expect().await {
            WampMessage::Goodbye { reason, .. } => assert_eq!(reason, CLOSE_NORMAL),
            other => panic!("expected GOODBYE, got {other:?}"),
        }
        handle.wait_for(ConnectionState::Closed).await;

        assert!(handle.close(CLOSE_NORMAL).is_err());
        assert_eq!(publish(&handle, "late"), SendStatus::Discarded);
        assert!(matches!(
            timeout(Duration::from_secs(10), routers.recv()).await,
            Ok(None) | Err(_)
        ));
    }

    #[tokio::test]
    async fn close_before_open_fails_queued_callers() {
        let (connector, _routers) = MockConnector::new();
        let handle = start(connector, RealtimeOptions::default());

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.session().await }
        });
        tokio::task::yield_now().await;
        handle.close(CLOSE_NORMAL).expect("close");

        assert!(matches!(
            waiter.await.expect("join"),
            Err(RealtimeError::SessionClosed)
        ));
    }
}
