//! Per-application realtime facade.
//!
//! A `RealtimeClient` combines an [`AppConfig`], an optional data type and
//! the application's shared [`ConnectionHandle`]. Clients are cheap: build
//! as many as needed, they all ride the same physical connection.
//!
//! ```no_run
//! use neutrino_sdk::config::AppConfig;
//! use neutrino_sdk::realtime::{ConnectionManager, RealtimeClient, RealtimeOptions};
//! use secrecy::SecretString;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), neutrino_sdk::realtime::RealtimeError> {
//! let manager = ConnectionManager::new(RealtimeOptions::default());
//! let config = AppConfig::new("app1", SecretString::new("token".to_string()));
//! let todos = RealtimeClient::for_data_type(&manager, config, "todos");
//!
//! let _sub = todos.on_create_message(None, None, |notification| {
//!     println!("created: {:?}", notification.envelope);
//! })?;
//! todos.send_create(json!({"id": "x1", "title": "write docs"}), None)?;
//! let all = todos.call_read(json!({}), None, None).await?;
//! println!("{all}");
//! # Ok(())
//! # }
//! ```

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::AppConfig;
use crate::realtime::connection::{ConnectionHandle, SendStatus};
use crate::realtime::envelope::{Envelope, EnvelopeBuilder, MessageOp};
use crate::realtime::manager::ConnectionManager;
use crate::realtime::proto::Dict;
use crate::realtime::subscription::{Notification, Subscription, SubscriptionDescriptor};
use crate::realtime::topic::TopicScope;

/// Errors surfaced by realtime operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Client has no data type and none was passed.
    #[error("data type is required for clients without a default data type")]
    MissingDataType,

    /// Update publish or subscription has no usable record `id`.
    #[error("updates must name a record `id`")]
    MissingRecordId,

    /// Router or callee rejected the call.
    #[error("remote error {error}")]
    Remote {
        error: String,
        args: Vec<Value>,
        kwargs: Dict,
    },

    /// Session ended before the operation completed.
    #[error("realtime session closed")]
    SessionClosed,

    /// No session opened within the configured timeout.
    #[error("timed out waiting for a realtime session")]
    SessionTimeout,

    /// Envelope could not be serialized.
    #[error("json error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Realtime client scoped to one application and optionally one data type.
#[derive(Clone, Debug)]
pub struct RealtimeClient {
    config: AppConfig,
    scope: TopicScope,
    connection: ConnectionHandle,
}

impl RealtimeClient {
    /// Creates a client for every data type of `config`'s application.
    pub fn new(manager: &ConnectionManager, config: AppConfig) -> Self {
        Self::with_scope(manager, config, None)
    }

    /// Creates a client whose operations default to `data_type`.
    pub fn for_data_type(
        manager: &ConnectionManager,
        config: AppConfig,
        data_type: impl Into<String>,
    ) -> Self {
        Self::with_scope(manager, config, Some(data_type.into()))
    }

    fn with_scope(manager: &ConnectionManager, config: AppConfig, data_type: Option<String>) -> Self {
        let connection = manager.get_or_create(config.app_id(), config.realtime_host());
        let scope = TopicScope::new(config.app_id(), data_type);
        Self {
            config,
            scope,
            connection,
        }
    }

    /// Returns a client for `data_type` sharing this client's connection.
    pub fn scoped(&self, data_type: impl Into<String>) -> Self {
        Self {
            config: self.config.clone(),
            scope: TopicScope::new(self.config.app_id(), Some(data_type.into())),
            connection: self.connection.clone(),
        }
    }

    /// `appId` or `appId.dataType`.
    pub fn default_topic(&self) -> String {
        self.scope.base()
    }

    pub fn data_type(&self) -> Option<&str> {
        self.scope.data_type()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Builds the envelope this client would send for `op`.
    pub fn build_message(
        &self,
        op: MessageOp,
        payload: Value,
        data_type: Option<&str>,
        options: Option<Map<String, Value>>,
    ) -> Result<Envelope, RealtimeError> {
        EnvelopeBuilder::new(&self.config, &self.scope).build(op, payload, data_type, options)
    }

    /// Publishes a create notification. Other sessions and this one receive it.
    pub fn send_create(
        &self,
        payload: Value,
        data_type: Option<&str>,
    ) -> Result<SendStatus, RealtimeError> {
        self.send(MessageOp::Create, payload, data_type)
    }

    /// Publishes an update notification on the record's topic. The sending
    /// session does not receive it.
    pub fn send_update(
        &self,
        payload: Value,
        data_type: Option<&str>,
    ) -> Result<SendStatus, RealtimeError> {
        self.send(MessageOp::Update, payload, data_type)
    }

    /// Publishes a delete notification. Other sessions and this one receive it.
    pub fn send_remove(
        &self,
        payload: Value,
        data_type: Option<&str>,
    ) -> Result<SendStatus, RealtimeError> {
        self.send(MessageOp::Delete, payload, data_type)
    }

    fn send(
        &self,
        op: MessageOp,
        payload: Value,
        data_type: Option<&str>,
    ) -> Result<SendStatus, RealtimeError> {
        let envelope = self.build_message(op, payload, data_type, None)?;
        let text = envelope.to_text()?;

        let mut options = Dict::new();
        if matches!(op, MessageOp::Create | MessageOp::Delete) {
            options.insert("exclude_me".to_string(), Value::Bool(false));
        }

        let topic = envelope.topic;
        Ok(self.connection.with_session(move |session| {
            if let Err(err) = session.publish(&topic, vec![Value::String(text)], options) {
                tracing::debug!(event = "realtime_publish_dropped", topic = %topic, error = %err);
            }
        }))
    }

    /// Reads records through `data.read`.
    pub async fn call_read(
        &self,
        payload: Value,
        data_type: Option<&str>,
        options: Option<Map<String, Value>>,
    ) -> Result<Value, RealtimeError> {
        self.call(MessageOp::Read, payload, data_type, options).await
    }

    /// Creates a record through `data.create`.
    pub async fn call_create(
        &self,
        payload: Value,
        data_type: Option<&str>,
        options: Option<Map<String, Value>>,
    ) -> Result<Value, RealtimeError> {
        self.call(MessageOp::Create, payload, data_type, options).await
    }

    /// Updates a record through `data.update`. The payload must carry `id`.
    pub async fn call_update(
        &self,
        payload: Value,
        data_type: Option<&str>,
        options: Option<Map<String, Value>>,
    ) -> Result<Value, RealtimeError> {
        self.call(MessageOp::Update, payload, data_type, options).await
    }

    /// Removes a record through `data.remove`.
    pub async fn call_remove(
        &self,
        payload: Value,
        data_type: Option<&str>,
        options: Option<Map<String, Value>>,
    ) -> Result<Value, RealtimeError> {
        self.call(MessageOp::Delete, payload, data_type, options).await
    }

    async fn call(
        &self,
        op: MessageOp,
        payload: Value,
        data_type: Option<&str>,
        options: Option<Map<String, Value>>,
    ) -> Result<Value, RealtimeError> {
        let envelope = self.build_message(op, payload, data_type, options)?;
        let arg = serde_json::to_value(&envelope)?;
        self.connection.call(op.procedure(), vec![arg]).await
    }

    /// Listens for create notifications, optionally for one record id.
    ///
    /// A client without a data type listens on `data_type` when one is
    /// named, otherwise on every create of the application.
    pub fn on_create_message<F>(
        &self,
        filter_id: Option<&str>,
        data_type: Option<&str>,
        handler: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.on_op(MessageOp::Create, data_type, filter_id, handler)
    }

    /// Listens for delete notifications, optionally for one record id.
    pub fn on_delete_message<F>(
        &self,
        filter_id: Option<&str>,
        data_type: Option<&str>,
        handler: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.on_op(MessageOp::Delete, data_type, filter_id, handler)
    }

    /// Listens for update notifications of record `id`. An empty `id` is
    /// rejected with [`RealtimeError::MissingRecordId`].
    pub fn on_update_message<F>(
        &self,
        id: &str,
        data_type: Option<&str>,
        handler: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.on_op(MessageOp::Update, data_type, Some(id), handler)
    }

    fn on_op<F>(
        &self,
        op: MessageOp,
        data_type: Option<&str>,
        filter_id: Option<&str>,
        handler: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let topic = self.scope.subscribe_topic(op, data_type, filter_id)?;
        Ok(self.on_message(SubscriptionDescriptor::new(topic, handler).with_op(op)))
    }

    /// Registers an arbitrary subscription on this client's connection.
    pub fn on_message(&self, descriptor: SubscriptionDescriptor) -> Subscription {
        self.connection.subscribe(descriptor)
    }
}
