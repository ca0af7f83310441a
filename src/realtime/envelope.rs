//! Wire envelope carried by realtime notifications and remote calls.

use std::fmt;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::AppConfig;
use crate::realtime::client::RealtimeError;
use crate::realtime::topic::TopicScope;

/// Operation kind of an envelope. Selects the topic suffix and, for remote
/// calls, the procedure name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOp {
    Create,
    Read,
    Update,
    Delete,
}

impl MessageOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Remote procedure invoked for calls with this operation.
    pub fn procedure(self) -> &'static str {
        match self {
            Self::Create => "data.create",
            Self::Read => "data.read",
            Self::Update => "data.update",
            Self::Delete => "data.remove",
        }
    }
}

impl fmt::Display for MessageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    Api,
    Client,
}

/// Message sent on both the publish and the call path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub app: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub op: MessageOp,
    pub origin: MessageOrigin,
    pub pld: Value,
    pub token: String,
    pub options: Map<String, Value>,
    pub timestamp: String,
    pub topic: String,
}

impl Envelope {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Session unique id of the sender, when present.
    pub fn client_id(&self) -> Option<&str> {
        self.options.get("clientId").and_then(Value::as_str)
    }
}

/// Builds envelopes for one client scope.
#[derive(Clone, Copy, Debug)]
pub struct EnvelopeBuilder<'a> {
    config: &'a AppConfig,
    scope: &'a TopicScope,
}

impl<'a> EnvelopeBuilder<'a> {
    pub fn new(config: &'a AppConfig, scope: &'a TopicScope) -> Self {
        Self { config, scope }
    }

    /// Builds an envelope stamped with the current UTC second.
    pub fn build(
        &self,
        op: MessageOp,
        payload: Value,
        data_type: Option<&str>,
        options: Option<Map<String, Value>>,
    ) -> Result<Envelope, RealtimeError> {
        self.build_at(op, payload, data_type, options, Utc::now())
    }

    /// Builds an envelope stamped with `now`.
    ///
    /// Caller options are shallow-merged over `{clientId}`; a caller-supplied
    /// `clientId` replaces the session id.
    pub fn build_at(
        &self,
        op: MessageOp,
        payload: Value,
        data_type: Option<&str>,
        options: Option<Map<String, Value>>,
        now: DateTime<Utc>,
    ) -> Result<Envelope, RealtimeError> {
        let data_type = self
            .scope
            .resolve_data_type(data_type)
            .ok_or(RealtimeError::MissingDataType)?
            .to_string();

        let pld = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let topic = self.scope.publish_topic(&data_type, op, &pld)?;

        let mut merged = Map::new();
        merged.insert(
            "clientId".to_string(),
            Value::String(self.config.unique_id().to_string()),
        );
        merged.extend(options.unwrap_or_default());

        Ok(Envelope {
            app: self.config.app_id().to_string(),
            data_type,
            op,
            origin: MessageOrigin::Client,
            pld,
            token: self.config.token().expose_secret().clone(),
            options: merged,
            timestamp: format_timestamp(now),
            topic,
        })
    }
}

/// Formats `now` as ISO-8601 UTC with sub-second precision dropped.
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.trunc_subsecs(0)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
