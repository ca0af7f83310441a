//! Topic naming grammar.
//!
//! ```text
//! topic    := base ('.' dataType)? '.' op ('.' id)?
//! base     := appId | appId '.' dataType   (scoped client)
//! ```
//!
//! The data type segment after `base` only appears for clients without a
//! fixed data type. The id segment appears for updates and for id-filtered
//! create/delete subscriptions.

use serde_json::Value;

use crate::realtime::client::RealtimeError;
use crate::realtime::envelope::MessageOp;

pub const SEPARATOR: &str = ".";

/// Addressing context of one realtime client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicScope {
    app_id: String,
    data_type: Option<String>,
}

impl TopicScope {
    pub fn new(app_id: impl Into<String>, data_type: Option<String>) -> Self {
        Self {
            app_id: app_id.into(),
            data_type,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn data_type(&self) -> Option<&str> {
        self.data_type.as_deref()
    }

    pub fn is_scoped(&self) -> bool {
        self.data_type.is_some()
    }

    /// Default topic: `appId` or `appId.dataType`.
    pub fn base(&self) -> String {
        match &self.data_type {
            Some(data_type) => [self.app_id.as_str(), data_type].join(SEPARATOR),
            None => self.app_id.clone(),
        }
    }

    /// Joins `segments` onto the default topic.
    pub fn build<'s, I>(&self, segments: I) -> String
    where
        I: IntoIterator<Item = &'s str>,
    {
        let mut topic = self.base();
        for segment in segments {
            topic.push_str(SEPARATOR);
            topic.push_str(segment);
        }
        topic
    }

    /// Explicit data type, falling back to the scope's own.
    pub fn resolve_data_type<'a>(&'a self, data_type: Option<&'a str>) -> Option<&'a str> {
        data_type.or(self.data_type.as_deref())
    }

    /// Topic a notification for `op` on `payload` is published to.
    ///
    /// Updates are addressed to the record, so their payload must carry an
    /// `id` (string or number).
    pub fn publish_topic(
        &self,
        data_type: &str,
        op: MessageOp,
        payload: &Value,
    ) -> Result<String, RealtimeError> {
        let id = match op {
            MessageOp::Update => Some(record_id(payload).ok_or(RealtimeError::MissingRecordId)?),
            _ => None,
        };
        Ok(self.topic_for(Some(data_type), op, id.as_deref()))
    }

    /// Topic a subscription for `op` listens on.
    ///
    /// `data_type` adds the type segment for clients without a fixed data
    /// type; without one they listen on the app-wide `appId.op` topic.
    /// `filter_id` narrows create/delete subscriptions to one record, an
    /// empty one meaning no filter. Updates need a non-empty id.
    pub fn subscribe_topic(
        &self,
        op: MessageOp,
        data_type: Option<&str>,
        filter_id: Option<&str>,
    ) -> Result<String, RealtimeError> {
        let id = filter_id.filter(|id| !id.is_empty());
        if op == MessageOp::Update && id.is_none() {
            return Err(RealtimeError::MissingRecordId);
        }
        Ok(self.topic_for(data_type, op, id))
    }

    fn topic_for(&self, data_type: Option<&str>, op: MessageOp, id: Option<&str>) -> String {
        let mut segments = Vec::with_capacity(3);
        if !self.is_scoped() {
            if let Some(data_type) = data_type {
                segments.push(data_type);
            }
        }
        segments.push(op.as_str());
        if let Some(id) = id {
            segments.push(id);
        }
        self.build(segments)
    }
}

/// Record id of a payload, rendered as a topic segment.
pub fn record_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
