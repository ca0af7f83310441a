//! WAMP v2 messages exchanged with the realtime router.
//!
//! Only the client-side subset the SDK speaks is modeled. On the wire every
//! message is a JSON array whose first element is the message type code.

use serde_json::{json, Map, Value};
use thiserror::Error;

/// WAMP dictionary (`details`, `options`, `kwargs`).
pub type Dict = Map<String, Value>;

/// Websocket subprotocol for JSON-serialized WAMP v2.
pub const WAMP_SUBPROTOCOL: &str = "wamp.2.json";

/// Message type codes.
pub mod code {
    pub const HELLO: u64 = 1;
    pub const WELCOME: u64 = 2;
    pub const ABORT: u64 = 3;
    pub const GOODBYE: u64 = 6;
    pub const ERROR: u64 = 8;
    pub const PUBLISH: u64 = 16;
    pub const PUBLISHED: u64 = 17;
    pub const SUBSCRIBE: u64 = 32;
    pub const SUBSCRIBED: u64 = 33;
    pub const UNSUBSCRIBE: u64 = 34;
    pub const UNSUBSCRIBED: u64 = 35;
    pub const EVENT: u64 = 36;
    pub const CALL: u64 = 48;
    pub const RESULT: u64 = 50;
}

#[derive(Debug, Clone, PartialEq)]
pub enum WampMessage {
    Hello {
        realm: String,
        details: Dict,
    },
    Welcome {
        session: u64,
        details: Dict,
    },
    Abort {
        details: Dict,
        reason: String,
    },
    Goodbye {
        details: Dict,
        reason: String,
    },
    Error {
        request_type: u64,
        request: u64,
        details: Dict,
        error: String,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Publish {
        request: u64,
        options: Dict,
        topic: String,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Published {
        request: u64,
        publication: u64,
    },
    Subscribe {
        request: u64,
        options: Dict,
        topic: String,
    },
    Subscribed {
        request: u64,
        subscription: u64,
    },
    Unsubscribe {
        request: u64,
        subscription: u64,
    },
    Unsubscribed {
        request: u64,
    },
    Event {
        subscription: u64,
        publication: u64,
        details: Dict,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Call {
        request: u64,
        options: Dict,
        procedure: String,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Result {
        request: u64,
        details: Dict,
        args: Vec<Value>,
        kwargs: Dict,
    },
}

/// Errors produced while decoding WAMP frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Frame is not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is JSON but not a well-formed WAMP message.
    #[error("malformed wamp message: {0}")]
    Malformed(String),

    /// Well-formed frame of a message type this codec does not model.
    #[error("unsupported wamp message type {0}")]
    Unsupported(u64),
}

impl WampMessage {
    /// Builds the client `HELLO` announcing the roles this SDK plays.
    pub fn hello(realm: impl Into<String>) -> Self {
        let details = json!({
            "roles": {
                "publisher": { "features": { "publisher_exclusion": true } },
                "subscriber": {},
                "caller": {},
            }
        });

        Self::Hello {
            realm: realm.into(),
            details: into_dict(details),
        }
    }

    /// Builds a `GOODBYE` carrying a human-readable message.
    pub fn goodbye(reason: impl Into<String>, message: &str) -> Self {
        Self::Goodbye {
            details: into_dict(json!({ "message": message })),
            reason: reason.into(),
        }
    }

    pub fn message_type(&self) -> u64 {
        match self {
            Self::Hello { .. } => code::HELLO,
            Self::Welcome { .. } => code::WELCOME,
            Self::Abort { .. } => code::ABORT,
            Self::Goodbye { .. } => code::GOODBYE,
            Self::Error { .. } => code::ERROR,
            Self::Publish { .. } => code::PUBLISH,
            Self::Published { .. } => code::PUBLISHED,
            Self::Subscribe { .. } => code::SUBSCRIBE,
            Self::Subscribed { .. } => code::SUBSCRIBED,
            Self::Unsubscribe { .. } => code::UNSUBSCRIBE,
            Self::Unsubscribed { .. } => code::UNSUBSCRIBED,
            Self::Event { .. } => code::EVENT,
            Self::Call { .. } => code::CALL,
            Self::Result { .. } => code::RESULT,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value())
    }

    pub fn to_value(&self) -> Value {
        let mut frame = vec![json!(self.message_type())];
        match self {
            Self::Hello { realm, details } => {
                frame.push(json!(realm));
                frame.push(Value::Object(details.clone()));
            }
            Self::Welcome { session, details } => {
                frame.push(json!(session));
                frame.push(Value::Object(details.clone()));
            }
            Self::Abort { details, reason } | Self::Goodbye { details, reason } => {
                frame.push(Value::Object(details.clone()));
                frame.push(json!(reason));
            }
            Self::Error {
                request_type,
                request,
                details,
                error,
                args,
                kwargs,
            } => {
                frame.push(json!(request_type));
                frame.push(json!(request));
                frame.push(Value::Object(details.clone()));
                frame.push(json!(error));
                push_payload(&mut frame, args, kwargs);
            }
            Self::Publish {
                request,
                options,
                topic,
                args,
                kwargs,
            } => {
                frame.push(json!(request));
                frame.push(Value::Object(options.clone()));
                frame.push(json!(topic));
                push_payload(&mut frame, args, kwargs);
            }
            Self::Published {
                request,
                publication,
            } => {
                frame.push(json!(request));
                frame.push(json!(publication));
            }
            Self::Subscribe {
                request,
                options,
                topic,
            } => {
                frame.push(json!(request));
                frame.push(Value::Object(options.clone()));
                frame.push(json!(topic));
            }
            Self::Subscribed {
                request,
                subscription,
            }
            | Self::Unsubscribe {
                request,
                subscription,
            } => {
                frame.push(json!(request));
                frame.push(json!(subscription));
            }
            Self::Unsubscribed { request } => {
                frame.push(json!(request));
            }
            Self::Event {
                subscription,
                publication,
                details,
                args,
                kwargs,
            } => {
                frame.push(json!(subscription));
                frame.push(json!(publication));
                frame.push(Value::Object(details.clone()));
                push_payload(&mut frame, args, kwargs);
            }
            Self::Call {
                request,
                options,
                procedure,
                args,
                kwargs,
            } => {
                frame.push(json!(request));
                frame.push(Value::Object(options.clone()));
                frame.push(json!(procedure));
                push_payload(&mut frame, args, kwargs);
            }
            Self::Result {
                request,
                details,
                args,
                kwargs,
            } => {
                frame.push(json!(request));
                frame.push(Value::Object(details.clone()));
                push_payload(&mut frame, args, kwargs);
            }
        }
        Value::Array(frame)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtoError> {
        let Value::Array(items) = value else {
            return Err(ProtoError::Malformed("frame is not an array".to_string()));
        };
        let mut fields = Fields::new(items);
        let kind = fields.id("message type")?;

        let message = match kind {
            code::HELLO => Self::Hello {
                realm: fields.uri("realm")?,
                details: fields.dict("details")?,
            },
            code::WELCOME => Self::Welcome {
                session: fields.id("session")?,
                details: fields.dict("details")?,
            },
            code::ABORT => Self::Abort {
                details: fields.dict("details")?,
                reason: fields.uri("reason")?,
            },
            code::GOODBYE => Self::Goodbye {
                details: fields.dict("details")?,
                reason: fields.uri("reason")?,
            },
            code::ERROR => Self::Error {
                request_type: fields.id("request type")?,
                request: fields.id("request")?,
                details: fields.dict("details")?,
                error: fields.uri("error")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            code::PUBLISH => Self::Publish {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                topic: fields.uri("topic")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            code::PUBLISHED => Self::Published {
                request: fields.id("request")?,
                publication: fields.id("publication")?,
            },
            code::SUBSCRIBE => Self::Subscribe {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                topic: fields.uri("topic")?,
            },
            code::SUBSCRIBED => Self::Subscribed {
                request: fields.id("request")?,
                subscription: fields.id("subscription")?,
            },
            code::UNSUBSCRIBE => Self::Unsubscribe {
                request: fields.id("request")?,
                subscription: fields.id("subscription")?,
            },
            code::UNSUBSCRIBED => Self::Unsubscribed {
                request: fields.id("request")?,
            },
            code::EVENT => Self::Event {
                subscription: fields.id("subscription")?,
                publication: fields.id("publication")?,
                details: fields.dict("details")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            code::CALL => Self::Call {
                request: fields.id("request")?,
                options: fields.dict("options")?,
                procedure: fields.uri("procedure")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            code::RESULT => Self::Result {
                request: fields.id("request")?,
                details: fields.dict("details")?,
                args: fields.args()?,
                kwargs: fields.kwargs()?,
            },
            other => return Err(ProtoError::Unsupported(other)),
        };

        Ok(message)
    }
}

pub(crate) fn into_dict(value: Value) -> Dict {
    match value {
        Value::Object(map) => map,
        _ => Dict::new(),
    }
}

// Trailing empty payload elements are omitted on the wire.
fn push_payload(frame: &mut Vec<Value>, args: &[Value], kwargs: &Dict) {
    if args.is_empty() && kwargs.is_empty() {
        return;
    }
    frame.push(Value::Array(args.to_vec()));
    if !kwargs.is_empty() {
        frame.push(Value::Object(kwargs.clone()));
    }
}

struct Fields {
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(items: Vec<Value>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    fn next(&mut self, name: &str) -> Result<Value, ProtoError> {
        self.items
            .next()
            .ok_or_else(|| ProtoError::Malformed(format!("missing {name}")))
    }

    fn id(&mut self, name: &str) -> Result<u64, ProtoError> {
        self.next(name)?
            .as_u64()
            .ok_or_else(|| ProtoError::Malformed(format!("{name} must be an integer id")))
    }

    fn uri(&mut self, name: &str) -> Result<String, ProtoError> {
        match self.next(name)? {
            Value::String(uri) => Ok(uri),
            _ => Err(ProtoError::Malformed(format!("{name} must be a string"))),
        }
    }

    fn dict(&mut self, name: &str) -> Result<Dict, ProtoError> {
        match self.next(name)? {
            Value::Object(dict) => Ok(dict),
            _ => Err(ProtoError::Malformed(format!("{name} must be an object"))),
        }
    }

    fn args(&mut self) -> Result<Vec<Value>, ProtoError> {
        match self.items.next() {
            None => Ok(Vec::new()),
            Some(Value::Array(args)) => Ok(args),
            Some(_) => Err(ProtoError::Malformed("args must be an array".to_string())),
        }
    }

    fn kwargs(&mut self) -> Result<Dict, ProtoError> {
        match self.items.next() {
            None => Ok(Dict::new()),
            Some(Value::Object(kwargs)) => Ok(kwargs),
            Some(_) => Err(ProtoError::Malformed("kwargs must be an object".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn hello_announces_publisher_exclusion() {
        let value = WampMessage::hello("default").to_value();
        assert_eq!(value[0], json!(code::HELLO));
        assert_eq!(value[1], json!("default"));
        assert_eq!(
            value[2]["roles"]["publisher"]["features"]["publisher_exclusion"],
            json!(true)
        );
    }

    #[test]
    fn publish_omits_empty_kwargs() {
        let mut options = Dict::new();
        options.insert("exclude_me".to_string(), json!(false));
        let msg = WampMessage::Publish {
            request: 3,
            options,
            topic: "app1.create".to_string(),
            args: vec![json!("{}")],
            kwargs: Dict::new(),
        };

        assert_eq!(
            msg.to_value(),
            json!([16, 3, {"exclude_me": false}, "app1.create", ["{}"]])
        );
    }

    #[test]
    fn subscribe_has_no_payload_elements() {
        let msg = WampMessage::Subscribe {
            request: 1,
            options: Dict::new(),
            topic: "app1.todos.update.x1".to_string(),
        };
        assert_eq!(msg.to_value(), json!([32, 1, {}, "app1.todos.update.x1"]));
    }

    #[test]
    fn decodes_event_without_payload() {
        let msg = WampMessage::from_text("[36, 5, 9, {}]").expect("decode event");
        assert_eq!(
            msg,
            WampMessage::Event {
                subscription: 5,
                publication: 9,
                details: Dict::new(),
                args: Vec::new(),
                kwargs: Dict::new(),
            }
        );
    }

    #[test]
    fn decodes_call_error_with_args() {
        let msg = WampMessage::from_text(r#"[8, 48, 12, {}, "app.error.denied", ["nope"]]"#)
            .expect("decode error");
        match msg {
            WampMessage::Error {
                request_type,
                request,
                error,
                args,
                ..
            } => {
                assert_eq!(request_type, code::CALL);
                assert_eq!(request, 12);
                assert_eq!(error, "app.error.denied");
                assert_eq!(args, vec![json!("nope")]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn result_text_decodes_back_to_same_message() {
        let mut kwargs = Dict::new();
        kwargs.insert("count".to_string(), json!(2));
        let msg = WampMessage::Result {
            request: 4,
            details: Dict::new(),
            args: vec![json!({"id": "x1"})],
            kwargs,
        };
        let text = msg.to_text().expect("encode");
        assert_eq!(WampMessage::from_text(&text).expect("decode"), msg);
    }

    #[test]
    fn unknown_message_type_is_unsupported_not_malformed() {
        let err = WampMessage::from_text("[70, 1]").expect_err("unsupported type");
        assert!(matches!(err, ProtoError::Unsupported(70)));

        let err = WampMessage::from_text("[70").expect_err("truncated frame");
        assert!(matches!(err, ProtoError::Json(_)));
    }

    #[test]
    fn rejects_non_array_frames() {
        let err = WampMessage::from_text(r#"{"type": 1}"#).expect_err("object frame");
        assert!(matches!(err, ProtoError::Malformed(_)));
    }
}
