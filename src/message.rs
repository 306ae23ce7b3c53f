//! Wire envelope for the Phoenix Channels V2 JSON serializer.
//!
//! Every frame is a five element JSON array:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//!  "3"       "7"  "room:lobby" "shout" {"id": 1}
//! ```
//!
//! `join_ref` and `ref` are opaque strings (`null` when absent). Replies use
//! `event = "phx_reply"` with `payload = {"status": ..., "response": ...}`.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{PhoenixError, Result};

/// Topic reserved for socket-level traffic (heartbeats).
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Event name on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    /// `phx_join`: join request.
    Join,
    /// `phx_reply`: server reply to a push.
    Reply,
    /// `phx_error`: server-side channel crash.
    Error,
    /// `phx_close`: leave request, or server-initiated close.
    Close,
    /// `heartbeat`: socket keepalive.
    Heartbeat,
    /// Application event.
    Custom(String),
}

impl Event {
    /// Wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Join => "phx_join",
            Self::Reply => "phx_reply",
            Self::Error => "phx_error",
            Self::Close => "phx_close",
            Self::Heartbeat => "heartbeat",
            Self::Custom(name) => name,
        }
    }

    /// Whether the event is protocol-internal and never dispatched to subscribers.
    pub fn is_reserved(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl From<&str> for Event {
    fn from(s: &str) -> Self {
        match s {
            "phx_join" => Self::Join,
            "phx_reply" => Self::Reply,
            "phx_error" => Self::Error,
            "phx_close" => Self::Close,
            "heartbeat" => Self::Heartbeat,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for Event {
    fn from(s: String) -> Self {
        match Self::from(s.as_str()) {
            Self::Custom(_) => Self::Custom(s),
            reserved => reserved,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Ref of the join that owns this frame's channel membership.
    pub join_ref: Option<String>,
    /// Ref correlating a push with its reply.
    pub msg_ref: Option<String>,
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: Event,
    /// Structured payload.
    pub payload: Value,
}

impl Message {
    /// Build a message with no refs.
    pub fn new(topic: impl Into<String>, event: impl Into<Event>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Build a heartbeat frame with the given ref.
    pub fn heartbeat(msg_ref: String) -> Self {
        Self {
            join_ref: None,
            msg_ref: Some(msg_ref),
            topic: PHOENIX_TOPIC.to_string(),
            event: Event::Heartbeat,
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Build a reply frame (used by tests and in-process servers).
    pub fn reply(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        status: &str,
        response: Value,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.into(),
            event: Event::Reply,
            payload: serde_json::json!({ "status": status, "response": response }),
        }
    }
}

/// Encode a message to its wire text.
pub fn encode(message: &Message) -> Result<String> {
    let frame = (
        message.join_ref.as_deref(),
        message.msg_ref.as_deref(),
        message.topic.as_str(),
        message.event.as_str(),
        &message.payload,
    );
    Ok(serde_json::to_string(&frame)?)
}

/// Decode wire text into a message.
///
/// Fails with [`PhoenixError::MalformedFrame`]; callers drop the frame and
/// keep the connection.
pub fn decode(text: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| PhoenixError::MalformedFrame(format!("invalid JSON: {e}")))?;

    let Value::Array(mut fields) = value else {
        return Err(PhoenixError::MalformedFrame(
            "frame is not an array".to_string(),
        ));
    };
    if fields.len() < 5 {
        return Err(PhoenixError::MalformedFrame(format!(
            "expected 5 elements, got {}",
            fields.len()
        )));
    }
    fields.truncate(5);

    let payload = fields.pop().unwrap_or(Value::Null);
    let event = string_field(fields.pop(), "event")?;
    let topic = string_field(fields.pop(), "topic")?;
    let msg_ref = ref_field(fields.pop(), "ref")?;
    let join_ref = ref_field(fields.pop(), "join_ref")?;

    Ok(Message {
        join_ref,
        msg_ref,
        topic,
        event: Event::from(event),
        payload,
    })
}

fn string_field(value: Option<Value>, name: &str) -> Result<String> {
    match value {
        Some(Value::String(s)) => Ok(s),
        other => Err(PhoenixError::MalformedFrame(format!(
            "{name} must be a string, got {}",
            other.unwrap_or(Value::Null)
        ))),
    }
}

/// Refs are opaque; servers normally send strings but numbers are tolerated.
fn ref_field(value: Option<Value>, name: &str) -> Result<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(PhoenixError::MalformedFrame(format!(
            "{name} must be a string or null, got {other}"
        ))),
    }
}

/// Body of a `phx_reply` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    /// `"ok"` or `"error"` (servers may use other statuses).
    pub status: String,
    /// Reply body handed to the push callback.
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    /// Parse a reply out of a `phx_reply` payload.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        Self::deserialize(payload)
            .map_err(|e| PhoenixError::MalformedFrame(format!("invalid reply payload: {e}")))
    }
}
