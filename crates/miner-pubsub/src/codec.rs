//! Frame codec for the event-bus wire format.
//!
//! Every frame is a JSON text message shaped
//! `{type, nonce?, data?, error?}`. Outbound commands are `LISTEN`,
//! `UNLISTEN` and `PING`; inbound frames are decoded by their `type`
//! discriminator into [`InboundFrame`], with an explicit
//! [`InboundFrame::Unknown`] catch-all for types this client has never seen.

use miner_core::Nonce;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::DecodeError;
use crate::topic::Topic;

// ─── Outbound ────────────────────────────────────────────────────────────

/// Outbound command discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Subscribe to topics.
    Listen,
    /// Unsubscribe from topics.
    Unlisten,
    /// Keepalive probe.
    Ping,
}

impl CommandKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Listen => "LISTEN",
            Self::Unlisten => "UNLISTEN",
            Self::Ping => "PING",
        }
    }
}

/// A command sent to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    /// Command type.
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// Correlation token; assigned by the client when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Nonce>,
    /// Command payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OutboundCommand {
    /// `LISTEN` for `topics`, carrying the auth token when one is set.
    pub fn listen(topics: &[Topic], auth_token: Option<&str>) -> Self {
        let mut data = Map::new();
        let _ = data.insert("topics".into(), json!(topics));
        if let Some(token) = auth_token {
            let _ = data.insert("auth_token".into(), Value::String(token.to_owned()));
        }
        Self {
            kind: CommandKind::Listen,
            nonce: None,
            data: Some(Value::Object(data)),
        }
    }

    /// `UNLISTEN` for `topics`.
    pub fn unlisten(topics: &[Topic]) -> Self {
        Self {
            kind: CommandKind::Unlisten,
            nonce: None,
            data: Some(json!({ "topics": topics })),
        }
    }

    /// Keepalive `PING`.
    pub fn ping() -> Self {
        Self {
            kind: CommandKind::Ping,
            nonce: None,
            data: None,
        }
    }

    /// Set the nonce.
    #[must_use]
    pub fn with_nonce(mut self, nonce: Nonce) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Whether the server answers this command with a `RESPONSE`.
    pub fn expects_reply(&self) -> bool {
        matches!(self.kind, CommandKind::Listen | CommandKind::Unlisten)
    }

    /// Topics named in `data.topics`.
    pub fn topics(&self) -> Vec<Topic> {
        self.data
            .as_ref()
            .and_then(|d| d.get("topics"))
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .filter_map(Topic::parse)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Encode a command to its wire text.
pub fn encode_command(command: &OutboundCommand) -> String {
    let mut obj = Map::new();
    let _ = obj.insert("type".into(), Value::String(command.kind.as_str().into()));
    if let Some(nonce) = &command.nonce {
        let _ = obj.insert("nonce".into(), Value::String(nonce.to_string()));
    }
    if let Some(data) = &command.data {
        let _ = obj.insert("data".into(), data.clone());
    }
    Value::Object(obj).to_string()
}

/// Decode a command from wire text.
pub fn decode_command(text: &str) -> Result<OutboundCommand, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

// ─── Inbound ─────────────────────────────────────────────────────────────

/// Acknowledgement of a correlated command.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseFrame {
    /// Nonce of the command being acknowledged.
    pub nonce: Option<Nonce>,
    /// Empty on success, otherwise the failure reason.
    pub error: String,
}

impl ResponseFrame {
    /// Whether the command succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }

    /// Whether the error is the server's bad-credentials signal.
    pub fn is_auth_failure(&self) -> bool {
        is_auth_failure(&self.error)
    }
}

/// Whether `error` is the bad-credentials signal (`ERR_BADAUTH`, `bad auth`).
pub fn is_auth_failure(error: &str) -> bool {
    let normalized: String = error
        .chars()
        .filter(|c| !matches!(c, '_' | ' ' | '-'))
        .flat_map(char::to_lowercase)
        .collect();
    normalized == "errbadauth" || normalized == "badauth"
}

/// A pub/sub event on a topic.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageFrame {
    /// Topic the event was published on.
    pub topic: Topic,
    /// The nested message, parsed when it is JSON.
    pub payload: Value,
}

impl MessageFrame {
    /// The payload's own `type` field (e.g. `points-earned`).
    pub fn event_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }

    /// The payload's `data` object.
    pub fn data(&self) -> Option<&Value> {
        self.payload.get("data")
    }
}

/// A frame type this client does not model.
#[derive(Clone, Debug, PartialEq)]
pub struct UnknownFrame {
    /// The unrecognised discriminator.
    pub kind: String,
    /// The whole frame.
    pub raw: Value,
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// `RESPONSE`: acknowledgement of a command.
    Response(ResponseFrame),
    /// `MESSAGE`: topic event.
    Message(MessageFrame),
    /// `PONG`: keepalive reply.
    Pong,
    /// `RECONNECT`: the server is about to drop the link.
    Reconnect,
    /// Anything else.
    Unknown(UnknownFrame),
}

impl InboundFrame {
    /// Wire discriminator.
    pub fn kind(&self) -> &str {
        match self {
            Self::Response(_) => "RESPONSE",
            Self::Message(_) => "MESSAGE",
            Self::Pong => "PONG",
            Self::Reconnect => "RECONNECT",
            Self::Unknown(u) => &u.kind,
        }
    }

    /// The nonce carried by the frame, if any.
    pub fn nonce(&self) -> Option<&Nonce> {
        match self {
            Self::Response(r) => r.nonce.as_ref(),
            _ => None,
        }
    }
}

/// Decode wire text into a frame.
pub fn decode_frame(text: &str) -> Result<InboundFrame, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    let frame = match kind {
        "RESPONSE" => InboundFrame::Response(ResponseFrame {
            nonce: value
                .get("nonce")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .map(Nonce::from),
            error: value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        }),
        "MESSAGE" => InboundFrame::Message(decode_message(&value)?),
        "PONG" => InboundFrame::Pong,
        "RECONNECT" => InboundFrame::Reconnect,
        other => InboundFrame::Unknown(UnknownFrame {
            kind: other.to_owned(),
            raw: value.clone(),
        }),
    };
    Ok(frame)
}

fn decode_message(value: &Value) -> Result<MessageFrame, DecodeError> {
    let missing = |field| DecodeError::MissingField {
        kind: "MESSAGE".into(),
        field,
    };
    let data = value.get("data").ok_or_else(|| missing("data"))?;
    let topic = data
        .get("topic")
        .and_then(Value::as_str)
        .and_then(Topic::parse)
        .ok_or_else(|| missing("data.topic"))?;
    let payload = match data.get("message").ok_or_else(|| missing("data.message"))? {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        other => other.clone(),
    };
    Ok(MessageFrame { topic, payload })
}

/// Encode a frame back to wire text.
pub fn encode_frame(frame: &InboundFrame) -> String {
    let value = match frame {
        InboundFrame::Response(r) => {
            let mut obj = Map::new();
            let _ = obj.insert("type".into(), json!("RESPONSE"));
            if let Some(nonce) = &r.nonce {
                let _ = obj.insert("nonce".into(), json!(nonce));
            }
            let _ = obj.insert("error".into(), json!(r.error));
            Value::Object(obj)
        }
        InboundFrame::Message(m) => {
            let message = match &m.payload {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            json!({
                "type": "MESSAGE",
                "data": { "topic": m.topic, "message": message },
            })
        }
        InboundFrame::Pong => json!({ "type": "PONG" }),
        InboundFrame::Reconnect => json!({ "type": "RECONNECT" }),
        InboundFrame::Unknown(u) => u.raw.clone(),
    };
    value.to_string()
}
