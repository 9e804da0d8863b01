//! Server control-channel envelopes.
//!
//! Every message on the control channel is a JSON object with a
//! per-connection sequence `id`, a `type` tag and, for replies, a
//! `reply_to` referencing the request's `id`. The server's `pong` echoes
//! only `id`; the transport synthesizes `reply_to` at receipt.

use crate::webrtc::WebRtcMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A control-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-connection sequence number. Strictly increasing per socket.
    #[serde(default, skip_serializing_if = "id_is_unset")]
    pub id: u64,
    /// Sequence number of the request this message replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Wrap a payload in an envelope; the transport assigns `id` on send.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            id: 0,
            reply_to: None,
            payload,
        }
    }
}

fn id_is_unset(id: &u64) -> bool {
    *id == 0
}

/// Type-tagged envelope payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Assigns the local user identity for this session.
    Hello(Hello),
    /// Server is closing the session.
    Goodbye,
    Ping(Heartbeat),
    Pong(Heartbeat),
    Error(ErrorBody),
    Webrtc(WebRtcMessage),
    /// Chat traffic; opaque to the core engine.
    Chats(Chats),
}

/// `hello` body: the server-confirmed local identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "self")]
    pub identity: UserIdentity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// `ping`/`pong` body. `auth` on a `pong` carries a refreshed
/// authorization value that replaces the stored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Wall-clock milliseconds at send time; echoed by the server.
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// `error` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
}

/// `chats` body, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chats {
    #[serde(flatten)]
    pub body: Map<String, Value>,
}
