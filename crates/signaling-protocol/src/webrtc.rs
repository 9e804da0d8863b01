//! `webrtc` envelope fields and typed payloads.
//!
//! A `webrtc` envelope carries the call/channel/hangup/signal/group
//! machinery. Besides the routing fields (`target`, `source`, `channel`),
//! each peer relationship is bound by a server-issued session token
//! (`hash`) and a pair of client nonces (`state` on the local side, echoed
//! back as the remote's `state`). `pcid` identifies the sender's media
//! connection so unilateral restarts can be detected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subtypes of a `webrtc` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebRtcSubtype {
    WebrtcCall,
    WebrtcChannel,
    WebrtcHangup,
    WebrtcSignal,
    WebrtcGroup,
}

/// Body of a `webrtc` envelope. The same shape is reused for nested
/// signaling on the data channel, where `source` carries a stream token
/// instead of a user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebRtcMessage {
    pub subtype: WebRtcSubtype,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub initiator: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pcid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    pub v: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Opaque identity metadata forwarded by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
}

impl WebRtcMessage {
    /// An empty message of the given subtype, stamped with the current
    /// protocol version.
    #[must_use]
    pub fn new(subtype: WebRtcSubtype) -> Self {
        Self {
            subtype,
            target: String::new(),
            source: String::new(),
            initiator: false,
            channel: String::new(),
            group: String::new(),
            hash: String::new(),
            state: String::new(),
            pcid: String::new(),
            transaction: None,
            v: crate::PROTOCOL_VERSION,
            data: None,
            profile: None,
        }
    }
}

/// `data` of a `webrtc_call` accept/reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallData {
    pub accept: bool,
    /// The nonce of the side being answered; binds the reply to the call.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Extra data delivered with a `webrtc_channel` (or embedded in a call
/// reply): supersession, group membership, pipeline enrolment.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChannelExtra {
    /// The call was taken over by another connection of the same user.
    #[serde(default)]
    pub replaced: bool,
    #[serde(default)]
    pub group: Option<GroupUpdate>,
    #[serde(default)]
    pub pipeline: Option<PipelineInfo>,
}

/// Group membership as pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupUpdate {
    pub group: String,
    #[serde(default)]
    pub members: Vec<String>,
    /// Tear the mesh down before reconciling to `members`.
    #[serde(default)]
    pub reset: bool,
}

/// Server-mediated pipeline enrolment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    /// Identifier of the pipeline peer.
    pub pipeline: String,
    pub mode: String,
}

/// Marker `cid` of the pipeline peer record.
pub const PIPELINE_MODE_MCU_FORWARD: &str = "mcu-forward";

/// `data` of a `webrtc_hangup`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HangupDetails {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}
