//! Data-channel side protocol.
//!
//! Once a media connection is fully established, the peers run a small
//! JSON protocol over its data channel: a handshake, announcements of
//! auxiliary streams (screen share), and nested signaling for the
//! per-stream connections negotiated directly peer-to-peer. Nested
//! signaling reuses [`WebRtcMessage`] with `source` set to a stream token
//! instead of a user id.

use crate::webrtc::WebRtcMessage;
use serde::{Deserialize, Serialize};

/// A message on the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEnvelope {
    #[serde(flatten)]
    pub payload: PeerPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerPayload {
    P2p(P2pMessage),
    /// Nested signaling; `source` carries the stream token.
    Webrtc(WebRtcMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum P2pSubtype {
    Handshake,
    HandshakeReply,
    AnnounceStreams,
}

/// Body of a `p2p` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2pMessage {
    pub subtype: P2pSubtype,
    /// Handshake timestamp; a `handshake_reply` echoes the timestamp of
    /// the handshake it answers.
    #[serde(default, skip_serializing_if = "ts_is_unset")]
    pub ts: i64,
    pub v: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamAnnouncement>,
    /// A handshake may piggyback the reply to a handshake already
    /// received from the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<P2pMessage>>,
}

impl P2pMessage {
    #[must_use]
    pub fn new(subtype: P2pSubtype) -> Self {
        Self {
            subtype,
            ts: 0,
            v: crate::P2P_VERSION,
            streams: Vec::new(),
            data: None,
        }
    }
}

fn ts_is_unset(ts: &i64) -> bool {
    *ts == 0
}

/// One entry of an `announce_streams` list. The token is the routing key
/// embedded in nested signaling so the receiver can map a message to the
/// right per-stream connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamAnnouncement {
    pub id: String,
    pub kind: StreamKind,
    pub token: String,
    pub v: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Screenshare,
    #[serde(other)]
    Unknown,
}
