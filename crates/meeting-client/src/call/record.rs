//! Peer records and identity helpers.

use crate::peer::MediaPeer;
use serde_json::Value;
use std::sync::Arc;

// Marker `cid` of the pipeline peer record.
pub(crate) use signaling_protocol::webrtc::PIPELINE_MODE_MCU_FORWARD as PIPELINE_CID;

/// One entry of the call engine's peer table.
///
/// Keyed by the remote user id for normal peers and by the pipeline
/// identifier for the pipeline peer (`cid` non-empty marks the latter).
pub(crate) struct PeerRecord {
    pub id: String,
    pub user: String,
    /// Group id when this peer belongs to a group call.
    pub group: String,
    /// Non-empty marker for special peers.
    pub cid: String,
    pub initiator: bool,
    /// Locally generated nonce the server binds replies to.
    pub state: String,
    /// The remote side's nonce, as learned from its messages.
    pub remote_state: String,
    /// Server-issued session token; must match on every inbound message
    /// except during a group hash exchange.
    pub hash: String,
    /// Server-issued request id to echo on accept/reject.
    pub transaction: String,
    pub pc: Option<Arc<dyn MediaPeer>>,
    /// Remote connection id from the first signal; a change means the
    /// remote restarted its connection.
    pub remote_pc_id: String,
    pub profile: Option<Value>,
    /// When set, the factory auto-recovers this peer on error.
    pub reconnect: bool,
}

impl PeerRecord {
    pub(crate) fn new(id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            group: String::new(),
            cid: String::new(),
            initiator: false,
            state: state_nonce(),
            remote_state: String::new(),
            hash: String::new(),
            transaction: String::new(),
            pc: None,
            remote_pc_id: String::new(),
            profile: None,
            reconnect: true,
        }
    }

    /// Whether `pc_id` refers to the currently bound connection. Events
    /// from superseded connections fail this check and are dropped.
    pub(crate) fn pc_matches(&self, pc_id: &str) -> bool {
        self.pc.as_ref().is_some_and(|pc| pc.local_id() == pc_id)
    }
}

/// 12-hex-char nonce binding request/reply pairs.
pub(crate) fn state_nonce() -> String {
    random_hex(6)
}

/// 16-hex-char routing token for an announced stream.
pub(crate) fn stream_token() -> String {
    random_hex(8)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::Rng::fill(&mut rand::thread_rng(), buf.as_mut_slice());
    hex::encode(buf)
}

/// Initiator election: the endpoint with the lexicographically larger
/// user id places the offer; ties resolve to initiator.
pub(crate) fn compute_initiator(self_user: &str, other_user: &str) -> bool {
    self_user >= other_user
}
