//! Group coordination state.
//!
//! A group call is driven by `webrtc_channel` pushes carrying the member
//! set. The coordinator holds the group-level record whose hash/state the
//! server uses when it addresses the group as a whole; reconciliation of
//! the member set into a full mesh goes through the call engine.

use crate::call::record::PeerRecord;

pub(crate) struct GroupState {
    pub id: String,
    pub channel: String,
    /// Member user ids, kept lexicographically sorted.
    pub members: Vec<String>,
    /// Group-level record (not part of the peer table).
    pub record: PeerRecord,
}

impl GroupState {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            record: PeerRecord::new(id.clone(), id.clone()),
            id,
            channel: String::new(),
            members: Vec::new(),
        }
    }

    pub(crate) fn is_member(&self, user: &str) -> bool {
        self.members.iter().any(|m| m == user)
    }
}
