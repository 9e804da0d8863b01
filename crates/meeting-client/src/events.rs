//! User-visible events.
//!
//! Events are a tagged union delivered over an unbounded channel; the
//! application's receive loop is the handler table. Unknown kinds are
//! unrepresentable by construction.

use crate::peer::{IceServer, MediaStream, MediaTrack};
use crate::transport::TransportState;
use serde_json::Value;

/// Events emitted by the client.
#[derive(Debug)]
pub enum ClientEvent {
    /// Control channel state transition.
    StateChanged {
        state: TransportState,
        connected: bool,
    },
    /// Fatal or server-reported error.
    Error { code: String, msg: String },
    /// A TURN refresh produced a new ICE server list. Whether the list
    /// was applied is decided by the configured turn policy.
    TurnChanged { servers: Vec<IceServer> },
    /// Server confirmed the local identity.
    Hello { user: String },
    /// A remote caller wants to establish a call; answer with
    /// `do_answer` or decline with `do_reject`.
    IncomingCall {
        user: String,
        profile: Option<Value>,
    },
    /// An outbound call (or group peer) was accepted and is being
    /// established.
    OutgoingCall {
        user: String,
        profile: Option<Value>,
    },
    /// An outbound call was declined before establishment.
    AbortCall { user: String, reason: String },
    /// A peer hung up.
    Hangup {
        user: String,
        details: Option<Value>,
    },
    /// A remote media stream arrived on a peer connection.
    PeerStream { user: String, stream: MediaStream },
    /// A remote media track arrived on a peer connection.
    PeerTrack {
        user: String,
        track: MediaTrack,
        stream: Option<MediaStream>,
    },
    /// Chat traffic; opaque to the engine.
    Chats(Value),
}
