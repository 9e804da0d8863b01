//! Wire protocol for the meetings signaling service.
//!
//! This crate models the two JSON message surfaces the client speaks:
//!
//! - the server control channel: request/reply envelopes carrying `hello`,
//!   `goodbye`, `ping`/`pong`, `error`, `webrtc` and `chats` messages
//!   ([`envelope`], [`webrtc`]);
//! - the peer-to-peer side channel carried over an established media
//!   connection's data channel: handshake, stream announcements and nested
//!   signaling ([`p2p`]).
//!
//! All types round-trip through `serde_json`; unknown fields are tolerated
//! on decode so newer servers stay compatible with older clients.

#![warn(clippy::pedantic)]

pub mod envelope;
pub mod p2p;
pub mod webrtc;

/// Protocol version stamped on every `webrtc` envelope. Inbound messages
/// with a lower version are dropped.
pub const PROTOCOL_VERSION: u64 = 20_180_703;

/// Protocol version of the data-channel side protocol.
pub const P2P_VERSION: u64 = 1;
