//! Signaling and peer-coordination engine for the meetings service.
//!
//! This crate is the client-side core between a user-facing application
//! and its media connections: it keeps a reconnecting, heartbeated
//! control channel to the signaling service, runs the call/group/
//! pipeline state machine, and speaks the peer-to-peer side protocol
//! over established data channels.
//!
//! # Architecture
//!
//! ```text
//! Client (handle)
//! └── SessionController (one task per client)
//!     ├── routes control envelopes from the TransportClient actor
//!     ├── CallEngine: channel, peer table, call/group/pipeline state
//!     │   ├── GroupState: full-mesh reconciliation
//!     │   ├── PeerFactory: media peers via the provider seam
//!     │   └── P2pController: data-channel handshake, stream
//!     │       announcements, nested per-stream connections
//!     └── emits ClientEvent to the application
//! ```
//!
//! # Key design decisions
//!
//! - **Single logical thread**: all engine state lives on the session
//!   task; deferred work re-enters through an internal mailbox, so every
//!   handler is atomic relative to the others.
//! - **Records by id**: peers are table entries looked up by id; media
//!   connections are bound to records and verified by connection id on
//!   every event, which makes recovery a pure table operation.
//! - **Media engine behind a trait**: SDP, ICE and tracks belong to the
//!   [`peer::PeerProvider`] implementation; the engine only routes
//!   signals and toggles streams.

#![warn(clippy::pedantic)]

pub mod call;
pub mod config;
pub mod errors;
pub mod events;
pub mod p2p;
pub mod peer;
pub mod session;
pub mod transport;

pub use call::{EngineStatus, GroupSnapshot, PeerSnapshot};
pub use config::{ApiVersion, ClientConfig, ClientOptions, RtcOptions, SdpTransform, TurnPolicy};
pub use errors::ClientError;
pub use events::ClientEvent;
pub use session::Client;
pub use transport::{TransportEvent, TransportHandle, TransportState};
