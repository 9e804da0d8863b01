//! Test support for the meeting client.
//!
//! Provides a scripted [`MockPeerProvider`] standing in for the media
//! engine and a [`TransportHarness`] that drives the engine from the
//! transport side without sockets.

pub mod mock_peer;
pub mod transport_harness;

pub use mock_peer::{CreatedPeerInfo, MockMediaPeer, MockPeerProvider};
pub use transport_harness::TransportHarness;
