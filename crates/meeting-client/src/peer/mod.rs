//! Media peer abstraction and factory.

pub mod factory;
pub mod provider;

pub use factory::SharedIceServers;
pub use provider::{
    CreatedPeer, IceServer, MediaKind, MediaPeer, MediaStream, MediaTrack, PeerEvent,
    PeerOptions, PeerProvider,
};
