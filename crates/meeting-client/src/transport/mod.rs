//! Control channel: HTTP bootstrap and the WebSocket transport actor.

pub mod bootstrap;
pub mod client;

pub use bootstrap::{ConnectInfo, TurnConfig};
pub use client::{TransportCommand, TransportEvent, TransportHandle, TransportState};
