//! Peer-to-peer side channel over established data channels.

pub(crate) mod controller;

pub(crate) use controller::P2pController;
