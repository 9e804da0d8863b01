//! Call, group and pipeline state machine.

pub(crate) mod engine;
pub(crate) mod group;
pub(crate) mod record;

pub use engine::{EngineStatus, GroupSnapshot, PeerSnapshot};
pub(crate) use engine::CallEngine;
