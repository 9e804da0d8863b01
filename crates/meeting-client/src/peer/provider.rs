//! The media engine seam.
//!
//! The engine never touches SDP, ICE or tracks directly; it drives an
//! external provider through the [`MediaPeer`] capability set and reacts
//! to its [`PeerEvent`] stream. A provider is free to wrap a browser
//! peer connection, a native stack, or a scripted mock.

use crate::config::SdpTransform;
use crate::errors::ClientError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Media track kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Handle to a media track. The engine only toggles enablement; track
/// contents belong to the application.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    enabled: Arc<AtomicBool>,
}

impl MediaTrack {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Handle to a media stream owned by the application. The engine holds
/// references and attaches or detaches them from peers; it never mutates
/// the stream itself.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<Vec<MediaTrack>>,
}

impl MediaStream {
    #[must_use]
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(tracks),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// First track of the given kind, if any.
    #[must_use]
    pub fn first_track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }
}

/// One ICE server entry handed to new peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Events emitted by a media peer.
#[derive(Debug)]
pub enum PeerEvent {
    Error(String),
    /// Outbound signaling payload to forward to the remote side.
    Signal(Value),
    /// The connection (including its data channel) is established.
    Connect,
    Close,
    /// A text payload arrived on the data channel.
    Data(String),
    /// A remote media stream arrived.
    Stream(MediaStream),
    /// A remote track arrived.
    Track {
        track: MediaTrack,
        stream: Option<MediaStream>,
    },
    IceStateChange(String),
    SignalingStateChange(String),
}

/// Construction parameters for a peer.
#[derive(Clone)]
pub struct PeerOptions {
    pub initiator: bool,
    pub ice_servers: Vec<IceServer>,
    /// Local streams to send from the start.
    pub streams: Vec<MediaStream>,
    pub trickle: bool,
    pub channel_name: String,
    pub channel_config: Option<Value>,
    pub object_mode: bool,
    pub offer_constraints: Option<Value>,
    pub answer_constraints: Option<Value>,
    /// Applied to locally generated descriptions before signaling.
    pub sdp_transform: Option<SdpTransform>,
    /// Add a receive-only video transceiver when no local stream is
    /// supplied (used for per-stream sub-connections).
    pub recv_video: bool,
}

/// A freshly created peer and its event stream.
pub struct CreatedPeer {
    pub peer: Arc<dyn MediaPeer>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Capability set of a media connection.
pub trait MediaPeer: Send + Sync {
    /// Stable identifier of this connection; carried as `pcid` in
    /// signaling so restarts are detectable.
    fn local_id(&self) -> String;
    fn initiator(&self) -> bool;
    fn connected(&self) -> bool;
    fn destroyed(&self) -> bool;
    /// Feed a remote signaling payload into the connection.
    fn signal(&self, data: Value) -> Result<(), ClientError>;
    /// Send a text payload over the data channel.
    fn send_text(&self, text: &str) -> Result<(), ClientError>;
    fn add_stream(&self, stream: &MediaStream);
    fn remove_stream(&self, stream: &MediaStream);
    fn add_track(&self, track: &MediaTrack, stream: &MediaStream);
    fn remove_track(&self, track: &MediaTrack, stream: &MediaStream);
    fn destroy(&self);
    /// Make the peer emit a synthetic `Signal` event, e.g.
    /// `{"renegotiate": true}` to unblock the remote side.
    fn inject_signal(&self, data: Value);
}

/// Creates media peers.
pub trait PeerProvider: Send + Sync {
    fn create(&self, options: PeerOptions) -> Result<CreatedPeer, ClientError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_track_toggle() {
        let track = MediaTrack::new("t1", MediaKind::Audio);
        assert!(track.enabled());
        track.set_enabled(false);
        assert!(!track.enabled());
    }

    #[test]
    fn test_first_track_selects_by_kind() {
        let stream = MediaStream::new(
            "s1",
            vec![
                MediaTrack::new("a1", MediaKind::Audio),
                MediaTrack::new("v1", MediaKind::Video),
                MediaTrack::new("v2", MediaKind::Video),
            ],
        );
        assert_eq!(stream.first_track(MediaKind::Video).unwrap().id(), "v1");
        assert_eq!(stream.first_track(MediaKind::Audio).unwrap().id(), "a1");
    }

    #[test]
    fn test_first_track_missing_kind() {
        let stream = MediaStream::new("s1", vec![MediaTrack::new("a1", MediaKind::Audio)]);
        assert!(stream.first_track(MediaKind::Video).is_none());
    }
}
