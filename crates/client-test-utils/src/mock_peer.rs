//! Scripted media peer provider.
//!
//! Every created peer records what the engine did to it (signals fed,
//! data-channel payloads sent, streams attached) and lets a test emit
//! arbitrary peer events. `inject_signal` loops back into the event
//! stream like a real provider would.

use meeting_client::errors::ClientError;
use meeting_client::peer::{
    CreatedPeer, MediaPeer, MediaStream, MediaTrack, PeerEvent, PeerOptions, PeerProvider,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct MockMediaPeer {
    id: String,
    initiator: bool,
    connected: AtomicBool,
    destroyed: AtomicBool,
    fail_sends: AtomicBool,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    received_signals: Mutex<Vec<Value>>,
    sent_texts: Mutex<Vec<String>>,
    added_streams: Mutex<Vec<String>>,
    removed_streams: Mutex<Vec<String>>,
}

impl MockMediaPeer {
    /// Emit a peer event towards the engine.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Signals the engine fed into this peer.
    pub fn received_signals(&self) -> Vec<Value> {
        self.received_signals.lock().expect("poisoned").clone()
    }

    /// Data-channel payloads the engine sent through this peer.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent_texts.lock().expect("poisoned").clone()
    }

    /// Drain the recorded data-channel payloads.
    pub fn take_sent_texts(&self) -> Vec<String> {
        std::mem::take(&mut *self.sent_texts.lock().expect("poisoned"))
    }

    pub fn added_streams(&self) -> Vec<String> {
        self.added_streams.lock().expect("poisoned").clone()
    }

    pub fn removed_streams(&self) -> Vec<String> {
        self.removed_streams.lock().expect("poisoned").clone()
    }

    /// Make subsequent `send_text` calls fail (recovery tests).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl MediaPeer for MockMediaPeer {
    fn local_id(&self) -> String {
        self.id.clone()
    }

    fn initiator(&self) -> bool {
        self.initiator
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn signal(&self, data: Value) -> Result<(), ClientError> {
        if self.destroyed() {
            return Err(ClientError::ConnectionDestroyed);
        }
        self.received_signals.lock().expect("poisoned").push(data);
        Ok(())
    }

    fn send_text(&self, text: &str) -> Result<(), ClientError> {
        if self.destroyed() {
            return Err(ClientError::ConnectionDestroyed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::NoConnection);
        }
        self.sent_texts
            .lock()
            .expect("poisoned")
            .push(text.to_string());
        Ok(())
    }

    fn add_stream(&self, stream: &MediaStream) {
        self.added_streams
            .lock()
            .expect("poisoned")
            .push(stream.id().to_string());
    }

    fn remove_stream(&self, stream: &MediaStream) {
        self.removed_streams
            .lock()
            .expect("poisoned")
            .push(stream.id().to_string());
    }

    fn add_track(&self, track: &MediaTrack, stream: &MediaStream) {
        self.added_streams
            .lock()
            .expect("poisoned")
            .push(format!("{}/{}", stream.id(), track.id()));
    }

    fn remove_track(&self, track: &MediaTrack, stream: &MediaStream) {
        self.removed_streams
            .lock()
            .expect("poisoned")
            .push(format!("{}/{}", stream.id(), track.id()));
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(PeerEvent::Close);
    }

    fn inject_signal(&self, data: Value) {
        let _ = self.events_tx.send(PeerEvent::Signal(data));
    }
}

/// What the provider saw when a peer was created.
#[derive(Clone)]
pub struct CreatedPeerInfo {
    pub peer: Arc<MockMediaPeer>,
    pub initiator: bool,
    pub stream_ids: Vec<String>,
    pub recv_video: bool,
    pub channel_name: String,
}

#[derive(Default)]
pub struct MockPeerProvider {
    counter: AtomicU64,
    created: Mutex<Vec<CreatedPeerInfo>>,
    fail_creates: AtomicBool,
}

impl MockPeerProvider {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> Vec<CreatedPeerInfo> {
        self.created.lock().expect("poisoned").clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().expect("poisoned").len()
    }

    /// The n-th created peer, panicking when out of range.
    pub fn peer(&self, index: usize) -> Arc<MockMediaPeer> {
        Arc::clone(&self.created.lock().expect("poisoned")[index].peer)
    }

    pub fn last(&self) -> Option<CreatedPeerInfo> {
        self.created.lock().expect("poisoned").last().cloned()
    }

    /// Make subsequent creates fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }
}

impl PeerProvider for MockPeerProvider {
    fn create(&self, options: PeerOptions) -> Result<CreatedPeer, ClientError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ClientError::Provider("scripted create failure".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MockMediaPeer {
            id: format!("pc-{n}"),
            initiator: options.initiator,
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            events_tx,
            received_signals: Mutex::new(Vec::new()),
            sent_texts: Mutex::new(Vec::new()),
            added_streams: Mutex::new(Vec::new()),
            removed_streams: Mutex::new(Vec::new()),
        });
        self.created.lock().expect("poisoned").push(CreatedPeerInfo {
            peer: Arc::clone(&peer),
            initiator: options.initiator,
            stream_ids: options.streams.iter().map(|s| s.id().to_string()).collect(),
            recv_video: options.recv_video,
            channel_name: options.channel_name,
        });
        Ok(CreatedPeer {
            peer,
            events: events_rx,
        })
    }
}
