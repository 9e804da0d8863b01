//! P2P side-channel controller.
//!
//! Runs over the data channel of each fully connected peer. After a
//! handshake both sides announce their auxiliary streams (screen share);
//! each (peer, stream) pair gets a dedicated sub-connection whose
//! signaling is tunnelled through the parent data channel with the
//! stream's token as routing key. Signals flagged `noop` are wake-ups
//! only and never reach a connection.

use crate::call::record::stream_token;
use crate::errors::ClientError;
use crate::events::ClientEvent;
use crate::peer::factory::{PeerFactory, RECOVERY_DELAY};
use crate::peer::{MediaPeer, MediaStream, PeerEvent};
use crate::session::InternalMsg;
use crate::transport::client::now_ms;
use serde_json::{json, Value};
use signaling_protocol::p2p::{
    P2pMessage, P2pSubtype, PeerEnvelope, PeerPayload, StreamAnnouncement, StreamKind,
};
use signaling_protocol::webrtc::{WebRtcMessage, WebRtcSubtype};
use signaling_protocol::{P2P_VERSION, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-connection side-channel state, keyed by the parent connection id.
struct P2pRecord {
    id: String,
    /// Call-engine peer table key of the parent.
    peer_id: String,
    user: String,
    initiator: bool,
    reconnect: bool,
    /// Gates stream announcements; set once the handshake completed.
    ready: bool,
    /// Send timestamp of our handshake; the reply must echo it.
    ts: i64,
    remote_handshake: Option<P2pMessage>,
    peer: Arc<dyn MediaPeer>,
    /// Streams announced by the remote side, keyed by stream id.
    streams: HashMap<String, RemoteStreamRecord>,
}

struct RemoteStreamRecord {
    kind: StreamKind,
    token: String,
    sub: Option<SubConnection>,
}

struct SubConnection {
    pc: Arc<dyn MediaPeer>,
    remote_pc_id: String,
}

/// A locally published stream, announced to every ready peer.
struct LocalStreamRecord {
    id: String,
    kind: StreamKind,
    token: String,
    #[allow(dead_code)]
    sequence: u64,
    stream: MediaStream,
    /// Per-peer send connections, keyed by the parent connection id.
    connections: HashMap<String, SubConnection>,
}

enum Route {
    Local(String),
    Remote(String),
}

pub(crate) struct P2pController {
    factory: Arc<PeerFactory>,
    internal_tx: mpsc::UnboundedSender<InternalMsg>,
    events: mpsc::UnboundedSender<ClientEvent>,
    records: HashMap<String, P2pRecord>,
    local_streams: HashMap<String, LocalStreamRecord>,
    sequence: u64,
}

impl P2pController {
    pub(crate) fn new(
        factory: Arc<PeerFactory>,
        internal_tx: mpsc::UnboundedSender<InternalMsg>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            factory,
            internal_tx,
            events,
            records: HashMap::new(),
            local_streams: HashMap::new(),
            sequence: 0,
        }
    }

    /// A parent peer finished connecting: open the side channel.
    pub(crate) fn peer_connected(
        &mut self,
        peer_id: String,
        user: String,
        initiator: bool,
        reconnect: bool,
        peer: Arc<dyn MediaPeer>,
    ) {
        let id = peer.local_id();
        debug!(
            target: "client.p2p",
            p2p_id = %id,
            user = %user,
            "side channel opening"
        );
        self.records.insert(
            id.clone(),
            P2pRecord {
                id: id.clone(),
                peer_id,
                user,
                initiator,
                reconnect,
                ready: false,
                ts: now_ms(),
                remote_handshake: None,
                peer,
                streams: HashMap::new(),
            },
        );
        self.send_handshake(&id);
    }

    /// A parent connection went away: drop its side-channel state and
    /// every sub-connection bound to it.
    pub(crate) fn peer_closed(&mut self, pc_id: &str) {
        if let Some(record) = self.records.remove(pc_id) {
            for (_, stream) in record.streams {
                if let Some(sub) = stream.sub {
                    sub.pc.destroy();
                }
            }
            debug!(
                target: "client.p2p",
                p2p_id = %record.id,
                peer_id = %record.peer_id,
                "side channel closed"
            );
        }
        for stream in self.local_streams.values_mut() {
            if let Some(sub) = stream.connections.remove(pc_id) {
                sub.pc.destroy();
            }
        }
    }

    /// Publish a local stream and announce it to every ready peer.
    pub(crate) fn add_local_stream(
        &mut self,
        stream: MediaStream,
        kind: StreamKind,
    ) -> Result<String, ClientError> {
        let id = stream.id().to_string();
        if self.local_streams.contains_key(&id) {
            return Err(ClientError::Internal(format!(
                "stream {id} already published"
            )));
        }
        self.sequence += 1;
        self.local_streams.insert(
            id.clone(),
            LocalStreamRecord {
                id: id.clone(),
                kind,
                token: stream_token(),
                sequence: self.sequence,
                stream,
                connections: HashMap::new(),
            },
        );
        self.announce_all();
        Ok(id)
    }

    /// Withdraw a local stream; peers learn about it from the next
    /// announcement, which no longer lists it.
    pub(crate) fn remove_local_stream(&mut self, id: &str) -> Result<(), ClientError> {
        let Some(stream) = self.local_streams.remove(id) else {
            return Err(ClientError::WrongStream);
        };
        for (_, sub) in stream.connections {
            sub.pc.destroy();
        }
        self.announce_all();
        Ok(())
    }

    /// Inbound data-channel payload from a parent peer.
    pub(crate) fn handle_data(&mut self, pc_id: &str, text: &str) {
        let envelope: PeerEnvelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(target: "client.p2p", error = %e, "unparseable data channel payload");
                return;
            }
        };
        match envelope.payload {
            PeerPayload::P2p(msg) => {
                if msg.v < P2P_VERSION {
                    debug!(target: "client.p2p", v = msg.v, "outdated p2p message");
                    return;
                }
                match msg.subtype {
                    P2pSubtype::Handshake => self.handle_handshake(pc_id, msg),
                    P2pSubtype::HandshakeReply => self.handle_handshake_reply(pc_id, msg),
                    P2pSubtype::AnnounceStreams => self.handle_announce(pc_id, msg.streams),
                }
            }
            PeerPayload::Webrtc(signal) => {
                if signal.subtype != WebRtcSubtype::WebrtcSignal {
                    debug!(target: "client.p2p", "unexpected nested subtype");
                    return;
                }
                self.handle_stream_signal(pc_id, signal);
            }
        }
    }

    fn send_handshake(&mut self, pc_id: &str) {
        let Some(record) = self.records.get_mut(pc_id) else {
            return;
        };
        let mut msg = P2pMessage::new(P2pSubtype::Handshake);
        msg.ts = record.ts;
        if let Some(theirs) = &record.remote_handshake {
            let mut reply = P2pMessage::new(P2pSubtype::HandshakeReply);
            reply.ts = theirs.ts;
            msg.data = Some(Box::new(reply));
        }
        let envelope = PeerEnvelope {
            payload: PeerPayload::P2p(msg),
        };
        if let Err(e) = send_over(record.peer.as_ref(), &envelope) {
            warn!(target: "client.p2p", error = %e, "handshake send failed");
        }
    }

    fn handle_handshake(&mut self, pc_id: &str, msg: P2pMessage) {
        let piggyback = {
            let Some(record) = self.records.get_mut(pc_id) else {
                warn!(target: "client.p2p", "handshake from unknown connection");
                return;
            };
            if record.ready {
                warn!(target: "client.p2p", p2p_id = %record.id, "duplicate handshake");
                return;
            }
            let piggyback = msg.data.clone();
            let mut reply = P2pMessage::new(P2pSubtype::HandshakeReply);
            reply.ts = msg.ts;
            record.remote_handshake = Some(msg);
            let envelope = PeerEnvelope {
                payload: PeerPayload::P2p(reply),
            };
            if let Err(e) = send_over(record.peer.as_ref(), &envelope) {
                warn!(target: "client.p2p", error = %e, "handshake reply send failed");
            }
            piggyback
        };
        if let Some(reply) = piggyback {
            self.handle_handshake_reply(pc_id, *reply);
        }
    }

    fn handle_handshake_reply(&mut self, pc_id: &str, msg: P2pMessage) {
        let Some(record) = self.records.get_mut(pc_id) else {
            return;
        };
        if record.ready {
            debug!(target: "client.p2p", "handshake already complete");
            return;
        }
        if msg.ts != record.ts || msg.v != P2P_VERSION {
            warn!(
                target: "client.p2p",
                p2p_id = %record.id,
                "handshake reply mismatch"
            );
            return;
        }
        record.ready = true;
        debug!(target: "client.p2p", p2p_id = %record.id, "side channel ready");
        self.announce_to(pc_id, false);
    }

    fn announce_all(&mut self) {
        let ids: Vec<String> = self.records.keys().cloned().collect();
        for id in ids {
            self.announce_to(&id, true);
        }
    }

    fn announce_to(&mut self, pc_id: &str, force: bool) {
        let list: Vec<StreamAnnouncement> = self
            .local_streams
            .values()
            .map(|s| StreamAnnouncement {
                id: s.id.clone(),
                kind: s.kind,
                token: s.token.clone(),
                v: P2P_VERSION,
            })
            .collect();
        let Some(record) = self.records.get(pc_id) else {
            return;
        };
        if !record.ready || (list.is_empty() && !force) {
            return;
        }
        let mut msg = P2pMessage::new(P2pSubtype::AnnounceStreams);
        msg.streams = list;
        let envelope = PeerEnvelope {
            payload: PeerPayload::P2p(msg),
        };
        if let Err(e) = send_over(record.peer.as_ref(), &envelope) {
            warn!(target: "client.p2p", error = %e, "stream announcement failed");
        }
    }

    fn handle_announce(&mut self, pc_id: &str, entries: Vec<StreamAnnouncement>) {
        let initiator = {
            let Some(record) = self.records.get(pc_id) else {
                return;
            };
            if !record.ready {
                warn!(target: "client.p2p", "announcement before handshake");
                return;
            }
            record.initiator
        };
        let entries: Vec<StreamAnnouncement> = entries
            .into_iter()
            .filter(|e| e.v >= P2P_VERSION)
            .collect();

        // Entries no longer announced go away along with their
        // sub-connections.
        let removed: Vec<String> = {
            let Some(record) = self.records.get(pc_id) else {
                return;
            };
            record
                .streams
                .keys()
                .filter(|sid| !entries.iter().any(|e| &e.id == *sid))
                .cloned()
                .collect()
        };
        for sid in removed {
            if let Some(record) = self.records.get_mut(pc_id) {
                if let Some(stream) = record.streams.remove(&sid) {
                    if let Some(sub) = stream.sub {
                        sub.pc.destroy();
                    }
                    debug!(target: "client.p2p", stream_id = %sid, "remote stream withdrawn");
                }
            }
        }

        for entry in entries {
            let existing_token = self
                .records
                .get(pc_id)
                .and_then(|r| r.streams.get(&entry.id))
                .map(|s| s.token.clone());
            match existing_token {
                Some(token) if token == entry.token => {}
                Some(_) => {
                    // Token changed: rebind the routing key.
                    if let Some(stream) = self
                        .records
                        .get_mut(pc_id)
                        .and_then(|r| r.streams.get_mut(&entry.id))
                    {
                        stream.token = entry.token.clone();
                        debug!(
                            target: "client.p2p",
                            stream_id = %entry.id,
                            "stream token rebound"
                        );
                    }
                }
                None => {
                    if entry.kind == StreamKind::Unknown {
                        debug!(
                            target: "client.p2p",
                            stream_id = %entry.id,
                            "stream of unknown kind ignored"
                        );
                        continue;
                    }
                    // New remote stream: a screenshare is received on a
                    // video-only sub-connection.
                    let sub = match self.factory.create_stream_peer(
                        pc_id,
                        &entry.id,
                        false,
                        initiator,
                        Vec::new(),
                        entry.kind == StreamKind::Screenshare,
                    ) {
                        Ok(pc) => pc,
                        Err(e) => {
                            warn!(
                                target: "client.p2p",
                                error = %e,
                                stream_id = %entry.id,
                                "sub-connection create failed"
                            );
                            continue;
                        }
                    };
                    let sub_id = sub.local_id();
                    let Some(record) = self.records.get_mut(pc_id) else {
                        sub.destroy();
                        return;
                    };
                    record.streams.insert(
                        entry.id.clone(),
                        RemoteStreamRecord {
                            kind: entry.kind,
                            token: entry.token.clone(),
                            sub: Some(SubConnection {
                                pc: sub,
                                remote_pc_id: String::new(),
                            }),
                        },
                    );
                    if !initiator {
                        // Wake the announcing side up so it starts the
                        // nested negotiation.
                        let _ = self.send_stream_signal(
                            pc_id,
                            &entry.token,
                            &sub_id,
                            json!({"renegotiate": true, "noop": true}),
                        );
                    }
                }
            }
        }
    }

    fn route(&self, pc_id: &str, token: &str) -> Option<Route> {
        if let Some(stream) = self.local_streams.values().find(|s| s.token == token) {
            return Some(Route::Local(stream.id.clone()));
        }
        let record = self.records.get(pc_id)?;
        record
            .streams
            .iter()
            .find(|(_, s)| s.token == token)
            .map(|(sid, _)| Route::Remote(sid.clone()))
    }

    fn handle_stream_signal(&mut self, pc_id: &str, signal: WebRtcMessage) {
        if signal.v < PROTOCOL_VERSION {
            debug!(target: "client.p2p", v = signal.v, "outdated nested signal");
            return;
        }
        let Some(route) = self.route(pc_id, &signal.source) else {
            warn!(
                target: "client.p2p",
                token = %signal.source,
                "signal for unknown stream"
            );
            return;
        };
        let initiator = {
            let Some(record) = self.records.get(pc_id) else {
                return;
            };
            record.initiator
        };
        let noop = signal
            .data
            .as_ref()
            .and_then(|d| d.get("noop"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        match route {
            Route::Local(sid) => self.feed_local(pc_id, &sid, signal, noop, initiator),
            Route::Remote(sid) => self.feed_remote(pc_id, &sid, signal, noop, initiator),
        }
    }

    /// Nested signal for one of our published streams; the remote side
    /// is receiving it through a sub-connection we own on this peer.
    fn feed_local(
        &mut self,
        pc_id: &str,
        sid: &str,
        signal: WebRtcMessage,
        noop: bool,
        initiator: bool,
    ) {
        let missing = self
            .local_streams
            .get(sid)
            .map_or(true, |s| !s.connections.contains_key(pc_id));
        if missing {
            let Some(media) = self.local_streams.get(sid).map(|s| s.stream.clone()) else {
                return;
            };
            match self
                .factory
                .create_stream_peer(pc_id, sid, true, initiator, vec![media], false)
            {
                Ok(pc) => {
                    if let Some(stream) = self.local_streams.get_mut(sid) {
                        stream.connections.insert(
                            pc_id.to_string(),
                            SubConnection {
                                pc,
                                remote_pc_id: String::new(),
                            },
                        );
                    }
                }
                Err(e) => {
                    warn!(target: "client.p2p", error = %e, "send sub-connection create failed");
                    return;
                }
            }
        }

        let recreate = {
            let Some(conn) = self
                .local_streams
                .get_mut(sid)
                .and_then(|s| s.connections.get_mut(pc_id))
            else {
                return;
            };
            reconcile_remote_pc(conn, &signal.pcid)
        };
        if recreate {
            let Some(media) = self.local_streams.get(sid).map(|s| s.stream.clone()) else {
                return;
            };
            if let Some(conn) = self
                .local_streams
                .get(sid)
                .and_then(|s| s.connections.get(pc_id))
            {
                conn.pc.destroy();
            }
            match self
                .factory
                .create_stream_peer(pc_id, sid, true, initiator, vec![media], false)
            {
                Ok(pc) => {
                    if let Some(conn) = self
                        .local_streams
                        .get_mut(sid)
                        .and_then(|s| s.connections.get_mut(pc_id))
                    {
                        conn.pc = pc;
                    }
                }
                Err(e) => {
                    warn!(target: "client.p2p", error = %e, "sub-connection recreate failed");
                    return;
                }
            }
        }

        if noop {
            return;
        }
        let Some(data) = signal.data else {
            return;
        };
        if let Some(conn) = self
            .local_streams
            .get(sid)
            .and_then(|s| s.connections.get(pc_id))
        {
            if let Err(e) = conn.pc.signal(data) {
                warn!(target: "client.p2p", error = %e, "sub-connection signal failed");
            }
        }
    }

    /// Nested signal for a stream the remote announced to us.
    fn feed_remote(
        &mut self,
        pc_id: &str,
        sid: &str,
        signal: WebRtcMessage,
        noop: bool,
        initiator: bool,
    ) {
        let recreate = {
            let Some(sub) = self
                .records
                .get_mut(pc_id)
                .and_then(|r| r.streams.get_mut(sid))
                .and_then(|s| s.sub.as_mut())
            else {
                return;
            };
            reconcile_remote_pc(sub, &signal.pcid)
        };
        if recreate {
            if let Some(sub) = self
                .records
                .get(pc_id)
                .and_then(|r| r.streams.get(sid))
                .and_then(|s| s.sub.as_ref())
            {
                sub.pc.destroy();
            }
            let recv_video = self.remote_recv_video(pc_id, sid);
            match self
                .factory
                .create_stream_peer(pc_id, sid, false, initiator, Vec::new(), recv_video)
            {
                Ok(pc) => {
                    if let Some(sub) = self
                        .records
                        .get_mut(pc_id)
                        .and_then(|r| r.streams.get_mut(sid))
                        .and_then(|s| s.sub.as_mut())
                    {
                        sub.pc = pc;
                    }
                }
                Err(e) => {
                    warn!(target: "client.p2p", error = %e, "sub-connection recreate failed");
                    return;
                }
            }
        }

        if noop {
            return;
        }
        let Some(data) = signal.data else {
            return;
        };
        if let Some(sub) = self
            .records
            .get(pc_id)
            .and_then(|r| r.streams.get(sid))
            .and_then(|s| s.sub.as_ref())
        {
            if let Err(e) = sub.pc.signal(data) {
                warn!(target: "client.p2p", error = %e, "sub-connection signal failed");
            }
        }
    }

    fn send_stream_signal(
        &self,
        pc_id: &str,
        token: &str,
        sub_pc_id: &str,
        data: Value,
    ) -> Result<(), ClientError> {
        let record = self.records.get(pc_id).ok_or(ClientError::UnknownPeer)?;
        let mut msg = WebRtcMessage::new(WebRtcSubtype::WebrtcSignal);
        msg.source = token.to_string();
        msg.pcid = sub_pc_id.to_string();
        msg.data = Some(data);
        let envelope = PeerEnvelope {
            payload: PeerPayload::Webrtc(msg),
        };
        send_over(record.peer.as_ref(), &envelope)
    }

    /// Event from a per-stream sub-connection.
    pub(crate) fn handle_sub_event(
        &mut self,
        p2p_id: &str,
        stream_id: &str,
        local: bool,
        pc_id: &str,
        event: PeerEvent,
    ) {
        let Some((token, current_pc)) = self.sub_view(p2p_id, stream_id, local) else {
            return;
        };
        if current_pc != pc_id {
            debug!(target: "client.p2p", "event from superseded sub-connection");
            return;
        }
        let Some((user, reconnect)) = self
            .records
            .get(p2p_id)
            .map(|r| (r.user.clone(), r.reconnect))
        else {
            return;
        };

        match event {
            PeerEvent::Signal(data) => {
                if self
                    .send_stream_signal(p2p_id, &token, pc_id, data)
                    .is_err()
                    && reconnect
                {
                    self.schedule_sub_recovery(p2p_id, stream_id, local, pc_id);
                }
            }
            PeerEvent::Error(e) => {
                warn!(
                    target: "client.p2p",
                    error = %e,
                    stream_id = %stream_id,
                    "sub-connection error"
                );
                if reconnect {
                    self.schedule_sub_recovery(p2p_id, stream_id, local, pc_id);
                }
            }
            PeerEvent::Stream(stream) => {
                let _ = self.events.send(ClientEvent::PeerStream { user, stream });
            }
            PeerEvent::Track { track, stream } => {
                let _ = self
                    .events
                    .send(ClientEvent::PeerTrack { user, track, stream });
            }
            PeerEvent::Connect
            | PeerEvent::Close
            | PeerEvent::Data(_)
            | PeerEvent::IceStateChange(_)
            | PeerEvent::SignalingStateChange(_) => {
                debug!(target: "client.p2p", stream_id = %stream_id, "sub-connection event");
            }
        }
    }

    fn remote_recv_video(&self, pc_id: &str, sid: &str) -> bool {
        self.records
            .get(pc_id)
            .and_then(|r| r.streams.get(sid))
            .map_or(true, |s| matches!(s.kind, StreamKind::Screenshare))
    }

    fn sub_view(&self, p2p_id: &str, stream_id: &str, local: bool) -> Option<(String, String)> {
        if local {
            let stream = self.local_streams.get(stream_id)?;
            let conn = stream.connections.get(p2p_id)?;
            Some((stream.token.clone(), conn.pc.local_id()))
        } else {
            let record = self.records.get(p2p_id)?;
            let stream = record.streams.get(stream_id)?;
            let sub = stream.sub.as_ref()?;
            Some((stream.token.clone(), sub.pc.local_id()))
        }
    }

    fn schedule_sub_recovery(&self, p2p_id: &str, stream_id: &str, local: bool, pc_id: &str) {
        let internal = self.internal_tx.clone();
        let p2p = p2p_id.to_string();
        let stream = stream_id.to_string();
        let pc = pc_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(RECOVERY_DELAY).await;
            let _ = internal.send(InternalMsg::RecoverSub {
                p2p_id: p2p,
                stream_id: stream,
                local,
                pc_id: pc,
            });
        });
    }

    /// Delayed sub-connection recovery: recreate the connection if it is
    /// still the failed one, clear its remote binding, and wake the
    /// remote side up when we are not the initiator.
    pub(crate) fn handle_recover_sub(
        &mut self,
        p2p_id: &str,
        stream_id: &str,
        local: bool,
        pc_id: &str,
    ) {
        let Some((_, current_pc)) = self.sub_view(p2p_id, stream_id, local) else {
            return;
        };
        if current_pc != pc_id {
            return;
        }
        let Some((initiator, reconnect)) = self
            .records
            .get(p2p_id)
            .map(|r| (r.initiator, r.reconnect))
        else {
            return;
        };
        if !reconnect {
            return;
        }

        debug!(
            target: "client.p2p",
            stream_id = %stream_id,
            "recovering sub-connection"
        );
        let created = if local {
            let Some(media) = self.local_streams.get(stream_id).map(|s| s.stream.clone())
            else {
                return;
            };
            if let Some(conn) = self
                .local_streams
                .get(stream_id)
                .and_then(|s| s.connections.get(p2p_id))
            {
                conn.pc.destroy();
            }
            self.factory
                .create_stream_peer(p2p_id, stream_id, true, initiator, vec![media], false)
        } else {
            if let Some(sub) = self
                .records
                .get(p2p_id)
                .and_then(|r| r.streams.get(stream_id))
                .and_then(|s| s.sub.as_ref())
            {
                sub.pc.destroy();
            }
            let recv_video = self.remote_recv_video(p2p_id, stream_id);
            self.factory
                .create_stream_peer(p2p_id, stream_id, false, initiator, Vec::new(), recv_video)
        };
        let pc = match created {
            Ok(pc) => pc,
            Err(e) => {
                warn!(target: "client.p2p", error = %e, "sub-connection recovery failed");
                return;
            }
        };
        let sub_id = pc.local_id();

        let token = if local {
            let Some(stream) = self.local_streams.get_mut(stream_id) else {
                return;
            };
            if let Some(conn) = stream.connections.get_mut(p2p_id) {
                conn.pc = pc;
                conn.remote_pc_id.clear();
            }
            stream.token.clone()
        } else {
            let Some(stream) = self
                .records
                .get_mut(p2p_id)
                .and_then(|r| r.streams.get_mut(stream_id))
            else {
                return;
            };
            if let Some(sub) = stream.sub.as_mut() {
                sub.pc = pc;
                sub.remote_pc_id.clear();
            }
            stream.token.clone()
        };

        if !initiator {
            let _ = self.send_stream_signal(
                p2p_id,
                &token,
                &sub_id,
                json!({"renegotiate": true, "noop": true}),
            );
        }
    }
}

/// Bind an inbound `pcid` to a sub-connection; returns true when the
/// remote restarted its connection and ours must be recreated.
fn reconcile_remote_pc(conn: &mut SubConnection, msg_pcid: &str) -> bool {
    if msg_pcid == conn.remote_pc_id {
        return false;
    }
    if conn.remote_pc_id.is_empty() {
        conn.remote_pc_id = msg_pcid.to_string();
        return false;
    }
    conn.remote_pc_id = msg_pcid.to_string();
    true
}

fn send_over(peer: &dyn MediaPeer, envelope: &PeerEnvelope) -> Result<(), ClientError> {
    let text =
        serde_json::to_string(envelope).map_err(|e| ClientError::Internal(e.to_string()))?;
    peer.send_text(&text)
}
