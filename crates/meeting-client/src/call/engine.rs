//! The call engine.
//!
//! Owns the channel, the peer table, and the call/group/pipeline state
//! machine. All mutation happens on the session task; deferred work
//! (request replies, recovery timers) re-enters through the internal
//! mailbox so handlers stay atomic relative to each other.
//!
//! Identity rules enforced on every inbound message:
//!
//! - the message's `channel` must match the active channel;
//! - the peer's `hash` must match, except during a group hash exchange
//!   on an accepted call from the current group;
//! - `state`/`ref` nonces bind replies to requests independently of
//!   envelope ids;
//! - a changed `pcid` means the remote restarted its connection and the
//!   local one is rebuilt.

use crate::call::group::GroupState;
use crate::call::record::{compute_initiator, PeerRecord, PIPELINE_CID};
use crate::errors::ClientError;
use crate::events::ClientEvent;
use crate::p2p::P2pController;
use crate::peer::factory::{PeerFactory, RECOVERY_DELAY};
use crate::peer::{MediaKind, MediaStream, PeerEvent};
use crate::session::InternalMsg;
use crate::transport::TransportHandle;
use serde_json::{json, Value};
use signaling_protocol::envelope::{Envelope, Payload};
use signaling_protocol::p2p::StreamKind;
use signaling_protocol::webrtc::{
    CallData, ChannelExtra, GroupUpdate, PipelineInfo, WebRtcMessage, WebRtcSubtype,
};
use signaling_protocol::PROTOCOL_VERSION;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Reply timeout of `webrtc_call` and `webrtc_group` requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason sent when an incoming call hits an occupied channel.
const REASON_BUSY: &str = "reject_busy";

/// Default reject reason.
const REASON_REJECT: &str = "reject";

type ChannelReply = oneshot::Sender<Result<String, ClientError>>;

/// Snapshot of the engine state, for health checks and tests.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub user: Option<String>,
    pub channel: String,
    pub group: Option<GroupSnapshot>,
    pub peers: Vec<PeerSnapshot>,
    pub local_stream_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub id: String,
    pub members: Vec<String>,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: String,
    pub user: String,
    pub cid: String,
    pub group: String,
    pub hash: String,
    pub state: String,
    pub remote_state: String,
    pub remote_pc_id: String,
    pub initiator: bool,
    pub pc_id: Option<String>,
}

pub(crate) struct CallEngine {
    user: Option<String>,
    channel: String,
    peers: HashMap<String, PeerRecord>,
    group: Option<GroupState>,
    /// When set, local media flows only to this peer (pipeline mode).
    local_stream_target: Option<String>,
    local_stream: Option<MediaStream>,
    p2p: P2pController,
    transport: TransportHandle,
    factory: Arc<PeerFactory>,
    internal_tx: mpsc::UnboundedSender<InternalMsg>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl CallEngine {
    pub(crate) fn new(
        transport: TransportHandle,
        factory: Arc<PeerFactory>,
        internal_tx: mpsc::UnboundedSender<InternalMsg>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            user: None,
            channel: String::new(),
            peers: HashMap::new(),
            group: None,
            local_stream_target: None,
            local_stream: None,
            p2p: P2pController::new(
                Arc::clone(&factory),
                internal_tx.clone(),
                events.clone(),
            ),
            transport,
            factory,
            internal_tx,
            events,
        }
    }

    pub(crate) fn user(&self) -> Option<&String> {
        self.user.as_ref()
    }

    pub(crate) fn set_user(&mut self, user: String) {
        self.user = Some(user);
    }

    pub(crate) fn channel(&self) -> &str {
        &self.channel
    }

    pub(crate) fn group_member(&self, user: &str) -> bool {
        self.group.as_ref().is_some_and(|g| g.is_member(user))
    }

    pub(crate) fn status(&self) -> EngineStatus {
        EngineStatus {
            user: self.user.clone(),
            channel: self.channel.clone(),
            group: self.group.as_ref().map(|g| GroupSnapshot {
                id: g.id.clone(),
                members: g.members.clone(),
                hash: g.record.hash.clone(),
            }),
            peers: self
                .peers
                .values()
                .map(|r| PeerSnapshot {
                    id: r.id.clone(),
                    user: r.user.clone(),
                    cid: r.cid.clone(),
                    group: r.group.clone(),
                    hash: r.hash.clone(),
                    state: r.state.clone(),
                    remote_state: r.remote_state.clone(),
                    remote_pc_id: r.remote_pc_id.clone(),
                    initiator: r.initiator,
                    pc_id: r.pc.as_ref().map(|pc| pc.local_id()),
                })
                .collect(),
            local_stream_target: self.local_stream_target.clone(),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn is_stream_target(&self, record_id: &str) -> bool {
        self.local_stream_target
            .as_deref()
            .map_or(true, |target| target == record_id)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Place a 1:1 call. Resolves with the channel once the server
    /// acknowledged the call.
    pub(crate) fn do_call(&mut self, user: String, respond_to: ChannelReply) {
        if self.user.is_none() {
            let _ = respond_to.send(Err(ClientError::NoConnection));
            return;
        }
        if !self.channel.is_empty() {
            let _ = respond_to.send(Err(ClientError::ChannelExists));
            return;
        }
        if self.peers.contains_key(&user) {
            let _ = respond_to.send(Err(ClientError::PeerExists));
            return;
        }

        let mut record = PeerRecord::new(user.clone(), user.clone());
        record.initiator = true;
        let state = record.state.clone();
        self.peers.insert(user.clone(), record);
        info!(target: "client.call", user = %user, "placing call");

        let mut msg = WebRtcMessage::new(WebRtcSubtype::WebrtcCall);
        msg.target = user.clone();
        msg.initiator = true;
        msg.state = state.clone();

        let transport = self.transport.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport
                .request(Envelope::new(Payload::Webrtc(msg)), REQUEST_TIMEOUT)
                .await;
            let _ = internal.send(InternalMsg::CallReply {
                user,
                state,
                result,
                respond_to,
            });
        });
    }

    /// Completion of an outbound call request.
    pub(crate) async fn handle_call_reply(
        &mut self,
        user: String,
        state: String,
        result: Result<Envelope, ClientError>,
        respond_to: ChannelReply,
    ) {
        let current = self
            .peers
            .get(&user)
            .is_some_and(|r| r.state == state && r.initiator);
        match result {
            Err(e) => {
                if current {
                    self.hangup_peer(&user, "").await;
                }
                let _ = respond_to.send(Err(e));
            }
            Ok(envelope) => {
                if !current {
                    let _ = respond_to.send(Err(ClientError::Internal(
                        "call superseded before reply".to_string(),
                    )));
                    return;
                }
                match envelope.payload {
                    Payload::Webrtc(msg) => {
                        if let Some(record) = self.peers.get_mut(&user) {
                            record.hash = msg.hash.clone();
                        }
                        if !msg.channel.is_empty() {
                            self.channel = msg.channel.clone();
                        }
                        self.handle_webrtc_message(msg).await;
                        let _ = respond_to.send(Ok(self.channel.clone()));
                    }
                    Payload::Error(body) => {
                        self.hangup_peer(&user, "").await;
                        let _ = respond_to.send(Err(ClientError::Server {
                            code: body.error.code,
                            msg: body.error.msg,
                        }));
                    }
                    _ => {
                        let _ = respond_to.send(Err(ClientError::Internal(
                            "unexpected call reply".to_string(),
                        )));
                    }
                }
            }
        }
    }

    /// Accept an incoming call (or a mesh peer).
    pub(crate) async fn do_answer(&mut self, user: &str) -> Result<String, ClientError> {
        if self.channel.is_empty() {
            return Err(ClientError::NoChannel);
        }
        let (mut msg, channel) = {
            let record = self.peers.get_mut(user).ok_or(ClientError::UnknownPeer)?;
            let mut msg = WebRtcMessage::new(WebRtcSubtype::WebrtcCall);
            msg.target = record.user.clone();
            msg.channel = self.channel.clone();
            msg.group = record.group.clone();
            msg.hash = record.hash.clone();
            msg.state = record.state.clone();
            if !record.transaction.is_empty() {
                msg.transaction = Some(record.transaction.clone());
                record.transaction.clear();
            }
            msg.data = Some(json!({
                "accept": true,
                "state": record.remote_state,
            }));
            (msg, self.channel.clone())
        };
        self.transport
            .send(Envelope::new(Payload::Webrtc(msg)))
            .await?;
        Ok(channel)
    }

    /// Decline an incoming call; the peer is also torn down locally.
    pub(crate) async fn do_reject(
        &mut self,
        user: &str,
        reason: &str,
    ) -> Result<String, ClientError> {
        let msg = {
            let record = self.peers.get_mut(user).ok_or(ClientError::UnknownPeer)?;
            let mut msg = WebRtcMessage::new(WebRtcSubtype::WebrtcCall);
            msg.target = record.user.clone();
            msg.channel = self.channel.clone();
            msg.hash = record.hash.clone();
            msg.state = record.state.clone();
            if !record.transaction.is_empty() {
                msg.transaction = Some(record.transaction.clone());
                record.transaction.clear();
            }
            let reason = if reason.is_empty() { REASON_REJECT } else { reason };
            msg.data = Some(json!({
                "accept": false,
                "state": record.remote_state,
                "reason": reason,
            }));
            msg
        };
        let channel = self.channel.clone();
        if let Err(e) = self.transport.send(Envelope::new(Payload::Webrtc(msg))).await {
            debug!(target: "client.call", error = %e, "reject send failed");
        }
        // No hangup message follows a reject; the teardown is local.
        self.hangup_peer(user, "").await;
        Ok(channel)
    }

    /// Join (or create) a group call.
    pub(crate) fn do_group(&mut self, group: String, respond_to: ChannelReply) {
        if self.user.is_none() {
            let _ = respond_to.send(Err(ClientError::NoConnection));
            return;
        }
        if let Some(current) = &self.group {
            if current.id == group {
                self.refresh_group(Some(respond_to));
                return;
            }
        }
        if !self.channel.is_empty() {
            let _ = respond_to.send(Err(ClientError::ChannelExists));
            return;
        }

        let state = GroupState::new(group.clone());
        info!(target: "client.call", group = %group, "joining group");
        self.send_group_request(&state, Some(respond_to));
        self.group = Some(state);
    }

    /// Re-issue the group request, e.g. after the current user
    /// reappeared in the member set on reconnection.
    pub(crate) fn refresh_group(&mut self, respond_to: Option<ChannelReply>) {
        let Some(group) = &self.group else {
            if let Some(respond_to) = respond_to {
                let _ = respond_to.send(Err(ClientError::NoChannel));
            }
            return;
        };
        debug!(target: "client.call", group = %group.id, "refreshing group");
        self.send_group_request(group, respond_to);
    }

    fn send_group_request(&self, group: &GroupState, respond_to: Option<ChannelReply>) {
        let mut msg = WebRtcMessage::new(WebRtcSubtype::WebrtcGroup);
        msg.target = group.id.clone();
        msg.group = group.id.clone();
        msg.state = group.record.state.clone();
        msg.hash = group.record.hash.clone();

        let id = group.id.clone();
        let transport = self.transport.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport
                .request(Envelope::new(Payload::Webrtc(msg)), REQUEST_TIMEOUT)
                .await;
            let _ = internal.send(InternalMsg::GroupReply {
                group: id,
                result,
                respond_to,
            });
        });
    }

    /// Completion of a group request.
    pub(crate) async fn handle_group_reply(
        &mut self,
        group: String,
        result: Result<Envelope, ClientError>,
        respond_to: Option<ChannelReply>,
    ) {
        let current = self.group.as_ref().is_some_and(|g| g.id == group);
        match result {
            Err(e) => {
                if current && self.channel.is_empty() {
                    self.group = None;
                }
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(Err(e));
                }
            }
            Ok(envelope) => {
                if !current {
                    if let Some(respond_to) = respond_to {
                        let _ = respond_to.send(Err(ClientError::Internal(
                            "group superseded before reply".to_string(),
                        )));
                    }
                    return;
                }
                match envelope.payload {
                    Payload::Webrtc(msg) => {
                        if let Some(state) = self.group.as_mut() {
                            state.record.hash = msg.hash.clone();
                        }
                        self.handle_webrtc_message(msg).await;
                        if let Some(respond_to) = respond_to {
                            let _ = respond_to.send(Ok(self.channel.clone()));
                        }
                    }
                    Payload::Error(body) => {
                        if self.channel.is_empty() {
                            self.group = None;
                        }
                        if let Some(respond_to) = respond_to {
                            let _ = respond_to.send(Err(ClientError::Server {
                                code: body.error.code,
                                msg: body.error.msg,
                            }));
                        }
                    }
                    _ => {
                        if let Some(respond_to) = respond_to {
                            let _ = respond_to.send(Err(ClientError::Internal(
                                "unexpected group reply".to_string(),
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Hang up one peer, or everything when `user` is `None`. An empty
    /// `reason` makes the hangup local only; no envelope goes out.
    pub(crate) async fn do_hangup(
        &mut self,
        user: Option<String>,
        reason: &str,
    ) -> Result<String, ClientError> {
        let channel = self.channel.clone();
        match user {
            Some(user) => {
                if !self.peers.contains_key(&user) {
                    return Err(ClientError::UnknownPeer);
                }
                self.hangup_peer(&user, reason).await;
                Ok(channel)
            }
            None => {
                if let Some(group) = self.group.take() {
                    if !reason.is_empty() {
                        let mut msg = WebRtcMessage::new(WebRtcSubtype::WebrtcHangup);
                        msg.target = group.record.user.clone();
                        msg.channel = channel.clone();
                        msg.group = group.id.clone();
                        msg.hash = group.record.hash.clone();
                        msg.state = group.record.state.clone();
                        msg.data = Some(json!({ "reason": reason }));
                        if let Err(e) =
                            self.transport.send(Envelope::new(Payload::Webrtc(msg))).await
                        {
                            debug!(target: "client.call", error = %e, "group hangup send failed");
                        }
                    }
                }
                let ids: Vec<String> = self.peers.keys().cloned().collect();
                for id in ids {
                    self.hangup_peer(&id, reason).await;
                }
                self.channel.clear();
                self.local_stream_target = None;
                info!(target: "client.call", channel = %channel, "channel closed");
                Ok(channel)
            }
        }
    }

    async fn hangup_peer(&mut self, id: &str, reason: &str) {
        let Some(mut record) = self.peers.remove(id) else {
            return;
        };
        if !reason.is_empty() {
            let mut msg = WebRtcMessage::new(WebRtcSubtype::WebrtcHangup);
            msg.target = record.user.clone();
            msg.channel = self.channel.clone();
            msg.group = record.group.clone();
            msg.hash = record.hash.clone();
            msg.state = record.state.clone();
            msg.data = Some(json!({ "reason": reason }));
            if let Err(e) = self.transport.send(Envelope::new(Payload::Webrtc(msg))).await {
                debug!(target: "client.call", error = %e, "hangup send failed");
            }
        }
        if let Some(pc) = record.pc.take() {
            let pc_id = pc.local_id();
            pc.destroy();
            self.p2p.peer_closed(&pc_id);
        }
        debug!(target: "client.call", peer = %id, "peer removed");
        // An emptied table outside a group means the call session is
        // over; the channel identity goes with it.
        if self.peers.is_empty() && self.group.is_none() && !self.channel.is_empty() {
            self.channel.clear();
            self.local_stream_target = None;
            debug!(target: "client.call", "last peer gone, channel cleared");
        }
    }

    /// Swap the local media stream on every peer it is targeted at.
    pub(crate) fn set_local_stream(&mut self, stream: Option<MediaStream>) {
        let old = self.local_stream.take();
        let targets: Vec<Arc<dyn crate::peer::MediaPeer>> = self
            .peers
            .values()
            .filter(|r| self.is_stream_target(&r.id))
            .filter_map(|r| r.pc.clone())
            .collect();
        for pc in targets {
            if let Some(old) = &old {
                pc.remove_stream(old);
            }
            if let Some(new) = &stream {
                pc.add_stream(new);
            }
        }
        self.local_stream = stream;
    }

    /// Toggle the first audio or video track of the local stream.
    /// Returns whether a track was found.
    pub(crate) fn mute(&mut self, video: bool, mute: bool) -> bool {
        let Some(stream) = &self.local_stream else {
            return false;
        };
        let kind = if video { MediaKind::Video } else { MediaKind::Audio };
        match stream.first_track(kind) {
            Some(track) => {
                track.set_enabled(!mute);
                true
            }
            None => false,
        }
    }

    /// Publish a screen-share stream over the P2P side channel.
    pub(crate) fn start_screen_share(
        &mut self,
        stream: MediaStream,
    ) -> Result<String, ClientError> {
        self.p2p.add_local_stream(stream, StreamKind::Screenshare)
    }

    /// Withdraw a published screen-share stream.
    pub(crate) fn stop_screen_share(&mut self, id: &str) -> Result<(), ClientError> {
        self.p2p.remove_local_stream(id)
    }

    // ------------------------------------------------------------------
    // Inbound webrtc envelopes
    // ------------------------------------------------------------------

    pub(crate) async fn handle_webrtc_message(&mut self, msg: WebRtcMessage) {
        if msg.v < PROTOCOL_VERSION {
            debug!(target: "client.call", v = msg.v, "outdated webrtc message");
            return;
        }
        match msg.subtype {
            WebRtcSubtype::WebrtcCall => {
                if msg.initiator {
                    self.handle_incoming_call(msg).await;
                } else {
                    self.handle_call_answer(msg).await;
                }
            }
            WebRtcSubtype::WebrtcChannel => self.handle_channel(msg).await,
            WebRtcSubtype::WebrtcHangup => self.handle_hangup_message(msg).await,
            WebRtcSubtype::WebrtcSignal => self.handle_signal_message(msg),
            WebRtcSubtype::WebrtcGroup => {
                debug!(target: "client.call", "unexpected webrtc_group push");
            }
        }
    }

    /// A remote caller, relayed by the server.
    async fn handle_incoming_call(&mut self, msg: WebRtcMessage) {
        if msg.source.is_empty() {
            return;
        }
        if self.peers.contains_key(&msg.source) {
            if msg.target.is_empty() {
                // The call was taken by another connection of ours; the
                // server cancels silently.
                debug!(
                    target: "client.call",
                    source = %msg.source,
                    "call taken elsewhere, tearing peer down"
                );
                let _ = self.internal_tx.send(InternalMsg::LocalHangup {
                    user: Some(msg.source.clone()),
                });
            } else {
                debug!(target: "client.call", source = %msg.source, "duplicate call");
            }
            return;
        }
        if !self.channel.is_empty() {
            // Busy: decline with the caller's own nonce so it can match
            // the reply.
            let mut reply = WebRtcMessage::new(WebRtcSubtype::WebrtcCall);
            reply.target = msg.source.clone();
            reply.hash = msg.hash.clone();
            reply.transaction = msg.transaction.clone();
            reply.data = Some(json!({
                "accept": false,
                "reason": REASON_BUSY,
                "state": msg.state,
            }));
            if let Err(e) = self.transport.send(Envelope::new(Payload::Webrtc(reply))).await
            {
                debug!(target: "client.call", error = %e, "busy reject send failed");
            }
            return;
        }
        if msg.channel.is_empty() {
            warn!(target: "client.call", source = %msg.source, "incoming call without channel");
            return;
        }

        let mut record = PeerRecord::new(msg.source.clone(), msg.source.clone());
        record.remote_state = msg.state.clone();
        record.hash = msg.hash.clone();
        record.transaction = msg.transaction.clone().unwrap_or_default();
        record.profile = msg.profile.clone();
        self.peers.insert(msg.source.clone(), record);
        self.channel = msg.channel.clone();
        info!(
            target: "client.call",
            source = %msg.source,
            channel = %self.channel,
            "incoming call"
        );

        if let Some(data) = msg.data.clone() {
            self.handle_channel_extra(data).await;
        }
        self.emit(ClientEvent::IncomingCall {
            user: msg.source,
            profile: msg.profile,
        });
    }

    /// Reply to our outbound call, pushed or replayed from the request.
    async fn handle_call_answer(&mut self, msg: WebRtcMessage) {
        let Some(data) = msg.data.as_ref() else {
            debug!(target: "client.call", "call answer without data");
            return;
        };
        let Ok(data) = serde_json::from_value::<CallData>(data.clone()) else {
            debug!(target: "client.call", "unparseable call answer");
            return;
        };
        {
            let Some(record) = self.peers.get(&msg.source) else {
                debug!(target: "client.call", source = %msg.source, "answer for unknown peer");
                return;
            };
            // Anti-replay: the reply must carry our nonce.
            if record.state != data.state {
                debug!(target: "client.call", source = %msg.source, "stale call answer");
                return;
            }
            if record.hash != msg.hash {
                let group_exchange = data.accept
                    && !msg.group.is_empty()
                    && self
                        .group
                        .as_ref()
                        .is_some_and(|g| g.id == msg.group && record.group == g.id);
                if !group_exchange {
                    debug!(target: "client.call", source = %msg.source, "hash mismatch, dropped");
                    return;
                }
                debug!(target: "client.call", source = %msg.source, "group hash exchange");
            }
        }

        if !data.accept {
            let reason = data
                .reason
                .unwrap_or_else(|| "no reason given".to_string());
            info!(target: "client.call", source = %msg.source, reason = %reason, "call declined");
            let user = msg.source.clone();
            self.hangup_peer(&msg.source, "").await;
            self.emit(ClientEvent::AbortCall { user, reason });
            return;
        }

        let initiator = {
            let self_user = self.user.clone().unwrap_or_default();
            let Some(record) = self.peers.get_mut(&msg.source) else {
                return;
            };
            record.hash = msg.hash.clone();
            record.remote_state = msg.state.clone();
            record.profile = msg.profile.clone();
            let initiator = compute_initiator(&self_user, &record.user);
            record.initiator = initiator;
            if let Some(pc) = record.pc.take() {
                let pc_id = pc.local_id();
                pc.destroy();
                self.p2p.peer_closed(&pc_id);
            }
            initiator
        };

        match self.create_pc(&msg.source, initiator) {
            Ok(()) => {
                if !initiator {
                    // Unblock the remote offerer.
                    if let Some(pc) = self.peers.get(&msg.source).and_then(|r| r.pc.clone()) {
                        pc.inject_signal(json!({"renegotiate": true}));
                    }
                }
                info!(
                    target: "client.call",
                    source = %msg.source,
                    initiator = initiator,
                    "call accepted, establishing"
                );
                self.emit(ClientEvent::OutgoingCall {
                    user: msg.source,
                    profile: msg.profile,
                });
            }
            Err(e) => {
                warn!(target: "client.call", error = %e, "peer create failed");
                self.hangup_peer(&msg.source, "").await;
            }
        }
    }

    async fn handle_channel(&mut self, msg: WebRtcMessage) {
        if !self.channel.is_empty() && msg.data.is_none() {
            return;
        }
        if !msg.channel.is_empty() {
            self.channel = msg.channel.clone();
        }
        if let Some(data) = msg.data {
            self.handle_channel_extra(data).await;
        }
    }

    async fn handle_hangup_message(&mut self, msg: WebRtcMessage) {
        if self.channel.is_empty() || msg.channel != self.channel {
            return;
        }
        let Some(record) = self.peers.get(&msg.source) else {
            return;
        };
        if !record.remote_state.is_empty() && record.remote_state != msg.state {
            return;
        }
        let user = record.user.clone();
        self.hangup_peer(&msg.source, "").await;
        info!(target: "client.call", user = %user, "peer hung up");
        self.emit(ClientEvent::Hangup {
            user,
            details: msg.data,
        });
    }

    fn handle_signal_message(&mut self, msg: WebRtcMessage) {
        if self.channel.is_empty() || msg.channel != self.channel {
            return;
        }
        {
            let Some(record) = self.peers.get_mut(&msg.source) else {
                debug!(target: "client.call", source = %msg.source, "signal for unknown peer");
                return;
            };
            if !record.remote_state.is_empty() && record.remote_state != msg.state {
                debug!(target: "client.call", source = %msg.source, "signal with stale state");
                return;
            }
            // Remote connection identity reconciliation.
            if msg.pcid != record.remote_pc_id {
                if record.remote_pc_id.is_empty() {
                    if record.pc.is_some() {
                        record.remote_pc_id = msg.pcid.clone();
                    }
                } else {
                    debug!(
                        target: "client.call",
                        source = %msg.source,
                        "remote connection restarted"
                    );
                    if let Some(pc) = record.pc.take() {
                        let pc_id = pc.local_id();
                        pc.destroy();
                        self.p2p.peer_closed(&pc_id);
                    }
                    record.remote_pc_id = msg.pcid.clone();
                }
            }
        }

        if self.peers.get(&msg.source).is_some_and(|r| r.pc.is_none()) {
            let self_user = self.user.clone().unwrap_or_default();
            let initiator = self
                .peers
                .get(&msg.source)
                .map(|r| compute_initiator(&self_user, &r.user))
                .unwrap_or(false);
            if let Err(e) = self.create_pc(&msg.source, initiator) {
                warn!(target: "client.call", error = %e, "peer create for signal failed");
                return;
            }
        }

        let Some(mut data) = msg.data else {
            return;
        };
        if let Some(transform) = self.factory.remote_sdp_transform() {
            if let Some(sdp) = data.get("sdp").and_then(Value::as_str) {
                let rewritten = transform(sdp.to_string());
                data["sdp"] = Value::String(rewritten);
            }
        }
        if let Some(pc) = self.peers.get(&msg.source).and_then(|r| r.pc.clone()) {
            if let Err(e) = pc.signal(data) {
                warn!(target: "client.call", error = %e, "signal delivery failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Extra channel data: supersession, groups, pipeline
    // ------------------------------------------------------------------

    async fn handle_channel_extra(&mut self, data: Value) {
        let extra = match serde_json::from_value::<ChannelExtra>(data) {
            Ok(extra) => extra,
            Err(e) => {
                debug!(target: "client.call", error = %e, "unparseable channel data");
                return;
            }
        };
        if extra.replaced {
            // Superseded by another connection of the same user.
            info!(target: "client.call", "call replaced by another connection");
            let _ = self.internal_tx.send(InternalMsg::LocalHangup { user: None });
            return;
        }
        if let Some(update) = extra.group {
            self.handle_group_update(update).await;
        }
        if let Some(pipeline) = extra.pipeline {
            self.handle_pipeline(&pipeline);
        }
    }

    async fn handle_group_update(&mut self, update: GroupUpdate) {
        let (reset, members) = {
            let Some(group) = self.group.as_mut() else {
                return;
            };
            if update.group != group.id {
                return;
            }
            let mut members = update.members;
            members.sort();
            group.members = members.clone();
            if !self.channel.is_empty() {
                group.channel = self.channel.clone();
            }
            (update.reset, members)
        };
        if reset {
            debug!(target: "client.call", "group reset, tearing mesh down");
            if let Err(e) = self.do_mesh(&[]).await {
                warn!(target: "client.call", error = %e, "mesh teardown failed");
            }
        }
        if let Err(e) = self.do_mesh(&members).await {
            warn!(target: "client.call", error = %e, "mesh reconciliation failed");
        }
    }

    fn handle_pipeline(&mut self, pipeline: &PipelineInfo) {
        if pipeline.mode != PIPELINE_CID {
            info!(
                target: "client.call",
                mode = %pipeline.mode,
                "unsupported pipeline mode ignored"
            );
            return;
        }
        let Some(group) = &self.group else {
            warn!(target: "client.call", "pipeline enrolment without group");
            return;
        };
        let mut record = PeerRecord::new(pipeline.pipeline.clone(), pipeline.pipeline.clone());
        record.remote_state = pipeline.pipeline.clone();
        record.hash = group.record.hash.clone();
        record.cid = PIPELINE_CID.to_string();
        self.peers.insert(pipeline.pipeline.clone(), record);
        // Local media now flows only to the pipeline peer.
        self.local_stream_target = Some(pipeline.pipeline.clone());
        info!(
            target: "client.call",
            pipeline = %pipeline.pipeline,
            "pipeline peer enrolled"
        );
    }

    // ------------------------------------------------------------------
    // Mesh
    // ------------------------------------------------------------------

    /// Reconcile the peer table to the given member set. An empty set
    /// tears the mesh down. Special peers (non-empty `cid`) are left
    /// alone.
    pub(crate) async fn do_mesh(&mut self, users: &[String]) -> Result<(), ClientError> {
        if users.is_empty() {
            let ids: Vec<String> = self
                .peers
                .values()
                .filter(|r| r.cid.is_empty())
                .map(|r| r.id.clone())
                .collect();
            for id in ids {
                self.hangup_peer(&id, "").await;
            }
            return Ok(());
        }

        let me = self.user.clone().ok_or(ClientError::NoConnection)?;
        if self.channel.is_empty() {
            return Err(ClientError::NoChannel);
        }
        if !users.iter().any(|u| u == &me) {
            return Err(ClientError::MeshWithoutSelf);
        }
        let (group_id, group_hash) = self
            .group
            .as_ref()
            .map(|g| (g.id.clone(), g.record.hash.clone()))
            .ok_or_else(|| ClientError::Internal("mesh without group".to_string()))?;

        let removed: Vec<String> = self
            .peers
            .values()
            .filter(|r| r.cid.is_empty() && !users.contains(&r.user))
            .map(|r| r.id.clone())
            .collect();
        for id in removed {
            debug!(target: "client.call", peer = %id, "mesh removed member");
            self.hangup_peer(&id, "").await;
        }

        for user in users {
            if *user == me {
                continue;
            }
            let established = self
                .peers
                .get(user)
                .is_some_and(|r| r.pc.as_ref().is_some_and(|pc| !pc.destroyed()));
            if established {
                continue;
            }
            if !self.peers.contains_key(user) {
                let mut record = PeerRecord::new(user.clone(), user.clone());
                record.group = group_id.clone();
                record.hash = group_hash.clone();
                record.state = group_id.clone();
                record.remote_state = group_id.clone();
                self.peers.insert(user.clone(), record);
                debug!(target: "client.call", peer = %user, "mesh added member");
            }
            if let Err(e) = self.do_answer(user).await {
                // Surfaced but non-fatal; convergence continues.
                warn!(
                    target: "client.call",
                    peer = %user,
                    code = %e.code(),
                    "mesh answer failed"
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer events and recovery
    // ------------------------------------------------------------------

    pub(crate) async fn handle_peer_event(&mut self, id: String, pc_id: String, event: PeerEvent) {
        {
            let Some(record) = self.peers.get(&id) else {
                return;
            };
            if !record.pc_matches(&pc_id) {
                debug!(target: "client.call", peer = %id, "event from superseded connection");
                return;
            }
        }
        match event {
            PeerEvent::Signal(data) => {
                let mut msg = WebRtcMessage::new(WebRtcSubtype::WebrtcSignal);
                {
                    let Some(record) = self.peers.get(&id) else {
                        return;
                    };
                    msg.target = record.user.clone();
                    msg.channel = self.channel.clone();
                    msg.group = record.group.clone();
                    msg.hash = record.hash.clone();
                    msg.state = record.state.clone();
                }
                msg.pcid = pc_id.clone();
                msg.data = Some(data);
                if let Err(e) = self.transport.send(Envelope::new(Payload::Webrtc(msg))).await
                {
                    warn!(target: "client.call", error = %e, "signal send failed");
                    self.schedule_recovery(&id, &pc_id);
                }
            }
            PeerEvent::Error(error) => {
                warn!(target: "client.call", peer = %id, error = %error, "peer error");
                if self.peers.get(&id).is_some_and(|r| r.reconnect) {
                    self.schedule_recovery(&id, &pc_id);
                }
            }
            PeerEvent::Connect => {
                let Some(record) = self.peers.get(&id) else {
                    return;
                };
                let Some(pc) = record.pc.clone() else {
                    return;
                };
                let (user, initiator, reconnect) =
                    (record.user.clone(), record.initiator, record.reconnect);
                debug!(target: "client.call", peer = %id, "peer connected");
                self.p2p.peer_connected(id, user, initiator, reconnect, pc);
            }
            PeerEvent::Close => {
                if let Some(record) = self.peers.get_mut(&id) {
                    record.pc = None;
                }
                self.p2p.peer_closed(&pc_id);
            }
            PeerEvent::Data(text) => {
                self.p2p.handle_data(&pc_id, &text);
            }
            PeerEvent::Stream(stream) => {
                if let Some(user) = self.peers.get(&id).map(|r| r.user.clone()) {
                    self.emit(ClientEvent::PeerStream { user, stream });
                }
            }
            PeerEvent::Track { track, stream } => {
                if let Some(user) = self.peers.get(&id).map(|r| r.user.clone()) {
                    self.emit(ClientEvent::PeerTrack {
                        user,
                        track,
                        stream,
                    });
                }
            }
            PeerEvent::IceStateChange(state) => {
                debug!(target: "client.call", peer = %id, state = %state, "ice state");
            }
            PeerEvent::SignalingStateChange(state) => {
                debug!(target: "client.call", peer = %id, state = %state, "signaling state");
            }
        }
    }

    pub(crate) fn handle_sub_event(
        &mut self,
        p2p_id: &str,
        stream_id: &str,
        local: bool,
        pc_id: &str,
        event: PeerEvent,
    ) {
        self.p2p
            .handle_sub_event(p2p_id, stream_id, local, pc_id, event);
    }

    pub(crate) fn handle_recover_sub(
        &mut self,
        p2p_id: &str,
        stream_id: &str,
        local: bool,
        pc_id: &str,
    ) {
        self.p2p.handle_recover_sub(p2p_id, stream_id, local, pc_id);
    }

    /// Delayed peer recovery: if the failed connection is still the
    /// bound one, replace it with a fresh one of the same role.
    pub(crate) fn handle_recover_peer(&mut self, id: &str, pc_id: &str) {
        let initiator = {
            let Some(record) = self.peers.get_mut(id) else {
                return;
            };
            if !record.reconnect || !record.pc_matches(pc_id) {
                return;
            }
            if let Some(pc) = record.pc.take() {
                pc.destroy();
            }
            record.initiator
        };
        self.p2p.peer_closed(pc_id);
        info!(target: "client.call", peer = %id, "recovering peer connection");
        match self.create_pc(id, initiator) {
            Ok(()) => {
                if !initiator {
                    if let Some(pc) = self.peers.get(id).and_then(|r| r.pc.clone()) {
                        pc.inject_signal(json!({"renegotiate": true}));
                    }
                }
            }
            Err(e) => {
                warn!(target: "client.call", peer = %id, error = %e, "peer recovery failed");
            }
        }
    }

    fn schedule_recovery(&self, id: &str, pc_id: &str) {
        let internal = self.internal_tx.clone();
        let id = id.to_string();
        let pc_id = pc_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(RECOVERY_DELAY).await;
            let _ = internal.send(InternalMsg::RecoverPeer { id, pc_id });
        });
    }

    fn create_pc(&mut self, id: &str, initiator: bool) -> Result<(), ClientError> {
        let streams = if self.is_stream_target(id) {
            self.local_stream.clone().into_iter().collect()
        } else {
            Vec::new()
        };
        let pc = self.factory.create_peer(id, initiator, streams)?;
        let record = self.peers.get_mut(id).ok_or(ClientError::UnknownPeer)?;
        record.initiator = initiator;
        record.pc = Some(pc);
        Ok(())
    }
}

