//! Session controller.
//!
//! One task owns the engine: it selects over the public command mailbox,
//! the internal continuation channel (request completions, peer events,
//! recovery timers), and the transport event stream. Inbound envelopes
//! route by type: `webrtc` to the call engine, `chats` and `error` to
//! events, `goodbye` to a transport recycle with suppressed instant
//! reconnect. A `hello` carrying a different user while a channel is
//! active tears the call down locally.

use crate::call::engine::EngineStatus;
use crate::call::CallEngine;
use crate::config::ClientOptions;
use crate::errors::ClientError;
use crate::events::ClientEvent;
use crate::peer::factory::{PeerFactory, SharedIceServers};
use crate::peer::{MediaStream, PeerEvent, PeerProvider};
use crate::transport::client::TransportClient;
use crate::transport::{TransportEvent, TransportHandle};
use signaling_protocol::envelope::{Envelope, Hello, Payload};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Command mailbox depth.
const COMMAND_BUFFER: usize = 100;

/// Commands accepted by the session task.
pub(crate) enum EngineCommand {
    DoCall {
        user: String,
        respond_to: oneshot::Sender<Result<String, ClientError>>,
    },
    DoAnswer {
        user: String,
        respond_to: oneshot::Sender<Result<String, ClientError>>,
    },
    DoReject {
        user: String,
        reason: String,
        respond_to: oneshot::Sender<Result<String, ClientError>>,
    },
    DoGroup {
        group: String,
        respond_to: oneshot::Sender<Result<String, ClientError>>,
    },
    DoHangup {
        user: Option<String>,
        reason: String,
        respond_to: oneshot::Sender<Result<String, ClientError>>,
    },
    SetLocalStream {
        stream: Option<MediaStream>,
        respond_to: oneshot::Sender<()>,
    },
    Mute {
        video: bool,
        mute: bool,
        respond_to: oneshot::Sender<bool>,
    },
    StartScreenShare {
        stream: MediaStream,
        respond_to: oneshot::Sender<Result<String, ClientError>>,
    },
    StopScreenShare {
        id: String,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Status {
        respond_to: oneshot::Sender<EngineStatus>,
    },
}

/// Deferred continuations re-entering the session task.
pub(crate) enum InternalMsg {
    CallReply {
        user: String,
        state: String,
        result: Result<Envelope, ClientError>,
        respond_to: oneshot::Sender<Result<String, ClientError>>,
    },
    GroupReply {
        group: String,
        result: Result<Envelope, ClientError>,
        respond_to: Option<oneshot::Sender<Result<String, ClientError>>>,
    },
    PeerEvent {
        id: String,
        pc_id: String,
        event: PeerEvent,
    },
    SubPeerEvent {
        p2p_id: String,
        stream_id: String,
        local: bool,
        pc_id: String,
        event: PeerEvent,
    },
    RecoverPeer {
        id: String,
        pc_id: String,
    },
    RecoverSub {
        p2p_id: String,
        stream_id: String,
        local: bool,
        pc_id: String,
    },
    /// Hang up locally, without a server message. `None` clears the
    /// whole channel.
    LocalHangup {
        user: Option<String>,
    },
}

pub(crate) struct SessionController {
    receiver: mpsc::Receiver<EngineCommand>,
    internal_rx: mpsc::UnboundedReceiver<InternalMsg>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport: TransportHandle,
    cancel_token: CancellationToken,
    engine: CallEngine,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl SessionController {
    #[instrument(skip_all, name = "client.session")]
    pub(crate) async fn run(mut self) {
        debug!(target: "client.session", "session controller started");
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    break;
                }
                Some(event) = self.transport_events.recv() => {
                    self.handle_transport_event(event).await;
                }
                Some(msg) = self.internal_rx.recv() => {
                    self.handle_internal(msg).await;
                }
                Some(cmd) = self.receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                else => break,
            }
        }
        info!(target: "client.session", "session controller stopped");
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::DoCall { user, respond_to } => {
                self.engine.do_call(user, respond_to);
            }
            EngineCommand::DoAnswer { user, respond_to } => {
                let _ = respond_to.send(self.engine.do_answer(&user).await);
            }
            EngineCommand::DoReject {
                user,
                reason,
                respond_to,
            } => {
                let _ = respond_to.send(self.engine.do_reject(&user, &reason).await);
            }
            EngineCommand::DoGroup { group, respond_to } => {
                self.engine.do_group(group, respond_to);
            }
            EngineCommand::DoHangup {
                user,
                reason,
                respond_to,
            } => {
                let _ = respond_to.send(self.engine.do_hangup(user, &reason).await);
            }
            EngineCommand::SetLocalStream { stream, respond_to } => {
                self.engine.set_local_stream(stream);
                let _ = respond_to.send(());
            }
            EngineCommand::Mute {
                video,
                mute,
                respond_to,
            } => {
                let _ = respond_to.send(self.engine.mute(video, mute));
            }
            EngineCommand::StartScreenShare { stream, respond_to } => {
                let _ = respond_to.send(self.engine.start_screen_share(stream));
            }
            EngineCommand::StopScreenShare { id, respond_to } => {
                let _ = respond_to.send(self.engine.stop_screen_share(&id));
            }
            EngineCommand::Status { respond_to } => {
                let _ = respond_to.send(self.engine.status());
            }
        }
    }

    async fn handle_internal(&mut self, msg: InternalMsg) {
        match msg {
            InternalMsg::CallReply {
                user,
                state,
                result,
                respond_to,
            } => {
                self.engine
                    .handle_call_reply(user, state, result, respond_to)
                    .await;
            }
            InternalMsg::GroupReply {
                group,
                result,
                respond_to,
            } => {
                self.engine
                    .handle_group_reply(group, result, respond_to)
                    .await;
            }
            InternalMsg::PeerEvent { id, pc_id, event } => {
                self.engine.handle_peer_event(id, pc_id, event).await;
            }
            InternalMsg::SubPeerEvent {
                p2p_id,
                stream_id,
                local,
                pc_id,
                event,
            } => {
                self.engine
                    .handle_sub_event(&p2p_id, &stream_id, local, &pc_id, event);
            }
            InternalMsg::RecoverPeer { id, pc_id } => {
                self.engine.handle_recover_peer(&id, &pc_id);
            }
            InternalMsg::RecoverSub {
                p2p_id,
                stream_id,
                local,
                pc_id,
            } => {
                self.engine
                    .handle_recover_sub(&p2p_id, &stream_id, local, &pc_id);
            }
            InternalMsg::LocalHangup { user } => {
                if let Err(e) = self.engine.do_hangup(user, "").await {
                    debug!(target: "client.session", error = %e, "scheduled hangup failed");
                }
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged { state, connected } => {
                let _ = self
                    .events
                    .send(ClientEvent::StateChanged { state, connected });
            }
            TransportEvent::Error { code, msg } => {
                let _ = self.events.send(ClientEvent::Error { code, msg });
            }
            TransportEvent::TurnChanged { servers } => {
                let _ = self.events.send(ClientEvent::TurnChanged { servers });
            }
            TransportEvent::Message(envelope) => self.handle_envelope(envelope).await,
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.payload {
            Payload::Hello(hello) => self.handle_hello(hello).await,
            Payload::Goodbye => {
                info!(target: "client.session", "server said goodbye, recycling socket");
                self.transport.recycle().await;
            }
            Payload::Error(body) => {
                warn!(
                    target: "client.session",
                    code = %body.error.code,
                    "server error"
                );
                let _ = self.events.send(ClientEvent::Error {
                    code: body.error.code,
                    msg: body.error.msg,
                });
            }
            Payload::Webrtc(msg) => {
                self.engine.handle_webrtc_message(msg).await;
            }
            Payload::Chats(chats) => {
                let _ = self
                    .events
                    .send(ClientEvent::Chats(serde_json::Value::Object(chats.body)));
            }
            Payload::Ping(_) | Payload::Pong(_) => {
                // Heartbeats are the transport's business.
            }
        }
    }

    async fn handle_hello(&mut self, hello: Hello) {
        let user = hello.identity.id;
        let previous = self.engine.user().cloned();
        if let Some(previous) = previous {
            if previous != user && !self.engine.channel().is_empty() {
                info!(
                    target: "client.session",
                    "session user changed, tearing down call"
                );
                if let Err(e) = self.engine.do_hangup(None, "").await {
                    debug!(target: "client.session", error = %e, "teardown failed");
                }
            }
        }
        self.engine.set_user(user.clone());
        if self.engine.group_member(&user) {
            // We are still listed in the active group; re-establish it.
            self.engine.refresh_group(None);
        }
        let _ = self.events.send(ClientEvent::Hello { user });
    }
}

/// Handle to a running meeting client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    sender: mpsc::Sender<EngineCommand>,
    transport: TransportHandle,
    cancel_token: CancellationToken,
}

impl Client {
    /// Build a client with its own transport, returning the handle and
    /// the event stream.
    ///
    /// # Errors
    ///
    /// Fails when the configured server URI is invalid.
    pub fn new(
        options: ClientOptions,
        provider: Arc<dyn PeerProvider>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let cancel_token = CancellationToken::new();
        let ice_servers: SharedIceServers = Arc::new(RwLock::new(Vec::new()));
        let (transport, transport_events) = TransportClient::spawn(
            options.config.clone(),
            options.turn_policy.clone(),
            Arc::clone(&ice_servers),
            cancel_token.child_token(),
        )?;
        Ok(Self::spawn_session(
            options,
            provider,
            transport,
            transport_events,
            ice_servers,
            cancel_token,
        ))
    }

    /// Build a client around an existing transport handle. This is the
    /// seam for embedding a custom control channel (or a test harness).
    #[must_use]
    pub fn with_transport(
        options: ClientOptions,
        provider: Arc<dyn PeerProvider>,
        transport: TransportHandle,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let ice_servers: SharedIceServers = Arc::new(RwLock::new(Vec::new()));
        Self::spawn_session(
            options,
            provider,
            transport,
            transport_events,
            ice_servers,
            CancellationToken::new(),
        )
    }

    fn spawn_session(
        options: ClientOptions,
        provider: Arc<dyn PeerProvider>,
        transport: TransportHandle,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        ice_servers: SharedIceServers,
        cancel_token: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

        let factory = Arc::new(PeerFactory::new(
            provider,
            ice_servers,
            options.rtc.clone(),
            internal_tx.clone(),
        ));
        let engine = CallEngine::new(
            transport.clone(),
            factory,
            internal_tx,
            events_tx.clone(),
        );
        let session = SessionController {
            receiver: cmd_rx,
            internal_rx,
            transport_events,
            transport: transport.clone(),
            cancel_token: cancel_token.child_token(),
            engine,
            events: events_tx,
        };
        tokio::spawn(session.run());

        (
            Self {
                sender: cmd_tx,
                transport,
                cancel_token,
            },
            events_rx,
        )
    }

    /// Connect the control channel with the given authentication.
    pub async fn connect(
        &self,
        identifier: impl Into<String>,
        mode: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.transport.connect(identifier, mode).await
    }

    /// Place a 1:1 call; resolves with the channel.
    pub async fn do_call(&self, user: impl Into<String>) -> Result<String, ClientError> {
        self.request(|respond_to| EngineCommand::DoCall {
            user: user.into(),
            respond_to,
        })
        .await?
    }

    /// Accept an incoming call; resolves with the channel.
    pub async fn do_answer(&self, user: impl Into<String>) -> Result<String, ClientError> {
        self.request(|respond_to| EngineCommand::DoAnswer {
            user: user.into(),
            respond_to,
        })
        .await?
    }

    /// Decline an incoming call.
    pub async fn do_reject(
        &self,
        user: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<String, ClientError> {
        self.request(|respond_to| EngineCommand::DoReject {
            user: user.into(),
            reason: reason.into(),
            respond_to,
        })
        .await?
    }

    /// Join (or create) a group call; resolves with the channel.
    pub async fn do_group(&self, group: impl Into<String>) -> Result<String, ClientError> {
        self.request(|respond_to| EngineCommand::DoGroup {
            group: group.into(),
            respond_to,
        })
        .await?
    }

    /// Hang up one peer, or the whole channel when `user` is `None`. An
    /// empty reason keeps the hangup local.
    pub async fn do_hangup(
        &self,
        user: Option<String>,
        reason: impl Into<String>,
    ) -> Result<String, ClientError> {
        self.request(|respond_to| EngineCommand::DoHangup {
            user,
            reason: reason.into(),
            respond_to,
        })
        .await?
    }

    /// Replace the local media stream on all targeted peers.
    pub async fn set_local_stream(
        &self,
        stream: Option<MediaStream>,
    ) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::SetLocalStream { stream, respond_to })
            .await
    }

    /// Toggle the first audio (`video == false`) or video track of the
    /// local stream. Returns whether a track was found.
    pub async fn mute(&self, video: bool, mute: bool) -> Result<bool, ClientError> {
        self.request(|respond_to| EngineCommand::Mute {
            video,
            mute,
            respond_to,
        })
        .await
    }

    /// Publish a screen-share stream to connected peers.
    pub async fn start_screen_share(
        &self,
        stream: MediaStream,
    ) -> Result<String, ClientError> {
        self.request(|respond_to| EngineCommand::StartScreenShare { stream, respond_to })
            .await?
    }

    /// Withdraw a published screen-share stream.
    pub async fn stop_screen_share(
        &self,
        id: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.request(|respond_to| EngineCommand::StopScreenShare {
            id: id.into(),
            respond_to,
        })
        .await?
    }

    /// Snapshot of the engine state.
    pub async fn status(&self) -> Result<EngineStatus, ClientError> {
        self.request(|respond_to| EngineCommand::Status { respond_to })
            .await
    }

    /// Rolling average heartbeat round trip, in milliseconds.
    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        self.transport.latency_ms()
    }

    /// Tear the client down.
    pub async fn close(&self) {
        self.transport.close().await;
        self.cancel_token.cancel();
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| ClientError::ConnectionDestroyed)?;
        rx.await.map_err(|_| ClientError::ConnectionDestroyed)
    }
}
