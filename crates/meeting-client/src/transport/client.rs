//! Control channel transport.
//!
//! One actor owns the WebSocket to the signaling service:
//!
//! - bootstrap via HTTP, then socket connect with a timeout;
//! - reconnect with capped exponential backoff plus a random spread; a
//!   "fast" reconnect bypasses backoff when a connected socket closes
//!   cleanly (network returned);
//! - heartbeat pings every interval, expecting the pong within 90% of
//!   it; a timeout force-closes the socket so the reconnect path runs;
//! - request/reply correlation by envelope id, with per-request timers;
//! - TURN credential refresh at 90% of the ttl, retried after 5 s on
//!   failure.
//!
//! The actor is driven by a command mailbox and reports through an
//! unbounded event stream consumed by the session controller.

use crate::config::{ClientConfig, TurnPolicy};
use crate::errors::ClientError;
use crate::peer::factory::SharedIceServers;
use crate::peer::IceServer;
use crate::transport::bootstrap::{Bootstrap, TurnConfig};
use futures_util::{SinkExt, StreamExt};
use signaling_protocol::envelope::{Envelope, Heartbeat, Payload};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Command mailbox depth.
const COMMAND_BUFFER: usize = 200;

/// Share of the heartbeat interval a pong may take.
const HEARTBEAT_TIMEOUT_RATIO: f64 = 0.9;

/// Share of the TURN ttl after which credentials are refreshed.
const TURN_REFRESH_RATIO: f64 = 0.9;

/// Retry delay after a failed TURN refresh.
const TURN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How many heartbeat round trips feed the latency estimate.
const RTT_SAMPLE_LIMIT: usize = 10;

/// Control channel states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

/// Events reported by the transport.
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged {
        state: TransportState,
        connected: bool,
    },
    /// A non-reply envelope arrived.
    Message(Envelope),
    Error {
        code: String,
        msg: String,
    },
    /// A TURN refresh produced a new ICE server list.
    TurnChanged {
        servers: Vec<IceServer>,
    },
}

/// Commands accepted by the transport actor.
#[derive(Debug)]
pub enum TransportCommand {
    /// Bootstrap and open the socket with the given authentication.
    Connect {
        identifier: String,
        mode: String,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    /// Fire-and-forget send; resolves with the assigned envelope id.
    Send {
        envelope: Envelope,
        respond_to: oneshot::Sender<Result<u64, ClientError>>,
    },
    /// Send and wait for the correlated reply.
    Request {
        envelope: Envelope,
        timeout: Duration,
        respond_to: oneshot::Sender<Result<Envelope, ClientError>>,
    },
    /// Close the socket and reconnect with backoff (server `goodbye`):
    /// the attempt counter is seeded so the instant retry is skipped.
    Recycle,
    /// Tear everything down for good.
    Close { respond_to: oneshot::Sender<()> },
}

/// Handle to the transport actor. Cheap to clone.
#[derive(Clone)]
pub struct TransportHandle {
    sender: mpsc::Sender<TransportCommand>,
    latency_ms: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Assemble a handle around an existing command channel. This is the
    /// seam for embedding a custom transport (or a test harness) behind
    /// the engine.
    #[must_use]
    pub fn from_parts(
        sender: mpsc::Sender<TransportCommand>,
        latency_ms: Arc<AtomicU64>,
    ) -> Self {
        Self { sender, latency_ms }
    }

    pub async fn connect(
        &self,
        identifier: impl Into<String>,
        mode: impl Into<String>,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TransportCommand::Connect {
                identifier: identifier.into(),
                mode: mode.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionDestroyed)?;
        rx.await.map_err(|_| ClientError::ConnectionDestroyed)?
    }

    /// Send an envelope without waiting for a reply.
    pub async fn send(&self, envelope: Envelope) -> Result<u64, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TransportCommand::Send {
                envelope,
                respond_to: tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionDestroyed)?;
        rx.await.map_err(|_| ClientError::ConnectionDestroyed)?
    }

    /// Send an envelope and wait for its reply. `timeout` must be
    /// positive; fire-and-forget traffic uses [`TransportHandle::send`].
    pub async fn request(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TransportCommand::Request {
                envelope,
                timeout,
                respond_to: tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionDestroyed)?;
        rx.await.map_err(|_| ClientError::ConnectionDestroyed)?
    }

    pub async fn recycle(&self) {
        let _ = self.sender.send(TransportCommand::Recycle).await;
    }

    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(TransportCommand::Close { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Rolling average heartbeat round trip, in milliseconds.
    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::SeqCst)
    }
}

enum SocketEventKind {
    Frame(String),
    Closed { error: Option<String> },
}

struct SocketEvent {
    generation: u64,
    kind: SocketEventKind,
}

enum Internal {
    ReconnectAttempt { seq: u64 },
    ReplyTimeout { id: u64 },
    HeartbeatTimeout { generation: u64 },
    RefreshTurn,
    TurnResult(Box<Result<TurnConfig, ClientError>>),
}

struct ActiveSocket {
    generation: u64,
    out_tx: mpsc::UnboundedSender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

pub(crate) struct TransportClient {
    config: ClientConfig,
    bootstrap: Bootstrap,
    receiver: mpsc::Receiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    socket_tx: mpsc::UnboundedSender<SocketEvent>,
    socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
    cancel_token: CancellationToken,
    ice_servers: SharedIceServers,
    turn_policy: Option<TurnPolicy>,
    latency_ms: Arc<AtomicU64>,

    state: TransportState,
    auth_identifier: String,
    auth_mode: String,
    auth_value: String,
    socket: Option<ActiveSocket>,
    generation: u64,
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Envelope, ClientError>>>,
    attempts: u32,
    reconnect_enabled: bool,
    reconnect_seq: u64,
    rtt_samples: VecDeque<u64>,
    turn_guard: CancellationToken,
}

impl TransportClient {
    /// Spawn the transport actor; returns its handle and event stream.
    pub(crate) fn spawn(
        config: ClientConfig,
        turn_policy: Option<TurnPolicy>,
        ice_servers: SharedIceServers,
        cancel_token: CancellationToken,
    ) -> Result<(TransportHandle, mpsc::UnboundedReceiver<TransportEvent>), ClientError> {
        let bootstrap = Bootstrap::new(&config)?;
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let latency_ms = Arc::new(AtomicU64::new(0));

        let auth_value = config.authorization_auth.clone();
        let reconnect_enabled = config.reconnect_enabled;
        let client = TransportClient {
            config,
            bootstrap,
            receiver: cmd_rx,
            events: event_tx,
            internal_tx,
            internal_rx,
            socket_tx,
            socket_rx,
            cancel_token,
            ice_servers,
            turn_policy,
            latency_ms: Arc::clone(&latency_ms),
            state: TransportState::Disconnected,
            auth_identifier: String::new(),
            auth_mode: String::new(),
            auth_value,
            socket: None,
            generation: 0,
            next_id: 0,
            pending: HashMap::new(),
            attempts: 0,
            reconnect_enabled,
            reconnect_seq: 0,
            rtt_samples: VecDeque::new(),
            turn_guard: CancellationToken::new(),
        };
        tokio::spawn(client.run());

        Ok((TransportHandle::from_parts(cmd_tx, latency_ms), event_rx))
    }

    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.shutdown();
                    break;
                }
                _ = heartbeat.tick(), if matches!(self.state, TransportState::Connected) => {
                    self.send_heartbeat();
                }
                Some(cmd) = self.receiver.recv() => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(msg) = self.internal_rx.recv() => {
                    self.handle_internal(msg).await;
                }
                Some(ev) = self.socket_rx.recv() => {
                    self.handle_socket_event(ev);
                }
            }
        }
    }

    /// Handle one command; returns true when the actor should exit.
    async fn handle_command(&mut self, cmd: TransportCommand) -> bool {
        match cmd {
            TransportCommand::Connect {
                identifier,
                mode,
                respond_to,
            } => {
                self.auth_identifier = identifier;
                self.auth_mode = mode;
                self.reconnect_enabled = self.config.reconnect_enabled;
                self.attempts = 0;
                match self.establish().await {
                    Ok(()) => {
                        let _ = respond_to.send(Ok(()));
                    }
                    Err(e) => {
                        if e.is_permanent() {
                            self.reconnect_enabled = false;
                            self.set_state(TransportState::Disconnected);
                        } else if self.reconnect_enabled {
                            self.set_state(TransportState::Reconnecting);
                            self.schedule_reconnect(false);
                        } else {
                            self.set_state(TransportState::Disconnected);
                        }
                        let _ = respond_to.send(Err(e));
                    }
                }
                false
            }

            TransportCommand::Send {
                envelope,
                respond_to,
            } => {
                let _ = respond_to.send(self.submit_send(envelope));
                false
            }

            TransportCommand::Request {
                envelope,
                timeout,
                respond_to,
            } => {
                match self.submit_request(envelope, timeout) {
                    Ok(rx) => {
                        tokio::spawn(async move {
                            let result = rx
                                .await
                                .unwrap_or_else(|_| Err(ClientError::ConnectionDestroyed));
                            let _ = respond_to.send(result);
                        });
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                }
                false
            }

            TransportCommand::Recycle => {
                self.attempts = self.attempts.max(1);
                self.teardown_socket();
                self.fail_pending(ClientError::NoConnection);
                if self.reconnect_enabled {
                    self.set_state(TransportState::Reconnecting);
                    self.schedule_reconnect(false);
                } else {
                    self.set_state(TransportState::Disconnected);
                }
                false
            }

            TransportCommand::Close { respond_to } => {
                self.set_state(TransportState::Closing);
                self.shutdown();
                let _ = respond_to.send(());
                true
            }
        }
    }

    fn shutdown(&mut self) {
        self.reconnect_enabled = false;
        self.fail_pending(ClientError::ConnectionDestroyed);
        self.teardown_socket();
        self.set_state(TransportState::Disconnected);
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::ReconnectAttempt { seq } => {
                if seq != self.reconnect_seq
                    || !matches!(self.state, TransportState::Reconnecting)
                {
                    return;
                }
                match self.establish().await {
                    Ok(()) => {}
                    Err(e) => {
                        if e.is_permanent() {
                            warn!(
                                target: "client.transport",
                                error = %e,
                                "reconnect rejected permanently"
                            );
                            self.reconnect_enabled = false;
                            self.emit_error(&e);
                            self.set_state(TransportState::Disconnected);
                        } else {
                            debug!(
                                target: "client.transport",
                                error = %e,
                                attempts = self.attempts,
                                "reconnect attempt failed"
                            );
                            self.set_state(TransportState::Reconnecting);
                            self.schedule_reconnect(false);
                        }
                    }
                }
            }

            Internal::ReplyTimeout { id } => {
                if let Some(tx) = self.pending.remove(&id) {
                    let _ = tx.send(Err(ClientError::Timeout));
                }
            }

            Internal::HeartbeatTimeout { generation } => {
                let current = self.socket.as_ref().map(|s| s.generation);
                if current != Some(generation)
                    || !matches!(self.state, TransportState::Connected)
                {
                    return;
                }
                warn!(
                    target: "client.transport",
                    "heartbeat timed out, forcing socket close"
                );
                self.teardown_socket();
                self.fail_pending(ClientError::NoConnection);
                if self.reconnect_enabled {
                    self.set_state(TransportState::Reconnecting);
                    self.schedule_reconnect(false);
                } else {
                    self.set_state(TransportState::Disconnected);
                }
            }

            Internal::RefreshTurn => {
                if !matches!(self.state, TransportState::Connected) {
                    return;
                }
                let bootstrap = self.bootstrap.clone();
                let mode = self.auth_mode.clone();
                let identifier = self.auth_identifier.clone();
                let auth = self.auth_value.clone();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = bootstrap.turn(&mode, &identifier, Some(&auth)).await;
                    let _ = internal.send(Internal::TurnResult(Box::new(result)));
                });
            }

            Internal::TurnResult(result) => match *result {
                Ok(turn) => self.apply_turn(turn),
                Err(e) => {
                    warn!(
                        target: "client.transport",
                        error = %e,
                        "turn refresh failed, retrying"
                    );
                    self.schedule_turn_refresh(TURN_RETRY_DELAY);
                }
            },
        }
    }

    fn handle_socket_event(&mut self, ev: SocketEvent) {
        let Some(socket) = &self.socket else {
            return;
        };
        if socket.generation != ev.generation {
            return;
        }
        match ev.kind {
            SocketEventKind::Frame(text) => self.handle_frame(&text),
            SocketEventKind::Closed { error } => self.handle_socket_closed(error),
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let mut envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(target: "client.transport", error = %e, "unparseable frame");
                return;
            }
        };

        if let Payload::Pong(hb) = &envelope.payload {
            if let Some(auth) = &hb.auth {
                self.auth_value = auth.clone();
            }
            let rtt = (now_ms() - hb.ts).max(0);
            #[allow(clippy::cast_sign_loss)]
            self.record_rtt(rtt as u64);
            // The server echoes only `id` on pong.
            if envelope.reply_to.is_none() {
                envelope.reply_to = Some(envelope.id);
            }
        }

        if let Some(reply_to) = envelope.reply_to {
            if let Some(tx) = self.pending.remove(&reply_to) {
                let _ = tx.send(Ok(envelope));
            } else {
                debug!(
                    target: "client.transport",
                    reply_to = reply_to,
                    "reply without a pending request"
                );
            }
            return;
        }

        let _ = self.events.send(TransportEvent::Message(envelope));
    }

    fn handle_socket_closed(&mut self, error: Option<String>) {
        let was_connected = matches!(self.state, TransportState::Connected);
        self.teardown_socket();
        self.fail_pending(ClientError::NoConnection);

        if matches!(self.state, TransportState::Closing) {
            self.set_state(TransportState::Disconnected);
            return;
        }
        if let Some(err) = &error {
            let _ = self.events.send(TransportEvent::Error {
                code: "websocket_error".to_string(),
                msg: err.clone(),
            });
        }
        if !self.reconnect_enabled {
            self.set_state(TransportState::Disconnected);
            return;
        }
        // A connected socket that closed without an error means the
        // network went away and came back; skip the backoff once.
        let fast = was_connected && error.is_none();
        self.set_state(TransportState::Reconnecting);
        self.schedule_reconnect(fast);
    }

    async fn establish(&mut self) -> Result<(), ClientError> {
        self.teardown_socket();
        self.set_state(TransportState::Connecting);
        let auth = self.auth_value.clone();
        let info = self
            .bootstrap
            .connect(&self.auth_mode, &self.auth_identifier, Some(&auth))
            .await?;
        let ws_url = self.bootstrap.websocket_url(&info.url)?;
        let (ws, _) = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(ws_url.as_str()),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)?
        .map_err(|e| ClientError::Websocket(e.to_string()))?;

        self.install_socket(ws);
        self.next_id = 0;
        self.attempts = 0;
        self.rtt_samples.clear();
        self.set_state(TransportState::Connected);
        info!(target: "client.transport", url = %ws_url, "socket connected");

        if let Some(turn) = info.turn {
            self.apply_turn(turn);
        }
        Ok(())
    }

    fn install_socket(&mut self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        self.generation += 1;
        let generation = self.generation;
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let socket_tx = self.socket_tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if socket_tx
                            .send(SocketEvent {
                                generation,
                                kind: SocketEventKind::Frame(text),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = socket_tx.send(SocketEvent {
                            generation,
                            kind: SocketEventKind::Closed { error: None },
                        });
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = socket_tx.send(SocketEvent {
                            generation,
                            kind: SocketEventKind::Closed {
                                error: Some(e.to_string()),
                            },
                        });
                        break;
                    }
                }
            }
        });

        self.socket = Some(ActiveSocket {
            generation,
            out_tx,
            writer,
            reader,
        });
    }

    fn teardown_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.writer.abort();
            socket.reader.abort();
        }
        self.turn_guard.cancel();
    }

    fn fail_pending(&mut self, error: ClientError) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(clone_error(&error)));
        }
    }

    fn submit_send(&mut self, envelope: Envelope) -> Result<u64, ClientError> {
        let (id, _) = self.write_frame(envelope)?;
        Ok(id)
    }

    fn submit_request(
        &mut self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Envelope, ClientError>>, ClientError> {
        let (id, _) = self.write_frame(envelope)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal.send(Internal::ReplyTimeout { id });
        });
        Ok(rx)
    }

    fn write_frame(&mut self, mut envelope: Envelope) -> Result<(u64, u64), ClientError> {
        if !matches!(self.state, TransportState::Connected) {
            return Err(ClientError::NoConnection);
        }
        let socket = self.socket.as_ref().ok_or(ClientError::NoConnection)?;
        self.next_id += 1;
        envelope.id = self.next_id;
        let text = serde_json::to_string(&envelope)
            .map_err(|e| ClientError::Internal(e.to_string()))?;
        socket
            .out_tx
            .send(Message::Text(text))
            .map_err(|_| ClientError::Websocket("socket writer gone".to_string()))?;
        Ok((envelope.id, socket.generation))
    }

    fn send_heartbeat(&mut self) {
        let envelope = Envelope::new(Payload::Ping(Heartbeat {
            ts: now_ms(),
            auth: None,
        }));
        let timeout = self
            .config
            .heartbeat_interval
            .mul_f64(HEARTBEAT_TIMEOUT_RATIO);
        let generation = self.generation;
        match self.submit_request(envelope, timeout) {
            Ok(rx) => {
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    if let Ok(Err(ClientError::Timeout)) = rx.await {
                        let _ = internal.send(Internal::HeartbeatTimeout { generation });
                    }
                });
            }
            Err(e) => {
                debug!(target: "client.transport", error = %e, "heartbeat not sent");
            }
        }
    }

    fn record_rtt(&mut self, rtt: u64) {
        self.rtt_samples.push_back(rtt);
        while self.rtt_samples.len() > RTT_SAMPLE_LIMIT {
            self.rtt_samples.pop_front();
        }
        let avg = self.rtt_samples.iter().sum::<u64>() / self.rtt_samples.len() as u64;
        self.latency_ms.store(avg, Ordering::SeqCst);
    }

    fn apply_turn(&mut self, turn: TurnConfig) {
        let servers = vec![IceServer {
            urls: turn.uris.clone(),
            username: Some(turn.username.clone()),
            credential: Some(turn.password.clone()),
        }];
        let apply = self
            .turn_policy
            .as_ref()
            .map_or(true, |policy| policy(&servers));
        let _ = self.events.send(TransportEvent::TurnChanged {
            servers: servers.clone(),
        });
        if apply {
            if let Ok(mut guard) = self.ice_servers.write() {
                *guard = servers;
            }
        } else {
            debug!(
                target: "client.transport",
                "turn refresh withheld by policy"
            );
        }
        self.schedule_turn_refresh(
            Duration::from_secs(turn.ttl).mul_f64(TURN_REFRESH_RATIO),
        );
    }

    fn schedule_turn_refresh(&mut self, delay: Duration) {
        self.turn_guard.cancel();
        self.turn_guard = CancellationToken::new();
        let guard = self.turn_guard.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = internal.send(Internal::RefreshTurn);
                }
            }
        });
    }

    fn schedule_reconnect(&mut self, fast: bool) {
        if !self.reconnect_enabled {
            self.set_state(TransportState::Disconnected);
            return;
        }
        self.reconnect_seq += 1;
        let seq = self.reconnect_seq;
        let delay = if fast {
            Duration::ZERO
        } else {
            self.backoff_delay()
        };
        self.attempts = self.attempts.saturating_add(1);
        debug!(
            target: "client.transport",
            attempts = self.attempts,
            delay_ms = delay.as_millis() as u64,
            fast = fast,
            "reconnect scheduled"
        );
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::ReconnectAttempt { seq });
        });
    }

    /// `min(max, base * factor^attempts) + uniform(0, spreader)`.
    fn backoff_delay(&self) -> Duration {
        let base = self.config.reconnect_interval.as_millis() as f64;
        let max = self.config.max_reconnect_interval.as_millis() as f64;
        #[allow(clippy::cast_possible_wrap)]
        let exp = base * self.config.reconnect_factor.powi(self.attempts as i32);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = exp.min(max) as u64;
        let spreader = self.config.reconnect_spreader.as_millis() as u64;
        let spread = if spreader == 0 {
            0
        } else {
            rand::Rng::gen_range(&mut rand::thread_rng(), 0..=spreader)
        };
        Duration::from_millis(capped + spread)
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state == state {
            return;
        }
        self.state = state;
        let _ = self.events.send(TransportEvent::StateChanged {
            state,
            connected: matches!(state, TransportState::Connected),
        });
    }

    fn emit_error(&self, error: &ClientError) {
        let _ = self.events.send(TransportEvent::Error {
            code: error.code(),
            msg: error.to_string(),
        });
    }
}

fn clone_error(error: &ClientError) -> ClientError {
    match error {
        ClientError::NoConnection => ClientError::NoConnection,
        ClientError::ConnectionDestroyed => ClientError::ConnectionDestroyed,
        ClientError::Timeout => ClientError::Timeout,
        other => ClientError::Internal(other.to_string()),
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
