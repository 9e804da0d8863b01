//! Transport-side test harness.
//!
//! Plays the server's role behind a [`TransportHandle`]: receives the
//! engine's outbound commands, assigns envelope ids the way the real
//! transport would, answers requests, and pushes inbound envelopes and
//! transport events.

use meeting_client::errors::ClientError;
use meeting_client::transport::{TransportCommand, TransportEvent, TransportHandle};
use signaling_protocol::envelope::Envelope;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How long harness expectations wait before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TransportHarness {
    commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    next_id: u64,
}

impl TransportHarness {
    /// Build a harness. The returned handle and event receiver go into
    /// `Client::with_transport`.
    #[must_use]
    pub fn new() -> (
        TransportHandle,
        mpsc::UnboundedReceiver<TransportEvent>,
        Self,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = TransportHandle::from_parts(cmd_tx, Arc::new(AtomicU64::new(0)));
        (
            handle,
            event_rx,
            Self {
                commands: cmd_rx,
                events: event_tx,
                next_id: 0,
            },
        )
    }

    /// Next outbound command, panicking after a timeout.
    pub async fn next_command(&mut self) -> TransportCommand {
        tokio::time::timeout(WAIT_TIMEOUT, self.commands.recv())
            .await
            .expect("timed out waiting for a transport command")
            .expect("transport command channel closed")
    }

    /// Expect a fire-and-forget send; acknowledges it and returns the
    /// envelope with its assigned id.
    pub async fn expect_send(&mut self) -> Envelope {
        match self.next_command().await {
            TransportCommand::Send {
                mut envelope,
                respond_to,
            } => {
                self.next_id += 1;
                envelope.id = self.next_id;
                let _ = respond_to.send(Ok(envelope.id));
                envelope
            }
            other => panic!("expected a send command, got {other:?}"),
        }
    }

    /// Expect a request; returns the envelope (with its assigned id) and
    /// the reply slot.
    pub async fn expect_request(
        &mut self,
    ) -> (Envelope, oneshot::Sender<Result<Envelope, ClientError>>) {
        match self.next_command().await {
            TransportCommand::Request {
                mut envelope,
                respond_to,
                ..
            } => {
                self.next_id += 1;
                envelope.id = self.next_id;
                (envelope, respond_to)
            }
            other => panic!("expected a request command, got {other:?}"),
        }
    }

    /// A command, if one is already queued.
    pub fn try_next_command(&mut self) -> Option<TransportCommand> {
        self.commands.try_recv().ok()
    }

    /// Push an inbound envelope to the session.
    pub fn push_message(&self, envelope: Envelope) {
        let _ = self.events.send(TransportEvent::Message(envelope));
    }

    /// Push a raw transport event to the session.
    pub fn push_event(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}
