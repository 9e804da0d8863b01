//! Peer creation and event binding.
//!
//! The factory builds provider options from the client configuration and
//! the current ICE server list, then bridges the provider's event stream
//! into the engine mailbox. Every forwarded event is tagged with the
//! connection id it originated from; handlers drop events whose id no
//! longer matches the record's bound connection, so a superseded peer can
//! never mutate state.

use crate::config::RtcOptions;
use crate::errors::ClientError;
use crate::peer::provider::{
    IceServer, MediaPeer, MediaStream, PeerOptions, PeerProvider,
};
use crate::session::InternalMsg;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// ICE server list shared between the transport (which refreshes it) and
/// the factory (which reads it at peer creation).
pub type SharedIceServers = Arc<RwLock<Vec<IceServer>>>;

/// Delay before a failed connection is recreated. The guard re-checks
/// that the failed connection is still the bound one when the timer
/// fires.
pub(crate) const RECOVERY_DELAY: Duration = Duration::from_millis(500);

pub(crate) struct PeerFactory {
    provider: Arc<dyn PeerProvider>,
    ice_servers: SharedIceServers,
    rtc: RtcOptions,
    internal_tx: mpsc::UnboundedSender<InternalMsg>,
}

impl PeerFactory {
    pub(crate) fn new(
        provider: Arc<dyn PeerProvider>,
        ice_servers: SharedIceServers,
        rtc: RtcOptions,
        internal_tx: mpsc::UnboundedSender<InternalMsg>,
    ) -> Self {
        Self {
            provider,
            ice_servers,
            rtc,
            internal_tx,
        }
    }

    /// The configured inbound SDP rewrite hook, if any.
    pub(crate) fn remote_sdp_transform(&self) -> Option<crate::config::SdpTransform> {
        self.rtc.remote_sdp_transform.clone()
    }

    fn ice_snapshot(&self) -> Vec<IceServer> {
        self.ice_servers
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn base_options(&self, initiator: bool, streams: Vec<MediaStream>) -> PeerOptions {
        PeerOptions {
            initiator,
            ice_servers: self.ice_snapshot(),
            streams,
            trickle: true,
            channel_name: self.rtc.channel_name().to_string(),
            channel_config: self.rtc.channel_config.clone(),
            object_mode: true,
            offer_constraints: self.rtc.offer_constraints.clone(),
            answer_constraints: self.rtc.answer_constraints.clone(),
            sdp_transform: self.rtc.local_sdp_transform.clone(),
            recv_video: false,
        }
    }

    /// Create a peer bound to a call-engine record. Events arrive in the
    /// engine mailbox tagged with the record id and the connection id.
    pub(crate) fn create_peer(
        &self,
        record_id: &str,
        initiator: bool,
        streams: Vec<MediaStream>,
    ) -> Result<Arc<dyn MediaPeer>, ClientError> {
        let created = self.provider.create(self.base_options(initiator, streams))?;
        let pc_id = created.peer.local_id();
        tracing::debug!(
            target: "client.peer",
            record_id = %record_id,
            pc_id = %pc_id,
            initiator = initiator,
            "peer created"
        );

        let internal = self.internal_tx.clone();
        let id = record_id.to_string();
        let mut events = created.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if internal
                    .send(InternalMsg::PeerEvent {
                        id: id.clone(),
                        pc_id: pc_id.clone(),
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(created.peer)
    }

    /// Create a per-stream sub-connection whose signaling runs over the
    /// parent peer's data channel.
    pub(crate) fn create_stream_peer(
        &self,
        p2p_id: &str,
        stream_id: &str,
        local: bool,
        initiator: bool,
        streams: Vec<MediaStream>,
        recv_video: bool,
    ) -> Result<Arc<dyn MediaPeer>, ClientError> {
        let mut options = self.base_options(initiator, streams);
        options.recv_video = recv_video;
        let created = self.provider.create(options)?;
        let pc_id = created.peer.local_id();
        tracing::debug!(
            target: "client.peer",
            p2p_id = %p2p_id,
            stream_id = %stream_id,
            pc_id = %pc_id,
            local = local,
            "stream sub-peer created"
        );

        let internal = self.internal_tx.clone();
        let p2p = p2p_id.to_string();
        let stream = stream_id.to_string();
        let mut events = created.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if internal
                    .send(InternalMsg::SubPeerEvent {
                        p2p_id: p2p.clone(),
                        stream_id: stream.clone(),
                        local,
                        pc_id: pc_id.clone(),
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(created.peer)
    }
}
