//! Client error types.
//!
//! Every error maps to a stable code string surfaced on error events and
//! used by callers to branch on failure kinds. Transport-level failures
//! trigger local repair (reconnect, peer recreation); only fatal errors
//! reach the application's error event.

use thiserror::Error;

/// Error type of the meeting client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP bootstrap request could not be performed.
    #[error("bootstrap request failed: {0}")]
    RequestFailed(String),

    /// HTTP bootstrap request was rejected with a status code.
    #[error("bootstrap request rejected with status {0}")]
    Http(u16),

    /// Socket did not open within the connect timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// Operation requires an open control channel.
    #[error("no connection")]
    NoConnection,

    /// A request's reply did not arrive in time.
    #[error("reply timed out")]
    Timeout,

    /// WebSocket-level failure.
    #[error("websocket error: {0}")]
    Websocket(String),

    /// Write attempted after the connection was torn down for good.
    #[error("connection is destroyed")]
    ConnectionDestroyed,

    /// The server replied with an `error` envelope.
    #[error("server error {code}: {msg}")]
    Server { code: String, msg: String },

    /// A call already occupies the channel.
    #[error("already have a channel")]
    ChannelExists,

    /// Operation requires an active channel.
    #[error("no channel")]
    NoChannel,

    /// A peer record already exists for this user.
    #[error("peer already exists")]
    PeerExists,

    /// No peer record exists for this user.
    #[error("unknown peer")]
    UnknownPeer,

    /// A data-channel message referenced an unknown stream token.
    #[error("wrong stream")]
    WrongStream,

    /// Mesh reconciliation requires the local user in the member list.
    #[error("mesh without self")]
    MeshWithoutSelf,

    /// The media peer provider failed.
    #[error("peer provider error: {0}")]
    Provider(String),

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Stable code string for this error.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            ClientError::RequestFailed(_) => "request_failed".to_string(),
            ClientError::Http(status) => format!("http_error_{status}"),
            ClientError::ConnectTimeout => "connect_timeout".to_string(),
            ClientError::NoConnection => "no_connection".to_string(),
            ClientError::Timeout => "timeout".to_string(),
            ClientError::Websocket(_) => "websocket_error".to_string(),
            ClientError::ConnectionDestroyed => "connection_is_destroyed".to_string(),
            ClientError::Server { code, .. } => code.clone(),
            ClientError::ChannelExists => "already_have_channel".to_string(),
            ClientError::NoChannel => "no_channel".to_string(),
            ClientError::PeerExists => "peer_already_exists".to_string(),
            ClientError::UnknownPeer => "unknown_peer".to_string(),
            ClientError::WrongStream => "wrong_stream".to_string(),
            ClientError::MeshWithoutSelf => "mesh_without_self".to_string(),
            ClientError::Provider(_) => "peer_provider_error".to_string(),
            ClientError::Internal(_) => "internal_error".to_string(),
        }
    }

    /// Whether a bootstrap failure is permanent. Permanent failures
    /// disable auto-reconnect; transient ones schedule a retry.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, ClientError::Http(400 | 401 | 403))
    }
}
