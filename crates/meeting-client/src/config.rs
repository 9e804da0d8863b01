//! Client configuration.
//!
//! Options are plain structs with documented defaults. Authorization
//! values are redacted in Debug output.

use crate::peer::IceServer;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default socket connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default heartbeat interval. A pong must arrive within 90% of this.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default reconnect backoff base.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Default reconnect backoff cap.
pub const DEFAULT_MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Default reconnect backoff growth factor.
pub const DEFAULT_RECONNECT_FACTOR: f64 = 1.5;

/// Default upper bound of the uniform random spread added to each
/// reconnect delay.
pub const DEFAULT_RECONNECT_SPREADER: Duration = Duration::from_millis(500);

/// Default label of the peer data channel.
pub const DEFAULT_CHANNEL_NAME: &str = "meeting-p2p";

/// Supported API versions of the signaling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    /// Path segment of this version.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
            ApiVersion::V2 => "v2",
        }
    }
}

/// Transport-side configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URI of the signaling service, e.g. `https://meet.example.com`.
    pub server: String,
    pub api_version: ApiVersion,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub reconnect_enabled: bool,
    pub reconnect_factor: f64,
    pub reconnect_interval: Duration,
    pub reconnect_spreader: Duration,
    /// Authorization scheme for bootstrap requests, e.g. `Bearer`.
    pub authorization_type: String,
    /// Authorization credential; redacted in Debug output.
    pub authorization_value: String,
    /// Session authorization value sent in bootstrap bodies. A `pong`
    /// may carry a refreshed value that replaces this one.
    pub authorization_auth: String,
}

impl ClientConfig {
    /// Configuration with defaults for the given server base URI.
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            api_version: ApiVersion::V2,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_reconnect_interval: DEFAULT_MAX_RECONNECT_INTERVAL,
            reconnect_enabled: true,
            reconnect_factor: DEFAULT_RECONNECT_FACTOR,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            reconnect_spreader: DEFAULT_RECONNECT_SPREADER,
            authorization_type: String::new(),
            authorization_value: String::new(),
            authorization_auth: String::new(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("api_version", &self.api_version)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_reconnect_interval", &self.max_reconnect_interval)
            .field("reconnect_enabled", &self.reconnect_enabled)
            .field("reconnect_factor", &self.reconnect_factor)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("reconnect_spreader", &self.reconnect_spreader)
            .field("authorization_type", &self.authorization_type)
            .field("authorization_value", &"[REDACTED]")
            .field("authorization_auth", &"[REDACTED]")
            .finish()
    }
}

/// SDP rewrite hook applied to outbound (local) or inbound (remote)
/// session descriptions.
pub type SdpTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Decides whether a refreshed TURN credential set replaces the active
/// ICE server list. Returning `false` keeps the current list; the
/// `turnChanged` event is emitted either way.
pub type TurnPolicy = Arc<dyn Fn(&[IceServer]) -> bool + Send + Sync>;

/// Media-connection options handed to the peer provider.
#[derive(Clone, Default)]
pub struct RtcOptions {
    /// Data channel configuration, passed through to the provider.
    pub channel_config: Option<Value>,
    /// Label of the peer data channel. Empty selects
    /// [`DEFAULT_CHANNEL_NAME`].
    pub channel_name: String,
    pub offer_constraints: Option<Value>,
    pub answer_constraints: Option<Value>,
    pub local_sdp_transform: Option<SdpTransform>,
    pub remote_sdp_transform: Option<SdpTransform>,
}

impl RtcOptions {
    pub(crate) fn channel_name(&self) -> &str {
        if self.channel_name.is_empty() {
            DEFAULT_CHANNEL_NAME
        } else {
            &self.channel_name
        }
    }
}

impl fmt::Debug for RtcOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcOptions")
            .field("channel_config", &self.channel_config)
            .field("channel_name", &self.channel_name)
            .field("offer_constraints", &self.offer_constraints)
            .field("answer_constraints", &self.answer_constraints)
            .field(
                "local_sdp_transform",
                &self.local_sdp_transform.as_ref().map(|_| "<fn>"),
            )
            .field(
                "remote_sdp_transform",
                &self.remote_sdp_transform.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

/// Everything needed to build a [`crate::Client`].
#[derive(Clone)]
pub struct ClientOptions {
    pub config: ClientConfig,
    pub rtc: RtcOptions,
    pub turn_policy: Option<TurnPolicy>,
}

impl ClientOptions {
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(server),
            rtc: RtcOptions::default(),
            turn_policy: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("config", &self.config)
            .field("rtc", &self.rtc)
            .field("turn_policy", &self.turn_policy.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("https://meet.example.com");
        assert_eq!(config.server, "https://meet.example.com");
        assert_eq!(config.api_version, ApiVersion::V2);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.max_reconnect_interval, DEFAULT_MAX_RECONNECT_INTERVAL);
        assert!(config.reconnect_enabled);
        assert!((config.reconnect_factor - DEFAULT_RECONNECT_FACTOR).abs() < f64::EPSILON);
        assert_eq!(config.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
        assert_eq!(config.reconnect_spreader, DEFAULT_RECONNECT_SPREADER);
    }

    #[test]
    fn test_debug_redacts_authorization() {
        let mut config = ClientConfig::new("https://meet.example.com");
        config.authorization_type = "Bearer".to_string();
        config.authorization_value = "secret-token".to_string();
        config.authorization_auth = "session-secret".to_string();

        let output = format!("{config:?}");
        assert!(output.contains("[REDACTED]"));
        assert!(!output.contains("secret-token"));
        assert!(!output.contains("session-secret"));
        assert!(output.contains("Bearer"));
    }

    #[test]
    fn test_channel_name_fallback() {
        let mut rtc = RtcOptions::default();
        assert_eq!(rtc.channel_name(), DEFAULT_CHANNEL_NAME);
        rtc.channel_name = "custom".to_string();
        assert_eq!(rtc.channel_name(), "custom");
    }

    #[test]
    fn test_api_version_path_segments() {
        assert_eq!(ApiVersion::V1.as_str(), "v1");
        assert_eq!(ApiVersion::V2.as_str(), "v2");
    }
}
