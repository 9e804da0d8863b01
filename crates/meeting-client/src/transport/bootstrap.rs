//! HTTP bootstrap.
//!
//! Before the WebSocket opens, the client POSTs to the connect endpoint
//! to obtain a socket URL and, optionally, TURN credentials. TURN
//! refreshes reuse the same request shape against the turn endpoint.

use crate::config::ClientConfig;
use crate::errors::ClientError;
use serde::Deserialize;
use url::Url;

/// TURN credentials as delivered by the service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TurnConfig {
    pub username: String,
    pub password: String,
    /// Credential lifetime in seconds; a refresh is scheduled at 90%.
    pub ttl: u64,
    pub uris: Vec<String>,
}

/// Result of a successful connect bootstrap.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    /// WebSocket URL, absolute or relative to the service base.
    pub url: String,
    pub turn: Option<TurnConfig>,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    url: String,
    #[serde(default)]
    turn: Option<TurnConfig>,
}

#[derive(Debug, Deserialize)]
struct TurnResponse {
    turn: TurnConfig,
}

/// HTTP bootstrap client. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Bootstrap {
    http: reqwest::Client,
    base: Url,
    api_version: &'static str,
    authorization: Option<String>,
}

impl Bootstrap {
    pub(crate) fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let base = Url::parse(&config.server)
            .map_err(|e| ClientError::RequestFailed(format!("invalid server uri: {e}")))?;
        let authorization = if config.authorization_type.is_empty() {
            None
        } else {
            Some(format!(
                "{} {}",
                config.authorization_type, config.authorization_value
            ))
        };
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            api_version: config.api_version.as_str(),
            authorization,
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!(
            "{}/api/{}/{}",
            self.base.as_str().trim_end_matches('/'),
            self.api_version,
            name
        )
    }

    async fn post_form(
        &self,
        endpoint: &str,
        mode: &str,
        identifier: &str,
        auth: Option<&str>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut form: Vec<(String, String)> = vec![(mode.to_string(), identifier.to_string())];
        if let Some(auth) = auth {
            if !auth.is_empty() {
                form.push(("auth".to_string(), auth.to_string()));
            }
        }

        let mut request = self.http.post(endpoint).form(&form);
        if let Some(authorization) = &self.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, authorization.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::RequestFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Http(status.as_u16()));
        }
        Ok(response)
    }

    /// Bootstrap a connection: resolves to the WebSocket URL and the
    /// initial TURN configuration.
    pub(crate) async fn connect(
        &self,
        mode: &str,
        identifier: &str,
        auth: Option<&str>,
    ) -> Result<ConnectInfo, ClientError> {
        let response = self
            .post_form(&self.endpoint("rtm.connect"), mode, identifier, auth)
            .await?;
        let body: ConnectResponse = response
            .json()
            .await
            .map_err(|e| ClientError::RequestFailed(e.to_string()))?;
        if !body.ok || body.url.is_empty() {
            return Err(ClientError::RequestFailed(
                "connect rejected by server".to_string(),
            ));
        }
        Ok(ConnectInfo {
            url: body.url,
            turn: body.turn,
        })
    }

    /// Fetch refreshed TURN credentials.
    pub(crate) async fn turn(
        &self,
        mode: &str,
        identifier: &str,
        auth: Option<&str>,
    ) -> Result<TurnConfig, ClientError> {
        let response = self
            .post_form(&self.endpoint("rtm.turn"), mode, identifier, auth)
            .await?;
        let body: TurnResponse = response
            .json()
            .await
            .map_err(|e| ClientError::RequestFailed(e.to_string()))?;
        Ok(body.turn)
    }

    /// Resolve the socket URL from the bootstrap response against the
    /// service base, mapping the scheme to ws/wss.
    pub(crate) fn websocket_url(&self, url: &str) -> Result<String, ClientError> {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return Ok(url.to_string());
        }
        let resolved = self
            .base
            .join(url)
            .map_err(|e| ClientError::RequestFailed(format!("invalid socket url: {e}")))?
            .to_string();
        if let Some(rest) = resolved.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = resolved.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Ok(resolved)
        }
    }
}
