//! Connection configuration shared by the REST client and the kernel
//! channel engine.

use std::time::Duration;

use uuid::Uuid;

/// Everything needed to talk to one Jupyter server as one client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL for REST calls, e.g. `http://localhost:8888/`.
    pub base_url: String,
    /// Base URL for WebSocket connections, e.g. `ws://localhost:8888/`. If
    /// not given explicitly, derived from `base_url` by swapping the
    /// scheme.
    pub ws_url: String,
    /// Bearer token, sent as `Authorization: token {tok}`.
    pub token: Option<String>,
    /// XSRF cookie value, sent as `X-XSRFToken` on state-changing REST
    /// calls when the server has XSRF protection enabled.
    pub xsrf_token: Option<String>,
    /// Username attached to outgoing message headers.
    pub username: String,
    /// Client id sent as the `session_id` query parameter when opening a
    /// kernel's WebSocket, and as the `session` field on message headers.
    pub client_id: String,
    /// Timeout applied to individual REST calls.
    pub rest_timeout: Duration,
    /// Maximum consecutive reconnect attempts before a kernel channel
    /// engine gives up and transitions to `Dead`.
    pub reconnect_limit: u32,
}

impl ClientConfig {
    /// Build a config from a base HTTP(S) URL, deriving a matching
    /// WebSocket URL and generating a fresh client id.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let ws_url = derive_ws_url(&base_url);
        ClientConfig {
            base_url,
            ws_url,
            token: None,
            xsrf_token: None,
            username: "username".to_string(),
            client_id: Uuid::new_v4().to_string(),
            rest_timeout: Duration::from_secs(30),
            reconnect_limit: 7,
        }
    }

    /// Set the bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the XSRF cookie value.
    pub fn with_xsrf_token(mut self, xsrf_token: impl Into<String>) -> Self {
        self.xsrf_token = Some(xsrf_token.into());
        self
    }

    /// Set the username attached to outgoing messages.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }
}

fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_ws_url_from_https() {
        let config = ClientConfig::new("https://example.com/");
        assert_eq!(config.ws_url, "wss://example.com/");
    }

    #[test]
    fn derives_ws_url_from_http() {
        let config = ClientConfig::new("http://localhost:8888/");
        assert_eq!(config.ws_url, "ws://localhost:8888/");
    }
}
