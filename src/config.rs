//! Connection settings for the phoenixd websocket.
//!
//! `PhoenixdConfig` is the loose, deserializable shape an application keeps in
//! its own settings. `ConnectionParameters` is the validated, immutable form
//! handed to [`crate::stream::client::PaymentStream`].

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::retry::ReconnectPolicy;

/// Default phoenixd HTTP listener.
pub const DEFAULT_HOST: &str = "http://127.0.0.1:9740";
/// Default phoenixd HTTP basic-auth username.
pub const DEFAULT_USERNAME: &str = "phoenix";
/// Path of the payments websocket on the node.
pub const WEBSOCKET_PATH: &str = "/websocket";

/// Default timing values used by [`StreamClientOptions`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// Delay between reconnect attempts.
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    /// Upper bound for one connect attempt, handshake included.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Node settings as an application stores them.
#[derive(Clone, Debug, Deserialize)]
pub struct PhoenixdConfig {
    /// Node base URL, for example `http://127.0.0.1:9740`.
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP basic-auth username for the REST surface.
    #[serde(default = "default_username")]
    pub username: String,
    /// `http-password` from the node's `phoenix.conf`.
    pub token: SecretString,
}

impl PhoenixdConfig {
    /// Creates settings for the default local node.
    pub fn new(token: SecretString) -> Self {
        Self {
            host: default_host(),
            username: default_username(),
            token,
        }
    }

    /// Overrides the node base URL.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Builds websocket connection parameters from these settings.
    ///
    /// The websocket authenticates with an empty username, so `username` is
    /// only meaningful to the REST surface.
    pub fn connection_parameters(&self) -> Result<ConnectionParameters, ConfigError> {
        ConnectionParameters::new(self.host.clone(), self.token.clone())
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

/// Validated, immutable inputs for every connect attempt.
#[derive(Clone)]
pub struct ConnectionParameters {
    host: String,
    /// Holds the shared secret; marked sensitive so it never prints.
    auth_header: HeaderValue,
}

impl ConnectionParameters {
    /// Validates `host` and derives the authorization header from `shared_secret`.
    ///
    /// The secret is not kept in any other form.
    pub fn new(host: impl Into<String>, shared_secret: SecretString) -> Result<Self, ConfigError> {
        let host = host.into().trim().to_string();
        if strip_scheme(&host).is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        let token = BASE64_STANDARD.encode(format!(":{}", shared_secret.expose_secret()));
        let mut auth_header = HeaderValue::from_str(&format!("Basic {token}"))?;
        auth_header.set_sensitive(true);

        Ok(Self { host, auth_header })
    }

    /// Host as configured, trimmed of surrounding whitespace.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `Basic base64(":<secret>")`, attached to every connect attempt.
    pub fn authorization_header(&self) -> &HeaderValue {
        &self.auth_header
    }

    /// Websocket endpoint derived from the configured host.
    ///
    /// `https://` and `wss://` hosts map to `wss`; anything else maps to `ws`.
    pub fn websocket_url(&self) -> String {
        let secure = self.host.starts_with("https://") || self.host.starts_with("wss://");
        let scheme = if secure { "wss" } else { "ws" };
        format!("{scheme}://{}{WEBSOCKET_PATH}", strip_scheme(&self.host))
    }
}

impl std::fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("host", &self.host)
            .field("authorization", &"[REDACTED]")
            .finish()
    }
}

fn strip_scheme(host: &str) -> &str {
    let host = ["http://", "https://", "ws://", "wss://"]
        .iter()
        .find_map(|prefix| host.strip_prefix(prefix))
        .unwrap_or(host);
    host.trim_end_matches('/')
}

/// Tunables for a [`crate::stream::client::PaymentStream`].
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    /// Delay schedule between reconnect attempts.
    pub reconnect_policy: ReconnectPolicy,
    /// Upper bound for one connect attempt.
    pub connect_timeout: Duration,
}

impl StreamClientOptions {
    /// Replaces the reconnect policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Replaces the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            reconnect_policy: ReconnectPolicy::fixed(StreamDefaults::RECONNECT_DELAY),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
        }
    }
}

/// Errors returned while building [`ConnectionParameters`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Host is blank once its scheme and trailing slash are removed.
    #[error("phoenixd host is empty")]
    EmptyHost,

    /// Secret cannot be carried in an HTTP header.
    #[error("invalid authorization header: {0}")]
    InvalidAuthHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{
        ConfigError, ConnectionParameters, PhoenixdConfig, StreamClientOptions, StreamDefaults,
        DEFAULT_HOST, DEFAULT_USERNAME,
    };

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    #[test]
    fn authorization_header_encodes_empty_user_and_secret() {
        let params = ConnectionParameters::new("http://127.0.0.1:9740", secret("s3cret"))
            .expect("valid params");
        // base64(":s3cret")
        assert_eq!(
            params.authorization_header().to_str().expect("ascii header"),
            "Basic OnMzY3JldA=="
        );
        assert!(params.authorization_header().is_sensitive());
    }

    #[test]
    fn websocket_url_strips_http_scheme() {
        let params =
            ConnectionParameters::new("http://127.0.0.1:9740/", secret("x")).expect("valid params");
        assert_eq!(params.websocket_url(), "ws://127.0.0.1:9740/websocket");
    }

    #[test]
    fn websocket_url_uses_wss_for_https_hosts() {
        let params =
            ConnectionParameters::new("https://node.example", secret("x")).expect("valid params");
        assert_eq!(params.websocket_url(), "wss://node.example/websocket");
    }

    #[test]
    fn bare_host_defaults_to_plain_websocket() {
        let params = ConnectionParameters::new("localhost:9740", secret("x")).expect("valid params");
        assert_eq!(params.websocket_url(), "ws://localhost:9740/websocket");
    }

    #[test]
    fn empty_host_is_rejected() {
        let err = ConnectionParameters::new("https://", secret("x")).expect_err("empty host");
        assert!(matches!(err, ConfigError::EmptyHost));
    }

    #[test]
    fn secret_with_newline_still_yields_header_safe_token() {
        let params = ConnectionParameters::new("h:1", secret("line\nbreak")).expect("valid params");
        assert!(params
            .authorization_header()
            .to_str()
            .expect("ascii header")
            .starts_with("Basic "));
    }

    #[test]
    fn debug_output_redacts_secret() {
        let params = ConnectionParameters::new("h:1", secret("hunter2")).expect("valid params");
        let rendered = format!("{params:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: PhoenixdConfig =
            serde_json::from_str(r#"{"token":"abc"}"#).expect("deserialize config");
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.username, DEFAULT_USERNAME);

        let params = config.connection_parameters().expect("params");
        assert_eq!(params.websocket_url(), "ws://127.0.0.1:9740/websocket");
    }

    #[test]
    fn default_options_use_five_second_fixed_backoff() {
        let options = StreamClientOptions::default();
        assert_eq!(
            options.reconnect_policy.delay_for_attempt(1),
            StreamDefaults::RECONNECT_DELAY
        );
        assert_eq!(
            options.reconnect_policy.delay_for_attempt(7),
            StreamDefaults::RECONNECT_DELAY
        );
        assert_eq!(options.connect_timeout, StreamDefaults::CONNECT_TIMEOUT);
    }
}
