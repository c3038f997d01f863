//! Tunables for a [`crate::BridgeClient`] (spec §2).

use std::time::Duration;

/// Configuration for one Bridge Client connection.
#[derive(Debug, Clone)]
pub struct BridgeClientConfig {
    /// `ws://` or `wss://` URL to connect and reconnect to.
    pub url: String,
    /// Shared secret for the encrypted framing. `None` sends plaintext.
    pub password: Option<String>,
    /// Frame kind used for encrypted traffic (ignored in plaintext mode).
    pub binary: bool,
    /// How long a `request()` waits for its `$response$` before it
    /// resolves to a gateway-timeout envelope.
    pub timeout: Duration,
    /// Interval on which `$heartick$` is sent to the peer.
    pub heartick: Duration,
    /// Interval on which a dropped connection is retried.
    pub conntick: Duration,
    /// Skip server certificate verification over `wss://`. Used for
    /// peer cluster links, which accept self-signed certificates
    /// (spec §6 "TLS"); end-user clients should leave this `false`.
    pub accept_invalid_certs: bool,
}

impl Default for BridgeClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            password: None,
            binary: false,
            timeout: Duration::from_millis(8000),
            heartick: Duration::from_secs(60),
            conntick: Duration::from_secs(3),
            accept_invalid_certs: false,
        }
    }
}

impl BridgeClientConfig {
    /// Any `http(s)://` prefix is normalized to `ws(s)://` (spec §4.2
    /// "Configuration" — `host`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: normalize_scheme(url.into()),
            ..Default::default()
        }
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_heartick(mut self, heartick: Duration) -> Self {
        self.heartick = heartick;
        self
    }

    pub fn with_conntick(mut self, conntick: Duration) -> Self {
        self.conntick = conntick;
        self
    }
}

fn normalize_scheme(url: String) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url
    }
}
