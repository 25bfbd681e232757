//! Server connection settings and operation timeouts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TransportError;

/// Server URL used when nothing is configured.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8888";

/// Environment variable holding the server base URL.
pub const SERVER_URL_ENV: &str = "JUPYTER_SERVER_URL";

/// Environment variable holding the server token.
pub const SERVER_TOKEN_ENV: &str = "JUPYTER_SERVER_TOKEN";

/// Read-only connection settings shared by every session against one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the server, without a trailing slash.
    pub base_url: String,

    /// Optional token sent as `Authorization: token <token>`.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_URL, None::<String>)
    }
}

impl ServerConfig {
    /// Create a config for `base_url`. An empty token counts as no token.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<impl Into<String>>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let token = token.map(Into::into).filter(|t: &String| !t.is_empty());
        Self { base_url, token }
    }

    /// Build a config from `JUPYTER_SERVER_URL` and `JUPYTER_SERVER_TOKEN`.
    #[must_use]
    pub fn from_env() -> Self {
        let base_url =
            std::env::var(SERVER_URL_ENV).unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
        Self::new(base_url, std::env::var(SERVER_TOKEN_ENV).ok())
    }

    /// Value for the `Authorization` header, if a token is configured.
    #[must_use]
    pub fn auth_header(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("token {t}"))
    }

    /// `{base}/api/kernels`
    #[must_use]
    pub fn kernels_url(&self) -> String {
        format!("{}/api/kernels", self.base_url)
    }

    /// `{base}/api/kernels/{id}`
    #[must_use]
    pub fn kernel_url(&self, kernel_id: &str) -> String {
        format!("{}/{kernel_id}", self.kernels_url())
    }

    /// `{base}/api/kernels/{id}/interrupt`
    #[must_use]
    pub fn interrupt_url(&self, kernel_id: &str) -> String {
        format!("{}/interrupt", self.kernel_url(kernel_id))
    }

    /// WebSocket URL of the kernel's channels endpoint.
    ///
    /// # Errors
    /// Returns error if the base URL is not an http(s) URL.
    pub fn channels_url(&self, kernel_id: &str, session_id: &str) -> Result<Url, TransportError> {
        let raw = format!("{}/channels", self.kernel_url(kernel_id));
        let mut url = Url::parse(&raw).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidUrl(raw.clone()))?;
        url.query_pairs_mut().append_pair("session_id", session_id);

        Ok(url)
    }
}

/// Bounds on every network wait a session performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Reachability probe (`GET /api/kernels`).
    #[serde(with = "millis")]
    pub probe: Duration,
    /// Kernel creation call.
    #[serde(with = "millis")]
    pub create: Duration,
    /// Opening the channel after the kernel exists.
    #[serde(with = "millis")]
    pub channel_open: Duration,
    /// Each best-effort step of shutdown.
    #[serde(with = "millis")]
    pub shutdown: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(2),
            create: Duration::from_secs(10),
            channel_open: Duration::from_secs(10),
            shutdown: Duration::from_secs(5),
        }
    }
}

/// Per-session behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Network timeouts.
    pub timeouts: Timeouts,
    /// Keep image payloads of earlier requests instead of releasing them
    /// when a new request starts.
    pub retain_images: bool,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
