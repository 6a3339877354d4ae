use thiserror::Error;

/// Top-level error type for the `homelink-api` crate.
///
/// Covers every failure mode across all API surfaces:
/// the one-shot REST client, the SSE stream, the MQTT broker, and TLS setup.
/// `homelink-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Server rejected the Basic credentials (HTTP 401).
    #[error("Unauthorized -- check username and password")]
    Unauthorized,

    /// Credentials were accepted but lack access (HTTP 403).
    #[error("Forbidden -- access denied")]
    Forbidden,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status that isn't an auth failure.
    #[error("HTTP {status} from {endpoint}")]
    Http { status: u16, endpoint: String },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Operation did not complete in time.
    #[error("Timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS configuration or client identity error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Realtime transports ─────────────────────────────────────────
    /// MQTT client or connection error.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// The event stream could not be opened.
    #[error("Event stream unavailable: {0}")]
    StreamUnavailable(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Assets ──────────────────────────────────────────────────────
    /// A bundled asset could not be read.
    #[error("Asset '{name}' unavailable: {source}")]
    Asset {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Returns `true` if the server rejected the credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::Forbidden)
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            Self::Http { status, .. } => *status >= 500,
            Self::Timeout { .. } | Self::Mqtt(_) | Self::StreamUnavailable(_) => true,
            _ => false,
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, endpoint: &str) -> Self {
        match status {
            reqwest::StatusCode::UNAUTHORIZED => Self::Unauthorized,
            reqwest::StatusCode::FORBIDDEN => Self::Forbidden,
            other => Self::Http {
                status: other.as_u16(),
                endpoint: endpoint.to_owned(),
            },
        }
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::Mqtt(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for Error {
    fn from(err: rumqttc::ConnectionError) -> Self {
        Self::Mqtt(err.to_string())
    }
}
