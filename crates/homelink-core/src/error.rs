// ── Core error types ──
//
// User-facing errors from homelink-core. Consumers never see raw HTTP
// statuses or MQTT client errors; `From<homelink_api::Error>` translates
// them. Realtime failures are not errors at all: the orchestrator reports
// them through its status stream and mode.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to server: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Server connection timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    // ── Storage ──────────────────────────────────────────────────────
    #[error(transparent)]
    Store(#[from] StoreError),

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<homelink_api::Error> for CoreError {
    fn from(err: homelink_api::Error) -> Self {
        use homelink_api::Error as Api;

        match err {
            Api::Unauthorized => CoreError::AuthenticationFailed {
                message: "server rejected the username or password".into(),
            },
            Api::Forbidden => CoreError::AuthenticationFailed {
                message: "account is not allowed to access this resource".into(),
            },
            Api::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            Api::Http { status, endpoint } => CoreError::Api {
                message: format!("{endpoint} returned HTTP {status}"),
                status: Some(status),
            },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::Tls(reason) => CoreError::ConnectionFailed {
                reason: format!("TLS error: {reason}"),
            },
            Api::Mqtt(reason) => CoreError::ConnectionFailed {
                reason: format!("MQTT: {reason}"),
            },
            Api::StreamUnavailable(reason) => CoreError::ConnectionFailed {
                reason: format!("event stream: {reason}"),
            },
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            Api::Asset { name, source } => CoreError::Config {
                message: format!("asset {name}: {source}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_translate() {
        let err: CoreError = homelink_api::Error::Unauthorized.into();
        assert!(err.is_auth_failure());

        let err: CoreError = homelink_api::Error::Http {
            status: 500,
            endpoint: "api/devices".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Api { status: Some(500), .. }));
    }

    #[test]
    fn store_closed_is_transparent() {
        let err: CoreError = StoreError::Closed.into();
        assert_eq!(err.to_string(), StoreError::Closed.to_string());
    }
}
