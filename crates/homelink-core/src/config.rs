// ── Runtime realtime configuration ──
//
// Immutable snapshot describing how to reach the homelink server. Built by
// the CLI (via homelink-config) and handed to `Realtime::from_config`;
// core never reads config files. Credentials that change at runtime go
// through `CredentialsHandle`, not through this struct.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use homelink_api::{Credentials, MqttConfig, SseConfig, TlsMode, TransportConfig};

use crate::error::CoreError;
use crate::store::DEFAULT_HISTORY_CAP;

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub use_tls: bool,
    /// Present a client certificate from `asset_dir`.
    pub use_client_certs: bool,
    /// Directory holding `client.pfx` or `client-cert.pem` + `client-key.pem`.
    pub asset_dir: Option<PathBuf>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1".into(),
            port: 8883,
            use_tls: true,
            use_client_certs: true,
            asset_dir: None,
        }
    }
}

/// Timeouts and backoff tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// How long `start` waits for the broker session before falling back.
    pub observation_window: Duration,
    pub mqtt_connect_timeout: Duration,
    pub mqtt_reconnect_interval: Duration,
    pub sse_retry_delay: Duration,
    /// Backoff after a 401/403 from the event stream.
    pub sse_auth_retry_delay: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            observation_window: Duration::from_secs(2),
            mqtt_connect_timeout: Duration::from_secs(15),
            mqtt_reconnect_interval: Duration::from_secs(5),
            sse_retry_delay: Duration::from_secs(5),
            sse_auth_retry_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Server base URL (e.g. `http://127.0.0.1:8000/`).
    pub base_url: Url,
    pub username: String,
    pub password: SecretString,
    pub mqtt: MqttSettings,
    /// Certificate policy for HTTPS base URLs.
    pub http_tls: TlsMode,
    pub timings: Timings,
    pub history_cap: usize,
    /// On-disk cache location. `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
}

impl RealtimeConfig {
    /// Snapshot with default broker settings, timings and history cap.
    pub fn new(base_url: Url, username: impl Into<String>, password: SecretString) -> Self {
        Self {
            base_url,
            username: username.into(),
            password,
            mqtt: MqttSettings::default(),
            http_tls: TlsMode::default(),
            timings: Timings::default(),
            history_cap: DEFAULT_HISTORY_CAP,
            store_path: None,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// The broker is only attempted over TLS and with a username.
    pub fn mqtt_usable(&self) -> bool {
        self.mqtt.use_tls && !self.username.trim().is_empty()
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            broker: self.mqtt.broker.clone(),
            port: self.mqtt.port,
            use_tls: self.mqtt.use_tls,
            use_client_certs: self.mqtt.use_client_certs,
            connect_timeout: self.timings.mqtt_connect_timeout,
            reconnect_interval: self.timings.mqtt_reconnect_interval,
            ..MqttConfig::default()
        }
    }

    pub fn sse_config(&self) -> Result<SseConfig, CoreError> {
        let mut config = SseConfig::new(&self.base_url)?;
        config.retry_delay = self.timings.sse_retry_delay;
        config.auth_retry_delay = self.timings.sse_auth_retry_delay;
        config.connect_timeout = self.timings.connect_timeout;
        Ok(config)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            tls: self.http_tls.clone(),
            timeout: Some(self.timings.request_timeout),
            connect_timeout: self.timings.connect_timeout,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> RealtimeConfig {
        RealtimeConfig::new(
            Url::parse("http://127.0.0.1:8000/").unwrap(),
            "guest",
            SecretString::from("secret".to_string()),
        )
    }

    #[test]
    fn defaults_match_local_server() {
        let config = config();
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.history_cap, 50);
        assert_eq!(config.timings.observation_window, Duration::from_secs(2));
    }

    #[test]
    fn mqtt_requires_tls_and_username() {
        let mut config = config();
        assert!(config.mqtt_usable());

        config.username = "  ".into();
        assert!(!config.mqtt_usable());

        config.username = "guest".into();
        config.mqtt.use_tls = false;
        assert!(!config.mqtt_usable());
    }

    #[test]
    fn derived_transport_configs() {
        let mut config = config();
        config.timings.sse_auth_retry_delay = Duration::from_secs(3);

        let sse = config.sse_config().unwrap();
        assert_eq!(sse.url.as_str(), "http://127.0.0.1:8000/api/events/stream");
        assert_eq!(sse.auth_retry_delay, Duration::from_secs(3));

        let mqtt = config.mqtt_config();
        assert_eq!(mqtt.broker, "127.0.0.1");
        assert!(mqtt.use_client_certs);

        assert_eq!(
            config.transport_config().timeout,
            Some(Duration::from_secs(30))
        );
    }
}
