//! Configuration for the homelink CLI.
//!
//! One TOML file (platform config dir) merged with `HOMELINK_*`
//! environment variables, password resolution (env + keyring +
//! plaintext), and translation to `homelink_core::RealtimeConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use homelink_api::TlsMode;
use homelink_core::{MqttSettings, RealtimeConfig};

const KEYRING_SERVICE: &str = "homelink";
pub const PASSWORD_ENV: &str = "HOMELINK_PASSWORD";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server base URL for REST calls and the event stream.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Seconds between fetches in `homelink poll`.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,

    #[serde(default = "default_username")]
    pub username: String,

    /// Plaintext password. Prefer the keyring or `HOMELINK_PASSWORD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Accept any HTTPS certificate from the server.
    #[serde(default)]
    pub insecure: bool,

    /// Extra CA certificate for the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub mqtt: MqttSection,

    #[serde(default)]
    pub cache: CacheSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            refresh_interval: default_refresh_interval(),
            username: default_username(),
            password: None,
            insecure: false,
            ca_cert: None,
            timeout: default_timeout(),
            mqtt: MqttSection::default(),
            cache: CacheSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttSection {
    #[serde(default = "default_broker")]
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub use_tls: bool,

    #[serde(default = "default_true")]
    pub use_client_certs: bool,

    /// Directory with `client.pfx` or `client-cert.pem` + `client-key.pem`.
    /// Defaults to `certs/` under the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_dir: Option<PathBuf>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_mqtt_port(),
            use_tls: true,
            use_client_certs: true,
            asset_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSection {
    /// SQLite file. Defaults to `homelink.db` in the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            path: None,
            history_cap: default_history_cap(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000/".into()
}
fn default_refresh_interval() -> u64 {
    5
}
fn default_username() -> String {
    "guest".into()
}
fn default_timeout() -> u64 {
    30
}
fn default_broker() -> String {
    "127.0.0.1".into()
}
fn default_mqtt_port() -> u16 {
    8883
}
fn default_true() -> bool {
    true
}
fn default_history_cap() -> usize {
    homelink_core::store::DEFAULT_HISTORY_CAP
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "homelink", "homelink")
}

fn home_fallback(parts: &[&str]) -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.extend(parts);
    p
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(&[".config", "homelink", "config.toml"]),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default location of the SQLite cache.
pub fn default_store_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(&[".local", "share", "homelink", "homelink.db"]),
        |dirs| dirs.data_dir().join("homelink.db"),
    )
}

fn default_asset_dir() -> PathBuf {
    config_path()
        .parent()
        .map_or_else(|| PathBuf::from("certs"), |dir| dir.join("certs"))
}

// ── Loading and saving ──────────────────────────────────────────────

/// Load the config from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the config from `path` + environment. A missing file yields the
/// defaults.
///
/// Environment keys use `__` for nesting, e.g. `HOMELINK_MQTT__BROKER`.
/// `HOMELINK_PASSWORD` is left to [`resolve_password`].
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HOMELINK_").ignore(&["password"]).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Serialize the config to TOML at the canonical path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Where a resolved password came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordSource {
    Env,
    Keyring,
    Config,
    /// Nothing configured; an empty password is used.
    Empty,
}

/// Resolve the password: `HOMELINK_PASSWORD`, then the system keyring,
/// then the plaintext value in the config file.
pub fn resolve_password(cfg: &Config) -> (SecretString, PasswordSource) {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        return (SecretString::from(pw), PasswordSource::Env);
    }

    match keyring::Entry::new(KEYRING_SERVICE, &cfg.username).and_then(|e| e.get_password()) {
        Ok(pw) => return (SecretString::from(pw), PasswordSource::Keyring),
        Err(keyring::Error::NoEntry) => {}
        Err(e) => tracing::debug!(error = %e, "keyring unavailable"),
    }

    match cfg.password {
        Some(ref pw) => (SecretString::from(pw.clone()), PasswordSource::Config),
        None => (SecretString::from(String::new()), PasswordSource::Empty),
    }
}

/// Store `password` for `username` in the system keyring.
pub fn store_password(username: &str, password: &str) -> Result<(), ConfigError> {
    keyring::Entry::new(KEYRING_SERVICE, username)?.set_password(password)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// Build the runtime snapshot for homelink-core.
pub fn to_realtime_config(cfg: &Config) -> Result<RealtimeConfig, ConfigError> {
    let base_url = parse_base_url(&cfg.base_url)?;
    let (password, source) = resolve_password(cfg);
    tracing::debug!(?source, "password resolved");

    let mut rt = RealtimeConfig::new(base_url, cfg.username.clone(), password);

    rt.mqtt = MqttSettings {
        broker: cfg.mqtt.broker.clone(),
        port: cfg.mqtt.port,
        use_tls: cfg.mqtt.use_tls,
        use_client_certs: cfg.mqtt.use_client_certs,
        asset_dir: Some(cfg.mqtt.asset_dir.clone().unwrap_or_else(default_asset_dir)),
    };

    rt.http_tls = if cfg.insecure {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca) = cfg.ca_cert {
        TlsMode::CustomCa(ca.clone())
    } else {
        TlsMode::System
    };

    if cfg.timeout == 0 {
        return Err(ConfigError::Validation {
            field: "timeout".into(),
            reason: "must be at least 1 second".into(),
        });
    }
    rt.timings.request_timeout = Duration::from_secs(cfg.timeout);

    rt.history_cap = cfg.cache.history_cap;
    rt.store_path = Some(cfg.cache.path.clone().unwrap_or_else(default_store_path));

    Ok(rt)
}

/// Parse a base URL, adding the trailing slash relative joins need.
pub fn parse_base_url(raw: &str) -> Result<url::Url, ConfigError> {
    let invalid = |reason: String| ConfigError::Validation {
        field: "base_url".into(),
        reason,
    };

    let mut url = url::Url::parse(raw.trim()).map_err(|e| invalid(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("nope.toml")).unwrap();

        assert_eq!(cfg.base_url, "http://127.0.0.1:8000/");
        assert_eq!(cfg.username, "guest");
        assert_eq!(cfg.refresh_interval, 5);
        assert_eq!(cfg.mqtt.port, 8883);
        assert!(cfg.mqtt.use_tls);
        assert!(cfg.mqtt.use_client_certs);
        assert_eq!(cfg.cache.history_cap, 50);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
base_url = "https://home.example:8443/hub"
username = "admin"
insecure = true

[mqtt]
broker = "broker.example"
use_client_certs = false

[cache]
history_cap = 20
"#,
        )
        .unwrap();

        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.username, "admin");
        assert_eq!(cfg.mqtt.broker, "broker.example");
        assert_eq!(cfg.mqtt.port, 8883);
        assert!(!cfg.mqtt.use_client_certs);

        let rt = to_realtime_config(&cfg).unwrap();
        assert_eq!(rt.base_url.as_str(), "https://home.example:8443/hub/");
        assert!(matches!(rt.http_tls, TlsMode::DangerAcceptInvalid));
        assert_eq!(rt.history_cap, 20);
        assert!(rt.store_path.is_some());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut cfg = Config::default();
        cfg.mqtt.broker = "10.0.0.2".into();
        cfg.refresh_interval = 15;
        save_config_to(&cfg, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.mqtt.broker, "10.0.0.2");
        assert_eq!(loaded.refresh_interval, 15);
        assert!(loaded.password.is_none());
    }

    #[test]
    fn base_url_validation() {
        assert_eq!(
            parse_base_url("http://10.0.0.5:8000").unwrap().as_str(),
            "http://10.0.0.5:8000/"
        );
        assert!(parse_base_url("ftp://10.0.0.5").is_err());
        assert!(parse_base_url("not a url").is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let cfg = Config {
            timeout: 0,
            ..Config::default()
        };
        assert!(matches!(
            to_realtime_config(&cfg),
            Err(ConfigError::Validation { .. })
        ));
    }
}
