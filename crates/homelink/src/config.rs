//! CLI configuration: thin wrapper around `homelink_config`.
//!
//! Applies `GlobalOpts` overrides (--server, --username, --insecure,
//! --timeout) on top of the file + environment config and opens the
//! shared handles every server-bound command needs.

use std::sync::Arc;

use homelink_api::ApiClient;
use homelink_core::{CredentialsHandle, RealtimeConfig, Store};

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub use homelink_config::{
    Config, config_path, load_config, resolve_password, save_config, store_password,
};

/// Merge command-line overrides into a loaded config.
pub fn apply_overrides(cfg: &mut Config, global: &GlobalOpts) {
    if let Some(ref server) = global.server {
        cfg.base_url.clone_from(server);
    }
    if let Some(ref username) = global.username {
        cfg.username.clone_from(username);
    }
    if global.insecure {
        cfg.insecure = true;
    }
    if let Some(timeout) = global.timeout {
        cfg.timeout = timeout;
    }
}

/// Everything a server-bound command works with.
pub struct Session {
    pub config: Config,
    pub realtime: RealtimeConfig,
    pub credentials: CredentialsHandle,
    pub store: Arc<Store>,
}

impl Session {
    pub fn open(global: &GlobalOpts) -> Result<Self, CliError> {
        let mut config = load_config()?;
        apply_overrides(&mut config, global);
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self, CliError> {
        let realtime = homelink_config::to_realtime_config(&config)?;
        let credentials = CredentialsHandle::new(realtime.credentials());

        let store = match realtime.store_path {
            Some(ref path) => Store::open(path),
            None => Store::in_memory(),
        }
        .with_history_cap(realtime.history_cap);

        Ok(Self {
            config,
            realtime,
            credentials,
            store: Arc::new(store),
        })
    }

    /// One-shot REST client sharing the session credentials.
    pub fn client(&self) -> Result<ApiClient, CliError> {
        Ok(ApiClient::new(
            self.realtime.base_url.clone(),
            self.credentials.watch(),
            &self.realtime.transport_config(),
        )?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cli::{ColorMode, OutputFormat};
    use pretty_assertions::assert_eq;

    fn global() -> GlobalOpts {
        GlobalOpts {
            server: None,
            username: None,
            output: OutputFormat::Table,
            color: ColorMode::Never,
            verbose: 0,
            quiet: false,
            insecure: false,
            timeout: None,
        }
    }

    #[test]
    fn flags_override_file_values() {
        let mut cfg = Config::default();
        let opts = GlobalOpts {
            server: Some("http://10.0.0.9:8000".into()),
            username: Some("admin".into()),
            insecure: true,
            timeout: Some(5),
            ..global()
        };

        apply_overrides(&mut cfg, &opts);

        assert_eq!(cfg.base_url, "http://10.0.0.9:8000");
        assert_eq!(cfg.username, "admin");
        assert!(cfg.insecure);
        assert_eq!(cfg.timeout, 5);
    }

    #[test]
    fn absent_flags_keep_config() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, &global());
        assert_eq!(cfg.base_url, Config::default().base_url);
        assert!(!cfg.insecure);
    }

    #[test]
    fn session_uses_configured_cache_location() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.cache.path = Some(dir.path().join("cache.db"));
        cfg.cache.history_cap = 7;

        let session = Session::from_config(cfg).unwrap();
        assert_eq!(session.store.history_cap(), 7);
        assert_eq!(session.store.path(), Some(dir.path().join("cache.db").as_path()));
        assert_eq!(session.client().unwrap().base_url().as_str(), "http://127.0.0.1:8000/");
    }
}
