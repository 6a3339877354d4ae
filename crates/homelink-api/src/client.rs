// One-shot REST client for the telemetry server.
//
// Every request carries HTTP Basic auth built from the live credentials.
// Non-success statuses are mapped through `Error::from_status`; bodies
// that fail to decode keep the raw text for debugging.

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::credentials::Credentials;
use crate::error::Error;
use crate::model::{DeviceState, MetricsSample, ServerStatus};
use crate::transport::TransportConfig;

/// Join `path` onto `base`, treating `base` as a directory even when it
/// was configured without a trailing slash.
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url, Error> {
    if base.path().ends_with('/') {
        Ok(base.join(path)?)
    } else {
        let mut dir = base.clone();
        dir.set_path(&format!("{}/", base.path()));
        Ok(dir.join(path)?)
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: watch::Receiver<Credentials>,
}

impl ApiClient {
    pub fn new(
        base_url: Url,
        credentials: watch::Receiver<Credentials>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url, credentials))
    }

    /// Create a client around a pre-built `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        base_url: Url,
        credentials: watch::Receiver<Credentials>,
    ) -> Self {
        Self {
            http,
            base_url,
            credentials,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// `GET api/metrics`
    pub async fn get_metrics(&self) -> Result<MetricsSample, Error> {
        self.get("api/metrics").await
    }

    /// `GET api/devices`
    pub async fn get_devices(&self) -> Result<Vec<DeviceState>, Error> {
        self.get("api/devices").await
    }

    /// `POST api/devices/{id}/toggle`, returning the device's new state.
    pub async fn toggle_device(&self, id: &str) -> Result<DeviceState, Error> {
        let path = format!("api/devices/{id}/toggle");
        let url = endpoint_url(&self.base_url, &path)?;
        debug!("POST {url}");

        let resp = self
            .authorized(self.http.post(url))
            .send()
            .await
            .map_err(Error::Transport)?;

        Self::parse(resp, &path).await
    }

    /// `GET api/status`: server-side view of broker reachability.
    pub async fn server_status(&self) -> Result<ServerStatus, Error> {
        self.get("api/status").await
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = endpoint_url(&self.base_url, path)?;
        debug!("GET {url}");

        let resp = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(Error::Transport)?;

        Self::parse(resp, path).await
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let creds = self.credentials.borrow();
        request.basic_auth(&creds.username, Some(creds.password()))
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response, endpoint: &str) -> Result<T, Error> {
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::from_status(status, endpoint));
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }
}
