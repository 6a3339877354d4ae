//! MQTT transport with background reconnect.
//!
//! One driver task owns the broker session. Each connection attempt
//! builds a fresh [`rumqttc::AsyncClient`] with a newly generated client
//! id, waits (bounded) for the CONNACK, subscribes to the two telemetry
//! topic patterns and then routes incoming publishes until the session
//! drops. Between attempts the driver sleeps for the reconnect interval;
//! it never gives up on its own.
//!
//! Metrics are subscribed at QoS 0 because every sample is superseded by
//! the next one. Device state is subscribed at QoS 1 because a missed
//! toggle is not repeated until the device changes again.

pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    NetworkOptions, Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assets::AssetSource;
use crate::credentials::Credentials;
use crate::error::Error;
use crate::event::{
    EventEmitter, FirstAttemptSignal, StartWait, TransportEvent, TransportKind, TransportState,
    TransportStatus, await_first_attempt, state_channel,
};
use crate::model::{DeviceState, MetricsSample};

pub const METRICS_TOPIC: &str = "home/+/metrics";
pub const STATE_TOPIC: &str = "home/+/state";

const REQUEST_CHANNEL_CAPACITY: usize = 16;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

// ── MqttConfig ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub use_tls: bool,
    /// Present a client certificate from the asset source.
    pub use_client_certs: bool,
    /// Prefix of the per-attempt client id.
    pub client_id_prefix: String,
    /// Bound on one connection attempt (TCP + TLS + CONNACK). Default: 15s.
    pub connect_timeout: Duration,
    /// Sleep between reconnect attempts. Default: 5s.
    pub reconnect_interval: Duration,
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1".into(),
            port: 8883,
            use_tls: true,
            use_client_certs: true,
            client_id_prefix: "homelink".into(),
            connect_timeout: Duration::from_secs(15),
            reconnect_interval: Duration::from_secs(5),
            keep_alive: Duration::from_secs(30),
        }
    }
}

// ── Message routing ──────────────────────────────────────────────────

/// Decode a publish by topic suffix and emit it. Undecodable payloads
/// are logged and dropped.
pub(crate) fn route_publish(topic: &str, payload: &[u8], emitter: &EventEmitter) {
    if topic.ends_with("/metrics") {
        match serde_json::from_slice::<MetricsSample>(payload) {
            Ok(sample) => emitter.metrics(sample),
            Err(e) => tracing::warn!(topic, error = %e, "dropping undecodable metrics"),
        }
    } else if topic.ends_with("/state") {
        match serde_json::from_slice::<DeviceState>(payload) {
            Ok(device) => emitter.device(device),
            Err(e) => tracing::warn!(topic, error = %e, "dropping undecodable device state"),
        }
    } else {
        tracing::trace!(topic, "ignoring publish");
    }
}

// ── MqttTransport ────────────────────────────────────────────────────

struct Shared {
    config: MqttConfig,
    credentials: watch::Receiver<Credentials>,
    assets: Option<Arc<dyn AssetSource>>,
    emitter: EventEmitter,
    state: watch::Sender<TransportState>,
}

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Pub/sub transport handle.
pub struct MqttTransport {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<Driver>>,
}

impl MqttTransport {
    pub fn new(
        config: MqttConfig,
        credentials: watch::Receiver<Credentials>,
        assets: Option<Arc<dyn AssetSource>>,
        history: Option<mpsc::Sender<MetricsSample>>,
    ) -> Self {
        let (state, _) = state_channel();
        Self {
            shared: Arc::new(Shared {
                config,
                credentials,
                assets,
                emitter: EventEmitter::new(TransportKind::Mqtt, history),
                state,
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Spawn the driver (no-op if it is already running) and wait for the
    /// first connection attempt to settle.
    ///
    /// A failed first attempt is returned as an error while the driver
    /// keeps retrying in the background until [`stop`](Self::stop). A
    /// session that came up counts as success even if it dropped before
    /// this returns.
    pub async fn start(&self) -> Result<(), Error> {
        let wait = {
            let mut lifecycle = self.lifecycle.lock().await;
            let running = lifecycle.as_ref().is_some_and(|d| !d.task.is_finished());
            if running {
                tracing::debug!("MQTT driver already running");
                StartWait::Running(self.state())
            } else {
                let transport = self.build_transport()?;
                tracing::info!(
                    broker = %self.shared.config.broker,
                    port = self.shared.config.port,
                    tls = self.shared.config.use_tls,
                    "starting MQTT transport"
                );
                self.shared.state.send_replace(TransportState::Connecting);
                let (first, rx) = FirstAttemptSignal::channel();
                let cancel = CancellationToken::new();
                let task = tokio::spawn(drive(
                    Arc::clone(&self.shared),
                    transport,
                    cancel.clone(),
                    first,
                ));
                *lifecycle = Some(Driver { cancel, task });
                StartWait::Spawned(rx)
            }
        };

        // The first attempt is bounded by `connect_timeout`; allow for the
        // subscribe round trip on top.
        let timeout = self.shared.config.connect_timeout + Duration::from_secs(1);
        await_first_attempt(wait, timeout, Error::Mqtt).await
    }

    /// Cancel the driver, disconnect from the broker and wait for the
    /// task to finish. Idempotent.
    pub async fn stop(&self) {
        let driver = self.lifecycle.lock().await.take();
        let Some(driver) = driver else {
            return;
        };

        tracing::info!("stopping MQTT transport");
        driver.cancel.cancel();
        if let Err(e) = driver.task.await {
            tracing::warn!(error = %e, "MQTT driver ended abnormally");
        }
        self.shared.state.send_replace(TransportState::Stopped);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().is_connected()
    }

    pub fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.emitter.subscribe()
    }

    fn build_transport(&self) -> Result<Transport, Error> {
        let config = &self.shared.config;
        if !config.use_tls {
            return Ok(Transport::Tcp);
        }

        let assets = if config.use_client_certs {
            self.shared.assets.as_deref()
        } else {
            None
        };
        let tls = tls::client_config(assets)?;
        Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(tls),
        )))
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Some(driver) = lifecycle.as_ref() {
                driver.cancel.cancel();
            }
        }
    }
}

// ── Driver loop ──────────────────────────────────────────────────────

enum SessionEnd {
    Cancelled,
    /// Broker closed the session.
    Closed,
}

/// Main loop: connect → route publishes → on drop, wait → reconnect.
async fn drive(
    shared: Arc<Shared>,
    transport: Transport,
    cancel: CancellationToken,
    mut first: FirstAttemptSignal,
) {
    let mut attempt: u32 = 0;

    loop {
        let result = run_session(&shared, &transport, &cancel, &mut first).await;
        let had_session = shared.state.borrow().is_connected();

        let status = match result {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Closed) => {
                tracing::info!("MQTT session closed by broker");
                attempt = 0;
                Some(TransportStatus::Disconnected)
            }
            Err(e) if had_session => {
                tracing::warn!(error = %e, "MQTT connection lost");
                attempt = 0;
                Some(TransportStatus::Disconnected)
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "MQTT connect failed");
                (attempt == 0).then(|| connect_failure_status(&e))
            }
        };
        if let Some(status) = status {
            shared.emitter.status(status.clone());
            first.report(Err(status));
        }

        attempt = attempt.saturating_add(1);
        shared
            .state
            .send_replace(TransportState::Reconnecting { attempt });

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(shared.config.reconnect_interval) => {}
        }
        tracing::debug!(attempt, "attempting MQTT reconnect");
    }

    shared.state.send_replace(TransportState::Stopped);
    tracing::debug!("MQTT driver exiting");
}

fn connect_failure_status(error: &Error) -> TransportStatus {
    match error {
        Error::Unauthorized => TransportStatus::Unauthorized,
        Error::Forbidden => TransportStatus::Forbidden,
        other => TransportStatus::Failed(other.to_string()),
    }
}

fn refusal_to_error(code: ConnectReturnCode) -> Error {
    match code {
        ConnectReturnCode::BadUserNamePassword => Error::Unauthorized,
        ConnectReturnCode::NotAuthorized => Error::Forbidden,
        other => Error::Mqtt(format!("connection refused: {other:?}")),
    }
}

fn map_connection_error(err: ConnectionError) -> Error {
    match err {
        ConnectionError::ConnectionRefused(code) => refusal_to_error(code),
        other => other.into(),
    }
}

/// One broker session: connect, subscribe, route until it ends.
async fn run_session(
    shared: &Shared,
    transport: &Transport,
    cancel: &CancellationToken,
    first: &mut FirstAttemptSignal,
) -> Result<SessionEnd, Error> {
    let config = &shared.config;
    let creds = shared.credentials.borrow().clone();
    let client_id = format!("{}_{}", config.client_id_prefix, uuid::Uuid::new_v4().simple());

    let mut options = MqttOptions::new(client_id.clone(), config.broker.clone(), config.port);
    options
        .set_credentials(creds.username.clone(), creds.password().to_owned())
        .set_clean_session(true)
        .set_keep_alive(config.keep_alive)
        .set_transport(transport.clone());

    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
    let mut network = NetworkOptions::new();
    network.set_connection_timeout(config.connect_timeout.as_secs().max(1));
    eventloop.set_network_options(network);

    tracing::debug!(client_id, "connecting to MQTT broker");

    // ── Connect phase ──
    let connect = tokio::time::timeout(config.connect_timeout, wait_connack(&mut eventloop));
    tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        result = connect => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Timeout {
                    timeout_secs: config.connect_timeout.as_secs(),
                });
            }
        },
    }

    client.subscribe(METRICS_TOPIC, QoS::AtMostOnce).await?;
    client.subscribe(STATE_TOPIC, QoS::AtLeastOnce).await?;

    tracing::info!(client_id, "MQTT connected");
    shared.state.send_replace(TransportState::Connected);
    shared.emitter.status(TransportStatus::Connected);
    first.report(Ok(()));

    // ── Session phase ──
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                disconnect(&client, &mut eventloop).await;
                return Ok(SessionEnd::Cancelled);
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT publish");
                route_publish(&publish.topic, &publish.payload, &shared.emitter);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                tracing::debug!(pkid = ack.pkid, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => return Ok(SessionEnd::Closed),
            Ok(_) => {}
            Err(e) => return Err(map_connection_error(e)),
        }
    }
}

async fn wait_connack(eventloop: &mut EventLoop) -> Result<(), Error> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(refusal_to_error(code)),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(map_connection_error(e)),
        }
    }
}

/// Send DISCONNECT and give the event loop a moment to flush it.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        tracing::debug!(error = %e, "MQTT disconnect request failed");
        return;
    }

    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
        tracing::debug!("MQTT disconnect not flushed in time");
    }
}

// ── Tests ────────────────────────────────────────────────────────────
