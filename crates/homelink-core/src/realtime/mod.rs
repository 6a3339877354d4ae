// ── Connectivity orchestrator ──
//
// Composes the MQTT and SSE transports behind one start/stop lifecycle.
// Exactly one transport is authoritative at a time (the mode); events
// from the other one are dropped here. History persistence happens in
// the transports themselves, so it is unaffected by this filtering.

mod source;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use homelink_api::event::EVENT_CHANNEL_CAPACITY;
use homelink_api::{
    ApiClient, AssetSource, Credentials, CredentialsHandle, DeviceState, DirAssets, MetricsSample,
    MqttTransport, SseTransport, TransportEvent, TransportKind, TransportStatus,
};

use crate::config::RealtimeConfig;
use crate::error::CoreError;

pub use source::{RealtimeSource, StatusProbe};

// ── ConnectionMode ───────────────────────────────────────────────────

/// The transport currently considered authoritative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Disconnected,
    Mqtt,
    Sse,
}

/// Internal state machine. The connecting phases look like
/// `Disconnected` from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Disconnected,
    ConnectingMqtt,
    ConnectingSse,
    Mqtt,
    Sse,
}

impl Phase {
    fn connecting(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Mqtt => Self::ConnectingMqtt,
            TransportKind::Sse => Self::ConnectingSse,
        }
    }

    fn established(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Mqtt => Self::Mqtt,
            TransportKind::Sse => Self::Sse,
        }
    }

    /// Transport whose events are forwarded in this phase.
    fn active(self) -> Option<TransportKind> {
        match self {
            Self::Mqtt => Some(TransportKind::Mqtt),
            Self::Sse => Some(TransportKind::Sse),
            _ => None,
        }
    }

    fn mode(self) -> ConnectionMode {
        match self {
            Self::Mqtt => ConnectionMode::Mqtt,
            Self::Sse => ConnectionMode::Sse,
            _ => ConnectionMode::Disconnected,
        }
    }
}

// ── ConnectionStatus ─────────────────────────────────────────────────

/// A transport status relabeled with its source, or an orchestrator
/// verdict when `source` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub source: Option<TransportKind>,
    pub status: TransportStatus,
}

impl ConnectionStatus {
    pub fn new(source: TransportKind, status: TransportStatus) -> Self {
        Self {
            source: Some(source),
            status,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            source: None,
            status: TransportStatus::Failed(reason.into()),
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(TransportKind::Mqtt) => write!(f, "MQTT: {}", self.status),
            Some(TransportKind::Sse) => write!(f, "SSE Fallback: {}", self.status),
            None => write!(f, "{}", self.status),
        }
    }
}

/// Everything the orchestrator forwards, on one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Metrics(MetricsSample),
    DeviceState(DeviceState),
    Status(ConnectionStatus),
}

// ── RealtimeOptions ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    /// The broker is only tried with TLS enabled.
    pub mqtt_tls: bool,
    /// How long to wait for the broker before falling back to SSE.
    pub observation_window: Duration,
    /// Live credentials; MQTT is skipped while none are present.
    pub credentials: watch::Receiver<Credentials>,
}

impl RealtimeOptions {
    pub fn new(credentials: watch::Receiver<Credentials>) -> Self {
        Self {
            mqtt_tls: true,
            observation_window: Duration::from_secs(2),
            credentials,
        }
    }
}

// ── Realtime ─────────────────────────────────────────────────────────

/// Connectivity orchestrator: MQTT first, SSE fallback.
///
/// Failures never surface as errors. `start` always returns; the outcome
/// is reported on the status stream and through
/// [`current_mode`](Self::current_mode). A mode of `Disconnected` after
/// `start` is the terminal failure signal.
pub struct Realtime<M = MqttTransport, S = SseTransport, P = ApiClient> {
    shared: Arc<Shared<M, S, P>>,
    /// Start/stop lock. Holds the forwarder tasks while running.
    lifecycle: Mutex<Option<Forwarders>>,
}

struct Shared<M, S, P> {
    mqtt: M,
    sse: S,
    probe: P,
    options: RealtimeOptions,
    phase: watch::Sender<Phase>,
    mode: watch::Sender<ConnectionMode>,
    metrics_tx: broadcast::Sender<MetricsSample>,
    devices_tx: broadcast::Sender<DeviceState>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    events_tx: broadcast::Sender<RealtimeEvent>,
}

struct Forwarders {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Realtime {
    /// Wire up both transports and the status probe from a config snapshot.
    ///
    /// Metrics received by either transport go to `history` regardless of
    /// which one is active.
    pub fn from_config(
        config: &RealtimeConfig,
        credentials: &CredentialsHandle,
        history: Option<mpsc::Sender<MetricsSample>>,
    ) -> Result<Self, CoreError> {
        let transport = config.transport_config();

        let assets = config
            .mqtt
            .asset_dir
            .as_ref()
            .map(|dir| Arc::new(DirAssets::new(dir)) as Arc<dyn AssetSource>);

        let mqtt = MqttTransport::new(
            config.mqtt_config(),
            credentials.watch(),
            assets,
            history.clone(),
        );
        let sse = SseTransport::new(config.sse_config()?, credentials.watch(), &transport, history)?;
        let probe = ApiClient::new(config.base_url.clone(), credentials.watch(), &transport)?;

        let options = RealtimeOptions {
            mqtt_tls: config.mqtt.use_tls,
            observation_window: config.timings.observation_window,
            credentials: credentials.watch(),
        };
        Ok(Self::new(mqtt, sse, probe, options))
    }
}

impl<M, S, P> Realtime<M, S, P>
where
    M: RealtimeSource,
    S: RealtimeSource,
    P: StatusProbe,
{
    pub fn new(mqtt: M, sse: S, probe: P, options: RealtimeOptions) -> Self {
        let (phase, _) = watch::channel(Phase::Disconnected);
        let (mode, _) = watch::channel(ConnectionMode::Disconnected);
        let (metrics_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (devices_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                mqtt,
                sse,
                probe,
                options,
                phase,
                mode,
                metrics_tx,
                devices_tx,
                status_tx,
                events_tx,
            }),
            lifecycle: Mutex::new(None),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect over MQTT if possible, otherwise over SSE.
    ///
    /// A no-op while a mode is established. After a failed start or a lost
    /// MQTT session, calling it again tears down whatever is still retrying
    /// in the background and starts over. If the future is dropped midway,
    /// [`stop`](Self::stop) still tears down what it began.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.current_mode() != ConnectionMode::Disconnected {
            debug!(mode = %self.current_mode(), "realtime already started");
            return;
        }
        if lifecycle.is_some() {
            self.shutdown(&mut lifecycle).await;
        }
        *lifecycle = Some(self.spawn_forwarders());

        let shared = &self.shared;
        let window = shared.options.observation_window;

        if shared.mqtt_usable() {
            info!("connecting over MQTT");
            shared.set_phase(Phase::ConnectingMqtt);

            if let Err(e) = shared.mqtt.start().await {
                warn!(error = %e, "MQTT connect failed");
            }
            if shared.wait_established(TransportKind::Mqtt, window).await {
                return;
            }
            info!("MQTT unavailable, falling back to SSE");
        } else {
            info!("MQTT not usable (TLS disabled or no credentials), using SSE");
        }

        shared.set_phase(Phase::ConnectingSse);

        let probe_reachable = match shared.probe.server_status().await {
            Ok(status) => {
                info!(
                    mqtt_available = status.mqtt_available,
                    recommended = status.recommended_mode.as_deref().unwrap_or("-"),
                    "server status"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "server status probe failed, trying SSE anyway");
                false
            }
        };

        let mut sse_events = shared.sse.subscribe();
        if let Err(e) = shared.sse.start().await {
            warn!(error = %e, "SSE connect failed");
        }
        // The forwarder has the final word: a `Connected` already queued
        // behind a failed start still establishes the mode.
        if shared.wait_established(TransportKind::Sse, window).await {
            return;
        }

        let verdict = terminal_status(&mut sse_events, probe_reachable);
        self.shutdown(&mut lifecycle).await;
        error!(status = %verdict, "no realtime transport available");
        shared.emit_status(verdict);
    }

    /// Stop both transports and wait for them. No event is forwarded once
    /// this returns. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_none() {
            debug!("realtime already stopped");
            return;
        }
        info!("stopping realtime");
        self.shutdown(&mut lifecycle).await;
    }

    async fn shutdown(&self, lifecycle: &mut Option<Forwarders>) {
        let shared = &self.shared;
        shared.set_phase(Phase::Disconnected);

        tokio::join!(shared.mqtt.stop(), shared.sse.stop());

        if let Some(forwarders) = lifecycle.take() {
            forwarders.cancel.cancel();
            for task in forwarders.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "event forwarder ended abnormally");
                }
            }
        }
    }

    fn spawn_forwarders(&self) -> Forwarders {
        let cancel = CancellationToken::new();
        let tasks = [
            (self.shared.mqtt.kind(), self.shared.mqtt.subscribe()),
            (self.shared.sse.kind(), self.shared.sse.subscribe()),
        ]
        .into_iter()
        .map(|(kind, rx)| {
            tokio::spawn(forward(
                Arc::clone(&self.shared),
                kind,
                rx,
                cancel.clone(),
            ))
        })
        .collect();

        Forwarders { cancel, tasks }
    }

    // ── Observers ────────────────────────────────────────────────────

    pub fn current_mode(&self) -> ConnectionMode {
        *self.shared.mode.borrow()
    }

    /// Whether the active transport currently has a live connection.
    pub fn is_connected(&self) -> bool {
        match self.shared.phase.borrow().active() {
            Some(TransportKind::Mqtt) => self.shared.mqtt.is_connected(),
            Some(TransportKind::Sse) => self.shared.sse.is_connected(),
            None => false,
        }
    }

    pub fn mode_changes(&self) -> watch::Receiver<ConnectionMode> {
        self.shared.mode.subscribe()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<MetricsSample> {
        self.shared.metrics_tx.subscribe()
    }

    pub fn subscribe_devices(&self) -> broadcast::Receiver<DeviceState> {
        self.shared.devices_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Metrics, device updates and statuses merged in forwarding order.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn mqtt(&self) -> &M {
        &self.shared.mqtt
    }

    pub fn sse(&self) -> &S {
        &self.shared.sse
    }
}

impl<M, S, P> Drop for Realtime<M, S, P> {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Some(forwarders) = lifecycle.as_ref() {
                forwarders.cancel.cancel();
            }
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────────

impl<M, S, P> Shared<M, S, P> {
    fn mqtt_usable(&self) -> bool {
        self.options.mqtt_tls && self.options.credentials.borrow().is_present()
    }

    /// Apply a phase transition and keep the public mode in step. The
    /// mode is written under the phase lock so the two never disagree.
    fn transition(&self, next: impl FnOnce(Phase) -> Option<Phase>) -> bool {
        self.phase.send_if_modified(|phase| {
            let Some(next) = next(*phase) else {
                return false;
            };
            let changed = *phase != next;
            *phase = next;

            let mode = next.mode();
            self.mode.send_if_modified(|current| {
                if *current == mode {
                    false
                } else {
                    *current = mode;
                    true
                }
            });
            changed
        })
    }

    fn set_phase(&self, phase: Phase) {
        if self.transition(|_| Some(phase)) {
            trace!(?phase, "realtime phase");
        }
    }

    /// Establish `kind` if we are still waiting on it. Called by the
    /// forwarder on the transport's in-order `Connected`, so anything the
    /// transport sends right after connecting is already forwarded.
    fn promote(&self, kind: TransportKind) -> bool {
        let promoted = self.transition(|phase| {
            (phase == Phase::connecting(kind)).then(|| Phase::established(kind))
        });
        if promoted {
            info!(transport = %kind, "realtime mode established");
            self.emit_status(ConnectionStatus::new(kind, TransportStatus::Connected));
        }
        promoted
    }

    /// Wait up to `window` for the forwarder to establish `kind`.
    async fn wait_established(&self, kind: TransportKind, window: Duration) -> bool {
        let mut rx = self.phase.subscribe();
        let _ = tokio::time::timeout(
            window,
            rx.wait_for(|phase| *phase != Phase::connecting(kind)),
        )
        .await;
        *self.phase.borrow() == Phase::established(kind)
    }

    fn emit_status(&self, status: ConnectionStatus) {
        debug!(%status, "connection status");
        let _ = self.events_tx.send(RealtimeEvent::Status(status.clone()));
        let _ = self.status_tx.send(status);
    }

    fn handle(&self, kind: TransportKind, event: TransportEvent) {
        if event == TransportEvent::Status(TransportStatus::Connected) && self.promote(kind) {
            return;
        }

        // Held across the sends so a concurrent stop cannot slip in between
        // the check and the emit.
        let phase = self.phase.borrow();
        if phase.active() != Some(kind) {
            trace!(transport = %kind, "dropping event from inactive transport");
            return;
        }

        match event {
            TransportEvent::Metrics(sample) => {
                let _ = self.events_tx.send(RealtimeEvent::Metrics(sample.clone()));
                let _ = self.metrics_tx.send(sample);
            }
            TransportEvent::DeviceState(device) => {
                let _ = self.events_tx.send(RealtimeEvent::DeviceState(device.clone()));
                let _ = self.devices_tx.send(device);
            }
            TransportEvent::Status(status) => {
                let lost_mqtt =
                    kind == TransportKind::Mqtt && status == TransportStatus::Disconnected;
                self.emit_status(ConnectionStatus::new(kind, status));

                // No automatic fallback after a mid-session drop; the
                // caller restarts.
                if lost_mqtt {
                    drop(phase);
                    warn!("MQTT session lost, realtime disconnected");
                    self.set_phase(Phase::Disconnected);
                }
            }
        }
    }
}

async fn forward<M, S, P>(
    shared: Arc<Shared<M, S, P>>,
    kind: TransportKind,
    mut rx: broadcast::Receiver<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };

        match event {
            Ok(event) => shared.handle(kind, event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(transport = %kind, skipped, "event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Final status after both transports failed. Auth rejections from the
/// event stream are reported as such; otherwise the probe result decides.
fn terminal_status(
    events: &mut broadcast::Receiver<TransportEvent>,
    probe_reachable: bool,
) -> ConnectionStatus {
    let mut last = None;
    loop {
        match events.try_recv() {
            Ok(TransportEvent::Status(status)) => last = Some(status),
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }

    match last {
        Some(status @ (TransportStatus::Unauthorized | TransportStatus::Forbidden)) => {
            ConnectionStatus::new(TransportKind::Sse, status)
        }
        _ if !probe_reachable => ConnectionStatus::failed("Server unreachable"),
        _ => ConnectionStatus::failed("All connection methods unavailable"),
    }
}

// ── Tests ────────────────────────────────────────────────────────────
