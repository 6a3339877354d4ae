//! Events and lifecycle states shared by both realtime transports.
//!
//! Each transport owns one driver task that is the single writer of its
//! [`TransportState`] (published on a `watch` channel) and the single
//! producer of [`TransportEvent`]s (published on a `broadcast` channel).
//! Everything else only ever sees snapshots.

use std::fmt;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::Error;
use crate::model::{DeviceState, MetricsSample};

// ── Broadcast channel capacity ───────────────────────────────────────

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── TransportKind ────────────────────────────────────────────────────

/// Which transport produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum TransportKind {
    #[strum(serialize = "MQTT")]
    Mqtt,
    #[strum(serialize = "SSE")]
    Sse,
}

// ── TransportStatus ──────────────────────────────────────────────────

/// Connection status reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Disconnected,
    Unauthorized,
    Forbidden,
    Failed(String),
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("Connected"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Unauthorized => f.write_str("Unauthorized - Check credentials"),
            Self::Forbidden => f.write_str("Forbidden - Access denied"),
            Self::Failed(reason) if reason.is_empty() => f.write_str("Failed"),
            Self::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

// ── TransportEvent ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Metrics(MetricsSample),
    DeviceState(DeviceState),
    Status(TransportStatus),
}

// ── TransportState ───────────────────────────────────────────────────

/// Lifecycle of a transport's driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Waiting to retry after `attempt` consecutive failures.
    Reconnecting { attempt: u32 },
    Stopped,
}

impl TransportState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

// ── EventEmitter ─────────────────────────────────────────────────────

/// Fan-out used by a transport's driver task.
///
/// Emits go synchronously to the broadcast channel. Metrics are also
/// offered to the history channel with `try_send`: a full or closed
/// channel drops the sample with a warning and never stalls the
/// live path.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    kind: TransportKind,
    events: broadcast::Sender<TransportEvent>,
    history: Option<mpsc::Sender<MetricsSample>>,
}

impl EventEmitter {
    pub fn new(kind: TransportKind, history: Option<mpsc::Sender<MetricsSample>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kind,
            events,
            history,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self, sample: MetricsSample) {
        if let Some(ref history) = self.history {
            match history.try_send(sample.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(transport = %self.kind, "history queue full, sample not persisted");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(transport = %self.kind, "history queue closed");
                }
            }
        }
        self.send(TransportEvent::Metrics(sample));
    }

    pub fn device(&self, device: DeviceState) {
        self.send(TransportEvent::DeviceState(device));
    }

    pub fn status(&self, status: TransportStatus) {
        tracing::debug!(transport = %self.kind, %status, "transport status");
        self.send(TransportEvent::Status(status));
    }

    fn send(&self, event: TransportEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

pub(crate) fn state_channel() -> (watch::Sender<TransportState>, watch::Receiver<TransportState>) {
    watch::channel(TransportState::Idle)
}

// ── First attempt ────────────────────────────────────────────────────

/// Outcome of a driver's first connection attempt: `Ok` once connected,
/// otherwise the status the driver reported.
pub(crate) type FirstAttempt = Result<(), TransportStatus>;

/// Driver side of the first-attempt report. Only the first report is
/// delivered; dropping it unreported tells the waiter the driver exited.
#[derive(Debug)]
pub(crate) struct FirstAttemptSignal(Option<oneshot::Sender<FirstAttempt>>);

impl FirstAttemptSignal {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<FirstAttempt>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    pub(crate) fn report(&mut self, outcome: FirstAttempt) {
        if let Some(tx) = self.0.take() {
            // Start may have timed out already
            let _ = tx.send(outcome);
        }
    }
}

/// What a `start` call waits on.
pub(crate) enum StartWait {
    /// This call spawned the driver.
    Spawned(oneshot::Receiver<FirstAttempt>),
    /// A driver was already running; its current state is the answer.
    Running(TransportState),
}

/// Resolve a `start` call. `unavailable` builds the transport's own error
/// for non-auth failures.
pub(crate) async fn await_first_attempt(
    wait: StartWait,
    timeout: Duration,
    unavailable: impl FnOnce(String) -> Error,
) -> Result<(), Error> {
    let rx = match wait {
        StartWait::Spawned(rx) => rx,
        StartWait::Running(state) if state.is_connected() => return Ok(()),
        StartWait::Running(state) => return Err(unavailable(format!("not connected ({state:?})"))),
    };

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(TransportStatus::Unauthorized))) => Err(Error::Unauthorized),
        Ok(Ok(Err(TransportStatus::Forbidden))) => Err(Error::Forbidden),
        Ok(Ok(Err(status))) => Err(unavailable(status.to_string())),
        Ok(Err(_)) => Err(unavailable("driver exited before connecting".into())),
        Err(_) => Err(Error::Timeout {
            timeout_secs: timeout.as_secs(),
        }),
    }
}
