//! Server-sent event stream with auto-reconnect.
//!
//! Holds one long-lived `GET api/events/stream` request whose body is an
//! open-ended sequence of `data:` frames. Each frame is a JSON
//! [`StreamEnvelope`]; its topic decides which domain event is emitted.
//!
//! The driver task is the only writer of the transport's
//! [`TransportState`]. Failures never surface as errors after start;
//! they are reported as [`TransportStatus`] events followed by a backoff:
//!
//! | Outcome                | Status         | Backoff       |
//! |------------------------|----------------|---------------|
//! | HTTP 401               | `Unauthorized` | auth (10s)    |
//! | HTTP 403               | `Forbidden`    | auth (10s)    |
//! | other non-success      | `Failed`       | generic (5s)  |
//! | I/O error, stream end  | `Disconnected` | generic (5s)  |
//!
//! The body is split into lines at the byte level. A line that is not
//! valid UTF-8 poisons only the frame it belongs to.

use std::io;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::endpoint_url;
use crate::credentials::Credentials;
use crate::error::Error;
use crate::event::{
    EventEmitter, FirstAttemptSignal, StartWait, TransportEvent, TransportKind, TransportState,
    TransportStatus, await_first_attempt, state_channel,
};
use crate::model::{DeviceState, InitialState, MetricsSample, StreamEnvelope};
use crate::transport::TransportConfig;

pub const STREAM_PATH: &str = "api/events/stream";

// ── SseConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Full URL of the event stream endpoint.
    pub url: Url,
    /// Wait after a failed or dropped connection. Default: 5s.
    pub retry_delay: Duration,
    /// Wait after a 401/403. Default: 10s.
    pub auth_retry_delay: Duration,
    /// How long `start` waits for the first attempt to settle. Default: 15s.
    pub connect_timeout: Duration,
}

impl SseConfig {
    pub fn new(base_url: &Url) -> Result<Self, Error> {
        Ok(Self {
            url: endpoint_url(base_url, STREAM_PATH)?,
            retry_delay: Duration::from_secs(5),
            auth_retry_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
        })
    }
}

// ── Frame decoding ───────────────────────────────────────────────────

const DATA_FIELD: &str = "data:";

/// Reassembles `data:` lines into frames.
///
/// Field values are concatenated as-is (no separator), so a JSON document
/// split over several lines parses exactly like the single-line form. A
/// blank or whitespace-only line terminates the frame. Lines that are not
/// `data:` fields (`event:`, `id:`, comments) are ignored.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: String,
    /// The current frame contained a line that was not UTF-8.
    corrupt: bool,
}

impl SseFrameDecoder {
    /// Feed one physical line (without its line terminator). Returns the
    /// completed frame when `line` ends one.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        if line.trim().is_empty() {
            let frame = mem::take(&mut self.buffer);
            if mem::take(&mut self.corrupt) {
                tracing::warn!("dropping stream frame with invalid UTF-8");
                return None;
            }
            if frame.is_empty() {
                return None;
            }
            return Some(frame);
        }

        if let Some(value) = line.strip_prefix(DATA_FIELD) {
            self.buffer
                .push_str(value.strip_prefix(' ').unwrap_or(value));
        }
        None
    }

    /// Feed one raw line, with or without its `\n` / `\r\n` terminator.
    pub fn push_bytes(&mut self, raw: &[u8]) -> Option<String> {
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        match std::str::from_utf8(line) {
            Ok(line) => self.push_line(line),
            Err(e) => {
                tracing::debug!(error = %e, "invalid UTF-8 in stream line");
                self.corrupt = true;
                None
            }
        }
    }
}

// ── Envelope dispatch ────────────────────────────────────────────────

/// Decode one frame and emit whatever domain events it carries.
/// Malformed frames are logged and dropped.
pub(crate) fn dispatch_frame(frame: &str, emitter: &EventEmitter) {
    let envelope: StreamEnvelope = match serde_json::from_str(frame) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed stream frame");
            return;
        }
    };

    let Some(topic) = envelope.topic.as_deref() else {
        tracing::debug!("stream frame without topic");
        return;
    };
    let Some(payload) = envelope.payload else {
        tracing::trace!(topic, "stream frame without payload");
        return;
    };

    match topic {
        "system/connection" | "system/keepalive" => {
            tracing::trace!(topic, "liveness frame");
        }
        "system/initial-state" => {
            if let Some(state) = decode_payload::<InitialState>(topic, payload) {
                let devices = state.into_devices();
                tracing::debug!(count = devices.len(), "initial device state");
                for device in devices {
                    emitter.device(device);
                }
            }
        }
        t if t.contains("/metrics") => {
            if let Some(sample) = decode_payload::<MetricsSample>(topic, payload) {
                emitter.metrics(sample);
            }
        }
        t if t.contains("/state") => {
            if let Some(device) = decode_payload::<DeviceState>(topic, payload) {
                emitter.device(device);
            }
        }
        _ => tracing::trace!(topic, "ignoring stream topic"),
    }
}

fn decode_payload<T: DeserializeOwned>(topic: &str, payload: serde_json::Value) -> Option<T> {
    serde_json::from_value(payload)
        .map_err(|e| tracing::warn!(topic, error = %e, "dropping undecodable payload"))
        .ok()
}

// ── SseTransport ─────────────────────────────────────────────────────

/// State shared between the handle and its driver task.
struct Shared {
    http: reqwest::Client,
    config: SseConfig,
    credentials: watch::Receiver<Credentials>,
    emitter: EventEmitter,
    state: watch::Sender<TransportState>,
}

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Streaming transport handle.
pub struct SseTransport {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<Driver>>,
}

impl SseTransport {
    pub fn new(
        config: SseConfig,
        credentials: watch::Receiver<Credentials>,
        transport: &TransportConfig,
        history: Option<mpsc::Sender<MetricsSample>>,
    ) -> Result<Self, Error> {
        let http = transport.streaming().build_client()?;
        Ok(Self::with_client(http, config, credentials, history))
    }

    /// Create a transport around a pre-built `reqwest::Client`. The client
    /// must not carry an overall request timeout.
    pub fn with_client(
        http: reqwest::Client,
        config: SseConfig,
        credentials: watch::Receiver<Credentials>,
        history: Option<mpsc::Sender<MetricsSample>>,
    ) -> Self {
        let (state, _) = state_channel();
        Self {
            shared: Arc::new(Shared {
                http,
                config,
                credentials,
                emitter: EventEmitter::new(TransportKind::Sse, history),
                state,
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Spawn the read loop (unless it is already running) and wait until
    /// the first connection attempt settles.
    ///
    /// Returns `Ok` once the stream is open, even if it has dropped again
    /// by the time the caller resumes. If the first attempt fails the
    /// error is returned, but the loop keeps retrying in the background
    /// until [`stop`](Self::stop). When the loop is already running the
    /// current state answers without waiting.
    pub async fn start(&self) -> Result<(), Error> {
        let wait = {
            let mut lifecycle = self.lifecycle.lock().await;
            let running = lifecycle.as_ref().is_some_and(|d| !d.task.is_finished());
            if running {
                tracing::debug!("event stream already running");
                StartWait::Running(self.state())
            } else {
                self.shared.state.send_replace(TransportState::Connecting);
                let (first, rx) = FirstAttemptSignal::channel();
                let cancel = CancellationToken::new();
                let task = tokio::spawn(read_loop(Arc::clone(&self.shared), cancel.clone(), first));
                *lifecycle = Some(Driver { cancel, task });
                StartWait::Spawned(rx)
            }
        };

        await_first_attempt(wait, self.shared.config.connect_timeout, Error::StreamUnavailable).await
    }

    /// Cancel the read loop and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let driver = self.lifecycle.lock().await.take();
        let Some(driver) = driver else {
            return;
        };

        tracing::info!("stopping event stream");
        driver.cancel.cancel();
        if let Err(e) = driver.task.await {
            tracing::warn!(error = %e, "event stream task ended abnormally");
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
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Some(driver) = lifecycle.as_ref() {
                driver.cancel.cancel();
            }
        }
    }
}

// ── Background read loop ─────────────────────────────────────────────

/// Main loop: connect → read frames → on failure, report and back off.
async fn read_loop(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    mut first: FirstAttemptSignal,
) {
    let mut failures: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_and_read(&shared, &mut failures, &mut first) => result,
        };

        let (status, delay) = match result {
            Ok(()) => {
                tracing::info!("event stream ended, reconnecting");
                (TransportStatus::Disconnected, shared.config.retry_delay)
            }
            Err(Error::Unauthorized) => {
                tracing::warn!("event stream rejected credentials (401)");
                (TransportStatus::Unauthorized, shared.config.auth_retry_delay)
            }
            Err(Error::Forbidden) => {
                tracing::warn!("event stream access denied (403)");
                (TransportStatus::Forbidden, shared.config.auth_retry_delay)
            }
            Err(Error::Http { status, .. }) => {
                tracing::warn!(status, "event stream request failed");
                (
                    TransportStatus::Failed(format!("HTTP {status}")),
                    shared.config.retry_delay,
                )
            }
            Err(e) => {
                tracing::warn!(error = %e, "event stream error");
                (TransportStatus::Disconnected, shared.config.retry_delay)
            }
        };

        // Status first: anyone woken by the state change can already see it.
        failures = failures.saturating_add(1);
        shared.emitter.status(status.clone());
        first.report(Err(status));
        shared
            .state
            .send_replace(TransportState::Reconnecting { attempt: failures });

        tracing::info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = failures,
            "waiting before reconnect"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    shared.state.send_replace(TransportState::Stopped);
    tracing::debug!("event stream loop exiting");
}

/// Open the stream once and read it until it ends or fails.
async fn connect_and_read(
    shared: &Shared,
    failures: &mut u32,
    first: &mut FirstAttemptSignal,
) -> Result<(), Error> {
    let creds = shared.credentials.borrow().clone();
    tracing::info!(url = %shared.config.url, "connecting to event stream");

    let mut request = shared
        .http
        .get(shared.config.url.clone())
        .header(ACCEPT, "text/event-stream");
    if creds.is_present() {
        request = request.basic_auth(&creds.username, Some(creds.password()));
    } else {
        tracing::warn!("no credentials configured for event stream");
    }

    let resp = request.send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::from_status(status, STREAM_PATH));
    }

    tracing::info!("event stream connected");
    *failures = 0;
    shared.state.send_replace(TransportState::Connected);
    shared.emitter.status(TransportStatus::Connected);
    first.report(Ok(()));

    let body = Box::pin(resp.bytes_stream().map_err(io::Error::other));
    let mut reader = StreamReader::new(body);
    let mut decoder = SseFrameDecoder::default();
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| Error::StreamUnavailable(e.to_string()))?;
        if read == 0 {
            return Ok(());
        }
        if let Some(frame) = decoder.push_bytes(&line) {
            dispatch_frame(&frame, &shared.emitter);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(decoder: &mut SseFrameDecoder, lines: &[&str]) -> Vec<String> {
        lines.iter().filter_map(|l| decoder.push_line(l)).collect()
    }

    #[test]
    fn single_line_frame() {
        let mut decoder = SseFrameDecoder::default();
        let frames = feed(&mut decoder, &[r#"data: {"topic":"a"}"#, ""]);
        assert_eq!(frames, vec![r#"{"topic":"a"}"#.to_string()]);
    }

    #[test]
    fn frame_split_over_three_lines_matches_single_line() {
        let single = r#"{"topic":"home/k1/metrics","payload":{"temp":21.5,"humidity":40,"power":90,"ts":"t"}}"#;

        let mut decoder = SseFrameDecoder::default();
        let split = feed(
            &mut decoder,
            &[
                r#"data: {"topic":"home/k1/metrics","#,
                r#"data: "payload":{"temp":21.5,"humidity":40,"#,
                r#"data: "power":90,"ts":"t"}}"#,
                "",
            ],
        );

        assert_eq!(split, vec![single.to_string()]);
        let a: serde_json::Value = serde_json::from_str(single).unwrap();
        let b: serde_json::Value = serde_json::from_str(&split[0]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn whitespace_line_terminates_and_other_fields_are_ignored() {
        let mut decoder = SseFrameDecoder::default();
        let frames = feed(
            &mut decoder,
            &[": comment", "event: message", "id: 7", "data:{}", "   ", "", "data: x", "\t"],
        );
        assert_eq!(frames, vec!["{}".to_string(), "x".to_string()]);
    }

    #[test]
    fn invalid_utf8_drops_only_its_own_frame() {
        let mut decoder = SseFrameDecoder::default();
        let raw: [&[u8]; 6] = [
            b"data: {\"topic\":\"home/lamp/state\",\"payload\":\"\xff\"}\n",
            b"\n",
            b"data: {\"topic\":\"home/fan/state\"}\r\n",
            b"\r\n",
            b"data: tail",
            b"\n",
        ];
        let frames: Vec<String> = raw.iter().filter_map(|l| decoder.push_bytes(l)).collect();

        assert_eq!(
            frames,
            vec![r#"{"topic":"home/fan/state"}"#.to_string(), "tail".to_string()]
        );
    }

    #[test]
    fn blank_lines_without_data_produce_nothing() {
        let mut decoder = SseFrameDecoder::default();
        assert!(feed(&mut decoder, &["", "", "retry: 100", ""]).is_empty());
    }

    fn collect(frame: &str) -> (Vec<TransportEvent>, Vec<MetricsSample>) {
        let (tx, mut history) = mpsc::channel(8);
        let emitter = EventEmitter::new(TransportKind::Sse, Some(tx));
        let mut rx = emitter.subscribe();

        dispatch_frame(frame, &emitter);

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        let mut saved = Vec::new();
        while let Ok(s) = history.try_recv() {
            saved.push(s);
        }
        (events, saved)
    }

    #[test]
    fn initial_state_emits_each_device() {
        let (events, saved) = collect(
            r#"{"topic":"system/initial-state","payload":{"devices":[
                {"id":"lamp","name":"Lamp","isOn":true,"lastSeen":"t"},
                {"id":"fan","name":"Fan","isOn":false,"lastSeen":"t"}],"timestamp":"t"}}"#,
        );

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TransportEvent::DeviceState(d) if d.id == "lamp"));
        assert!(matches!(&events[1], TransportEvent::DeviceState(d) if d.id == "fan"));
        assert!(saved.is_empty());
    }

    #[test]
    fn metrics_topic_emits_and_queues_history() {
        let (events, saved) = collect(
            r#"{"topic":"home/system/metrics","payload":{"temp":19.0,"humidity":55,"power":10,"ts":"t"},"timestamp":"t"}"#,
        );

        assert_eq!(events.len(), 1);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].humidity, 55);
    }

    #[test]
    fn state_topic_emits_device() {
        let (events, _) = collect(
            r#"{"topic":"home/lamp/state","payload":{"id":"lamp","name":"Lamp","isOn":false,"lastSeen":"t"}}"#,
        );
        assert!(matches!(&events[..], [TransportEvent::DeviceState(d)] if !d.is_on));
    }

    #[test]
    fn liveness_unknown_and_malformed_frames_are_ignored() {
        for frame in [
            r#"{"topic":"system/keepalive","payload":{},"timestamp":"t"}"#,
            r#"{"topic":"system/connection","payload":{"status":"ok"}}"#,
            r#"{"topic":"home/lamp/battery","payload":{"level":3}}"#,
            r#"{"topic":"home/lamp/metrics","payload":null}"#,
            r#"{"topic":"home/lamp/metrics","payload":{"temp":"hot"}}"#,
            "not json at all",
        ] {
            let (events, saved) = collect(frame);
            assert!(events.is_empty(), "frame {frame} produced events");
            assert!(saved.is_empty());
        }
    }
}
