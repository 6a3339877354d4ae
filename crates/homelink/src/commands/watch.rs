//! `homelink watch`: live events through the connectivity orchestrator.
//!
//! Metrics persistence runs through a `HistoryWriter` fed by both
//! transports; the latest reading and device updates are written through
//! here as they are printed. A lost MQTT session demotes the orchestrator
//! to disconnected, and this loop restarts it (MQTT first, then SSE).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use homelink_core::{
    ConnectionMode, ConnectionStatus, DeviceState, HistoryWriter, MetricsSample, Realtime,
    RealtimeEvent, Store, TransportStatus,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{info, warn};

use crate::cli::{GlobalOpts, OutputFormat, WatchArgs};
use crate::config::Session;
use crate::error::CliError;
use crate::output::{self, Painter};

use super::metrics;
use super::util;

// ── Line rendering ───────────────────────────────────────────────────

/// One NDJSON line per event for `-o json`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventRecord<'a> {
    Metrics(&'a MetricsSample),
    Device(&'a DeviceState),
    Status {
        source: Option<&'static str>,
        message: String,
    },
}

impl<'a> From<&'a RealtimeEvent> for EventRecord<'a> {
    fn from(event: &'a RealtimeEvent) -> Self {
        match event {
            RealtimeEvent::Metrics(s) => Self::Metrics(s),
            RealtimeEvent::DeviceState(d) => Self::Device(d),
            RealtimeEvent::Status(s) => Self::Status {
                source: s.source.map(<&'static str>::from),
                message: s.to_string(),
            },
        }
    }
}

pub(crate) fn metrics_line(s: &MetricsSample, painter: Painter) -> String {
    format!(
        "[{}] {:>5.1} °C  {:>3} %  {:>5} W  {}",
        painter.accent("metrics"),
        s.temperature,
        s.humidity,
        s.power,
        painter.dim(&s.timestamp)
    )
}

fn device_line(d: &DeviceState, painter: Painter) -> String {
    let state = if d.is_on {
        painter.good("On")
    } else {
        painter.dim("Off")
    };
    format!("[{}] {} ({}) -> {state}", painter.accent("device"), d.name, d.id)
}

fn status_line(s: &ConnectionStatus, painter: Painter) -> String {
    let text = s.to_string();
    let text = match s.status {
        TransportStatus::Connected => painter.good(&text),
        TransportStatus::Disconnected => painter.dim(&text),
        _ => painter.bad(&text),
    };
    format!("[{}] {text}", painter.accent("status"))
}

fn render(event: &RealtimeEvent, format: OutputFormat, painter: Painter) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Json | OutputFormat::JsonCompact => {
            serde_json::to_string(&EventRecord::from(event))?
        }
        OutputFormat::Plain => match event {
            RealtimeEvent::Metrics(s) => metrics::plain(s),
            RealtimeEvent::DeviceState(d) => format!("{}\t{}", d.id, d.is_on),
            RealtimeEvent::Status(s) => s.to_string(),
        },
        OutputFormat::Table => match event {
            RealtimeEvent::Metrics(s) => metrics_line(s, painter),
            RealtimeEvent::DeviceState(d) => device_line(d, painter),
            RealtimeEvent::Status(s) => status_line(s, painter),
        },
    })
}

/// Write a live event through to the cache. History is the writer's job.
fn cache_event(store: &Store, event: &RealtimeEvent) {
    match event {
        RealtimeEvent::Metrics(sample) => {
            if let Err(e) = store.save_latest(sample) {
                warn!(error = %e, "failed to cache latest metrics");
            }
        }
        RealtimeEvent::DeviceState(device) => util::merge_device(store, device),
        RealtimeEvent::Status(_) => {}
    }
}

// ── Handler ──────────────────────────────────────────────────────────

pub async fn handle(session: &Session, args: &WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let writer = HistoryWriter::spawn(Arc::clone(&session.store));
    let realtime = Realtime::from_config(
        &session.realtime,
        &session.credentials,
        Some(writer.sender()),
    )?;

    let mut view = View::new(&session.store, args, global);
    let result = run(&realtime, &mut view).await;

    realtime.stop().await;
    writer.shutdown().await;
    let stats = writer.stats();
    info!(
        written = stats.written,
        failed = stats.failed,
        "watch finished"
    );
    result
}

async fn run(realtime: &Realtime, view: &mut View<'_>) -> Result<(), CliError> {
    let mut events = realtime.subscribe();
    let mut mode = realtime.mode_changes();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    if !connect(realtime, &mut events, view, ctrl_c.as_mut()).await? {
        return Ok(());
    }
    mode.mark_unchanged();

    loop {
        tokio::select! {
            biased;
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            changed = mode.changed() => {
                if changed.is_err() {
                    break;
                }
                if *mode.borrow_and_update() == ConnectionMode::Disconnected {
                    output::notice("Connection lost, reconnecting.", view.global.quiet);
                    if !connect(realtime, &mut events, view, ctrl_c.as_mut()).await? {
                        break;
                    }
                    mode.mark_unchanged();
                }
            }
            event = events.recv() => match event {
                Ok(event) => view.show(&event)?,
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "watch output lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

/// Start the orchestrator and print what it reported while connecting.
///
/// Returns `false` when `interrupt` fires first; the caller's `stop`
/// tears down whatever the start had begun. Fails when no transport
/// could be established.
async fn connect<F: Future>(
    realtime: &Realtime,
    events: &mut broadcast::Receiver<RealtimeEvent>,
    view: &mut View<'_>,
    interrupt: Pin<&mut F>,
) -> Result<bool, CliError> {
    tokio::select! {
        biased;
        _ = interrupt => {
            info!("interrupted while connecting");
            return Ok(false);
        }
        () = realtime.start() => {}
    }

    loop {
        match events.try_recv() {
            Ok(event) => view.show(&event)?,
            Err(TryRecvError::Lagged(n)) => warn!(skipped = n, "watch output lagging"),
            Err(_) => break,
        }
    }

    if realtime.current_mode() == ConnectionMode::Disconnected {
        return Err(CliError::RealtimeUnavailable {
            status: view
                .last_status
                .take()
                .unwrap_or_else(|| "no transport connected".into()),
        });
    }
    info!(mode = %realtime.current_mode(), "realtime connected");
    Ok(true)
}

/// Prints events and writes them through to the cache.
struct View<'a> {
    store: &'a Store,
    status_only: bool,
    global: &'a GlobalOpts,
    painter: Painter,
    last_status: Option<String>,
}

impl<'a> View<'a> {
    fn new(store: &'a Store, args: &WatchArgs, global: &'a GlobalOpts) -> Self {
        Self {
            store,
            status_only: args.status_only,
            global,
            painter: Painter::new(global.color),
            last_status: None,
        }
    }

    fn show(&mut self, event: &RealtimeEvent) -> Result<(), CliError> {
        cache_event(self.store, event);

        if let RealtimeEvent::Status(status) = event {
            self.last_status = Some(status.to_string());
        } else if self.status_only {
            return Ok(());
        }

        let line = render(event, self.global.output, self.painter)?;
        output::print_output(&line, self.global.quiet);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cli::{Cli, ColorMode};
    use clap::Parser;
    use homelink_core::TransportKind;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn painter() -> Painter {
        Painter::new(ColorMode::Never)
    }

    fn sample() -> MetricsSample {
        MetricsSample {
            temperature: 21.5,
            humidity: 40,
            power: 120,
            timestamp: "2026-01-05T10:00:00Z".into(),
        }
    }

    #[test]
    fn json_lines_are_tagged() {
        let status = RealtimeEvent::Status(ConnectionStatus::new(
            TransportKind::Sse,
            TransportStatus::Unauthorized,
        ));
        assert_eq!(
            render(&status, OutputFormat::Json, painter()).unwrap(),
            r#"{"type":"status","source":"SSE","message":"SSE Fallback: Unauthorized - Check credentials"}"#
        );

        let metrics = RealtimeEvent::Metrics(sample());
        assert_eq!(
            render(&metrics, OutputFormat::JsonCompact, painter()).unwrap(),
            r#"{"type":"metrics","temp":21.5,"humidity":40,"power":120,"ts":"2026-01-05T10:00:00Z"}"#
        );
    }

    #[test]
    fn table_lines_are_labelled() {
        let status = RealtimeEvent::Status(ConnectionStatus::new(
            TransportKind::Mqtt,
            TransportStatus::Connected,
        ));
        assert_eq!(
            render(&status, OutputFormat::Table, painter()).unwrap(),
            "[status] MQTT: Connected"
        );

        let failed = RealtimeEvent::Status(ConnectionStatus::failed("Server unreachable"));
        assert_eq!(
            render(&failed, OutputFormat::Plain, painter()).unwrap(),
            "Failed: Server unreachable"
        );
    }

    #[test]
    fn live_events_are_written_through() {
        let store = Store::in_memory();
        let args = WatchArgs { status_only: true };
        let global = Cli::try_parse_from(["homelink", "-q", "status"]).unwrap().global;
        let mut view = View::new(&store, &args, &global);

        let device = DeviceState {
            id: "lamp".into(),
            name: "Lamp".into(),
            is_on: true,
            last_seen: "2026-01-05T10:00:00Z".into(),
        };
        view.show(&RealtimeEvent::Metrics(sample())).unwrap();
        view.show(&RealtimeEvent::DeviceState(device.clone())).unwrap();
        view.show(&RealtimeEvent::Status(ConnectionStatus::new(
            TransportKind::Sse,
            TransportStatus::Connected,
        )))
        .unwrap();

        assert_eq!(store.load_latest().unwrap(), Some(sample()));
        assert_eq!(store.load_devices().unwrap(), vec![device]);
        assert_eq!(view.last_status.as_deref(), Some("SSE Fallback: Connected"));
        assert_eq!(store.history_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn interrupt_cuts_a_slow_connect_short() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/events/stream"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = crate::config::Config::default();
        cfg.base_url = server.uri();
        cfg.mqtt.use_tls = false;
        cfg.cache.path = Some(dir.path().join("cache.db"));
        let session = Session::from_config(cfg).unwrap();
        let realtime = Realtime::from_config(&session.realtime, &session.credentials, None).unwrap();

        let args = WatchArgs { status_only: false };
        let global = Cli::try_parse_from(["homelink", "-q", "status"]).unwrap().global;
        let mut view = View::new(&session.store, &args, &global);
        let mut events = realtime.subscribe();

        let interrupt = tokio::time::sleep(Duration::from_millis(200));
        tokio::pin!(interrupt);
        let connected = tokio::time::timeout(
            Duration::from_secs(5),
            connect(&realtime, &mut events, &mut view, interrupt.as_mut()),
        )
        .await
        .expect("interrupt must not wait for the connect to settle")
        .unwrap();

        assert!(!connected);
        realtime.stop().await;
        assert_eq!(realtime.current_mode(), ConnectionMode::Disconnected);
    }
}
