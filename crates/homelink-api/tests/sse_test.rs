#![allow(clippy::unwrap_used)]
// Integration tests for `SseTransport` against a wiremock event stream.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use homelink_api::{
    Credentials, CredentialsHandle, SseConfig, SseTransport, TransportEvent, TransportState,
    TransportStatus,
};

// ── Helpers ─────────────────────────────────────────────────────────

const STREAM_BODY: &str = concat!(
    ": hello\n",
    "data: {\"topic\":\"system/connection\",\"payload\":{\"status\":\"connected\"},\"timestamp\":\"t\"}\n",
    "\n",
    "data: {\"topic\":\"system/initial-state\",\"payload\":{\"devices\":[",
    "{\"id\":\"lamp\",\"name\":\"Lamp\",\"isOn\":true,\"lastSeen\":\"t\"},",
    "{\"id\":\"fan\",\"name\":\"Fan\",\"isOn\":false,\"lastSeen\":\"t\"}]}}\n",
    "\n",
    "data: {\"topic\":\"home/kitchen/metrics\",\n",
    "data: \"payload\":{\"temp\":22.0,\"humidity\":48,\n",
    "data: \"power\":300,\"ts\":\"2026-01-05T10:00:00Z\"}}\n",
    "\r\n",
    "data: {\"topic\":\"system/keepalive\",\"payload\":{}}\n",
    "\n",
    "data: {\"topic\":\"home/fan/state\",\"payload\":{\"id\":\"fan\",\"name\":\"Fan\",\"isOn\":true,\"lastSeen\":\"t2\"}}\n",
    "\n",
);

fn config(server: &MockServer, retry: Duration) -> SseConfig {
    let mut config = SseConfig::new(&Url::parse(&server.uri()).unwrap()).unwrap();
    config.retry_delay = retry;
    config.auth_retry_delay = Duration::from_secs(10);
    config.connect_timeout = Duration::from_secs(5);
    config
}

fn transport(
    server: &MockServer,
    retry: Duration,
) -> (SseTransport, mpsc::Receiver<homelink_api::MetricsSample>) {
    let creds = CredentialsHandle::new(Credentials::new("guest", "secret"));
    let (history_tx, history_rx) = mpsc::channel(16);
    let transport = SseTransport::with_client(
        reqwest::Client::new(),
        config(server, retry),
        creds.watch(),
        Some(history_tx),
    );
    (transport, history_rx)
}

async fn next(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_frames_become_events() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .and(header("accept", "text/event-stream"))
        .and(header("authorization", "Basic Z3Vlc3Q6c2VjcmV0"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(STREAM_BODY),
        )
        .mount(&server)
        .await;

    let (sse, mut history) = transport(&server, Duration::from_secs(30));
    let mut rx = sse.subscribe();

    sse.start().await.unwrap();

    assert_eq!(next(&mut rx).await, TransportEvent::Status(TransportStatus::Connected));
    assert!(matches!(next(&mut rx).await, TransportEvent::DeviceState(d) if d.id == "lamp"));
    assert!(matches!(next(&mut rx).await, TransportEvent::DeviceState(d) if d.id == "fan" && !d.is_on));
    assert!(matches!(next(&mut rx).await, TransportEvent::Metrics(m) if m.power == 300));
    assert!(matches!(next(&mut rx).await, TransportEvent::DeviceState(d) if d.id == "fan" && d.is_on));

    // Body ends: reported as a drop, then the loop backs off.
    assert_eq!(
        next(&mut rx).await,
        TransportEvent::Status(TransportStatus::Disconnected)
    );
    let mut state = sse.watch_state();
    let settled = *state
        .wait_for(|s| matches!(s, TransportState::Reconnecting { .. }))
        .await
        .unwrap();
    assert_eq!(settled, TransportState::Reconnecting { attempt: 1 });

    let saved = history.recv().await.unwrap();
    assert_eq!(saved.humidity, 48);

    sse.stop().await;
    assert_eq!(sse.state(), TransportState::Stopped);
    assert!(!sse.is_connected());
}

#[tokio::test]
async fn test_invalid_utf8_frame_is_skipped_and_stream_continues() {
    let server = MockServer::start().await;
    let mut body = Vec::new();
    body.extend_from_slice(b"data: {\"topic\":\"home/lamp/state\",\"payload\":\"\xff\"}\n\n");
    body.extend_from_slice(
        b"data: {\"topic\":\"home/fan/state\",\"payload\":{\"id\":\"fan\",\"name\":\"Fan\",\"isOn\":true,\"lastSeen\":\"t\"}}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;

    let (sse, _history) = transport(&server, Duration::from_secs(30));
    let mut rx = sse.subscribe();
    sse.start().await.unwrap();

    assert_eq!(next(&mut rx).await, TransportEvent::Status(TransportStatus::Connected));
    assert!(matches!(next(&mut rx).await, TransportEvent::DeviceState(d) if d.id == "fan" && d.is_on));
    assert_eq!(
        next(&mut rx).await,
        TransportEvent::Status(TransportStatus::Disconnected)
    );

    sse.stop().await;
}

#[tokio::test]
async fn test_unauthorized_fails_start_and_backs_off() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let (sse, _history) = transport(&server, Duration::from_millis(10));
    let mut rx = sse.subscribe();

    assert!(sse.start().await.is_err());
    assert_eq!(next(&mut rx).await, TransportEvent::Status(TransportStatus::Unauthorized));

    // Auth backoff is long; no second request within this window.
    tokio::time::sleep(Duration::from_millis(300)).await;
    sse.stop().await;
}

#[tokio::test]
async fn test_forbidden_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let (sse, _history) = transport(&server, Duration::from_millis(10));
    let mut rx = sse.subscribe();

    assert!(sse.start().await.is_err());
    assert_eq!(next(&mut rx).await, TransportEvent::Status(TransportStatus::Forbidden));
    sse.stop().await;
}

#[tokio::test]
async fn test_server_error_retries_with_generic_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (sse, _history) = transport(&server, Duration::from_millis(20));
    let mut rx = sse.subscribe();

    assert!(sse.start().await.is_err());
    for _ in 0..2 {
        assert_eq!(
            next(&mut rx).await,
            TransportEvent::Status(TransportStatus::Failed("HTTP 500".into()))
        );
    }
    sse.stop().await;

    assert!(server.received_requests().await.unwrap().len() >= 2);
}

#[tokio::test]
async fn test_stop_interrupts_backoff_and_silences_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_string(STREAM_BODY))
        .mount(&server)
        .await;

    let (sse, _history) = transport(&server, Duration::from_secs(60));
    let mut rx = sse.subscribe();
    sse.start().await.unwrap();

    let mut state = sse.watch_state();
    state
        .wait_for(|s| matches!(s, TransportState::Reconnecting { .. }))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), sse.stop())
        .await
        .expect("stop must not wait out the backoff");

    while rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    // Idempotent
    sse.stop().await;
}
