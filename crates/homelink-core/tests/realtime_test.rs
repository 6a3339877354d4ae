#![allow(clippy::unwrap_used)]
// End-to-end orchestrator tests: real SSE transport and REST probe against
// a wiremock server, MQTT disabled.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use homelink_core::{
    ConnectionMode, CredentialsHandle, HistoryWriter, Realtime, RealtimeConfig, Store,
};

// ── Helpers ─────────────────────────────────────────────────────────

const STREAM_BODY: &str = concat!(
    "data: {\"topic\":\"system/connection\",\"payload\":{\"status\":\"connected\"}}\n",
    "\n",
    "data: {\"topic\":\"home/kitchen/metrics\",\"payload\":",
    "{\"temp\":22.5,\"humidity\":51,\"power\":480,\"ts\":\"2026-01-05T10:00:00Z\"}}\n",
    "\n",
);

fn config(server: &MockServer) -> RealtimeConfig {
    let mut config = RealtimeConfig::new(
        Url::parse(&format!("{}/", server.uri())).unwrap(),
        "guest",
        SecretString::from("secret".to_string()),
    );
    config.mqtt.use_tls = false;
    config.timings.sse_retry_delay = Duration::from_secs(30);
    config.timings.connect_timeout = Duration::from_secs(5);
    config
}

async fn mount_status(server: &MockServer, code: u16) {
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .respond_with(ResponseTemplate::new(code).set_body_json(json!({
            "mqtt_available": false,
            "recommended_mode": "sse"
        })))
        .mount(server)
        .await;
}

async fn mount_stream(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/api/events/stream"))
        .respond_with(response)
        .mount(server)
        .await;
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sse_fallback_forwards_and_persists_metrics() {
    let server = MockServer::start().await;
    mount_status(&server, 200).await;
    mount_stream(
        &server,
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(STREAM_BODY),
    )
    .await;

    let config = config(&server);
    let creds = CredentialsHandle::new(config.credentials());
    let store = Arc::new(Store::in_memory());
    let writer = HistoryWriter::spawn(Arc::clone(&store));
    let realtime = Realtime::from_config(&config, &creds, Some(writer.sender())).unwrap();

    let mut metrics = realtime.subscribe_metrics();
    let mut status = realtime.subscribe_status();

    realtime.start().await;
    assert_eq!(realtime.current_mode(), ConnectionMode::Sse);

    let first_status = tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_status.to_string(), "SSE Fallback: Connected");

    let sample = tokio::time::timeout(Duration::from_secs(5), metrics.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sample.power, 480);

    // The finite body ends; the stream retries but the mode holds.
    let dropped = tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dropped.to_string(), "SSE Fallback: Disconnected");
    assert_eq!(realtime.current_mode(), ConnectionMode::Sse);
    assert!(status.try_recv().is_err());

    realtime.stop().await;
    writer.shutdown().await;

    assert_eq!(realtime.current_mode(), ConnectionMode::Disconnected);
    let history = store.load_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].humidity, 51);
}

#[tokio::test]
async fn test_rejected_credentials_end_disconnected() {
    let server = MockServer::start().await;
    mount_status(&server, 200).await;
    mount_stream(&server, ResponseTemplate::new(401)).await;

    let config = config(&server);
    let creds = CredentialsHandle::new(config.credentials());
    let realtime = Realtime::from_config(&config, &creds, None).unwrap();
    let mut status = realtime.subscribe_status();

    realtime.start().await;

    assert_eq!(realtime.current_mode(), ConnectionMode::Disconnected);
    assert!(!realtime.is_connected());
    assert_eq!(
        status.try_recv().unwrap().to_string(),
        "SSE Fallback: Unauthorized - Check credentials"
    );
    assert!(status.try_recv().is_err());
}

#[tokio::test]
async fn test_unreachable_server_reports_unreachable() {
    let server = MockServer::start().await;
    mount_status(&server, 500).await;
    mount_stream(&server, ResponseTemplate::new(502)).await;

    let config = config(&server);
    let creds = CredentialsHandle::new(config.credentials());
    let realtime = Realtime::from_config(&config, &creds, None).unwrap();
    let mut status = realtime.subscribe_status();

    realtime.start().await;

    assert_eq!(realtime.current_mode(), ConnectionMode::Disconnected);
    assert_eq!(status.try_recv().unwrap().to_string(), "Failed: Server unreachable");
}
