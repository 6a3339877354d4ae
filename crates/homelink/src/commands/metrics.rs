//! Metrics command handlers: latest reading and cached history.

use std::sync::Arc;

use chrono::Local;
use homelink_api::ApiClient;
use homelink_core::{HistoryRecord, MetricsSample, Store};
use tabled::Tabled;

use crate::cli::{CachedArgs, GlobalOpts, HistoryArgs};
use crate::config::Session;
use crate::error::CliError;
use crate::output;

use super::util::{self, Origin};

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Recorded")]
    recorded: String,
    #[tabled(rename = "Device Time")]
    timestamp: String,
    #[tabled(rename = "Temp (°C)")]
    temperature: String,
    #[tabled(rename = "Humidity (%)")]
    humidity: i32,
    #[tabled(rename = "Power (W)")]
    power: i32,
}

impl From<&HistoryRecord> for HistoryRow {
    fn from(r: &HistoryRecord) -> Self {
        Self {
            recorded: r
                .recorded_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            timestamp: r.sample.timestamp.clone(),
            temperature: format!("{:.1}", r.sample.temperature),
            humidity: r.sample.humidity,
            power: r.sample.power,
        }
    }
}

pub(crate) fn detail(s: &MetricsSample) -> String {
    [
        format!("Temperature: {:.1} °C", s.temperature),
        format!("Humidity:    {} %", s.humidity),
        format!("Power:       {} W", s.power),
        format!("Timestamp:   {}", s.timestamp),
    ]
    .join("\n")
}

/// Tab-separated `temp humidity power timestamp`.
pub(crate) fn plain(s: &MetricsSample) -> String {
    format!(
        "{:.1}\t{}\t{}\t{}",
        s.temperature, s.humidity, s.power, s.timestamp
    )
}

// ── Handlers ────────────────────────────────────────────────────────

pub async fn latest(
    session: &Session,
    args: &CachedArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let (sample, origin) = if args.cached {
        let sample = session
            .store
            .load_latest()?
            .ok_or_else(|| CliError::EmptyCache {
                what: "metrics".into(),
            })?;
        (sample, Origin::Cache)
    } else {
        fetch_latest(&session.client()?, &session.store).await?
    };

    if origin == Origin::Cache && !args.cached {
        output::notice("Server unreachable, showing the cached reading.", global.quiet);
    }

    let out = output::render_single(global.output, &sample, detail, plain)?;
    output::print_output(&out, global.quiet);
    Ok(())
}

/// Fetch the current reading and write it through, or fall back to the
/// cached one when the server is away.
pub(crate) async fn fetch_latest(
    client: &ApiClient,
    store: &Arc<Store>,
) -> Result<(MetricsSample, Origin), CliError> {
    let fetched = client.get_metrics().await.map_err(CliError::from);
    if let Ok(ref sample) = fetched {
        util::record_metrics(store, sample);
    }
    util::or_cached(fetched, || Ok(store.load_latest()?))
}

pub fn history(session: &Session, args: &HistoryArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let store = &session.store;

    if args.clear {
        let removed = store.history_len()?;
        store.clear_history()?;
        output::notice(&format!("Cleared {removed} cached readings."), global.quiet);
        return Ok(());
    }

    if args.limit == 0 {
        return Err(CliError::Validation {
            field: "limit".into(),
            reason: "must be at least 1".into(),
        });
    }

    let records = store.load_history_records(args.limit)?;
    if records.is_empty() {
        return Err(CliError::EmptyCache {
            what: "history".into(),
        });
    }

    let out = output::render_list(global.output, &records, |r| HistoryRow::from(r), |r| {
        plain(&r.sample)
    })?;
    output::print_output(&out, global.quiet);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use homelink_api::TransportConfig;
    use homelink_core::{Credentials, CredentialsHandle};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ApiClient {
        let creds = CredentialsHandle::new(Credentials::new("guest", "secret"));
        let base = format!("{}/", server.uri()).parse().unwrap();
        ApiClient::new(base, creds.watch(), &TransportConfig::default()).unwrap()
    }

    fn sample(power: i32) -> MetricsSample {
        MetricsSample {
            temperature: 21.5,
            humidity: 40,
            power,
            timestamp: "2026-01-05T10:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn fetched_reading_is_written_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "temp": 22.0, "humidity": 45, "power": 300, "ts": "2026-01-05T11:00:00Z"
            })))
            .mount(&server)
            .await;

        let store = Arc::new(Store::in_memory());
        let (got, origin) = fetch_latest(&client(&server), &store).await.unwrap();

        assert_eq!(origin, Origin::Server);
        assert_eq!(got.power, 300);
        assert_eq!(store.load_latest().unwrap(), Some(got));
        assert_eq!(store.history_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn server_error_serves_cached_reading() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/metrics"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = Arc::new(Store::in_memory());
        store.save_latest(&sample(120)).unwrap();

        let (got, origin) = fetch_latest(&client(&server), &store).await.unwrap();
        assert_eq!(origin, Origin::Cache);
        assert_eq!(got, sample(120));
        assert_eq!(store.history_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_credentials_are_not_masked_by_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/metrics"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let store = Arc::new(Store::in_memory());
        store.save_latest(&sample(120)).unwrap();

        let err = fetch_latest(&client(&server), &store).await.unwrap_err();
        assert!(matches!(err, CliError::AuthFailed { .. }));
    }

    #[test]
    fn plain_is_tab_separated() {
        assert_eq!(plain(&sample(5)), "21.5\t40\t5\t2026-01-05T10:00:00Z");
    }
}
