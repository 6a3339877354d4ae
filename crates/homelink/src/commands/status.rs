//! `homelink status`: server capability probe plus local cache summary.

use homelink_api::{ApiClient, ServerStatus};
use homelink_core::Store;
use serde::Serialize;

use crate::cli::GlobalOpts;
use crate::config::Session;
use crate::error::CliError;
use crate::output::{self, Painter};

#[derive(Debug, Serialize)]
pub(crate) struct StatusReport {
    pub server_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_error: Option<String>,
    pub cache: CacheReport,
}

#[derive(Debug, Serialize)]
pub(crate) struct CacheReport {
    pub path: Option<String>,
    pub devices: usize,
    pub history: usize,
    pub history_cap: usize,
    pub latest: Option<String>,
}

pub async fn handle(session: &Session, global: &GlobalOpts) -> Result<(), CliError> {
    let report = build_report(&session.client()?, &session.store).await?;

    let painter = Painter::new(global.color);
    let out = output::render_single(
        global.output,
        &report,
        |r| detail(r, painter),
        |r| {
            r.server
                .as_ref()
                .and_then(|s| s.recommended_mode.clone())
                .unwrap_or_else(|| "unreachable".into())
        },
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

/// Probe the server and summarize the cache. An unreachable server is part
/// of the report, not an error; rejected credentials are.
pub(crate) async fn build_report(client: &ApiClient, store: &Store) -> Result<StatusReport, CliError> {
    let (server, server_error) = match client.server_status().await.map_err(CliError::from) {
        Ok(status) => (Some(status), None),
        Err(e) if e.is_offline() => (None, Some(e.to_string())),
        Err(e) => return Err(e),
    };

    let cache = CacheReport {
        path: store.path().map(|p| p.display().to_string()),
        devices: store.load_devices()?.len(),
        history: store.history_len()?,
        history_cap: store.history_cap(),
        latest: store.load_latest()?.map(|s| s.timestamp),
    };

    Ok(StatusReport {
        server_url: client.base_url().to_string(),
        server,
        server_error,
        cache,
    })
}

fn detail(r: &StatusReport, painter: Painter) -> String {
    let mut lines = vec![format!("Server:          {}", r.server_url)];

    match (&r.server, &r.server_error) {
        (Some(s), _) => {
            let mqtt = if s.mqtt_available {
                painter.good("available")
            } else {
                painter.bad("unavailable")
            };
            lines.push(format!("MQTT:            {mqtt}"));
            if let Some(ref broker) = s.mqtt_broker {
                let port = s.mqtt_port.map_or_else(String::new, |p| format!(":{p}"));
                lines.push(format!("Broker:          {broker}{port}"));
            }
            if let Some(tls) = s.mqtt_tls {
                lines.push(format!("Broker TLS:      {}", if tls { "yes" } else { "no" }));
            }
            if let Some(n) = s.sse_clients_count {
                lines.push(format!("Stream clients:  {n}"));
            }
            if let Some(ref mode) = s.recommended_mode {
                lines.push(format!("Recommended:     {}", painter.accent(mode)));
            }
        }
        (None, Some(err)) => lines.push(format!("Reachable:       {} ({err})", painter.bad("no"))),
        (None, None) => {}
    }

    lines.push(String::new());
    lines.push(format!(
        "Cache:           {}",
        r.cache.path.as_deref().unwrap_or("(memory)")
    ));
    lines.push(format!("Cached devices:  {}", r.cache.devices));
    lines.push(format!(
        "History:         {}/{}",
        r.cache.history, r.cache.history_cap
    ));
    lines.push(format!(
        "Latest reading:  {}",
        painter.dim(r.cache.latest.as_deref().unwrap_or("-"))
    ));
    lines.join("\n")
}
