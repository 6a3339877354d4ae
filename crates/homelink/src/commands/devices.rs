//! Device command handlers.

use homelink_api::ApiClient;
use homelink_core::{DeviceState, Store};
use tabled::Tabled;

use crate::cli::{CachedArgs, GlobalOpts, ToggleArgs};
use crate::config::Session;
use crate::error::CliError;
use crate::output::{self, Painter};

use super::util::{self, Origin};

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: &'static str,
    #[tabled(rename = "Last Seen")]
    last_seen: String,
}

impl From<&DeviceState> for DeviceRow {
    fn from(d: &DeviceState) -> Self {
        Self {
            id: d.id.clone(),
            name: d.name.clone(),
            state: on_off(d.is_on),
            last_seen: d.last_seen.clone(),
        }
    }
}

fn on_off(is_on: bool) -> &'static str {
    if is_on { "On" } else { "Off" }
}

fn detail(d: &DeviceState, painter: Painter) -> String {
    let state = if d.is_on {
        painter.good("On")
    } else {
        painter.dim("Off")
    };
    [
        format!("ID:        {}", d.id),
        format!("Name:      {}", d.name),
        format!("State:     {state}"),
        format!("Last seen: {}", d.last_seen),
    ]
    .join("\n")
}

// ── Handlers ────────────────────────────────────────────────────────

pub async fn list(session: &Session, args: &CachedArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (devices, origin) = if args.cached {
        let devices = session.store.load_devices()?;
        if devices.is_empty() {
            return Err(CliError::EmptyCache {
                what: "devices".into(),
            });
        }
        (devices, Origin::Cache)
    } else {
        fetch_devices(&session.client()?, &session.store).await?
    };

    if origin == Origin::Cache && !args.cached {
        output::notice("Server unreachable, showing cached devices.", global.quiet);
    }

    let out = output::render_list(
        global.output,
        &devices,
        |d| DeviceRow::from(d),
        |d| d.id.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

pub async fn toggle(session: &Session, args: &ToggleArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let device = toggle_device(&session.client()?, &session.store, &args.id).await?;

    let painter = Painter::new(global.color);
    let out = output::render_single(
        global.output,
        &device,
        |d| detail(d, painter),
        |d| format!("{}\t{}", d.id, on_off(d.is_on)),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

/// Fetch the device list and replace the cached copy, or fall back to it.
pub(crate) async fn fetch_devices(
    client: &ApiClient,
    store: &Store,
) -> Result<(Vec<DeviceState>, Origin), CliError> {
    let fetched = client.get_devices().await.map_err(CliError::from);
    if let Ok(ref devices) = fetched {
        util::record_devices(store, devices);
    }
    util::or_cached(fetched, || {
        let cached = store.load_devices()?;
        Ok((!cached.is_empty()).then_some(cached))
    })
}

/// Toggle on the server and fold the new state into the cached list.
pub(crate) async fn toggle_device(
    client: &ApiClient,
    store: &Store,
    id: &str,
) -> Result<DeviceState, CliError> {
    let device = client.toggle_device(id).await.map_err(|e| match CliError::from(e) {
        CliError::Api {
            status: Some(404), ..
        } => CliError::NotFound {
            resource_type: "device".into(),
            identifier: id.into(),
            list_command: "devices".into(),
        },
        other => other,
    })?;
    util::merge_device(store, &device);
    Ok(device)
}
