//! Shared helpers for command handlers.

use std::sync::Arc;

use homelink_core::{DeviceState, MetricsSample, Store};
use tracing::warn;

use crate::error::CliError;

/// Where a displayed value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Server,
    Cache,
}

/// Write a fresh reading through to the cache. Cache failures are logged,
/// never fatal: the reading itself is still good.
pub fn record_metrics(store: &Arc<Store>, sample: &MetricsSample) {
    if let Err(e) = store.save_latest(sample) {
        warn!(error = %e, "failed to cache latest metrics");
    }
    if let Err(e) = store.append_history(sample) {
        warn!(error = %e, "failed to append metrics history");
    }
}

pub fn record_devices(store: &Store, devices: &[DeviceState]) {
    if let Err(e) = store.save_devices(devices) {
        warn!(error = %e, "failed to cache device list");
    }
}

/// Fold one updated device into the cached list, appending unknown ids.
pub fn merge_device(store: &Store, device: &DeviceState) {
    let mut devices = match store.load_devices() {
        Ok(devices) => devices,
        Err(e) => {
            warn!(error = %e, "failed to read cached devices");
            return;
        }
    };
    match devices.iter_mut().find(|d| d.id == device.id) {
        Some(existing) => existing.clone_from(device),
        None => devices.push(device.clone()),
    }
    record_devices(store, &devices);
}

/// Resolve a fetch that may fall back to the cache.
///
/// Errors that look like the server being away are logged and answered
/// from `cached`; anything else (bad credentials, bad config) is returned.
/// When the cache is empty too, the original fetch error wins.
pub fn or_cached<T>(
    fetched: Result<T, CliError>,
    cached: impl FnOnce() -> Result<Option<T>, CliError>,
) -> Result<(T, Origin), CliError> {
    match fetched {
        Ok(value) => Ok((value, Origin::Server)),
        Err(err) if err.is_offline() => {
            warn!(error = %err, "fetch failed, falling back to cache");
            match cached()? {
                Some(value) => Ok((value, Origin::Cache)),
                None => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn device(id: &str, is_on: bool) -> DeviceState {
        DeviceState {
            id: id.into(),
            name: id.to_uppercase(),
            is_on,
            last_seen: "2026-01-05T10:00:00Z".into(),
        }
    }

    #[test]
    fn merge_replaces_by_id_and_appends_new() {
        let store = Store::in_memory();
        store
            .save_devices(&[device("lamp", false), device("fan", false)])
            .unwrap();

        merge_device(&store, &device("lamp", true));
        merge_device(&store, &device("heater", true));

        let devices = store.load_devices().unwrap();
        let states: Vec<(String, bool)> = devices.into_iter().map(|d| (d.id, d.is_on)).collect();
        assert_eq!(
            states,
            vec![
                ("fan".to_string(), false),
                ("heater".to_string(), true),
                ("lamp".to_string(), true),
            ]
        );
    }

    #[test]
    fn offline_errors_fall_back() {
        let fetched: Result<u32, CliError> = Err(CliError::ConnectionFailed {
            reason: "refused".into(),
        });
        let (value, origin) = or_cached(fetched, || Ok(Some(7))).unwrap();
        assert_eq!((value, origin), (7, Origin::Cache));
    }

    #[test]
    fn empty_cache_keeps_original_error() {
        let fetched: Result<u32, CliError> = Err(CliError::ConnectionFailed {
            reason: "refused".into(),
        });
        let err = or_cached(fetched, || Ok(None)).unwrap_err();
        assert!(matches!(err, CliError::ConnectionFailed { .. }));
    }

    #[test]
    fn auth_errors_do_not_fall_back() {
        let fetched: Result<u32, CliError> = Err(CliError::AuthFailed {
            message: "nope".into(),
        });
        let err = or_cached(fetched, || Ok(Some(1))).unwrap_err();
        assert!(matches!(err, CliError::AuthFailed { .. }));
    }
}
