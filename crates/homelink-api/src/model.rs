// Wire types shared by the REST client and both realtime transports.
//
// Field names on the wire are fixed by the server; Rust names are
// the readable ones and serde renames bridge the two.

use serde::{Deserialize, Serialize};

/// One telemetry reading.
///
/// Wire shape: `{"temp": 21.5, "humidity": 40, "power": 120, "ts": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    #[serde(rename = "temp")]
    pub temperature: f64,
    pub humidity: i32,
    pub power: i32,
    /// ISO-8601 timestamp assigned by the device.
    #[serde(rename = "ts")]
    pub timestamp: String,
}

/// Current state of one switchable device. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub id: String,
    pub name: String,
    pub is_on: bool,
    pub last_seen: String,
}

/// Envelope carried in every SSE `data:` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEnvelope {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Payload of the `system/initial-state` frame sent right after connect.
///
/// The server sends `{"devices": [...], "timestamp": "..."}`; a bare
/// array of devices is accepted too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InitialState {
    Wrapped {
        #[serde(default)]
        devices: Vec<DeviceState>,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Bare(Vec<DeviceState>),
}

impl InitialState {
    pub fn into_devices(self) -> Vec<DeviceState> {
        match self {
            Self::Wrapped { devices, .. } | Self::Bare(devices) => devices,
        }
    }
}

/// Capability probe response from `GET api/status`.
///
/// The server emits snake_case; camelCase is accepted for older builds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    #[serde(default, alias = "mqtt_available")]
    pub mqtt_available: bool,
    #[serde(default, alias = "mqtt_broker")]
    pub mqtt_broker: Option<String>,
    #[serde(default, alias = "mqtt_port")]
    pub mqtt_port: Option<u16>,
    #[serde(default, alias = "mqtt_tls")]
    pub mqtt_tls: Option<bool>,
    #[serde(default, alias = "sse_clients_count")]
    pub sse_clients_count: Option<u32>,
    #[serde(default, alias = "recommended_mode")]
    pub recommended_mode: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}
