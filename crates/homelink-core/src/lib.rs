// homelink-core: connectivity orchestration and local caching between
// homelink-api and consumers (CLI).

pub mod config;
pub mod error;
pub mod realtime;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{MqttSettings, RealtimeConfig, Timings};
pub use error::CoreError;
pub use realtime::{
    ConnectionMode, ConnectionStatus, Realtime, RealtimeEvent, RealtimeOptions, RealtimeSource,
    StatusProbe,
};
pub use store::{HistoryRecord, HistoryStats, HistoryWriter, Store, StoreError};

// Wire types consumers need alongside the orchestrator.
pub use homelink_api::{
    Credentials, CredentialsHandle, DeviceState, MetricsSample, TransportKind, TransportStatus,
};
