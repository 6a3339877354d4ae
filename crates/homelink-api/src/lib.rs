// homelink-api: wire types, REST client and realtime transports (MQTT + SSE)
// for the homelink telemetry server.

pub mod assets;
pub mod client;
pub mod credentials;
pub mod error;
pub mod event;
pub mod model;
pub mod mqtt;
pub mod sse;
pub mod transport;

pub use assets::{AssetSource, DirAssets};
pub use client::ApiClient;
pub use credentials::{Credentials, CredentialsHandle};
pub use error::Error;
pub use event::{EventEmitter, TransportEvent, TransportKind, TransportState, TransportStatus};
pub use model::{DeviceState, InitialState, MetricsSample, ServerStatus, StreamEnvelope};
pub use mqtt::{MqttConfig, MqttTransport};
pub use sse::{SseConfig, SseFrameDecoder, SseTransport};
pub use transport::{TlsMode, TransportConfig};
