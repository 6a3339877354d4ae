// Seams between the orchestrator and the things it drives.

use std::future::Future;

use tokio::sync::{broadcast, watch};

use homelink_api::{
    ApiClient, Error, MqttTransport, ServerStatus, SseTransport, TransportEvent, TransportKind,
    TransportState,
};

/// A realtime transport the orchestrator can start, stop and listen to.
///
/// `start` resolves once the first connection attempt settles; on failure
/// the transport keeps retrying in the background until `stop`. `stop`
/// must not return while the transport can still emit events.
pub trait RealtimeSource: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    fn start(&self) -> impl Future<Output = Result<(), Error>> + Send;

    fn stop(&self) -> impl Future<Output = ()> + Send;

    fn state(&self) -> TransportState;

    fn watch_state(&self) -> watch::Receiver<TransportState>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}

/// Server-side capability query, consulted before falling back.
pub trait StatusProbe: Send + Sync + 'static {
    fn server_status(&self) -> impl Future<Output = Result<ServerStatus, Error>> + Send;
}

impl RealtimeSource for MqttTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    fn start(&self) -> impl Future<Output = Result<(), Error>> + Send {
        MqttTransport::start(self)
    }

    fn stop(&self) -> impl Future<Output = ()> + Send {
        MqttTransport::stop(self)
    }

    fn state(&self) -> TransportState {
        MqttTransport::state(self)
    }

    fn watch_state(&self) -> watch::Receiver<TransportState> {
        MqttTransport::watch_state(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        MqttTransport::subscribe(self)
    }
}

impl RealtimeSource for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn start(&self) -> impl Future<Output = Result<(), Error>> + Send {
        SseTransport::start(self)
    }

    fn stop(&self) -> impl Future<Output = ()> + Send {
        SseTransport::stop(self)
    }

    fn state(&self) -> TransportState {
        SseTransport::state(self)
    }

    fn watch_state(&self) -> watch::Receiver<TransportState> {
        SseTransport::watch_state(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        SseTransport::subscribe(self)
    }
}

impl StatusProbe for ApiClient {
    fn server_status(&self) -> impl Future<Output = Result<ServerStatus, Error>> + Send {
        ApiClient::server_status(self)
    }
}
