//! Media engine binding.
//!
//! The selective-forwarding engine runs out of process. Everything the
//! controller needs from it goes through the [`MediaEngine`] trait:
//!
//! ```text
//! EngineSupervisor ──owns──▶ Arc<dyn MediaEngine>
//!        │                        │
//!        │ restart on death        ├── WorkerProcess (production, stdio JSON lines)
//!        ▼                        └── MockEngine    (tests)
//! EngineLauncher::launch()
//! ```
//!
//! Engine objects (routers, transports, producers, consumers) are identified
//! by ids generated on the controller side. Closing something that is already
//! closed, or unknown to the engine, is a successful no-op.

pub mod mock;
pub mod supervisor;
pub mod types;
pub mod worker;

use crate::errors::EngineError;
use async_trait::async_trait;
use common::types::{
    ConsumerId, MediaKind, ProducerId, RouterId, TransportDirection, TransportId,
};
use std::sync::Arc;
use tokio::sync::broadcast;

pub use supervisor::{EngineSupervisor, RestartPolicy};
pub use types::{
    ConsumerDescriptor, DtlsParameters, DtlsState, IceParameters, IceState, RtpCapabilities,
    RtpParameters, TransportDescriptor,
};

/// Capacity of engine event broadcast channels.
pub const ENGINE_EVENT_CAPACITY: usize = 1024;

/// Asynchronous events raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    IceStateChanged {
        transport_id: TransportId,
        state: IceState,
    },
    DtlsStateChanged {
        transport_id: TransportId,
        state: DtlsState,
    },
    /// The worker process exited; every object it owned is gone.
    WorkerDied { reason: String },
}

/// Operations offered by a selective-forwarding media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a router for a room.
    async fn create_router(&self, room_id: &str) -> Result<RouterId, EngineError>;

    /// Capabilities a client negotiates against.
    async fn router_capabilities(&self, router: RouterId) -> Result<RtpCapabilities, EngineError>;

    async fn close_router(&self, router: RouterId) -> Result<(), EngineError>;

    async fn create_transport(
        &self,
        router: RouterId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError>;

    /// Apply the client's DTLS parameters to a transport.
    async fn connect_transport(
        &self,
        transport: TransportId,
        dtls: DtlsParameters,
    ) -> Result<(), EngineError>;

    /// Regenerate ICE credentials on the same transport.
    async fn restart_ice(&self, transport: TransportId) -> Result<IceParameters, EngineError>;

    async fn close_transport(&self, transport: TransportId) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    async fn close_producer(&self, producer: ProducerId) -> Result<(), EngineError>;

    /// Whether a peer with these capabilities can receive the producer.
    async fn can_consume(
        &self,
        router: RouterId,
        producer: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    /// Create a consumer of `producer` on a receive transport. Always created paused.
    async fn consume(
        &self,
        transport: TransportId,
        producer: ProducerId,
        capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescriptor, EngineError>;

    async fn resume_consumer(&self, consumer: ConsumerId) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer: ConsumerId) -> Result<(), EngineError>;

    /// Subscribe to engine events.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    fn is_alive(&self) -> bool;

    /// Stop the engine. Outstanding requests fail with `Unavailable`.
    async fn shutdown(&self);
}

/// Creates fresh engine instances for the supervisor.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn MediaEngine>, EngineError>;
}
