//! Message types for actor communication.
//!
//! Request messages carry a `respond_to` oneshot sender; notifications are
//! fire-and-forget. Events delivered to a peer's signaling connection are
//! [`PeerEvent`]s pushed through its [`PeerSink`].

use super::peer::{PeerActor, PeerActorHandle};
use super::room::RoomActorHandle;
use crate::discovery::ProducerAnnouncement;
use crate::engine::{
    ConsumerDescriptor, DtlsParameters, DtlsState, IceParameters, IceState, RtpCapabilities,
    RtpParameters, TransportDescriptor,
};
use crate::errors::SfuError;
use common::types::{ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Identity supplied by the auth/session layer at join time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
}

/// Why a peer left its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    /// Explicit leave request.
    Left,
    /// Signaling connection dropped.
    Disconnected,
    /// ICE/DTLS failure not recovered within the retry window.
    TransportFailed,
    /// Room (or the whole service) shut down.
    RoomClosed,
}

impl LeaveReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Left => "left",
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::TransportFailed => "transport-failed",
            LeaveReason::RoomClosed => "room-closed",
        }
    }
}

/// Peer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerPhase {
    Joining,
    CapabilitiesSet,
    TransportsCreated,
    Active,
    Leaving,
    Closed,
}

/// Which connectivity layer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureLayer {
    Ice,
    Dtls,
}

impl FailureLayer {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            FailureLayer::Ice => "ice",
            FailureLayer::Dtls => "dtls",
        }
    }
}

/// Server-initiated notification for one peer's signaling connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    NewProducerAvailable(ProducerAnnouncement),
    /// Join-time batch, sent exactly once per peer.
    ExistingProducers(Vec<ProducerAnnouncement>),
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: String,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    TransportStateChanged {
        transport_id: TransportId,
        direction: TransportDirection,
        ice_state: IceState,
        dtls_state: DtlsState,
    },
    TransportFailed {
        transport_id: TransportId,
        direction: TransportDirection,
        layer: FailureLayer,
    },
    UserJoined {
        peer_id: String,
        identity: PeerIdentity,
    },
    UserLeft {
        peer_id: String,
        room_id: String,
        identity: PeerIdentity,
        reason: LeaveReason,
    },
    /// The server tore this peer down on its own.
    Closed { reason: LeaveReason },
}

/// Outbound event channel for one signaling connection.
///
/// Unbounded so the room never waits on a slow client.
pub type PeerSink = mpsc::UnboundedSender<PeerEvent>;

/// Send and receive transports created for a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportPair {
    pub send: TransportDescriptor,
    pub recv: TransportDescriptor,
}

/// Result of `connect-transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// Nothing was done; the transport was connected earlier.
    AlreadyConnected,
}

/// Result of `consume`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    Created(ConsumerDescriptor),
    /// The producer is already in this peer's consumed-set.
    AlreadyConsuming { producer_id: ProducerId },
}

/// Result of registering a peer with a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Carries the completed peers present at registration, excluding the new one.
    Registered { peers: Vec<PeerSummary> },
    /// The room released itself before the registration was processed.
    RoomClosed,
}

/// A completed peer as listed by the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    pub identity: PeerIdentity,
}

/// Room-side view of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomPeerStatus {
    /// Registered, handshake in progress.
    Joining,
    /// Transports created; takes part in discovery.
    Ready,
    /// Teardown in progress.
    Leaving,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPeerState {
    pub peer_id: String,
    pub status: RoomPeerStatus,
    pub consumed: Vec<ProducerId>,
}

/// Snapshot of a room actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub room_id: String,
    pub peers: Vec<RoomPeerState>,
    pub producers: Vec<ProducerAnnouncement>,
}

impl RoomState {
    #[must_use]
    pub fn peer(&self, peer_id: &str) -> Option<&RoomPeerState> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    pub connected: bool,
    pub ice_state: IceState,
    pub dtls_state: DtlsState,
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerStatus {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStatus {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Snapshot of a peer actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub peer_id: String,
    pub room_id: String,
    pub phase: PeerPhase,
    pub transports: Vec<TransportStatus>,
    pub producers: Vec<ProducerStatus>,
    pub consumers: Vec<ConsumerStatus>,
}

impl PeerState {
    #[must_use]
    pub fn transport(&self, direction: TransportDirection) -> Option<&TransportStatus> {
        self.transports.iter().find(|t| t.direction == direction)
    }
}

/// Registry status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub peer_count: usize,
    pub engine_available: bool,
    pub accepting_new: bool,
}

/// Messages handled by a `PeerActor`.
#[derive(Debug)]
pub enum PeerMessage {
    SetCapabilities {
        capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
    CreateTransports {
        respond_to: oneshot::Sender<Result<TransportPair, SfuError>>,
    },
    ConnectTransport {
        transport_id: TransportId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<ConnectOutcome, SfuError>>,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<ProducerId, SfuError>>,
    },
    CloseProducer {
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
    Consume {
        producer_id: ProducerId,
        capabilities: Option<RtpCapabilities>,
        respond_to: oneshot::Sender<Result<ConsumeOutcome, SfuError>>,
    },
    RestartIce {
        transport_id: TransportId,
        respond_to: oneshot::Sender<Result<IceParameters, SfuError>>,
    },
    /// Tear the peer down. Answered once teardown completes.
    Leave {
        reason: LeaveReason,
        respond_to: oneshot::Sender<()>,
    },
    /// A producer this peer consumes was closed (sent by the room).
    ProducerClosed { producer_id: ProducerId },
    /// Resume a consumer after the settle delay.
    ResumeConsumer { consumer_id: ConsumerId },
    GetState {
        respond_to: oneshot::Sender<PeerState>,
    },
}

/// Messages handled by a `RoomActor`.
pub enum RoomMessage {
    /// Register a new peer. The room spawns `actor` and owns its task.
    RegisterPeer {
        peer_id: String,
        identity: PeerIdentity,
        actor: Box<PeerActor>,
        handle: PeerActorHandle,
        sink: PeerSink,
        respond_to: oneshot::Sender<Result<RegisterOutcome, SfuError>>,
    },
    /// Transports are up: send the join-time batch and announce the peer.
    PeerReady {
        peer_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
    ProducerCreated {
        announcement: ProducerAnnouncement,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
    /// Notify the room before the producer is physically closed.
    ProducerClosed {
        peer_id: String,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<()>,
    },
    ReserveConsumption {
        peer_id: String,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
    ConfirmConsumption {
        peer_id: String,
        producer_id: ProducerId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
    ReleaseConsumption {
        peer_id: String,
        producer_id: ProducerId,
    },
    /// First teardown step: drop the peer's producers from the index.
    PeerLeaving {
        peer_id: String,
        respond_to: oneshot::Sender<()>,
    },
    /// Last teardown step: remove the peer record.
    PeerRemoved {
        peer_id: String,
        reason: LeaveReason,
        respond_to: oneshot::Sender<()>,
    },
    GetPeers {
        excluding: Option<String>,
        respond_to: oneshot::Sender<Vec<PeerSummary>>,
    },
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
    /// Close if still empty. Answers whether the room closed.
    TryClose { respond_to: oneshot::Sender<bool> },
}

/// Messages handled by the `RoomRegistryActor`.
pub enum RegistryMessage {
    GetOrCreateRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },
    /// A room's last peer was removed.
    RoomEmpty { room_id: String },
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
    /// Stop accepting rooms and cancel every actor.
    Shutdown { respond_to: oneshot::Sender<()> },
}
