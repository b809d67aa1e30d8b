//! Actor hierarchy for session orchestration.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── RoomActor (one per room with a video session)
//!     └── PeerActor (one per signaling connection)
//! ```
//!
//! - The registry maps room ids to room actors and releases empty rooms.
//! - A room owns its peer set, every peer's consumed-set and the producer
//!   index, and runs the discovery fan-out. It never awaits the engine or a
//!   peer inside its loop.
//! - A peer actor serializes every operation of one peer, including all of
//!   its engine calls and its teardown.
//!
//! Cancellation flows down through child `CancellationToken`s.

pub mod messages;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod room;

pub use messages::{
    ConnectOutcome, ConsumeOutcome, LeaveReason, PeerEvent, PeerIdentity, PeerPhase, PeerSink,
    PeerState, PeerSummary, RegistryStatus, RoomState, TransportPair,
};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use peer::PeerActorHandle;
pub use registry::{JoinedPeer, RoomRegistryActor, RoomRegistryHandle};
pub use room::RoomActorHandle;

use crate::errors::{EngineError, SfuError};
use crate::observability::metrics as prom;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

/// Deliver a notification without waiting on a full mailbox.
///
/// Falls back to a spawned send when the mailbox is full; dropped silently
/// when the receiver is gone.
pub(crate) fn send_detached<T: Send + 'static>(sender: &mpsc::Sender<T>, message: T) {
    match sender.try_send(message) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(message)) => {
            let sender = sender.clone();
            tokio::spawn(async move {
                let _ = sender.send(message).await;
            });
        }
    }
}

/// Run one engine operation under a deadline and record its latency.
///
/// The outer error is the deadline; the inner one is the engine's answer.
pub(crate) async fn engine_call<T, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<Result<T, EngineError>, SfuError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, call).await;
    prom::record_engine_operation(operation, start.elapsed());
    result.map_err(|_| SfuError::EngineTimeout(operation))
}
