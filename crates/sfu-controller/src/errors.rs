//! SFU Controller error types.
//!
//! Error types map to signaling `ErrorCode` values for client responses.
//! Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

/// SFU Controller error type.
///
/// Maps to signaling `ErrorCode` values:
/// - `BadRequest` class (`NoRoomJoined`, `AlreadySet`, `InvalidState`): 1
/// - `NotReady` class (`TransportNotReady`, `TransportConnectTimeout`): 3
/// - `NotFound` class (`PeerNotFound`, `PeerGone`, `ProducerGone`, `UnknownTransport`): 4
/// - `Conflict` class (`Conflict`, `DuplicateConsumption`, `ProducerKindExists`): 5
/// - Internal, Config, Engine: 6
/// - `Unavailable` class (`EngineUnavailable`, `EngineTimeout`, capacity, draining): 7
/// - Media failures (`CannotConsume`, `IceOrDtlsFailed`): 8
#[derive(Debug, Error)]
pub enum SfuError {
    /// Operation issued by a signaling connection that has not joined a room.
    #[error("No room joined")]
    NoRoomJoined,

    /// Peer does not exist in the room.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Peer left (or is leaving) while the operation was in flight.
    #[error("Peer is gone")]
    PeerGone,

    /// The transport needed for the operation is not connected yet.
    #[error("Transport not ready: {0}")]
    TransportNotReady(&'static str),

    /// The DTLS handshake setup did not complete within the connect timeout.
    #[error("Transport connect timed out")]
    TransportConnectTimeout,

    /// Transport id does not belong to this peer.
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    /// The producer is already in the peer's consumed-set.
    #[error("Producer already consumed")]
    DuplicateConsumption,

    /// The source producer has closed.
    #[error("Producer is gone: {0}")]
    ProducerGone(String),

    /// The peer already has an active producer of this kind.
    #[error("Producer of kind {0} already exists")]
    ProducerKindExists(&'static str),

    /// The router reports the peer cannot consume this producer.
    #[error("Cannot consume: {0}")]
    CannotConsume(String),

    /// Receive capabilities were already negotiated.
    #[error("Capabilities already set")]
    AlreadySet,

    /// Operation is not valid in the peer's current phase.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The media engine worker is down (restarting) or unreachable.
    #[error("Media engine unavailable")]
    EngineUnavailable,

    /// A media engine call did not complete within the operation timeout.
    #[error("Media engine operation timed out: {0}")]
    EngineTimeout(&'static str),

    /// The media engine rejected an operation.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// ICE or DTLS negotiation failed on a transport.
    #[error("ICE/DTLS failed on transport {0}")]
    IceOrDtlsFailed(String),

    /// Conflict error (e.g., peer already registered).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Room is at capacity.
    #[error("Room at capacity: {0}")]
    RoomCapacityExceeded(String),

    /// Controller is draining (graceful shutdown).
    #[error("SFU is draining")]
    Draining,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by a media engine binding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The worker is not running.
    #[error("worker unavailable")]
    Unavailable,

    /// The referenced engine object does not exist (e.g. created by a previous worker).
    #[error("not found: {0}")]
    NotFound(String),

    /// The worker rejected the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The request/response channel to the worker failed.
    #[error("channel error: {0}")]
    Channel(String),

    /// Worker could not be started.
    #[error("launch failed: {0}")]
    Launch(String),
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable | EngineError::Channel(_) | EngineError::Launch(_) => {
                SfuError::EngineUnavailable
            }
            EngineError::NotFound(msg) | EngineError::Rejected(msg) => SfuError::Engine(msg),
        }
    }
}

impl SfuError {
    /// Returns the signaling `ErrorCode` value for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::NoRoomJoined | SfuError::AlreadySet | SfuError::InvalidState(_) => 1,
            SfuError::TransportNotReady(_) | SfuError::TransportConnectTimeout => 3,
            SfuError::PeerNotFound(_)
            | SfuError::PeerGone
            | SfuError::ProducerGone(_)
            | SfuError::UnknownTransport(_) => 4,
            SfuError::Conflict(_)
            | SfuError::DuplicateConsumption
            | SfuError::ProducerKindExists(_) => 5,
            SfuError::Internal(_) | SfuError::Config(_) | SfuError::Engine(_) => 6,
            SfuError::EngineUnavailable
            | SfuError::EngineTimeout(_)
            | SfuError::RoomCapacityExceeded(_)
            | SfuError::Draining => 7,
            SfuError::CannotConsume(_) | SfuError::IceOrDtlsFailed(_) => 8,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Internal(_) | SfuError::Config(_) | SfuError::Engine(_) => {
                "An internal error occurred".to_string()
            }
            SfuError::NoRoomJoined => "Join a room first".to_string(),
            SfuError::PeerNotFound(_) => "Peer not found".to_string(),
            SfuError::PeerGone => "Peer has left the room".to_string(),
            SfuError::TransportNotReady(_) => "Transport is not connected yet".to_string(),
            SfuError::TransportConnectTimeout => "Transport connection timed out".to_string(),
            SfuError::UnknownTransport(_) => "Unknown transport".to_string(),
            SfuError::DuplicateConsumption => "Already consuming this producer".to_string(),
            SfuError::ProducerGone(_) => "Producer is no longer available".to_string(),
            SfuError::ProducerKindExists(kind) => format!("Already producing {kind}"),
            SfuError::CannotConsume(_) => "Cannot consume this producer".to_string(),
            SfuError::AlreadySet => "Capabilities already set".to_string(),
            SfuError::InvalidState(_) => "Operation not allowed in current state".to_string(),
            SfuError::EngineUnavailable => {
                "Media server temporarily unavailable, please retry".to_string()
            }
            SfuError::EngineTimeout(_) => "Media server did not respond in time".to_string(),
            SfuError::IceOrDtlsFailed(_) => "Media connection failed".to_string(),
            SfuError::RoomCapacityExceeded(_) => "Room is at capacity".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::Conflict(msg) => msg.clone(),
        }
    }

    /// Whether the condition is resolved locally and reported as success-with-flag.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SfuError::DuplicateConsumption)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(SfuError::NoRoomJoined.error_code(), 1);
        assert_eq!(SfuError::AlreadySet.error_code(), 1);

        assert_eq!(SfuError::TransportNotReady("send").error_code(), 3);
        assert_eq!(SfuError::TransportConnectTimeout.error_code(), 3);

        assert_eq!(SfuError::PeerGone.error_code(), 4);
        assert_eq!(SfuError::ProducerGone("p-1".to_string()).error_code(), 4);

        assert_eq!(SfuError::DuplicateConsumption.error_code(), 5);
        assert_eq!(SfuError::ProducerKindExists("video").error_code(), 5);

        assert_eq!(SfuError::Internal("boom".to_string()).error_code(), 6);
        assert_eq!(SfuError::Engine("bad rtp".to_string()).error_code(), 6);

        assert_eq!(SfuError::EngineUnavailable.error_code(), 7);
        assert_eq!(SfuError::Draining.error_code(), 7);

        assert_eq!(SfuError::CannotConsume("codec".to_string()).error_code(), 8);
        assert_eq!(SfuError::IceOrDtlsFailed("t-1".to_string()).error_code(), 8);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = SfuError::Engine("worker pid 4242 rejected transport.connect".to_string());
        assert!(!err.client_message().contains("4242"));
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = SfuError::Internal("channel send failed: closed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: SfuError = EngineError::Unavailable.into();
        assert!(matches!(err, SfuError::EngineUnavailable));

        let err: SfuError = EngineError::Channel("stdin closed".to_string()).into();
        assert!(matches!(err, SfuError::EngineUnavailable));

        let err: SfuError = EngineError::NotFound("transport".to_string()).into();
        assert!(matches!(err, SfuError::Engine(_)));
    }

    #[test]
    fn test_only_duplicate_consumption_is_recoverable() {
        assert!(SfuError::DuplicateConsumption.is_recoverable());
        assert!(!SfuError::ProducerGone("p".to_string()).is_recoverable());
        assert!(!SfuError::EngineUnavailable.is_recoverable());
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", SfuError::ProducerKindExists("audio")),
            "Producer of kind audio already exists"
        );
        assert_eq!(
            format!("{}", SfuError::from(EngineError::Rejected("bad".to_string()))),
            "Media engine error: bad"
        );
    }
}
