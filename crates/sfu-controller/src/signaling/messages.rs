//! Signaling wire format.
//!
//! JSON text frames: `{"id": 7, "type": "produce", "data": {...}}`. Responses
//! echo the request `id`; notifications carry none.

use crate::actors::messages::{FailureLayer, LeaveReason, PeerEvent, PeerIdentity, PeerSummary};
use crate::actors::TransportPair;
use crate::discovery::ProducerAnnouncement;
use crate::engine::{
    ConsumerDescriptor, DtlsParameters, DtlsState, IceParameters, IceState, RtpCapabilities,
    RtpParameters,
};
use crate::errors::SfuError;
use common::types::{ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};
use serde::{Deserialize, Serialize};

/// A client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Join {
        room_id: String,
        #[serde(flatten)]
        identity: PeerIdentity,
    },
    /// Negotiate receive capabilities; answered with `transports-created`.
    SetCapabilities { rtp_capabilities: RtpCapabilities },
    ConnectTransport {
        transport_id: TransportId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    CloseProducer { producer_id: ProducerId },
    Consume {
        producer_id: ProducerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtp_capabilities: Option<RtpCapabilities>,
    },
    RestartIce {
        transport_id: TransportId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<TransportDirection>,
    },
    Leave,
}

impl ClientMessage {
    /// Wire name, for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::SetCapabilities { .. } => "set-capabilities",
            ClientMessage::ConnectTransport { .. } => "connect-transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::RestartIce { .. } => "restart-ice",
            ClientMessage::Leave => "leave",
        }
    }
}

/// A server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerFrame {
    #[must_use]
    pub fn response(id: Option<u64>, message: ServerMessage) -> Self {
        Self { id, message }
    }

    #[must_use]
    pub fn notification(message: ServerMessage) -> Self {
        Self { id: None, message }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Joined {
        peer_id: String,
        room_id: String,
        router_rtp_capabilities: RtpCapabilities,
        /// Peers that already completed their handshake.
        peers: Vec<PeerSummary>,
    },
    TransportsCreated(TransportPair),
    TransportConnected {
        transport_id: TransportId,
        direction: TransportDirection,
        already_connected: bool,
    },
    ProducerCreated {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    /// Answer to `close-producer`.
    ProducerStopped { producer_id: ProducerId },
    NewProducerAvailable(ProducerAnnouncement),
    ExistingProducers { producers: Vec<ProducerAnnouncement> },
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: String,
    },
    ConsumerCreated(ConsumerDescriptor),
    ConsumerCreationFailed {
        producer_id: ProducerId,
        code: i32,
        message: String,
    },
    /// The producer was already being consumed; nothing was created.
    ConsumeSkipped { producer_id: ProducerId },
    ConsumerResumed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    IceRestarted {
        transport_id: TransportId,
        ice_parameters: IceParameters,
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
        code: i32,
        message: String,
    },
    UserJoinedVideo {
        peer_id: String,
        #[serde(flatten)]
        identity: PeerIdentity,
    },
    UserLeftVideo {
        peer_id: String,
        room_id: String,
        #[serde(flatten)]
        identity: PeerIdentity,
        reason: LeaveReason,
    },
    Left { reason: LeaveReason },
    Error { code: i32, message: String },
}

impl ServerMessage {
    /// Client-safe error frame.
    #[must_use]
    pub fn error(err: &SfuError) -> Self {
        ServerMessage::Error {
            code: err.error_code(),
            message: err.client_message(),
        }
    }
}

impl From<PeerEvent> for ServerMessage {
    fn from(event: PeerEvent) -> Self {
        match event {
            PeerEvent::NewProducerAvailable(announcement) => {
                ServerMessage::NewProducerAvailable(announcement)
            }
            PeerEvent::ExistingProducers(producers) => {
                ServerMessage::ExistingProducers { producers }
            }
            PeerEvent::ProducerClosed {
                producer_id,
                peer_id,
            } => ServerMessage::ProducerClosed {
                producer_id,
                peer_id,
            },
            PeerEvent::ConsumerResumed {
                consumer_id,
                producer_id,
            } => ServerMessage::ConsumerResumed {
                consumer_id,
                producer_id,
            },
            PeerEvent::TransportStateChanged {
                transport_id,
                direction,
                ice_state,
                dtls_state,
            } => ServerMessage::TransportStateChanged {
                transport_id,
                direction,
                ice_state,
                dtls_state,
            },
            PeerEvent::TransportFailed {
                transport_id,
                direction,
                layer,
            } => {
                let err = SfuError::IceOrDtlsFailed(format!("{direction} transport {}", layer.as_str()));
                ServerMessage::TransportFailed {
                    transport_id,
                    direction,
                    layer,
                    code: err.error_code(),
                    message: err.client_message(),
                }
            }
            PeerEvent::UserJoined { peer_id, identity } => {
                ServerMessage::UserJoinedVideo { peer_id, identity }
            }
            PeerEvent::UserLeft {
                peer_id,
                room_id,
                identity,
                reason,
            } => ServerMessage::UserLeftVideo {
                peer_id,
                room_id,
                identity,
                reason,
            },
            PeerEvent::Closed { reason } => ServerMessage::Left { reason },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> PeerIdentity {
        PeerIdentity {
            user_id: "u-1".to_string(),
            display_name: "Ada".to_string(),
            role: "teacher".to_string(),
        }
    }

    #[test]
    fn test_join_frame_parses() {
        let request: ClientRequest = serde_json::from_value(json!({
            "id": 1,
            "type": "join",
            "data": {
                "roomId": "class-7",
                "userId": "u-1",
                "displayName": "Ada",
                "role": "teacher"
            }
        }))
        .unwrap();

        assert_eq!(request.id, Some(1));
        assert_eq!(
            request.message,
            ClientMessage::Join {
                room_id: "class-7".to_string(),
                identity: identity(),
            }
        );
    }

    #[test]
    fn test_leave_needs_no_data() {
        let request: ClientRequest =
            serde_json::from_value(json!({"type": "leave"})).unwrap();
        assert_eq!(request.id, None);
        assert_eq!(request.message, ClientMessage::Leave);
    }

    #[test]
    fn test_consume_capabilities_are_optional() {
        let producer_id = ProducerId::new();
        let request: ClientRequest = serde_json::from_value(json!({
            "id": 9,
            "type": "consume",
            "data": {"producerId": producer_id.to_string()}
        }))
        .unwrap();

        assert_eq!(
            request.message,
            ClientMessage::Consume {
                producer_id,
                rtp_capabilities: None,
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_value::<ClientRequest>(json!({"type": "dance"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_notification_omits_id() {
        let frame = ServerFrame::notification(ServerMessage::Left {
            reason: LeaveReason::TransportFailed,
        });
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(
            value,
            json!({"type": "left", "data": {"reason": "transport-failed"}})
        );
    }

    #[test]
    fn test_user_left_flattens_identity() {
        let message = ServerMessage::from(PeerEvent::UserLeft {
            peer_id: "p1".to_string(),
            room_id: "class-7".to_string(),
            identity: identity(),
            reason: LeaveReason::Disconnected,
        });
        let value = serde_json::to_value(ServerFrame::notification(message)).unwrap();

        assert_eq!(value["type"], "user-left-video");
        assert_eq!(value["data"]["peerId"], "p1");
        assert_eq!(value["data"]["roomId"], "class-7");
        assert_eq!(value["data"]["displayName"], "Ada");
        assert_eq!(value["data"]["reason"], "disconnected");
    }

    #[test]
    fn test_transport_failed_carries_media_failure_code() {
        let transport_id = TransportId::new();
        let message = ServerMessage::from(PeerEvent::TransportFailed {
            transport_id,
            direction: TransportDirection::Recv,
            layer: FailureLayer::Dtls,
        });

        assert_eq!(
            message,
            ServerMessage::TransportFailed {
                transport_id,
                direction: TransportDirection::Recv,
                layer: FailureLayer::Dtls,
                code: 8,
                message: "Media connection failed".to_string(),
            }
        );
    }

    #[test]
    fn test_error_frame_hides_internal_detail() {
        let frame = ServerFrame::response(
            Some(3),
            ServerMessage::error(&SfuError::Internal("db exploded".to_string())),
        );
        let text = serde_json::to_string(&frame).unwrap();

        assert!(!text.contains("db exploded"));
        assert_eq!(
            serde_json::from_str::<ServerFrame>(&text).unwrap(),
            frame
        );
    }
}
