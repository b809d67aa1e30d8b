//! One signaling connection.
//!
//! A `SignalingSession` turns client requests into peer-actor operations and
//! builds the response frame. The connection id doubles as the peer id.
//! Server-initiated events reach the connection through the session's
//! [`PeerSink`]; [`SignalingSession::observe`] must see each of them so the
//! session notices when the server closed the peer.

use super::messages::{ClientMessage, ClientRequest, ServerFrame, ServerMessage};
use crate::actors::{
    ConnectOutcome, ConsumeOutcome, LeaveReason, PeerActorHandle, PeerEvent, PeerSink,
    RoomRegistryHandle,
};
use crate::engine::RtpCapabilities;
use crate::errors::SfuError;
use common::types::ProducerId;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub struct SignalingSession {
    connection_id: String,
    registry: RoomRegistryHandle,
    sink: PeerSink,
    peer: Option<PeerActorHandle>,
    /// Set once the joined peer has gone, so a repeated `leave` is answered again.
    left: bool,
}

impl SignalingSession {
    #[must_use]
    pub fn new(registry: RoomRegistryHandle, sink: PeerSink) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            registry,
            sink,
            peer: None,
            left: false,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Room currently joined, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.peer.as_ref().map(PeerActorHandle::room_id)
    }

    /// Parse and handle one text frame.
    pub async fn handle_text(&mut self, text: &str) -> ServerFrame {
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                debug!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Malformed signaling frame"
                );
                ServerFrame::notification(ServerMessage::Error {
                    code: 1,
                    message: "Malformed message".to_string(),
                })
            }
        }
    }

    /// Handle one request and build its response.
    #[instrument(
        skip_all,
        name = "sfu.signaling.request",
        fields(connection_id = %self.connection_id, kind = request.message.name())
    )]
    pub async fn handle(&mut self, request: ClientRequest) -> ServerFrame {
        let ClientRequest { id, message } = request;
        let name = message.name();

        let response = match self.dispatch(message).await {
            Ok(response) => response,
            Err(e) => {
                self.log_failure(name, &e);
                ServerMessage::error(&e)
            }
        };

        ServerFrame::response(id, response)
    }

    /// Track server-side peer closure.
    pub fn observe(&mut self, event: &PeerEvent) {
        if let PeerEvent::Closed { reason } = event {
            info!(
                target: "sfu.signaling",
                connection_id = %self.connection_id,
                reason = reason.as_str(),
                "Peer closed by server"
            );
            if self.peer.take().is_some() {
                self.left = true;
            }
        }
    }

    /// The connection dropped. Tears the peer down if still joined.
    pub async fn close(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.disconnect().await;
            info!(
                target: "sfu.signaling",
                connection_id = %self.connection_id,
                room_id = %peer.room_id(),
                "Signaling connection closed, peer released"
            );
        }
    }

    fn joined(&self) -> Result<&PeerActorHandle, SfuError> {
        self.peer.as_ref().ok_or(SfuError::NoRoomJoined)
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<ServerMessage, SfuError> {
        match message {
            ClientMessage::Join { room_id, identity } => {
                if self.peer.is_some() {
                    return Err(SfuError::InvalidState("already joined".to_string()));
                }
                let joined = self
                    .registry
                    .join(
                        &room_id,
                        self.connection_id.clone(),
                        identity,
                        self.sink.clone(),
                    )
                    .await?;
                info!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    room_id = %joined.room_id,
                    "Joined room"
                );
                let response = ServerMessage::Joined {
                    peer_id: self.connection_id.clone(),
                    room_id: joined.room_id.clone(),
                    router_rtp_capabilities: joined.router_capabilities,
                    peers: joined.peers,
                };
                self.peer = Some(joined.handle);
                self.left = false;
                Ok(response)
            }

            ClientMessage::SetCapabilities { rtp_capabilities } => {
                let peer = self.joined()?;
                peer.set_capabilities(rtp_capabilities).await?;
                let transports = peer.create_transports().await?;
                Ok(ServerMessage::TransportsCreated(transports))
            }

            ClientMessage::ConnectTransport {
                transport_id,
                direction,
                dtls_parameters,
            } => {
                let outcome = self
                    .joined()?
                    .connect_transport(transport_id, direction, dtls_parameters)
                    .await?;
                Ok(ServerMessage::TransportConnected {
                    transport_id,
                    direction,
                    already_connected: outcome == ConnectOutcome::AlreadyConnected,
                })
            }

            ClientMessage::Produce {
                kind,
                rtp_parameters,
            } => {
                let producer_id = self.joined()?.produce(kind, rtp_parameters).await?;
                Ok(ServerMessage::ProducerCreated { producer_id, kind })
            }

            ClientMessage::CloseProducer { producer_id } => {
                self.joined()?.close_producer(producer_id).await?;
                Ok(ServerMessage::ProducerStopped { producer_id })
            }

            ClientMessage::RestartIce { transport_id, .. } => {
                let ice_parameters = self.joined()?.restart_ice(transport_id).await?;
                Ok(ServerMessage::IceRestarted {
                    transport_id,
                    ice_parameters,
                })
            }

            ClientMessage::Leave => {
                let Some(peer) = self.peer.take() else {
                    if self.left {
                        return Ok(ServerMessage::Left {
                            reason: LeaveReason::Left,
                        });
                    }
                    return Err(SfuError::NoRoomJoined);
                };
                peer.leave().await;
                self.left = true;
                info!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    room_id = %peer.room_id(),
                    "Left room"
                );
                Ok(ServerMessage::Left {
                    reason: LeaveReason::Left,
                })
            }

            // Failures answer with `consumer-creation-failed` for this producer
            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => match self.consume(producer_id, rtp_capabilities).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    self.log_failure("consume", &e);
                    Ok(ServerMessage::ConsumerCreationFailed {
                        producer_id,
                        code: e.error_code(),
                        message: e.client_message(),
                    })
                }
            },
        }
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: Option<RtpCapabilities>,
    ) -> Result<ServerMessage, SfuError> {
        match self.joined()?.consume(producer_id, capabilities).await? {
            ConsumeOutcome::Created(descriptor) => Ok(ServerMessage::ConsumerCreated(descriptor)),
            ConsumeOutcome::AlreadyConsuming { producer_id } => {
                Ok(ServerMessage::ConsumeSkipped { producer_id })
            }
        }
    }

    fn log_failure(&self, request: &'static str, err: &SfuError) {
        match err {
            SfuError::Internal(_) | SfuError::Engine(_) | SfuError::Config(_) => {
                warn!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    request,
                    error = %err,
                    "Signaling request failed"
                );
            }
            _ => {
                debug!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    request,
                    error = %err,
                    "Signaling request rejected"
                );
            }
        }
    }
}
