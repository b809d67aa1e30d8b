//! A signaling connection without the socket.
//!
//! `SignalingProbe` drives a real [`SignalingSession`] the way the WebSocket
//! handler does: requests go through `handle`, notifications are taken from
//! the session's sink and passed through `observe` before the test sees them.

use crate::fixtures::{client_capabilities, client_dtls, parameters_for, TestPeer};
use common::types::{MediaKind, ProducerId, TransportDirection};
use sfu_controller::actors::{PeerEvent, RoomRegistryHandle, TransportPair};
use sfu_controller::discovery::ProducerAnnouncement;
use sfu_controller::engine::RtpCapabilities;
use sfu_controller::signaling::{ClientMessage, ClientRequest, ServerMessage, SignalingSession};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// How long `next_event` waits before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time given to in-flight notifications before `drain`.
pub const SETTLE: Duration = Duration::from_millis(200);

pub struct SignalingProbe {
    session: SignalingSession,
    events: UnboundedReceiver<PeerEvent>,
    next_id: u64,
    transports: Option<TransportPair>,
}

impl SignalingProbe {
    #[must_use]
    pub fn new(registry: RoomRegistryHandle) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        Self {
            session: SignalingSession::new(registry, sink),
            events,
            next_id: 1,
            transports: None,
        }
    }

    /// The connection id, which is also the peer id.
    #[must_use]
    pub fn peer_id(&self) -> String {
        self.session.connection_id().to_string()
    }

    #[must_use]
    pub fn room_id(&self) -> Option<String> {
        self.session.room_id().map(str::to_string)
    }

    /// Transports created by `join_ready`.
    ///
    /// # Panics
    ///
    /// Panics before `join_ready`.
    #[must_use]
    pub fn transports(&self) -> &TransportPair {
        self.transports.as_ref().expect("join_ready was called")
    }

    /// Send one request and return the response.
    ///
    /// # Panics
    ///
    /// Panics if the response does not echo the request id.
    pub async fn request(&mut self, message: ClientMessage) -> ServerMessage {
        let id = self.next_id;
        self.next_id += 1;
        let frame = self
            .session
            .handle(ClientRequest {
                id: Some(id),
                message,
            })
            .await;
        assert_eq!(frame.id, Some(id), "response echoes the request id");
        frame.message
    }

    pub async fn join(&mut self, room_id: &str, peer: &TestPeer) -> ServerMessage {
        self.request(ClientMessage::Join {
            room_id: room_id.to_string(),
            identity: peer.identity(),
        })
        .await
    }

    pub async fn set_capabilities(&mut self, rtp_capabilities: RtpCapabilities) -> ServerMessage {
        self.request(ClientMessage::SetCapabilities { rtp_capabilities })
            .await
    }

    pub async fn connect(&mut self, direction: TransportDirection) -> ServerMessage {
        let transports = self.transports().clone();
        let transport_id = match direction {
            TransportDirection::Send => transports.send.id,
            TransportDirection::Recv => transports.recv.id,
        };
        self.request(ClientMessage::ConnectTransport {
            transport_id,
            direction,
            dtls_parameters: client_dtls(),
        })
        .await
    }

    /// Join, negotiate, and connect both transports.
    ///
    /// # Panics
    ///
    /// Panics if any step of the handshake is rejected.
    pub async fn join_ready(&mut self, room_id: &str, peer: &TestPeer) -> TransportPair {
        self.join_ready_with(room_id, peer, client_capabilities())
            .await
    }

    /// `join_ready` with explicit receive capabilities.
    ///
    /// # Panics
    ///
    /// Panics if any step of the handshake is rejected.
    pub async fn join_ready_with(
        &mut self,
        room_id: &str,
        peer: &TestPeer,
        capabilities: RtpCapabilities,
    ) -> TransportPair {
        let joined = self.join(room_id, peer).await;
        assert!(
            matches!(joined, ServerMessage::Joined { .. }),
            "join accepted: {joined:?}"
        );

        let ServerMessage::TransportsCreated(transports) =
            self.set_capabilities(capabilities).await
        else {
            unreachable!("set-capabilities answers with transports-created");
        };
        self.transports = Some(transports.clone());

        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            let connected = self.connect(direction).await;
            assert!(
                matches!(connected, ServerMessage::TransportConnected { .. }),
                "{direction} transport connected: {connected:?}"
            );
        }

        transports
    }

    /// Produce a track of `kind`.
    ///
    /// # Panics
    ///
    /// Panics if the producer is not created.
    pub async fn produce(&mut self, kind: MediaKind) -> ProducerId {
        match self
            .request(ClientMessage::Produce {
                kind,
                rtp_parameters: parameters_for(kind),
            })
            .await
        {
            ServerMessage::ProducerCreated { producer_id, .. } => producer_id,
            other => unreachable!("produce rejected: {other:?}"),
        }
    }

    pub async fn produce_video(&mut self) -> ProducerId {
        self.produce(MediaKind::Video).await
    }

    pub async fn produce_audio(&mut self) -> ProducerId {
        self.produce(MediaKind::Audio).await
    }

    pub async fn consume(&mut self, producer_id: ProducerId) -> ServerMessage {
        self.request(ClientMessage::Consume {
            producer_id,
            rtp_capabilities: None,
        })
        .await
    }

    pub async fn leave(&mut self) -> ServerMessage {
        self.request(ClientMessage::Leave).await
    }

    /// Drop the connection without a `leave`.
    pub async fn disconnect(&mut self) {
        self.session.close().await;
    }

    /// Next notification.
    ///
    /// # Panics
    ///
    /// Panics if none arrives within [`EVENT_TIMEOUT`].
    pub async fn next_event(&mut self) -> ServerMessage {
        let event = tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("notification arrived in time")
            .expect("event channel open");
        self.session.observe(&event);
        event.into()
    }

    /// Skip notifications until one matches `wanted`.
    pub async fn expect_event(&mut self, wanted: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let message = self.next_event().await;
            if wanted(&message) {
                return message;
            }
        }
    }

    pub async fn expect_new_producer(&mut self) -> ProducerAnnouncement {
        match self
            .expect_event(|m| matches!(m, ServerMessage::NewProducerAvailable(_)))
            .await
        {
            ServerMessage::NewProducerAvailable(announcement) => announcement,
            _ => unreachable!(),
        }
    }

    pub async fn expect_existing_producers(&mut self) -> Vec<ProducerAnnouncement> {
        match self
            .expect_event(|m| matches!(m, ServerMessage::ExistingProducers { .. }))
            .await
        {
            ServerMessage::ExistingProducers { producers } => producers,
            _ => unreachable!(),
        }
    }

    /// Every notification that arrives within [`SETTLE`].
    pub async fn drain(&mut self) -> Vec<ServerMessage> {
        tokio::time::sleep(SETTLE).await;
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            self.session.observe(&event);
            drained.push(event.into());
        }
        drained
    }
}
