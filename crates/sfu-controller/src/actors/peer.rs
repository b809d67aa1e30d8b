//! `PeerActor` - owns one peer's transports, producers and consumers.
//!
//! Every operation for a peer goes through this actor's mailbox, so the
//! peer's own engine resources need no locking and a `leave` queued behind a
//! `produce` or `consume` runs after it. Messages still queued when the peer
//! stops are answered with `PeerGone`.
//!
//! # Lifecycle
//!
//! ```text
//! Joining -> CapabilitiesSet -> TransportsCreated -> Active -> Leaving -> Closed
//! ```
//!
//! # Teardown order
//!
//! 1. Room retracts the peer's producers and sends `producer-closed`
//! 2. Producers closed
//! 3. Consumers closed
//! 4. Transports closed
//! 5. Room drops the peer record and sends `user-left-video`
//!
//! Engine closes are skipped when the engine is down; its objects died with
//! the worker.

use super::messages::{
    ConnectOutcome, ConsumeOutcome, ConsumerStatus, FailureLayer, LeaveReason, PeerEvent,
    PeerIdentity, PeerMessage, PeerPhase, PeerSink, PeerState, ProducerStatus, TransportPair,
    TransportStatus,
};
use super::metrics::{mailbox_depth, ActorType, MailboxMonitor};
use super::room::RoomActorHandle;
use super::{engine_call, send_detached};
use crate::config::SessionSettings;
use crate::discovery::ProducerAnnouncement;
use crate::engine::{
    ConsumerDescriptor, DtlsParameters, DtlsState, EngineEvent, EngineSupervisor, IceParameters,
    IceState, RtpCapabilities, RtpParameters, TransportDescriptor,
};
use crate::errors::{EngineError, SfuError};
use crate::observability::metrics as prom;

use common::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportDirection, TransportId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the peer mailbox.
const PEER_CHANNEL_BUFFER: usize = 100;

/// Everything a peer actor needs from its room at creation.
pub struct PeerContext {
    pub peer_id: String,
    pub room_id: String,
    pub identity: PeerIdentity,
    pub router_id: RouterId,
    pub room: RoomActorHandle,
    pub supervisor: Arc<EngineSupervisor>,
    pub sink: PeerSink,
    pub settings: SessionSettings,
}

/// Handle to a `PeerActor`.
///
/// Operations on a peer that has already gone fail with `PeerGone`.
#[derive(Clone)]
pub struct PeerActorHandle {
    sender: mpsc::Sender<PeerMessage>,
    cancel_token: CancellationToken,
    peer_id: String,
    room_id: String,
}

impl PeerActorHandle {
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> PeerMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| SfuError::PeerGone)?;
        rx.await.map_err(|_| SfuError::PeerGone)
    }

    /// Store the peer's receive capabilities. Single-shot.
    pub async fn set_capabilities(&self, capabilities: RtpCapabilities) -> Result<(), SfuError> {
        self.request(|respond_to| PeerMessage::SetCapabilities {
            capabilities,
            respond_to,
        })
        .await?
    }

    /// Create the send and receive transports.
    pub async fn create_transports(&self) -> Result<TransportPair, SfuError> {
        self.request(|respond_to| PeerMessage::CreateTransports { respond_to })
            .await?
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> Result<ConnectOutcome, SfuError> {
        self.request(|respond_to| PeerMessage::ConnectTransport {
            transport_id,
            direction,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SfuError> {
        self.request(|respond_to| PeerMessage::Produce {
            kind,
            rtp_parameters,
            respond_to,
        })
        .await?
    }

    /// Stop one of this peer's producers.
    pub async fn close_producer(&self, producer_id: ProducerId) -> Result<(), SfuError> {
        self.request(|respond_to| PeerMessage::CloseProducer {
            producer_id,
            respond_to,
        })
        .await?
    }

    /// Consume a producer; `capabilities` defaults to the negotiated ones.
    pub async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: Option<RtpCapabilities>,
    ) -> Result<ConsumeOutcome, SfuError> {
        self.request(|respond_to| PeerMessage::Consume {
            producer_id,
            capabilities,
            respond_to,
        })
        .await?
    }

    pub async fn restart_ice(&self, transport_id: TransportId) -> Result<IceParameters, SfuError> {
        self.request(|respond_to| PeerMessage::RestartIce {
            transport_id,
            respond_to,
        })
        .await?
    }

    /// Leave the room. Returns once teardown has completed; safe to repeat.
    pub async fn leave(&self) {
        self.leave_with(LeaveReason::Left).await;
    }

    /// The signaling connection dropped.
    pub async fn disconnect(&self) {
        self.leave_with(LeaveReason::Disconnected).await;
    }

    async fn leave_with(&self, reason: LeaveReason) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PeerMessage::Leave {
                reason,
                respond_to: tx,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn get_state(&self) -> Result<PeerState, SfuError> {
        self.request(|respond_to| PeerMessage::GetState { respond_to })
            .await
    }

    /// A producer this peer consumes was closed. Never blocks.
    pub(crate) fn producer_closed(&self, producer_id: ProducerId) {
        send_detached(&self.sender, PeerMessage::ProducerClosed { producer_id });
    }

    /// Cancel the peer actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[derive(Debug)]
struct TransportEntry {
    id: TransportId,
    direction: TransportDirection,
    connected: bool,
    ice_state: IceState,
    dtls_state: DtlsState,
    ice_failed: bool,
    dtls_failed: bool,
}

impl TransportEntry {
    fn new(descriptor: &TransportDescriptor) -> Self {
        Self {
            id: descriptor.id,
            direction: descriptor.direction,
            connected: false,
            ice_state: IceState::New,
            dtls_state: DtlsState::New,
            ice_failed: false,
            dtls_failed: false,
        }
    }

    fn failed(&self) -> bool {
        self.ice_failed || self.dtls_failed
    }

    fn status(&self) -> TransportStatus {
        TransportStatus {
            transport_id: self.id,
            direction: self.direction,
            connected: self.connected,
            ice_state: self.ice_state,
            dtls_state: self.dtls_state,
            failed: self.failed(),
        }
    }
}

#[derive(Debug)]
struct ConsumerEntry {
    producer_id: ProducerId,
    kind: MediaKind,
    paused: bool,
}

/// The `PeerActor` implementation.
pub struct PeerActor {
    peer_id: String,
    room_id: String,
    identity: PeerIdentity,
    router_id: RouterId,
    receiver: mpsc::Receiver<PeerMessage>,
    /// For self-scheduled messages; does not keep the mailbox open.
    self_sender: mpsc::WeakSender<PeerMessage>,
    cancel_token: CancellationToken,
    room: RoomActorHandle,
    supervisor: Arc<EngineSupervisor>,
    sink: PeerSink,
    settings: SessionSettings,
    engine_events: Option<broadcast::Receiver<EngineEvent>>,
    phase: PeerPhase,
    capabilities: Option<RtpCapabilities>,
    send_transport: Option<TransportEntry>,
    recv_transport: Option<TransportEntry>,
    producers: HashMap<ProducerId, MediaKind>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    /// Set while a transport is failed; the peer is torn down when it passes.
    failure_deadline: Option<Instant>,
    leave_waiters: Vec<oneshot::Sender<()>>,
    mailbox: MailboxMonitor,
}

impl PeerActor {
    /// Create a peer actor without starting it.
    ///
    /// The room spawns [`PeerActor::run`] once the peer is registered.
    #[must_use]
    pub fn new(context: PeerContext, cancel_token: CancellationToken) -> (PeerActorHandle, Self) {
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_BUFFER);
        let engine_events = Some(context.supervisor.subscribe());

        let handle = PeerActorHandle {
            sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            peer_id: context.peer_id.clone(),
            room_id: context.room_id.clone(),
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Peer, &context.peer_id),
            peer_id: context.peer_id,
            room_id: context.room_id,
            identity: context.identity,
            router_id: context.router_id,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token,
            room: context.room,
            supervisor: context.supervisor,
            sink: context.sink,
            settings: context.settings,
            engine_events,
            phase: PeerPhase::Joining,
            capabilities: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            failure_deadline: None,
            leave_waiters: Vec::new(),
        };

        (handle, actor)
    }

    #[instrument(
        skip_all,
        name = "sfu.actor.peer",
        fields(room_id = %self.room_id, peer_id = %self.peer_id)
    )]
    pub(crate) async fn run(mut self) {
        debug!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            "PeerActor started"
        );

        let reason = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break LeaveReason::RoomClosed,

                () = sleep_until(self.failure_deadline) => {
                    warn!(
                        target: "sfu.actor.peer",
                        room_id = %self.room_id,
                        peer_id = %self.peer_id,
                        "Transport did not recover in time, closing peer"
                    );
                    break LeaveReason::TransportFailed;
                }

                event = next_engine_event(&mut self.engine_events) => {
                    match event {
                        Some(event) => self.handle_engine_event(event),
                        None => self.engine_events = None,
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_depth(mailbox_depth(&self.receiver));
                            if let Some(reason) = self.handle_message(message).await {
                                break reason;
                            }
                        }
                        None => break LeaveReason::Disconnected,
                    }
                }
            }
        };

        self.teardown(reason).await;

        for waiter in self.leave_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.drain_mailbox();

        info!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            reason = reason.as_str(),
            messages_processed = self.mailbox.messages_processed(),
            "PeerActor stopped"
        );
    }

    /// Handle a single message. Returns the leave reason when the peer must stop.
    async fn handle_message(&mut self, message: PeerMessage) -> Option<LeaveReason> {
        match message {
            PeerMessage::SetCapabilities {
                capabilities,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_capabilities(capabilities));
            }

            PeerMessage::CreateTransports { respond_to } => {
                let result = self.create_transports().await;
                let _ = respond_to.send(result);
            }

            PeerMessage::ConnectTransport {
                transport_id,
                direction,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .connect_transport(transport_id, direction, dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            PeerMessage::Produce {
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self.produce(kind, rtp_parameters).await;
                let _ = respond_to.send(result);
            }

            PeerMessage::CloseProducer {
                producer_id,
                respond_to,
            } => {
                self.close_producer(producer_id).await;
                let _ = respond_to.send(Ok(()));
            }

            PeerMessage::Consume {
                producer_id,
                capabilities,
                respond_to,
            } => {
                let result = self.consume(producer_id, capabilities).await;
                let _ = respond_to.send(result);
            }

            PeerMessage::RestartIce {
                transport_id,
                respond_to,
            } => {
                let result = self.restart_ice(transport_id).await;
                let _ = respond_to.send(result);
            }

            PeerMessage::Leave { reason, respond_to } => {
                self.leave_waiters.push(respond_to);
                return Some(reason);
            }

            PeerMessage::ProducerClosed { producer_id } => {
                self.close_consumers_of(producer_id).await;
            }

            PeerMessage::ResumeConsumer { consumer_id } => {
                self.resume_consumer(consumer_id).await;
            }

            PeerMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }
        None
    }

    fn set_capabilities(&mut self, capabilities: RtpCapabilities) -> Result<(), SfuError> {
        if self.capabilities.is_some() {
            return Err(SfuError::AlreadySet);
        }
        if capabilities.codecs.is_empty() {
            return Err(SfuError::InvalidState(
                "capabilities contain no codecs".to_string(),
            ));
        }

        self.capabilities = Some(capabilities);
        self.phase = PeerPhase::CapabilitiesSet;
        debug!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            "Capabilities set"
        );
        Ok(())
    }

    async fn create_transports(&mut self) -> Result<TransportPair, SfuError> {
        match self.phase {
            PeerPhase::CapabilitiesSet => {}
            PeerPhase::Joining => {
                return Err(SfuError::InvalidState("capabilities not set".to_string()));
            }
            _ => {
                return Err(SfuError::InvalidState(
                    "transports already created".to_string(),
                ));
            }
        }

        let engine = self.supervisor.engine().await?;
        let timeout = self.settings.engine_operation_timeout;

        let send = engine_call(
            "create_transport",
            timeout,
            engine.create_transport(self.router_id, TransportDirection::Send),
        )
        .await??;

        let recv = engine_call(
            "create_transport",
            timeout,
            engine.create_transport(self.router_id, TransportDirection::Recv),
        )
        .await
        .and_then(|r| r.map_err(SfuError::from));
        let recv = match recv {
            Ok(recv) => recv,
            Err(e) => {
                self.close_quietly("close_transport", engine.close_transport(send.id))
                    .await;
                return Err(e);
            }
        };

        self.send_transport = Some(TransportEntry::new(&send));
        self.recv_transport = Some(TransportEntry::new(&recv));
        self.phase = PeerPhase::TransportsCreated;

        info!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            send_transport_id = %send.id,
            recv_transport_id = %recv.id,
            "Transports created"
        );

        self.room.peer_ready(self.peer_id.clone()).await?;

        Ok(TransportPair { send, recv })
    }

    async fn connect_transport(
        &mut self,
        transport_id: TransportId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> Result<ConnectOutcome, SfuError> {
        let Some(entry) = self.transport(direction) else {
            return Err(SfuError::InvalidState("transports not created".to_string()));
        };
        if entry.id != transport_id {
            return Err(SfuError::UnknownTransport(transport_id.to_string()));
        }
        if entry.connected {
            debug!(
                target: "sfu.actor.peer",
                room_id = %self.room_id,
                peer_id = %self.peer_id,
                transport_id = %transport_id,
                "Transport already connected"
            );
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let engine = self.supervisor.engine().await?;
        let result = engine_call(
            "connect_transport",
            self.settings.transport_connect_timeout,
            engine.connect_transport(transport_id, dtls_parameters),
        )
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(
                    target: "sfu.actor.peer",
                    room_id = %self.room_id,
                    peer_id = %self.peer_id,
                    transport_id = %transport_id,
                    "Transport connect timed out"
                );
                return Err(SfuError::TransportConnectTimeout);
            }
        }

        if let Some(entry) = self.transport_mut(direction) {
            entry.connected = true;
        }
        if self.phase == PeerPhase::TransportsCreated {
            self.phase = PeerPhase::Active;
        }

        info!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            transport_id = %transport_id,
            direction = %direction,
            "Transport connected"
        );
        Ok(ConnectOutcome::Connected)
    }

    async fn produce(
        &mut self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SfuError> {
        let send_id = match &self.send_transport {
            Some(transport) if transport.connected => transport.id,
            _ => return Err(SfuError::TransportNotReady("send")),
        };
        if self.producers.values().any(|existing| *existing == kind) {
            return Err(SfuError::ProducerKindExists(kind.as_str()));
        }

        let engine = self.supervisor.engine().await?;
        let producer_id = engine_call(
            "produce",
            self.settings.engine_operation_timeout,
            engine.produce(send_id, kind, rtp_parameters),
        )
        .await??;

        let announcement = ProducerAnnouncement {
            producer_id,
            kind,
            peer_id: self.peer_id.clone(),
            identity: self.identity.clone(),
        };
        if let Err(e) = self.room.producer_created(announcement).await {
            self.close_quietly("close_producer", engine.close_producer(producer_id))
                .await;
            return Err(e);
        }

        self.producers.insert(producer_id, kind);
        prom::record_producer_created(kind.as_str());

        info!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Client stopped a track. Unknown ids are ignored.
    async fn close_producer(&mut self, producer_id: ProducerId) {
        let Some(kind) = self.producers.remove(&producer_id) else {
            debug!(
                target: "sfu.actor.peer",
                room_id = %self.room_id,
                peer_id = %self.peer_id,
                producer_id = %producer_id,
                "Close requested for unknown producer"
            );
            return;
        };

        if let Err(e) = self
            .room
            .producer_closed(self.peer_id.clone(), producer_id)
            .await
        {
            warn!(
                target: "sfu.actor.peer",
                room_id = %self.room_id,
                peer_id = %self.peer_id,
                error = %e,
                "Room did not acknowledge producer close"
            );
        }

        if let Ok(engine) = self.supervisor.engine().await {
            self.close_quietly("close_producer", engine.close_producer(producer_id))
                .await;
        }
        prom::record_producer_closed(kind.as_str());

        info!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            producer_id = %producer_id,
            "Producer closed"
        );
    }

    async fn consume(
        &mut self,
        producer_id: ProducerId,
        capabilities: Option<RtpCapabilities>,
    ) -> Result<ConsumeOutcome, SfuError> {
        let result = self.try_consume(producer_id, capabilities).await;
        match &result {
            Ok(ConsumeOutcome::Created(_)) => {}
            Ok(ConsumeOutcome::AlreadyConsuming { .. }) => {
                prom::record_consume_rejected("duplicate");
            }
            Err(e) => {
                debug!(
                    target: "sfu.actor.peer",
                    room_id = %self.room_id,
                    peer_id = %self.peer_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Consume failed"
                );
                prom::record_consume_rejected(rejection_reason(e));
            }
        }
        result
    }

    /// Reserve, then create, then confirm. The reservation is released if creation fails.
    async fn try_consume(
        &mut self,
        producer_id: ProducerId,
        capabilities: Option<RtpCapabilities>,
    ) -> Result<ConsumeOutcome, SfuError> {
        let Some(capabilities) = capabilities.or_else(|| self.capabilities.clone()) else {
            return Err(SfuError::InvalidState("capabilities not set".to_string()));
        };
        let recv_id = match &self.recv_transport {
            Some(transport) if transport.connected => transport.id,
            _ => return Err(SfuError::TransportNotReady("recv")),
        };
        if self.consumers.values().any(|c| c.producer_id == producer_id) {
            return Ok(ConsumeOutcome::AlreadyConsuming { producer_id });
        }

        match self
            .room
            .reserve_consumption(self.peer_id.clone(), producer_id)
            .await
        {
            Ok(()) => {}
            Err(SfuError::DuplicateConsumption) => {
                return Ok(ConsumeOutcome::AlreadyConsuming { producer_id });
            }
            Err(e) => return Err(e),
        }

        let descriptor = match self
            .create_consumer(recv_id, producer_id, capabilities)
            .await
        {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.room
                    .release_consumption(self.peer_id.clone(), producer_id);
                return Err(e);
            }
        };

        if let Err(e) = self
            .room
            .confirm_consumption(self.peer_id.clone(), producer_id, descriptor.id)
            .await
        {
            if let Ok(engine) = self.supervisor.engine().await {
                self.close_quietly("close_consumer", engine.close_consumer(descriptor.id))
                    .await;
            }
            return Err(e);
        }

        self.consumers.insert(
            descriptor.id,
            ConsumerEntry {
                producer_id,
                kind: descriptor.kind,
                paused: true,
            },
        );
        prom::record_consumer_created(descriptor.kind.as_str());
        self.schedule_resume(descriptor.id);

        info!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            producer_id = %producer_id,
            consumer_id = %descriptor.id,
            "Consumer created"
        );
        Ok(ConsumeOutcome::Created(descriptor))
    }

    async fn create_consumer(
        &self,
        recv_id: TransportId,
        producer_id: ProducerId,
        capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescriptor, SfuError> {
        let engine = self.supervisor.engine().await?;
        let timeout = self.settings.engine_operation_timeout;

        match engine_call(
            "can_consume",
            timeout,
            engine.can_consume(self.router_id, producer_id, &capabilities),
        )
        .await?
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(SfuError::CannotConsume(
                    "incompatible receive capabilities".to_string(),
                ));
            }
            Err(EngineError::NotFound(_)) => {
                return Err(SfuError::ProducerGone(producer_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        match engine_call(
            "consume",
            timeout,
            engine.consume(recv_id, producer_id, capabilities),
        )
        .await?
        {
            Ok(descriptor) => Ok(descriptor),
            Err(EngineError::NotFound(_)) => Err(SfuError::ProducerGone(producer_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Resume a new consumer after the settle delay.
    fn schedule_resume(&self, consumer_id: ConsumerId) {
        let sender = self.self_sender.clone();
        let delay = self.settings.consumer_resume_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(PeerMessage::ResumeConsumer { consumer_id })
                    .await;
            }
        });
    }

    async fn resume_consumer(&mut self, consumer_id: ConsumerId) {
        let Some(producer_id) = self
            .consumers
            .get(&consumer_id)
            .filter(|c| c.paused)
            .map(|c| c.producer_id)
        else {
            return;
        };

        let engine = match self.supervisor.engine().await {
            Ok(engine) => engine,
            Err(e) => {
                warn!(
                    target: "sfu.actor.peer",
                    room_id = %self.room_id,
                    peer_id = %self.peer_id,
                    consumer_id = %consumer_id,
                    error = %e,
                    "Cannot resume consumer"
                );
                return;
            }
        };

        let result = engine_call(
            "resume_consumer",
            self.settings.engine_operation_timeout,
            engine.resume_consumer(consumer_id),
        )
        .await
        .and_then(|r| r.map_err(SfuError::from));

        match result {
            Ok(()) => {
                if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                    consumer.paused = false;
                }
                let _ = self.sink.send(PeerEvent::ConsumerResumed {
                    consumer_id,
                    producer_id,
                });
                debug!(
                    target: "sfu.actor.peer",
                    room_id = %self.room_id,
                    peer_id = %self.peer_id,
                    consumer_id = %consumer_id,
                    "Consumer resumed"
                );
            }
            Err(e) => {
                warn!(
                    target: "sfu.actor.peer",
                    room_id = %self.room_id,
                    peer_id = %self.peer_id,
                    consumer_id = %consumer_id,
                    error = %e,
                    "Consumer resume failed"
                );
            }
        }
    }

    /// Close every consumer built from a producer that went away.
    async fn close_consumers_of(&mut self, producer_id: ProducerId) {
        let closing: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id == producer_id)
            .map(|(id, _)| *id)
            .collect();
        if closing.is_empty() {
            return;
        }

        let engine = self.supervisor.engine().await.ok();
        for consumer_id in closing {
            self.consumers.remove(&consumer_id);
            if let Some(engine) = &engine {
                self.close_quietly("close_consumer", engine.close_consumer(consumer_id))
                    .await;
            }
            debug!(
                target: "sfu.actor.peer",
                room_id = %self.room_id,
                peer_id = %self.peer_id,
                consumer_id = %consumer_id,
                producer_id = %producer_id,
                "Consumer closed, producer gone"
            );
        }
    }

    async fn restart_ice(&mut self, transport_id: TransportId) -> Result<IceParameters, SfuError> {
        let Some(direction) = self.direction_of(transport_id) else {
            return Err(SfuError::UnknownTransport(transport_id.to_string()));
        };

        let engine = self.supervisor.engine().await?;
        let parameters = engine_call(
            "restart_ice",
            self.settings.engine_operation_timeout,
            engine.restart_ice(transport_id),
        )
        .await??;

        if let Some(entry) = self.transport_mut(direction) {
            entry.ice_failed = false;
            entry.dtls_failed = false;
        }
        self.refresh_failure_deadline();

        info!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            transport_id = %transport_id,
            "ICE restarted"
        );
        Ok(parameters)
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::IceStateChanged {
                transport_id,
                state,
            } => {
                let Some(direction) = self.direction_of(transport_id) else {
                    return;
                };
                if let Some(entry) = self.transport_mut(direction) {
                    entry.ice_state = state;
                }
                self.report_state(direction);

                if state == IceState::Failed {
                    self.transport_failed(direction, FailureLayer::Ice);
                } else if state.is_connected() {
                    self.transport_recovered(direction, FailureLayer::Ice);
                }
            }

            EngineEvent::DtlsStateChanged {
                transport_id,
                state,
            } => {
                let Some(direction) = self.direction_of(transport_id) else {
                    return;
                };
                if let Some(entry) = self.transport_mut(direction) {
                    entry.dtls_state = state;
                }
                self.report_state(direction);

                if state == DtlsState::Failed {
                    self.transport_failed(direction, FailureLayer::Dtls);
                } else if state == DtlsState::Connected {
                    self.transport_recovered(direction, FailureLayer::Dtls);
                }
            }

            EngineEvent::WorkerDied { reason } => {
                if self.send_transport.is_some() {
                    warn!(
                        target: "sfu.actor.peer",
                        room_id = %self.room_id,
                        peer_id = %self.peer_id,
                        reason = %reason,
                        "Media engine died under an established session"
                    );
                }
            }
        }
    }

    fn report_state(&self, direction: TransportDirection) {
        if let Some(entry) = self.transport(direction) {
            let _ = self.sink.send(PeerEvent::TransportStateChanged {
                transport_id: entry.id,
                direction,
                ice_state: entry.ice_state,
                dtls_state: entry.dtls_state,
            });
        }
    }

    fn transport_failed(&mut self, direction: TransportDirection, layer: FailureLayer) {
        let Some(entry) = self.transport_mut(direction) else {
            return;
        };
        match layer {
            FailureLayer::Ice => entry.ice_failed = true,
            FailureLayer::Dtls => entry.dtls_failed = true,
        }
        let transport_id = entry.id;

        prom::record_transport_failure(direction.as_str(), layer.as_str());
        warn!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            transport_id = %transport_id,
            direction = %direction,
            layer = layer.as_str(),
            "Transport failed"
        );

        let _ = self.sink.send(PeerEvent::TransportFailed {
            transport_id,
            direction,
            layer,
        });

        if self.failure_deadline.is_none() {
            self.failure_deadline = Some(Instant::now() + self.settings.ice_failure_grace);
        }
    }

    fn transport_recovered(&mut self, direction: TransportDirection, layer: FailureLayer) {
        if let Some(entry) = self.transport_mut(direction) {
            match layer {
                FailureLayer::Ice => entry.ice_failed = false,
                FailureLayer::Dtls => entry.dtls_failed = false,
            }
        }
        self.refresh_failure_deadline();
    }

    fn refresh_failure_deadline(&mut self) {
        let any_failed = [&self.send_transport, &self.recv_transport]
            .into_iter()
            .flatten()
            .any(TransportEntry::failed);
        if !any_failed {
            self.failure_deadline = None;
        }
    }

    fn transport(&self, direction: TransportDirection) -> Option<&TransportEntry> {
        match direction {
            TransportDirection::Send => self.send_transport.as_ref(),
            TransportDirection::Recv => self.recv_transport.as_ref(),
        }
    }

    fn transport_mut(&mut self, direction: TransportDirection) -> Option<&mut TransportEntry> {
        match direction {
            TransportDirection::Send => self.send_transport.as_mut(),
            TransportDirection::Recv => self.recv_transport.as_mut(),
        }
    }

    fn direction_of(&self, transport_id: TransportId) -> Option<TransportDirection> {
        [&self.send_transport, &self.recv_transport]
            .into_iter()
            .flatten()
            .find(|t| t.id == transport_id)
            .map(|t| t.direction)
    }

    fn get_state(&self) -> PeerState {
        PeerState {
            peer_id: self.peer_id.clone(),
            room_id: self.room_id.clone(),
            phase: self.phase,
            transports: [&self.send_transport, &self.recv_transport]
                .into_iter()
                .flatten()
                .map(TransportEntry::status)
                .collect(),
            producers: self
                .producers
                .iter()
                .map(|(id, kind)| ProducerStatus {
                    producer_id: *id,
                    kind: *kind,
                })
                .collect(),
            consumers: self
                .consumers
                .iter()
                .map(|(id, c)| ConsumerStatus {
                    consumer_id: *id,
                    producer_id: c.producer_id,
                    kind: c.kind,
                    paused: c.paused,
                })
                .collect(),
        }
    }

    async fn close_quietly<F>(&self, operation: &'static str, call: F)
    where
        F: Future<Output = Result<(), EngineError>>,
    {
        match engine_call(operation, self.settings.engine_operation_timeout, call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(
                    target: "sfu.actor.peer",
                    room_id = %self.room_id,
                    peer_id = %self.peer_id,
                    operation,
                    error = %e,
                    "Engine close failed"
                );
            }
            Err(e) => {
                warn!(
                    target: "sfu.actor.peer",
                    room_id = %self.room_id,
                    peer_id = %self.peer_id,
                    operation,
                    error = %e,
                    "Engine close timed out"
                );
            }
        }
    }

    /// Release everything this peer owns.
    async fn teardown(&mut self, reason: LeaveReason) {
        self.phase = PeerPhase::Leaving;
        let notify_room = reason != LeaveReason::RoomClosed;

        if notify_room {
            if let Err(e) = self.room.peer_leaving(self.peer_id.clone()).await {
                debug!(
                    target: "sfu.actor.peer",
                    room_id = %self.room_id,
                    peer_id = %self.peer_id,
                    error = %e,
                    "Room unavailable during teardown"
                );
            }
        }

        let producers = std::mem::take(&mut self.producers);
        let consumers = std::mem::take(&mut self.consumers);
        let transports: Vec<TransportEntry> = [self.send_transport.take(), self.recv_transport.take()]
            .into_iter()
            .flatten()
            .collect();

        let engine = self.supervisor.engine().await.ok();
        if let Some(engine) = &engine {
            for producer_id in producers.keys() {
                self.close_quietly("close_producer", engine.close_producer(*producer_id))
                    .await;
            }
            for consumer_id in consumers.keys() {
                self.close_quietly("close_consumer", engine.close_consumer(*consumer_id))
                    .await;
            }
            for transport in &transports {
                self.close_quietly("close_transport", engine.close_transport(transport.id))
                    .await;
            }
        }
        for kind in producers.values() {
            prom::record_producer_closed(kind.as_str());
        }
        self.failure_deadline = None;

        if matches!(
            reason,
            LeaveReason::TransportFailed | LeaveReason::RoomClosed
        ) {
            let _ = self.sink.send(PeerEvent::Closed { reason });
        }

        if notify_room {
            if let Err(e) = self
                .room
                .peer_removed(self.peer_id.clone(), reason)
                .await
            {
                debug!(
                    target: "sfu.actor.peer",
                    room_id = %self.room_id,
                    peer_id = %self.peer_id,
                    error = %e,
                    "Room unavailable during teardown"
                );
            }
        }

        self.phase = PeerPhase::Closed;
        info!(
            target: "sfu.actor.peer",
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            reason = reason.as_str(),
            producers = producers.len(),
            consumers = consumers.len(),
            engine_available = engine.is_some(),
            "Peer resources released"
        );
    }

    /// Answer everything still queued once the peer has stopped.
    fn drain_mailbox(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                PeerMessage::SetCapabilities { respond_to, .. }
                | PeerMessage::CloseProducer { respond_to, .. } => {
                    let _ = respond_to.send(Err(SfuError::PeerGone));
                }
                PeerMessage::CreateTransports { respond_to } => {
                    let _ = respond_to.send(Err(SfuError::PeerGone));
                }
                PeerMessage::ConnectTransport { respond_to, .. } => {
                    let _ = respond_to.send(Err(SfuError::PeerGone));
                }
                PeerMessage::Produce { respond_to, .. } => {
                    let _ = respond_to.send(Err(SfuError::PeerGone));
                }
                PeerMessage::Consume { respond_to, .. } => {
                    let _ = respond_to.send(Err(SfuError::PeerGone));
                }
                PeerMessage::RestartIce { respond_to, .. } => {
                    let _ = respond_to.send(Err(SfuError::PeerGone));
                }
                PeerMessage::Leave { respond_to, .. } => {
                    let _ = respond_to.send(());
                }
                PeerMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.get_state());
                }
                PeerMessage::ProducerClosed { .. } | PeerMessage::ResumeConsumer { .. } => {}
            }
        }
    }
}

/// Map a consume failure to its `sfu_consume_rejected_total` reason label.
fn rejection_reason(error: &SfuError) -> &'static str {
    match error {
        SfuError::ProducerGone(_) => "producer_gone",
        SfuError::CannotConsume(_) => "cannot_consume",
        SfuError::TransportNotReady(_) => "transport_not_ready",
        SfuError::PeerGone | SfuError::PeerNotFound(_) => "peer_gone",
        SfuError::EngineUnavailable | SfuError::EngineTimeout(_) => "engine_unavailable",
        _ => "other",
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Next engine event; `None` once the channel is closed.
async fn next_engine_event(
    events: &mut Option<broadcast::Receiver<EngineEvent>>,
) -> Option<EngineEvent> {
    let Some(receiver) = events.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    target: "sfu.actor.peer",
                    skipped,
                    "Engine event subscriber lagged"
                );
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::{RegisterOutcome, RegistryMessage};
    use crate::actors::metrics::ActorMetrics;
    use crate::actors::room::RoomActor;
    use crate::engine::mock::{MockEngine, MockLauncher, MockOp};
    use crate::engine::types::{DtlsFingerprint, RtpCodecParameters};
    use crate::engine::RestartPolicy;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        supervisor: Arc<EngineSupervisor>,
        launcher: Arc<MockLauncher>,
        room: RoomActorHandle,
        _registry_rx: mpsc::Receiver<RegistryMessage>,
    }

    impl Fixture {
        async fn new() -> Self {
            let launcher = Arc::new(MockLauncher::new());
            let supervisor = EngineSupervisor::start(
                launcher.clone(),
                RestartPolicy {
                    initial_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(100),
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();
            let (registry_tx, registry_rx) = mpsc::channel(8);
            let (room, _task) = RoomActor::spawn(
                "room-1".to_string(),
                registry_tx,
                Arc::clone(&supervisor),
                SessionSettings::default(),
                ActorMetrics::new(),
                CancellationToken::new(),
            );
            Self {
                supervisor,
                launcher,
                room,
                _registry_rx: registry_rx,
            }
        }

        fn engine(&self) -> Arc<MockEngine> {
            self.launcher.current().unwrap()
        }

        async fn join(&self, peer_id: &str) -> (PeerActorHandle, UnboundedReceiver<PeerEvent>) {
            let router = self
                .room
                .router(&self.supervisor, TIMEOUT)
                .await
                .unwrap()
                .unwrap();
            let identity = PeerIdentity {
                user_id: format!("user-{peer_id}"),
                display_name: peer_id.to_string(),
                role: "student".to_string(),
            };
            let (sink, events) = mpsc::unbounded_channel();
            let (handle, actor) = PeerActor::new(
                PeerContext {
                    peer_id: peer_id.to_string(),
                    room_id: "room-1".to_string(),
                    identity: identity.clone(),
                    router_id: router.id,
                    room: self.room.clone(),
                    supervisor: Arc::clone(&self.supervisor),
                    sink: sink.clone(),
                    settings: SessionSettings::default(),
                },
                self.room.child_token(),
            );
            let outcome = self
                .room
                .register_peer(peer_id.to_string(), identity, actor, handle.clone(), sink)
                .await
                .unwrap();
            assert!(matches!(outcome, RegisterOutcome::Registered { .. }));
            (handle, events)
        }

        /// Join and run the handshake up to connected transports.
        async fn join_connected(
            &self,
            peer_id: &str,
        ) -> (PeerActorHandle, UnboundedReceiver<PeerEvent>, TransportPair) {
            let (peer, events) = self.join(peer_id).await;
            peer.set_capabilities(self.engine_capabilities().await)
                .await
                .unwrap();
            let transports = peer.create_transports().await.unwrap();
            peer.connect_transport(transports.send.id, TransportDirection::Send, dtls())
                .await
                .unwrap();
            peer.connect_transport(transports.recv.id, TransportDirection::Recv, dtls())
                .await
                .unwrap();
            (peer, events, transports)
        }

        async fn engine_capabilities(&self) -> RtpCapabilities {
            self.room
                .router(&self.supervisor, TIMEOUT)
                .await
                .unwrap()
                .unwrap()
                .capabilities
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: None,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AB:CD".to_string(),
            }],
        }
    }

    fn vp8() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Map::new(),
            }],
            ..RtpParameters::default()
        }
    }

    async fn next_matching(
        events: &mut UnboundedReceiver<PeerEvent>,
        wanted: impl Fn(&PeerEvent) -> bool,
    ) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event channel open");
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event arrived")
    }

    #[tokio::test]
    async fn test_capabilities_are_single_shot() {
        let f = Fixture::new().await;
        let (peer, _events) = f.join("p1").await;
        let caps = f.engine_capabilities().await;

        peer.set_capabilities(caps.clone()).await.unwrap();
        assert!(matches!(
            peer.set_capabilities(caps).await,
            Err(SfuError::AlreadySet)
        ));
        assert_eq!(peer.get_state().await.unwrap().phase, PeerPhase::CapabilitiesSet);
    }

    #[tokio::test]
    async fn test_transports_require_capabilities() {
        let f = Fixture::new().await;
        let (peer, _events) = f.join("p1").await;

        assert!(matches!(
            peer.create_transports().await,
            Err(SfuError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_reaches_active() {
        let f = Fixture::new().await;
        let (peer, mut events) = f.join("p1").await;
        peer.set_capabilities(f.engine_capabilities().await)
            .await
            .unwrap();

        let transports = peer.create_transports().await.unwrap();
        assert_eq!(transports.send.direction, TransportDirection::Send);
        assert_eq!(transports.recv.direction, TransportDirection::Recv);
        assert_eq!(f.engine().transport_count(), 2);
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::ExistingProducers(Vec::new())
        );

        let outcome = peer
            .connect_transport(transports.send.id, TransportDirection::Send, dtls())
            .await
            .unwrap();
        assert_eq!(outcome, ConnectOutcome::Connected);
        assert_eq!(peer.get_state().await.unwrap().phase, PeerPhase::Active);

        // Second connect is a successful no-op
        let outcome = peer
            .connect_transport(transports.send.id, TransportDirection::Send, dtls())
            .await
            .unwrap();
        assert_eq!(outcome, ConnectOutcome::AlreadyConnected);
        assert_eq!(f.engine().call_count(MockOp::ConnectTransport), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_mismatched_transport() {
        let f = Fixture::new().await;
        let (peer, _events) = f.join("p1").await;
        peer.set_capabilities(f.engine_capabilities().await)
            .await
            .unwrap();
        let transports = peer.create_transports().await.unwrap();

        let result = peer
            .connect_transport(transports.recv.id, TransportDirection::Send, dtls())
            .await;
        assert!(matches!(result, Err(SfuError::UnknownTransport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let f = Fixture::new().await;
        let (peer, _events) = f.join("p1").await;
        peer.set_capabilities(f.engine_capabilities().await)
            .await
            .unwrap();
        let transports = peer.create_transports().await.unwrap();

        f.engine()
            .set_delay(MockOp::ConnectTransport, Duration::from_secs(120));
        let result = peer
            .connect_transport(transports.send.id, TransportDirection::Send, dtls())
            .await;
        assert!(matches!(result, Err(SfuError::TransportConnectTimeout)));
    }

    #[tokio::test]
    async fn test_produce_requires_connected_send_transport() {
        let f = Fixture::new().await;
        let (peer, _events) = f.join("p1").await;
        peer.set_capabilities(f.engine_capabilities().await)
            .await
            .unwrap();
        peer.create_transports().await.unwrap();

        assert!(matches!(
            peer.produce(MediaKind::Video, vp8()).await,
            Err(SfuError::TransportNotReady("send"))
        ));
    }

    #[tokio::test]
    async fn test_second_producer_of_same_kind_is_rejected() {
        let f = Fixture::new().await;
        let (peer, _events, _) = f.join_connected("p1").await;

        let producer_id = peer.produce(MediaKind::Video, vp8()).await.unwrap();
        assert!(matches!(
            peer.produce(MediaKind::Video, vp8()).await,
            Err(SfuError::ProducerKindExists("video"))
        ));

        // Stopping the track frees the kind again
        peer.close_producer(producer_id).await.unwrap();
        assert!(!f.engine().has_producer(producer_id));
        peer.produce(MediaKind::Video, vp8()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_creates_paused_then_resumes() {
        let f = Fixture::new().await;
        let (p1, _p1_events, _) = f.join_connected("p1").await;
        let (p2, mut p2_events, _) = f.join_connected("p2").await;

        let producer_id = p1.produce(MediaKind::Video, vp8()).await.unwrap();
        let ConsumeOutcome::Created(consumer) = p2.consume(producer_id, None).await.unwrap() else {
            unreachable!("first consume creates a consumer");
        };
        assert!(consumer.paused);
        assert_eq!(f.engine().consumer_paused(consumer.id), Some(true));

        let resumed = next_matching(&mut p2_events, |e| {
            matches!(e, PeerEvent::ConsumerResumed { .. })
        })
        .await;
        assert_eq!(
            resumed,
            PeerEvent::ConsumerResumed {
                consumer_id: consumer.id,
                producer_id,
            }
        );
        assert_eq!(f.engine().consumer_paused(consumer.id), Some(false));
    }

    #[tokio::test]
    async fn test_duplicate_consume_is_flagged_not_failed() {
        let f = Fixture::new().await;
        let (p1, _p1_events, _) = f.join_connected("p1").await;
        let (p2, _p2_events, _) = f.join_connected("p2").await;

        let producer_id = p1.produce(MediaKind::Video, vp8()).await.unwrap();
        assert!(matches!(
            p2.consume(producer_id, None).await.unwrap(),
            ConsumeOutcome::Created(_)
        ));
        assert_eq!(
            p2.consume(producer_id, None).await.unwrap(),
            ConsumeOutcome::AlreadyConsuming { producer_id }
        );
        assert_eq!(f.engine().consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_consume_own_producer_is_rejected() {
        let f = Fixture::new().await;
        let (p1, _events, _) = f.join_connected("p1").await;
        let producer_id = p1.produce(MediaKind::Video, vp8()).await.unwrap();

        assert!(matches!(
            p1.consume(producer_id, None).await,
            Err(SfuError::CannotConsume(_))
        ));
    }

    #[tokio::test]
    async fn test_consume_incompatible_capabilities_releases_reservation() {
        let f = Fixture::new().await;
        let (p1, _p1_events, _) = f.join_connected("p1").await;
        let (p2, _p2_events, _) = f.join_connected("p2").await;
        let producer_id = p1.produce(MediaKind::Video, vp8()).await.unwrap();

        let audio_only = RtpCapabilities {
            codecs: f
                .engine_capabilities()
                .await
                .codecs
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: Vec::new(),
        };
        assert!(matches!(
            p2.consume(producer_id, Some(audio_only)).await,
            Err(SfuError::CannotConsume(_))
        ));

        // The failed attempt left nothing behind, so a compatible retry works
        let state = f.room.get_state().await.unwrap();
        assert!(state.peer("p2").unwrap().consumed.is_empty());
        assert!(matches!(
            p2.consume(producer_id, None).await.unwrap(),
            ConsumeOutcome::Created(_)
        ));
    }

    #[tokio::test]
    async fn test_leave_is_idempotent_and_releases_everything() {
        let f = Fixture::new().await;
        let (p1, _p1_events, _) = f.join_connected("p1").await;
        let (p2, _p2_events, _) = f.join_connected("p2").await;
        let producer_id = p1.produce(MediaKind::Video, vp8()).await.unwrap();
        p2.consume(producer_id, None).await.unwrap();

        p2.leave().await;
        p2.leave().await;

        let engine = f.engine();
        assert_eq!(engine.consumer_count(), 0);
        assert_eq!(engine.transport_count(), 2, "only p1's transports remain");
        assert!(matches!(
            p2.produce(MediaKind::Audio, vp8()).await,
            Err(SfuError::PeerGone)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ice_failure_is_reported_and_restart_recovers() {
        let f = Fixture::new().await;
        let (peer, mut events, transports) = f.join_connected("p1").await;

        f.engine()
            .emit_ice_state(transports.send.id, IceState::Failed);

        let failed = next_matching(&mut events, |e| {
            matches!(e, PeerEvent::TransportFailed { .. })
        })
        .await;
        assert_eq!(
            failed,
            PeerEvent::TransportFailed {
                transport_id: transports.send.id,
                direction: TransportDirection::Send,
                layer: FailureLayer::Ice,
            }
        );

        peer.restart_ice(transports.send.id).await.unwrap();
        let state = peer.get_state().await.unwrap();
        assert!(!state.transport(TransportDirection::Send).unwrap().failed);

        // Past the grace period the peer is still alive
        tokio::time::sleep(SessionSettings::default().ice_failure_grace * 2).await;
        assert_eq!(peer.get_state().await.unwrap().phase, PeerPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecovered_failure_closes_peer() {
        let f = Fixture::new().await;
        let (peer, mut events, transports) = f.join_connected("p1").await;

        f.engine()
            .emit_dtls_state(transports.recv.id, DtlsState::Failed);

        let closed = next_matching(&mut events, |e| matches!(e, PeerEvent::Closed { .. })).await;
        assert_eq!(
            closed,
            PeerEvent::Closed {
                reason: LeaveReason::TransportFailed
            }
        );
        assert_eq!(f.engine().transport_count(), 0);
        assert!(!matches!(
            peer.get_state().await,
            Ok(state) if state.phase == PeerPhase::Active
        ));
    }

    #[tokio::test]
    async fn test_state_changes_forwarded() {
        let f = Fixture::new().await;
        let (_peer, mut events, transports) = f.join_connected("p1").await;

        f.engine()
            .emit_ice_state(transports.recv.id, IceState::Connected);
        // Other peers' transports are ignored
        f.engine().emit_ice_state(TransportId::new(), IceState::Failed);

        let changed = next_matching(&mut events, |e| {
            matches!(e, PeerEvent::TransportStateChanged { .. })
        })
        .await;
        assert_eq!(
            changed,
            PeerEvent::TransportStateChanged {
                transport_id: transports.recv.id,
                direction: TransportDirection::Recv,
                ice_state: IceState::Connected,
                dtls_state: DtlsState::New,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_down_fails_produce_with_unavailable() {
        let f = Fixture::new().await;
        f.launcher.fail_launches(100);
        let (peer, _events, _) = f.join_connected("p1").await;

        f.engine().crash("boom");

        assert!(matches!(
            peer.produce(MediaKind::Video, vp8()).await,
            Err(SfuError::EngineUnavailable)
        ));

        // Teardown without an engine still completes
        peer.leave().await;
        assert!(matches!(peer.get_state().await, Err(SfuError::PeerGone)));
    }
}
