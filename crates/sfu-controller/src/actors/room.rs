//! `RoomActor` - per-room membership, producer index and discovery fan-out.
//!
//! Each `RoomActor`:
//! - Owns the room's peer set and every peer's consumed-set
//! - Owns the index of active producers
//! - Sends the join-time `existing-producers` batch and the per-producer
//!   `new-producer-available` announcements
//! - Supervises the `PeerActor` tasks of its peers
//!
//! All state changes happen one message at a time and the loop never awaits
//! the media engine or a peer actor, so discovery sees a consistent snapshot.
//! The room's router lives in a [`RouterSlot`] next to the handle; it is
//! created by joining peers outside the loop and closed when the room exits.
//!
//! # Release
//!
//! When the last peer is removed the room sends `RoomEmpty` to the registry.
//! The registry answers with `TryClose`; the room closes only if it is still
//! empty at that point. Registrations queued behind a successful `TryClose`
//! are answered with [`RegisterOutcome::RoomClosed`] so the caller can retry
//! against a fresh room.

use super::messages::{
    LeaveReason, PeerEvent, PeerIdentity, PeerSink, PeerSummary, RegisterOutcome,
    RegistryMessage, RoomMessage, RoomPeerState, RoomPeerStatus, RoomState,
};
use super::metrics::{mailbox_depth, ActorMetrics, ActorType, MailboxMonitor};
use super::peer::{PeerActor, PeerActorHandle};
use super::{engine_call, send_detached};
use crate::config::SessionSettings;
use crate::discovery::{
    announcement_targets, existing_producers_for, AnnouncementCandidate, ConsumedSet,
    ProducerAnnouncement,
};
use crate::engine::{EngineSupervisor, RtpCapabilities};
use crate::errors::SfuError;

use common::types::{ConsumerId, ProducerId, RouterId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How long shutdown waits for each peer actor.
const PEER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval for reaping finished peer tasks while idle.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// A router created for a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterInfo {
    pub id: RouterId,
    /// Engine generation that created the router.
    pub generation: u64,
    pub capabilities: RtpCapabilities,
}

/// Lazily created router of one room.
///
/// The lock only guards the router itself and is never taken by the room loop.
#[derive(Debug, Default)]
pub struct RouterSlot {
    router: Mutex<Option<RouterInfo>>,
    closed: AtomicBool,
}

impl RouterSlot {
    /// Return the room's router, creating it on first use or after an engine restart.
    ///
    /// Returns `None` once the slot is closed.
    async fn get_or_create(
        &self,
        room_id: &str,
        supervisor: &EngineSupervisor,
        timeout: Duration,
    ) -> Result<Option<RouterInfo>, SfuError> {
        let mut slot = self.router.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let (engine, generation) = supervisor.engine_with_generation().await?;
        if let Some(router) = slot.as_ref().filter(|r| r.generation == generation) {
            return Ok(Some(router.clone()));
        }

        let id = engine_call("create_router", timeout, engine.create_router(room_id)).await??;
        let capabilities = engine_call(
            "router_capabilities",
            timeout,
            engine.router_capabilities(id),
        )
        .await
        .and_then(|r| r.map_err(SfuError::from));

        let capabilities = match capabilities {
            Ok(capabilities) => capabilities,
            Err(e) => {
                let _ = engine_call("close_router", timeout, engine.close_router(id)).await;
                return Err(e);
            }
        };

        info!(
            target: "sfu.actor.room",
            room_id = %room_id,
            router_id = %id,
            generation,
            "Router created"
        );

        let router = RouterInfo {
            id,
            generation,
            capabilities,
        };
        *slot = Some(router.clone());
        Ok(Some(router))
    }

    /// Stop handing out the router. Takes effect for the next caller.
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Close the slot and release the router if its engine is still running.
    async fn close(&self, room_id: &str, supervisor: &EngineSupervisor, timeout: Duration) {
        self.mark_closed();
        let router = self.router.lock().await.take();
        let Some(router) = router else {
            return;
        };

        match supervisor.engine_with_generation().await {
            Ok((engine, generation)) if generation == router.generation => {
                match engine_call("close_router", timeout, engine.close_router(router.id)).await {
                    Ok(Ok(())) => {
                        debug!(
                            target: "sfu.actor.room",
                            room_id = %room_id,
                            router_id = %router.id,
                            "Router closed"
                        );
                    }
                    Ok(Err(e)) => {
                        warn!(
                            target: "sfu.actor.room",
                            room_id = %room_id,
                            error = %e,
                            "Router close failed"
                        );
                    }
                    Err(e) => {
                        warn!(
                            target: "sfu.actor.room",
                            room_id = %room_id,
                            error = %e,
                            "Router close timed out"
                        );
                    }
                }
            }
            _ => {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %room_id,
                    "Router belonged to a stopped engine"
                );
            }
        }
    }

    async fn current(&self) -> Option<RouterInfo> {
        self.router.lock().await.clone()
    }
}

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
    router: Arc<RouterSlot>,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Get or create the room's router.
    ///
    /// Returns `None` when the room has already released itself.
    pub async fn router(
        &self,
        supervisor: &EngineSupervisor,
        timeout: Duration,
    ) -> Result<Option<RouterInfo>, SfuError> {
        self.router
            .get_or_create(&self.room_id, supervisor, timeout)
            .await
    }

    /// The router currently cached for this room, if any.
    pub async fn current_router(&self) -> Option<RouterInfo> {
        self.router.current().await
    }

    /// Register a new peer. The room spawns `actor` and supervises its task.
    pub async fn register_peer(
        &self,
        peer_id: String,
        identity: PeerIdentity,
        actor: PeerActor,
        handle: PeerActorHandle,
        sink: PeerSink,
    ) -> Result<RegisterOutcome, SfuError> {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .sender
            .send(RoomMessage::RegisterPeer {
                peer_id,
                identity,
                actor: Box::new(actor),
                handle,
                sink,
                respond_to: tx,
            })
            .await;
        if sent.is_err() {
            return Ok(RegisterOutcome::RoomClosed);
        }

        rx.await.unwrap_or(Ok(RegisterOutcome::RoomClosed))
    }

    /// Mark a peer's handshake complete.
    pub async fn peer_ready(&self, peer_id: String) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::PeerReady {
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Index a new producer and announce it.
    pub async fn producer_created(&self, announcement: ProducerAnnouncement) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ProducerCreated {
                announcement,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Announce that a producer is about to close.
    pub async fn producer_closed(
        &self,
        peer_id: String,
        producer_id: ProducerId,
    ) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ProducerClosed {
                peer_id,
                producer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Record `producer_id` in the peer's consumed-set before consuming it.
    pub async fn reserve_consumption(
        &self,
        peer_id: String,
        producer_id: ProducerId,
    ) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ReserveConsumption {
                peer_id,
                producer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Attach the created consumer to a reservation.
    pub async fn confirm_consumption(
        &self,
        peer_id: String,
        producer_id: ProducerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ConfirmConsumption {
                peer_id,
                producer_id,
                consumer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Drop a reservation after a failed consume.
    pub fn release_consumption(&self, peer_id: String, producer_id: ProducerId) {
        send_detached(
            &self.sender,
            RoomMessage::ReleaseConsumption {
                peer_id,
                producer_id,
            },
        );
    }

    /// First teardown step: retract the peer's producers.
    pub async fn peer_leaving(&self, peer_id: String) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::PeerLeaving {
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Last teardown step: remove the peer record. No-op if already absent.
    pub async fn peer_removed(&self, peer_id: String, reason: LeaveReason) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::PeerRemoved {
                peer_id,
                reason,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Peers whose join handshake has completed.
    pub async fn peers(&self, excluding: Option<String>) -> Result<Vec<PeerSummary>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetPeers {
                excluding,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Ask the room to close if it is still empty.
    ///
    /// A room that already exited counts as closed.
    pub async fn try_close(&self) -> Result<bool, SfuError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RoomMessage::TryClose { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(true);
        }

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for peer actors.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// A peer as tracked by its room.
struct RoomPeer {
    identity: PeerIdentity,
    handle: PeerActorHandle,
    sink: PeerSink,
    task_handle: JoinHandle<()>,
    status: RoomPeerStatus,
    /// `user-joined-video` was sent for this peer.
    announced: bool,
    consumed: ConsumedSet,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    /// Registry mailbox, for `RoomEmpty`.
    registry: mpsc::Sender<RegistryMessage>,
    router: Arc<RouterSlot>,
    supervisor: Arc<EngineSupervisor>,
    settings: SessionSettings,
    peers: HashMap<String, RoomPeer>,
    /// Active producers. A producer is indexed only after the engine created it.
    producers: HashMap<ProducerId, ProducerAnnouncement>,
    /// Tasks of removed peers that have not finished yet.
    exiting: Vec<(String, JoinHandle<()>)>,
    closing: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: String,
        registry: mpsc::Sender<RegistryMessage>,
        supervisor: Arc<EngineSupervisor>,
        settings: SessionSettings,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let router = Arc::new(RouterSlot::default());

        let actor = Self {
            room_id: room_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            registry,
            router: Arc::clone(&router),
            supervisor,
            settings,
            peers: HashMap::new(),
            producers: HashMap::new(),
            exiting: Vec::new(),
            closing: false,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            router,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            "RoomActor started"
        );

        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);

        loop {
            self.check_peer_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = health_check.tick() => {}

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_depth(mailbox_depth(&self.receiver));
                            if self.handle_message(message) {
                                info!(
                                    target: "sfu.actor.room",
                                    room_id = %self.room_id,
                                    "Room empty, releasing"
                                );
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.drain_mailbox();
        self.router
            .close(
                &self.room_id,
                &self.supervisor,
                self.settings.engine_operation_timeout,
            )
            .await;

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Returns true when the room closed.
    fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::RegisterPeer {
                peer_id,
                identity,
                actor,
                handle,
                sink,
                respond_to,
            } => {
                let result = self.register_peer(peer_id, identity, *actor, handle, sink);
                let _ = respond_to.send(result);
            }

            RoomMessage::PeerReady {
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.peer_ready(&peer_id));
            }

            RoomMessage::ProducerCreated {
                announcement,
                respond_to,
            } => {
                let _ = respond_to.send(self.producer_created(announcement));
            }

            RoomMessage::ProducerClosed {
                peer_id,
                producer_id,
                respond_to,
            } => {
                if self
                    .producers
                    .get(&producer_id)
                    .is_some_and(|p| p.peer_id == peer_id)
                {
                    self.retire_producer(producer_id);
                }
                let _ = respond_to.send(());
            }

            RoomMessage::ReserveConsumption {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.reserve_consumption(&peer_id, producer_id));
            }

            RoomMessage::ConfirmConsumption {
                peer_id,
                producer_id,
                consumer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.confirm_consumption(&peer_id, producer_id, consumer_id));
            }

            RoomMessage::ReleaseConsumption {
                peer_id,
                producer_id,
            } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.consumed.release(&producer_id);
                }
            }

            RoomMessage::PeerLeaving {
                peer_id,
                respond_to,
            } => {
                self.peer_leaving(&peer_id);
                let _ = respond_to.send(());
            }

            RoomMessage::PeerRemoved {
                peer_id,
                reason,
                respond_to,
            } => {
                if let Some(task) = self.remove_peer(&peer_id, reason) {
                    self.exiting.push((peer_id, task));
                }
                let _ = respond_to.send(());
            }

            RoomMessage::GetPeers {
                excluding,
                respond_to,
            } => {
                let _ = respond_to.send(self.ready_peers(excluding.as_deref()));
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }

            RoomMessage::TryClose { respond_to } => {
                let close = self.peers.is_empty();
                if close {
                    self.closing = true;
                    self.router.mark_closed();
                }
                let _ = respond_to.send(close);
                return close;
            }
        }
        false
    }

    fn register_peer(
        &mut self,
        peer_id: String,
        identity: PeerIdentity,
        actor: PeerActor,
        handle: PeerActorHandle,
        sink: PeerSink,
    ) -> Result<RegisterOutcome, SfuError> {
        if self.closing {
            return Ok(RegisterOutcome::RoomClosed);
        }

        if self.peers.contains_key(&peer_id) {
            return Err(SfuError::Conflict("Peer already in room".to_string()));
        }

        if self.peers.len() >= self.settings.max_peers_per_room {
            warn!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                capacity = self.settings.max_peers_per_room,
                "Room is full, rejecting peer"
            );
            return Err(SfuError::RoomCapacityExceeded(self.room_id.clone()));
        }

        let task_handle = tokio::spawn(actor.run());

        self.peers.insert(
            peer_id.clone(),
            RoomPeer {
                identity,
                handle,
                sink,
                task_handle,
                status: RoomPeerStatus::Joining,
                announced: false,
                consumed: ConsumedSet::new(),
            },
        );
        self.metrics.peer_joined();

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peers = self.peers.len(),
            "Peer registered"
        );

        Ok(RegisterOutcome::Registered {
            peers: self.ready_peers(Some(peer_id.as_str())),
        })
    }

    /// Join handshake finished: send the existing-producers batch and announce the peer.
    fn peer_ready(&mut self, peer_id: &str) -> Result<(), SfuError> {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Err(SfuError::PeerNotFound(peer_id.to_string()));
        };
        match peer.status {
            RoomPeerStatus::Leaving => return Err(SfuError::PeerGone),
            RoomPeerStatus::Ready => return Ok(()),
            RoomPeerStatus::Joining => {}
        }

        peer.status = RoomPeerStatus::Ready;
        peer.announced = true;

        let batch = existing_producers_for(peer_id, &peer.consumed, self.producers.values());
        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producers = batch.len(),
            "Sending existing producers"
        );
        let _ = peer.sink.send(PeerEvent::ExistingProducers(batch));
        let identity = peer.identity.clone();

        for (other_id, other) in &self.peers {
            if other_id != peer_id && other.status == RoomPeerStatus::Ready {
                let _ = other.sink.send(PeerEvent::UserJoined {
                    peer_id: peer_id.to_string(),
                    identity: identity.clone(),
                });
            }
        }

        Ok(())
    }

    fn producer_created(&mut self, announcement: ProducerAnnouncement) -> Result<(), SfuError> {
        match self.peers.get(&announcement.peer_id) {
            Some(owner) if owner.status != RoomPeerStatus::Leaving => {}
            Some(_) => return Err(SfuError::PeerGone),
            None => return Err(SfuError::PeerNotFound(announcement.peer_id.clone())),
        }

        let targets = announcement_targets(
            &announcement,
            self.peers.iter().map(|(id, p)| AnnouncementCandidate {
                peer_id: id,
                ready: p.status == RoomPeerStatus::Ready,
                consumed: &p.consumed,
            }),
        );

        for target in &targets {
            if let Some(peer) = self.peers.get(*target) {
                let _ = peer
                    .sink
                    .send(PeerEvent::NewProducerAvailable(announcement.clone()));
            }
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %announcement.peer_id,
            producer_id = %announcement.producer_id,
            kind = %announcement.kind,
            announced_to = targets.len(),
            "Producer announced"
        );

        self.producers
            .insert(announcement.producer_id, announcement);
        Ok(())
    }

    /// Remove a producer from the index and tell everyone else.
    ///
    /// Peers consuming it are told to close their consumer.
    fn retire_producer(&mut self, producer_id: ProducerId) {
        let Some(announcement) = self.producers.remove(&producer_id) else {
            return;
        };

        for (peer_id, peer) in &mut self.peers {
            if *peer_id == announcement.peer_id {
                continue;
            }
            if peer.consumed.release(&producer_id).is_some() {
                peer.handle.producer_closed(producer_id);
            }
            if peer.status != RoomPeerStatus::Leaving {
                let _ = peer.sink.send(PeerEvent::ProducerClosed {
                    producer_id,
                    peer_id: announcement.peer_id.clone(),
                });
            }
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %announcement.peer_id,
            producer_id = %producer_id,
            "Producer retired"
        );
    }

    fn reserve_consumption(&mut self, peer_id: &str, producer_id: ProducerId) -> Result<(), SfuError> {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Err(SfuError::PeerNotFound(peer_id.to_string()));
        };
        if peer.status == RoomPeerStatus::Leaving {
            return Err(SfuError::PeerGone);
        }

        let Some(producer) = self.producers.get(&producer_id) else {
            return Err(SfuError::ProducerGone(producer_id.to_string()));
        };
        if producer.peer_id == peer_id {
            return Err(SfuError::CannotConsume(
                "cannot consume own producer".to_string(),
            ));
        }

        if !peer.consumed.reserve(producer_id) {
            return Err(SfuError::DuplicateConsumption);
        }
        Ok(())
    }

    fn confirm_consumption(
        &mut self,
        peer_id: &str,
        producer_id: ProducerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SfuError> {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Err(SfuError::PeerNotFound(peer_id.to_string()));
        };
        if peer.status == RoomPeerStatus::Leaving {
            return Err(SfuError::PeerGone);
        }

        if !self.producers.contains_key(&producer_id) {
            peer.consumed.release(&producer_id);
            return Err(SfuError::ProducerGone(producer_id.to_string()));
        }
        if !peer.consumed.confirm(producer_id, consumer_id) {
            return Err(SfuError::ProducerGone(producer_id.to_string()));
        }
        Ok(())
    }

    /// Mark a peer as leaving and retract its producers. Idempotent.
    fn peer_leaving(&mut self, peer_id: &str) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        if peer.status == RoomPeerStatus::Leaving {
            return;
        }
        peer.status = RoomPeerStatus::Leaving;
        peer.consumed = ConsumedSet::new();

        for producer_id in self.producers_of(peer_id) {
            self.retire_producer(producer_id);
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            "Peer leaving"
        );
    }

    /// Remove a peer record. Returns its task handle if it was present.
    fn remove_peer(&mut self, peer_id: &str, reason: LeaveReason) -> Option<JoinHandle<()>> {
        let peer = self.peers.remove(peer_id)?;

        for producer_id in self.producers_of(peer_id) {
            self.retire_producer(producer_id);
        }
        self.metrics.peer_left();

        if peer.announced {
            for other in self.peers.values() {
                if other.status == RoomPeerStatus::Ready {
                    let _ = other.sink.send(PeerEvent::UserLeft {
                        peer_id: peer_id.to_string(),
                        room_id: self.room_id.clone(),
                        identity: peer.identity.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            reason = reason.as_str(),
            peers = self.peers.len(),
            "Peer removed"
        );

        if self.peers.is_empty() && !self.closing {
            send_detached(
                &self.registry,
                RegistryMessage::RoomEmpty {
                    room_id: self.room_id.clone(),
                },
            );
        }

        Some(peer.task_handle)
    }

    fn producers_of(&self, peer_id: &str) -> Vec<ProducerId> {
        self.producers
            .values()
            .filter(|p| p.peer_id == peer_id)
            .map(|p| p.producer_id)
            .collect()
    }

    fn ready_peers(&self, excluding: Option<&str>) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .peers
            .iter()
            .filter(|(id, p)| p.status == RoomPeerStatus::Ready && Some(id.as_str()) != excluding)
            .map(|(id, p)| PeerSummary {
                peer_id: id.clone(),
                identity: p.identity.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    fn get_state(&self) -> RoomState {
        let mut peers: Vec<RoomPeerState> = self
            .peers
            .iter()
            .map(|(id, p)| RoomPeerState {
                peer_id: id.clone(),
                status: p.status,
                consumed: p.consumed.producer_ids().copied().collect(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        RoomState {
            room_id: self.room_id.clone(),
            peers,
            producers: self.producers.values().cloned().collect(),
        }
    }

    /// Reap finished peer tasks.
    ///
    /// A registered peer whose task ended never removed itself (it panicked),
    /// so its record is cleaned up here.
    async fn check_peer_health(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.exiting)
            .into_iter()
            .partition(|(_, task)| task.is_finished());
        self.exiting = running;
        for (peer_id, task) in finished {
            self.reap(&peer_id, task).await;
        }

        let crashed: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for peer_id in crashed {
            self.peer_leaving(&peer_id);
            if let Some(task) = self.remove_peer(&peer_id, LeaveReason::Disconnected) {
                self.reap(&peer_id, task).await;
            }
        }
    }

    async fn reap(&self, peer_id: &str, task: JoinHandle<()>) {
        match task.await {
            Ok(()) => {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    "Peer actor exited cleanly"
                );
            }
            Err(join_error) => {
                if join_error.is_panic() {
                    error!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        error = ?join_error,
                        "Peer actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Peer);
                }
            }
        }
    }

    /// Answer everything still queued once the loop has stopped.
    fn drain_mailbox(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                RoomMessage::RegisterPeer { respond_to, .. } => {
                    let _ = respond_to.send(Ok(RegisterOutcome::RoomClosed));
                }
                RoomMessage::PeerReady { respond_to, .. }
                | RoomMessage::ProducerCreated { respond_to, .. }
                | RoomMessage::ReserveConsumption { respond_to, .. }
                | RoomMessage::ConfirmConsumption { respond_to, .. } => {
                    let _ = respond_to.send(Err(SfuError::PeerGone));
                }
                RoomMessage::ProducerClosed { respond_to, .. }
                | RoomMessage::PeerLeaving { respond_to, .. }
                | RoomMessage::PeerRemoved { respond_to, .. } => {
                    let _ = respond_to.send(());
                }
                RoomMessage::ReleaseConsumption { .. } => {}
                RoomMessage::GetPeers { respond_to, .. } => {
                    let _ = respond_to.send(Vec::new());
                }
                RoomMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.get_state());
                }
                RoomMessage::TryClose { respond_to } => {
                    let _ = respond_to.send(true);
                }
            }
        }
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peers = self.peers.len(),
            "Performing graceful shutdown"
        );

        self.closing = true;
        self.router.mark_closed();
        self.drain_mailbox();

        for peer in self.peers.values() {
            peer.handle.cancel();
        }

        for (peer_id, peer) in self.peers.drain() {
            match tokio::time::timeout(PEER_SHUTDOWN_TIMEOUT, peer.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        "Peer completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        error = ?e,
                        "Peer task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        "Peer shutdown timed out"
                    );
                }
            }
            self.metrics.peer_left();
        }
        self.producers.clear();

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            "Graceful shutdown complete"
        );
    }
}
