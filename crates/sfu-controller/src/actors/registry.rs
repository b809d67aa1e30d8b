//! `RoomRegistryActor` - singleton map of room ids to room actors.
//!
//! The registry:
//! - Creates room actors lazily on the first join
//! - Releases rooms whose last peer left
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! # Release
//!
//! A room that became empty sends `RoomEmpty`. The registry asks the room to
//! close (`try_close`); the room answers `false` when a peer registered in the
//! meantime, and the room stays. A join racing a release either reaches the
//! old room before it closed or gets `RoomClosed` and retries against a fresh
//! room.
//!
//! # Graceful Shutdown
//!
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to rooms and peers)
//! 3. Waits for room actors to finish

use super::messages::{
    PeerIdentity, PeerSink, PeerSummary, RegisterOutcome, RegistryMessage, RegistryStatus,
};
use super::metrics::{mailbox_depth, ActorMetrics, ActorType, MailboxMonitor};
use super::peer::{PeerActor, PeerActorHandle, PeerContext};
use super::room::{RoomActor, RoomActorHandle};
use crate::config::SessionSettings;
use crate::engine::{EngineSupervisor, RtpCapabilities};
use crate::errors::SfuError;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long shutdown waits for each room actor.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval for checking room actor health while idle.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// A join is retried once if the room released itself underneath it.
const JOIN_ATTEMPTS: usize = 2;

/// A peer registered in a room.
pub struct JoinedPeer {
    pub handle: PeerActorHandle,
    pub room_id: String,
    pub router_capabilities: RtpCapabilities,
    /// Completed peers already in the room, as seen when this peer registered.
    pub peers: Vec<PeerSummary>,
}

/// Handle to the `RoomRegistryActor`.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    supervisor: Arc<EngineSupervisor>,
    settings: SessionSettings,
}

impl RoomRegistryHandle {
    /// Get the room actor for `room_id`, creating it if needed.
    pub async fn get_or_create_room(&self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the room actor for `room_id` if it exists.
    pub async fn get_room(&self, room_id: String) -> Result<Option<RoomActorHandle>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting rooms and cancel every room and peer.
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Join `peer_id` to `room_id`.
    ///
    /// The router is created (or fetched) here, outside every actor loop.
    /// `sink` receives the peer's notifications from then on.
    #[instrument(skip_all, name = "sfu.registry.join", fields(room_id = %room_id, peer_id = %peer_id))]
    pub async fn join(
        &self,
        room_id: &str,
        peer_id: String,
        identity: PeerIdentity,
        sink: PeerSink,
    ) -> Result<JoinedPeer, SfuError> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(SfuError::NoRoomJoined);
        }

        for attempt in 1..=JOIN_ATTEMPTS {
            let room = self.get_or_create_room(room_id.to_string()).await?;
            let Some(router) = room
                .router(&self.supervisor, self.settings.engine_operation_timeout)
                .await?
            else {
                debug!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    attempt,
                    "Room released during join, retrying"
                );
                continue;
            };

            let (handle, actor) = PeerActor::new(
                PeerContext {
                    peer_id: peer_id.clone(),
                    room_id: room_id.to_string(),
                    identity: identity.clone(),
                    router_id: router.id,
                    room: room.clone(),
                    supervisor: Arc::clone(&self.supervisor),
                    sink: sink.clone(),
                    settings: self.settings,
                },
                room.child_token(),
            );

            match room
                .register_peer(
                    peer_id.clone(),
                    identity.clone(),
                    actor,
                    handle.clone(),
                    sink.clone(),
                )
                .await?
            {
                RegisterOutcome::Registered { peers } => {
                    info!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        peer_id = %peer_id,
                        "Peer joined"
                    );
                    return Ok(JoinedPeer {
                        handle,
                        room_id: room_id.to_string(),
                        router_capabilities: router.capabilities,
                        peers,
                    });
                }
                RegisterOutcome::RoomClosed => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        attempt,
                        "Room closed before registration, retrying"
                    );
                }
            }
        }

        warn!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            peer_id = %peer_id,
            "Join kept racing room release"
        );
        Err(SfuError::Internal(
            "room released repeatedly during join".to_string(),
        ))
    }

    /// Peers in `room_id` whose join handshake completed. Empty if the room does not exist.
    pub async fn peers_in_room(
        &self,
        room_id: &str,
        excluding: Option<String>,
    ) -> Result<Vec<PeerSummary>, SfuError> {
        match self.get_room(room_id.to_string()).await? {
            Some(room) => room.peers(excluding).await,
            None => Ok(Vec::new()),
        }
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<EngineSupervisor> {
        &self.supervisor
    }

    /// Cancel the registry and everything below it.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Given to rooms for `RoomEmpty`.
    sender: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<String, ManagedRoom>,
    accepting_new: bool,
    supervisor: Arc<EngineSupervisor>,
    settings: SessionSettings,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    /// Spawn the registry actor.
    ///
    /// `cancel_token` is the root token; cancelling it shuts every room down.
    pub fn spawn(
        supervisor: Arc<EngineSupervisor>,
        settings: SessionSettings,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> (RoomRegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = Self {
            receiver,
            sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            accepting_new: true,
            supervisor: Arc::clone(&supervisor),
            settings,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomRegistryHandle {
            sender,
            cancel_token,
            supervisor,
            settings,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.registry")]
    async fn run(mut self) {
        info!(target: "sfu.actor.registry", "RoomRegistryActor started");

        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = health_check.tick() => {}

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_depth(mailbox_depth(&self.receiver));
                            self.handle_message(message).await;
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get_or_create_room(room_id));
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let room = self.rooms.get(&room_id).map(|r| r.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::RoomEmpty { room_id } => {
                self.release_if_empty(&room_id).await;
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown { respond_to } => {
                info!(
                    target: "sfu.actor.registry",
                    room_count = self.rooms.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.cancel_token.cancel();
                let _ = respond_to.send(());
            }
        }
    }

    fn get_or_create_room(&mut self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        if let Some(room) = self.rooms.get(&room_id) {
            return Ok(room.handle.clone());
        }
        if !self.accepting_new {
            return Err(SfuError::Draining);
        }
        let Some(registry) = self.sender.upgrade() else {
            return Err(SfuError::Draining);
        };

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            registry,
            Arc::clone(&self.supervisor),
            self.settings,
            Arc::clone(&self.metrics),
            self.cancel_token.child_token(),
        );
        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );
        Ok(handle)
    }

    /// Release a room that reported itself empty, if it still is.
    async fn release_if_empty(&mut self, room_id: &str) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };

        match room.handle.try_close().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    "Room gained a peer before release, keeping it"
                );
                return;
            }
            Err(e) => {
                warn!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    error = %e,
                    "Room did not answer release request"
                );
                return;
            }
        }

        if let Some(managed) = self.rooms.remove(room_id) {
            managed.handle.cancel();
            self.metrics.room_removed();

            // The room closes its router on the way out; don't block the loop on it
            let room_id_owned = room_id.to_string();
            tokio::spawn(async move {
                match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(
                            target: "sfu.actor.registry",
                            room_id = %room_id_owned,
                            error = ?e,
                            "Room actor task panicked during release"
                        );
                    }
                    Err(_) => {
                        warn!(
                            target: "sfu.actor.registry",
                            room_id = %room_id_owned,
                            "Room actor release timed out"
                        );
                    }
                }
            });

            info!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                total_rooms = self.rooms.len(),
                "Empty room released"
            );
        }
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            peer_count: self.metrics.peer_count(),
            engine_available: self.supervisor.is_available(),
            accepting_new: self.accepting_new,
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.registry",
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(target: "sfu.actor.registry", "Graceful shutdown complete");
    }

    /// Drop rooms whose task ended without being released.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, r)| r.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.registry",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
            self.metrics.room_removed();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::{LeaveReason, PeerEvent};
    use crate::engine::mock::MockLauncher;
    use crate::engine::RestartPolicy;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        registry: RoomRegistryHandle,
        task: JoinHandle<()>,
        launcher: Arc<MockLauncher>,
    }

    async fn fixture(settings: SessionSettings) -> Fixture {
        let launcher = Arc::new(MockLauncher::new());
        let supervisor = EngineSupervisor::start(
            launcher.clone(),
            RestartPolicy::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let (registry, task) = RoomRegistryActor::spawn(
            supervisor,
            settings,
            ActorMetrics::new(),
            CancellationToken::new(),
        );
        Fixture {
            registry,
            task,
            launcher,
        }
    }

    fn identity(name: &str) -> PeerIdentity {
        PeerIdentity {
            user_id: format!("user-{name}"),
            display_name: name.to_string(),
            role: "student".to_string(),
        }
    }

    async fn join(
        registry: &RoomRegistryHandle,
        room_id: &str,
        peer_id: &str,
    ) -> Result<(JoinedPeer, UnboundedReceiver<PeerEvent>), SfuError> {
        let (sink, events) = mpsc::unbounded_channel();
        let joined = registry
            .join(room_id, peer_id.to_string(), identity(peer_id), sink)
            .await?;
        Ok((joined, events))
    }

    async fn wait_for_room_count(registry: &RoomRegistryHandle, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.status().await.unwrap().room_count != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("room count reached");
    }

    #[tokio::test]
    async fn test_join_creates_room_once() {
        let f = fixture(SessionSettings::default()).await;

        let (p1, _e1) = join(&f.registry, "room-1", "p1").await.unwrap();
        let (_p2, _e2) = join(&f.registry, "room-1", "p2").await.unwrap();

        assert_eq!(p1.room_id, "room-1");
        assert!(!p1.router_capabilities.codecs.is_empty());

        let status = f.registry.status().await.unwrap();
        assert_eq!(status.room_count, 1);
        assert_eq!(status.peer_count, 2);
        assert!(status.engine_available);
        assert!(status.accepting_new);
        assert_eq!(f.launcher.current().unwrap().router_count(), 1);
    }

    #[tokio::test]
    async fn test_join_rejects_blank_room_id() {
        let f = fixture(SessionSettings::default()).await;

        assert!(matches!(
            join(&f.registry, "   ", "p1").await,
            Err(SfuError::NoRoomJoined)
        ));
        assert_eq!(f.registry.status().await.unwrap().room_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_peer_id_conflicts() {
        let f = fixture(SessionSettings::default()).await;

        let (_p1, _e1) = join(&f.registry, "room-1", "p1").await.unwrap();
        assert!(matches!(
            join(&f.registry, "room-1", "p1").await,
            Err(SfuError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let settings = SessionSettings {
            max_peers_per_room: 1,
            ..SessionSettings::default()
        };
        let f = fixture(settings).await;

        let (_p1, _e1) = join(&f.registry, "room-1", "p1").await.unwrap();
        assert!(matches!(
            join(&f.registry, "room-1", "p2").await,
            Err(SfuError::RoomCapacityExceeded(_))
        ));
        // Other rooms are unaffected
        join(&f.registry, "room-2", "p2").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_room_is_released_with_its_router() {
        let f = fixture(SessionSettings::default()).await;

        let (p1, _e1) = join(&f.registry, "room-1", "p1").await.unwrap();
        p1.handle.leave().await;

        wait_for_room_count(&f.registry, 0).await;
        assert!(f.registry.get_room("room-1".to_string()).await.unwrap().is_none());

        let engine = f.launcher.current().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.router_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("router closed");
    }

    #[tokio::test]
    async fn test_rejoin_after_release_gets_fresh_room() {
        let f = fixture(SessionSettings::default()).await;

        let (p1, _e1) = join(&f.registry, "room-1", "p1").await.unwrap();
        p1.handle.leave().await;
        wait_for_room_count(&f.registry, 0).await;

        let (p1, _e1) = join(&f.registry, "room-1", "p1").await.unwrap();
        assert_eq!(p1.handle.room_id(), "room-1");
        assert_eq!(f.registry.status().await.unwrap().room_count, 1);
    }

    #[tokio::test]
    async fn test_join_returns_completed_peers_snapshot() {
        let f = fixture(SessionSettings::default()).await;

        let (p1, _e1) = join(&f.registry, "room-1", "p1").await.unwrap();
        assert!(p1.peers.is_empty());
        p1.handle
            .set_capabilities(p1.router_capabilities.clone())
            .await
            .unwrap();
        p1.handle.create_transports().await.unwrap();

        // p2 is still mid-handshake and is not listed to p3
        let (p2, _e2) = join(&f.registry, "room-1", "p2").await.unwrap();
        let (p3, _e3) = join(&f.registry, "room-1", "p3").await.unwrap();

        for joined in [&p2, &p3] {
            assert_eq!(
                joined
                    .peers
                    .iter()
                    .map(|p| p.peer_id.as_str())
                    .collect::<Vec<_>>(),
                vec!["p1"]
            );
        }
    }

    #[tokio::test]
    async fn test_peers_in_unknown_room_is_empty() {
        let f = fixture(SessionSettings::default()).await;

        let peers = f.registry.peers_in_room("nowhere", None).await.unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_peer() {
        let f = fixture(SessionSettings::default()).await;

        let (p1, mut e1) = join(&f.registry, "room-1", "p1").await.unwrap();
        let (_p2, mut e2) = join(&f.registry, "room-2", "p2").await.unwrap();

        f.registry.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), f.task)
            .await
            .expect("registry stopped")
            .unwrap();

        for events in [&mut e1, &mut e2] {
            let mut closed = None;
            while let Ok(event) = events.try_recv() {
                if let PeerEvent::Closed { reason } = event {
                    closed = Some(reason);
                }
            }
            assert_eq!(closed, Some(LeaveReason::RoomClosed));
        }
        assert!(p1.handle.is_cancelled());
        assert!(f.registry.is_cancelled());
    }
}
