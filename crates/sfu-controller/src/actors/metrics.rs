//! Actor metrics and mailbox monitoring.
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Room       | < 100  | 100-500 | > 500    |
//! | Peer       | < 50   | 50-200  | > 200    |

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for room actors (and the registry).
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for peer actors.
pub const PEER_MAILBOX_NORMAL: usize = 50;
pub const PEER_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RoomRegistryActor` (singleton).
    Registry,
    /// `RoomActor` (one per room).
    Room,
    /// `PeerActor` (one per signaling connection in a room).
    Peer,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Peer => "peer",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_WARNING,
            ActorType::Peer => PEER_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_NORMAL,
            ActorType::Peer => PEER_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth of one actor's mailbox.
///
/// Depth is derived from the channel itself (`max_capacity - capacity`) when
/// a message is taken, so it also counts messages still waiting.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record the depth observed when a message was dequeued.
    pub fn record_depth(&self, depth: usize) {
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);

        match self.level_for_depth(depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
                prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
            }
            MailboxLevel::Warning => {
                debug!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    "Mailbox depth elevated"
                );
                prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
            }
            MailboxLevel::Normal => {}
        }
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Depth of a bounded mpsc mailbox, as seen from the receiver.
#[must_use]
pub fn mailbox_depth<T>(receiver: &tokio::sync::mpsc::Receiver<T>) -> usize {
    receiver.max_capacity().saturating_sub(receiver.capacity())
}

/// Aggregated counters for the actor system.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_rooms: AtomicUsize,
    pub active_peers: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let count = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(count);
    }

    pub fn room_removed(&self) {
        let previous = self
            .active_rooms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .unwrap_or(0);
        prom::set_rooms_active(previous.saturating_sub(1));
    }

    pub fn peer_joined(&self) {
        self.active_peers.fetch_add(1, Ordering::Relaxed);
        prom::record_peer_joined();
    }

    pub fn peer_left(&self) {
        if self
            .active_peers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            prom::record_peer_left();
        }
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        self.actor_panics.fetch_add(1, Ordering::Relaxed);
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "sfu.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = self.actor_panics.load(Ordering::Relaxed),
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.active_peers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_as_str() {
        assert_eq!(ActorType::Registry.as_str(), "registry");
        assert_eq!(ActorType::Room.as_str(), "room");
        assert_eq!(ActorType::Peer.as_str(), "peer");
    }

    #[test]
    fn test_actor_type_thresholds() {
        assert_eq!(ActorType::Room.normal_threshold(), 100);
        assert_eq!(ActorType::Room.warning_threshold(), 500);
        assert_eq!(ActorType::Peer.normal_threshold(), 50);
        assert_eq!(ActorType::Peer.warning_threshold(), 200);
    }

    #[test]
    fn test_mailbox_monitor_tracks_peak() {
        let monitor = MailboxMonitor::new(ActorType::Room, "room-1");

        monitor.record_depth(3);
        monitor.record_depth(10);
        monitor.record_depth(1);

        assert_eq!(monitor.peak_depth(), 10);
        assert_eq!(monitor.messages_processed(), 3);
    }

    #[test]
    fn test_mailbox_levels() {
        let monitor = MailboxMonitor::new(ActorType::Peer, "peer-1");
        assert_eq!(monitor.level_for_depth(10), MailboxLevel::Normal);
        assert_eq!(monitor.level_for_depth(75), MailboxLevel::Warning);
        assert_eq!(monitor.level_for_depth(201), MailboxLevel::Critical);

        // Elevated depths are recorded without panicking
        monitor.record_depth(75);
        monitor.record_depth(250);
    }

    #[tokio::test]
    async fn test_mailbox_depth_counts_queued_messages() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u8>(8);
        assert_eq!(mailbox_depth(&rx), 0);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert_eq!(mailbox_depth(&rx), 2);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();

        metrics.room_created();
        metrics.room_created();
        metrics.peer_joined();
        assert_eq!(metrics.room_count(), 2);
        assert_eq!(metrics.peer_count(), 1);

        metrics.room_removed();
        metrics.peer_left();
        metrics.peer_left();
        assert_eq!(metrics.room_count(), 1);
        assert_eq!(metrics.peer_count(), 0, "never underflows");
    }

    #[test]
    fn test_actor_metrics_panics() {
        let metrics = ActorMetrics::new();
        metrics.record_panic(ActorType::Room);
        metrics.record_panic(ActorType::Peer);
        assert_eq!(metrics.actor_panics.load(Ordering::Relaxed), 2);
    }
}
