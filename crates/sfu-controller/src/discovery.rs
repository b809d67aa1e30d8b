//! Producer discovery.
//!
//! Every peer must end up consuming every other peer's producers exactly
//! once. Peers learn about producers through two paths:
//!
//! - the join-time batch (`existing-producers`), computed once when the peer
//!   finishes its handshake, from the room's producer index at that instant;
//! - per-producer announcements (`new-producer-available`), sent to every
//!   ready peer when a producer is created.
//!
//! Both paths are computed inside the room actor, so a producer is either in
//! the index when a peer becomes ready (batch) or created afterwards
//! (announcement), never both.
//!
//! The consumed-set closes the remaining race: a peer records a producer id
//! as `Reserved` before any engine call starts, and only then asks the engine
//! for a consumer. A second request for the same id is rejected as a
//! duplicate.

use crate::actors::messages::PeerIdentity;
use common::types::{ConsumerId, MediaKind, ProducerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One producer as advertised to other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAnnouncement {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub peer_id: String,
    pub identity: PeerIdentity,
}

/// State of one entry in a consumed-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// Recorded before the engine call; no consumer yet.
    Reserved,
    /// Engine consumer exists.
    Active(ConsumerId),
}

/// Producers a peer has begun consuming.
///
/// A producer id appears at most once.
#[derive(Debug, Default, Clone)]
pub struct ConsumedSet {
    entries: HashMap<ProducerId, Consumption>,
}

impl ConsumedSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, producer_id: &ProducerId) -> bool {
        self.entries.contains_key(producer_id)
    }

    #[must_use]
    pub fn get(&self, producer_id: &ProducerId) -> Option<Consumption> {
        self.entries.get(producer_id).copied()
    }

    /// Record a producer before consuming it. Returns false if already present.
    pub fn reserve(&mut self, producer_id: ProducerId) -> bool {
        if self.entries.contains_key(&producer_id) {
            return false;
        }
        self.entries.insert(producer_id, Consumption::Reserved);
        true
    }

    /// Attach the created consumer. Returns false if the reservation is gone.
    pub fn confirm(&mut self, producer_id: ProducerId, consumer_id: ConsumerId) -> bool {
        match self.entries.get_mut(&producer_id) {
            Some(entry) => {
                *entry = Consumption::Active(consumer_id);
                true
            }
            None => false,
        }
    }

    /// Drop an entry (failed consume, or the producer closed).
    pub fn release(&mut self, producer_id: &ProducerId) -> Option<Consumption> {
        self.entries.remove(producer_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn producer_ids(&self) -> impl Iterator<Item = &ProducerId> {
        self.entries.keys()
    }
}

/// Join-time batch: producers owned by other peers, minus what `peer_id` already consumes.
pub fn existing_producers_for<'a>(
    peer_id: &str,
    consumed: &ConsumedSet,
    producers: impl IntoIterator<Item = &'a ProducerAnnouncement>,
) -> Vec<ProducerAnnouncement> {
    producers
        .into_iter()
        .filter(|p| p.peer_id != peer_id && !consumed.contains(&p.producer_id))
        .cloned()
        .collect()
}

/// A peer as seen by the announcement fan-out.
#[derive(Debug, Clone, Copy)]
pub struct AnnouncementCandidate<'a> {
    pub peer_id: &'a str,
    /// Join handshake completed and not leaving.
    pub ready: bool,
    pub consumed: &'a ConsumedSet,
}

/// Peers that should receive `new-producer-available` for `producer`.
pub fn announcement_targets<'a>(
    producer: &ProducerAnnouncement,
    candidates: impl IntoIterator<Item = AnnouncementCandidate<'a>>,
) -> Vec<&'a str> {
    candidates
        .into_iter()
        .filter(|c| {
            c.ready && c.peer_id != producer.peer_id && !c.consumed.contains(&producer.producer_id)
        })
        .map(|c| c.peer_id)
        .collect()
}
