//! Integration tests for producer discovery.
//!
//! Drives full signaling sessions against the registry and `MockEngine`:
//! - Producers are announced exactly once to every ready peer
//! - Late joiners get the producers already live in one batch
//! - Consumers start paused and are resumed once

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::MediaKind;
use sfu_controller::signaling::ServerMessage;
use sfu_test_utils::{audio_only_capabilities, SfuHarness, TestPeer};

fn announcements_of(messages: &[ServerMessage], producer_id: common::types::ProducerId) -> usize {
    messages
        .iter()
        .filter(|m| match m {
            ServerMessage::NewProducerAvailable(a) => a.producer_id == producer_id,
            ServerMessage::ExistingProducers { producers } => {
                producers.iter().any(|p| p.producer_id == producer_id)
            }
            _ => false,
        })
        .count()
}

// ============================================================================
// Announcement
// ============================================================================

#[tokio::test]
async fn test_new_producer_announced_once_to_other_peer() {
    let harness = SfuHarness::new().await;
    let mut p1 = harness.probe();
    let mut p2 = harness.probe();

    p1.join_ready("room-a", &TestPeer::new("p1").teacher()).await;
    p2.join_ready("room-a", &TestPeer::new("p2")).await;

    let producer_id = p1.produce_video().await;

    let announced = p2.expect_new_producer().await;
    assert_eq!(announced.producer_id, producer_id);
    assert_eq!(announced.kind, MediaKind::Video);
    assert_eq!(announced.peer_id, p1.peer_id());
    assert_eq!(announced.identity.display_name, "p1");

    // Nothing else mentions the producer
    let rest = p2.drain().await;
    assert_eq!(announcements_of(&rest, producer_id), 0);

    // The producer is never announced to its owner
    let own = p1.drain().await;
    assert_eq!(announcements_of(&own, producer_id), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_gets_existing_producers_once() {
    let harness = SfuHarness::new().await;
    let mut p1 = harness.probe();
    let mut p2 = harness.probe();
    let mut p3 = harness.probe();

    p1.join_ready("room-b", &TestPeer::new("p1")).await;
    p2.join_ready("room-b", &TestPeer::new("p2")).await;
    let video = p1.produce_video().await;
    let audio = p1.produce_audio().await;
    p2.drain().await;
    p1.drain().await;

    p3.join_ready("room-b", &TestPeer::new("p3")).await;

    let mut existing = p3.expect_existing_producers().await;
    existing.sort_by_key(|p| p.kind == MediaKind::Video);
    assert_eq!(
        existing.iter().map(|p| p.producer_id).collect::<Vec<_>>(),
        vec![audio, video]
    );

    let rest = p3.drain().await;
    assert_eq!(announcements_of(&rest, video), 0);
    assert_eq!(announcements_of(&rest, audio), 0);

    // Existing members only learn that p3 arrived
    let p1_events = p1.drain().await;
    assert_eq!(announcements_of(&p1_events, video), 0);
    assert!(p1_events
        .iter()
        .any(|m| matches!(m, ServerMessage::UserJoinedVideo { peer_id, .. } if *peer_id == p3.peer_id())));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_joined_lists_ready_peers_only() {
    let harness = SfuHarness::new().await;
    let mut ready = harness.probe();
    let mut pending = harness.probe();
    let mut newcomer = harness.probe();

    ready.join_ready("room-c", &TestPeer::new("ready")).await;
    pending.join("room-c", &TestPeer::new("pending")).await;

    let ServerMessage::Joined { peers, room_id, .. } =
        newcomer.join("room-c", &TestPeer::new("newcomer")).await
    else {
        unreachable!("join accepted");
    };

    assert_eq!(room_id, "room-c");
    assert_eq!(
        peers.iter().map(|p| p.peer_id.clone()).collect::<Vec<_>>(),
        vec![ready.peer_id()]
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_peer_without_transports_is_not_announced_to() {
    let harness = SfuHarness::new().await;
    let mut producer = harness.probe();
    let mut lurker = harness.probe();

    producer.join_ready("room-d", &TestPeer::new("producer")).await;
    lurker.join("room-d", &TestPeer::new("lurker")).await;

    let producer_id = producer.produce_video().await;
    let before = lurker.drain().await;
    assert_eq!(announcements_of(&before, producer_id), 0);

    // Completing the handshake delivers it through the join-time batch
    let ServerMessage::TransportsCreated(_) = lurker
        .set_capabilities(sfu_test_utils::client_capabilities())
        .await
    else {
        unreachable!("set-capabilities accepted");
    };
    let existing = lurker.expect_existing_producers().await;
    assert_eq!(
        existing.iter().map(|p| p.producer_id).collect::<Vec<_>>(),
        vec![producer_id]
    );

    harness.shutdown().await;
}

// ============================================================================
// Consumption
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_consumer_created_paused_then_resumed() {
    let harness = SfuHarness::new().await;
    let mut p1 = harness.probe();
    let mut p2 = harness.probe();

    p1.join_ready("room-e", &TestPeer::new("p1")).await;
    p2.join_ready("room-e", &TestPeer::new("p2")).await;
    let producer_id = p1.produce_video().await;
    p2.expect_new_producer().await;

    let ServerMessage::ConsumerCreated(consumer) = p2.consume(producer_id).await else {
        unreachable!("consume accepted");
    };
    assert!(consumer.paused);
    assert_eq!(consumer.producer_id, producer_id);
    assert_eq!(harness.engine().consumer_paused(consumer.id), Some(true));

    let resumed = p2
        .expect_event(|m| matches!(m, ServerMessage::ConsumerResumed { .. }))
        .await;
    assert_eq!(
        resumed,
        ServerMessage::ConsumerResumed {
            consumer_id: consumer.id,
            producer_id,
        }
    );
    assert_eq!(harness.engine().consumer_paused(consumer.id), Some(false));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_second_consume_of_same_producer_is_skipped() {
    let harness = SfuHarness::new().await;
    let mut p1 = harness.probe();
    let mut p2 = harness.probe();

    p1.join_ready("room-f", &TestPeer::new("p1")).await;
    p2.join_ready("room-f", &TestPeer::new("p2")).await;
    let producer_id = p1.produce_video().await;

    assert!(matches!(
        p2.consume(producer_id).await,
        ServerMessage::ConsumerCreated(_)
    ));
    assert_eq!(
        p2.consume(producer_id).await,
        ServerMessage::ConsumeSkipped { producer_id }
    );
    assert_eq!(harness.engine().consumer_count(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_incompatible_consumer_gets_creation_failed() {
    let harness = SfuHarness::new().await;
    let mut p1 = harness.probe();
    let mut p2 = harness.probe();

    p1.join_ready("room-g", &TestPeer::new("p1")).await;
    p2.join_ready_with("room-g", &TestPeer::new("p2"), audio_only_capabilities())
        .await;
    let producer_id = p1.produce_video().await;

    let response = p2.consume(producer_id).await;
    assert!(
        matches!(
            response,
            ServerMessage::ConsumerCreationFailed { producer_id: p, code: 8, .. } if p == producer_id
        ),
        "unexpected response: {response:?}"
    );

    // The reservation was released; the audio track still works
    let audio = p1.produce_audio().await;
    assert!(matches!(
        p2.consume(audio).await,
        ServerMessage::ConsumerCreated(_)
    ));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_consume_own_producer_fails() {
    let harness = SfuHarness::new().await;
    let mut p1 = harness.probe();

    p1.join_ready("room-h", &TestPeer::new("p1")).await;
    let producer_id = p1.produce_video().await;

    assert!(matches!(
        p1.consume(producer_id).await,
        ServerMessage::ConsumerCreationFailed { .. }
    ));
    assert_eq!(harness.engine().consumer_count(), 0);

    harness.shutdown().await;
}
