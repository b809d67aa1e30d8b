//! In-memory media engine for tests.
//!
//! `MockEngine` keeps the same bookkeeping a real worker would (routers,
//! transports, producers, consumers) so tests can assert on leaks, and adds
//! failure injection, per-operation delays, and crash simulation.
//! `MockLauncher` hands out a fresh `MockEngine` per launch.

use super::types::{
    ConsumerDescriptor, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate,
    IceParameters, IceState, RtpCapabilities, RtpParameters, TransportDescriptor,
};
use super::{EngineEvent, EngineLauncher, MediaEngine, ENGINE_EVENT_CAPACITY};
use crate::errors::EngineError;
use async_trait::async_trait;
use common::types::{
    ConsumerId, MediaKind, ProducerId, RouterId, TransportDirection, TransportId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// Engine operations that can be delayed, failed, or counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateRouter,
    RouterCapabilities,
    CreateTransport,
    ConnectTransport,
    RestartIce,
    Produce,
    CanConsume,
    Consume,
    ResumeConsumer,
    CloseProducer,
    CloseConsumer,
    CloseTransport,
    CloseRouter,
}

#[derive(Debug)]
struct MockTransport {
    direction: TransportDirection,
    connected: bool,
}

#[derive(Debug)]
struct MockProducer {
    transport: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug)]
struct MockConsumer {
    transport: TransportId,
    paused: bool,
}

#[derive(Debug, Default)]
struct MockState {
    routers: HashMap<RouterId, String>,
    transports: HashMap<TransportId, MockTransport>,
    producers: HashMap<ProducerId, MockProducer>,
    consumers: HashMap<ConsumerId, MockConsumer>,
    calls: HashMap<MockOp, usize>,
    failures: HashMap<MockOp, EngineError>,
    delays: HashMap<MockOp, Duration>,
}

/// In-memory [`MediaEngine`].
pub struct MockEngine {
    state: Mutex<MockState>,
    alive: AtomicBool,
    events: broadcast::Sender<EngineEvent>,
    capabilities: RtpCapabilities,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Engine offering Opus audio and VP8 video.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(default_router_capabilities())
    }

    #[must_use]
    pub fn with_capabilities(capabilities: RtpCapabilities) -> Self {
        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        Self {
            state: Mutex::new(MockState::default()),
            alive: AtomicBool::new(true),
            events,
            capabilities,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: MockOp, error: EngineError) {
        self.state().failures.insert(op, error);
    }

    /// Delay every call of `op` by `delay` before it takes effect.
    pub fn set_delay(&self, op: MockOp, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    #[must_use]
    pub fn call_count(&self, op: MockOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Simulate the worker process dying.
    pub fn crash(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut state = self.state();
            state.routers.clear();
            state.transports.clear();
            state.producers.clear();
            state.consumers.clear();
        }
        let _ = self.events.send(EngineEvent::WorkerDied {
            reason: reason.to_string(),
        });
    }

    pub fn emit_ice_state(&self, transport_id: TransportId, state: IceState) {
        let _ = self.events.send(EngineEvent::IceStateChanged {
            transport_id,
            state,
        });
    }

    pub fn emit_dtls_state(&self, transport_id: TransportId, state: DtlsState) {
        let _ = self.events.send(EngineEvent::DtlsStateChanged {
            transport_id,
            state,
        });
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.state().routers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.state().transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.state().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state().consumers.len()
    }

    #[must_use]
    pub fn has_producer(&self, producer: ProducerId) -> bool {
        self.state().producers.contains_key(&producer)
    }

    #[must_use]
    pub fn has_consumer(&self, consumer: ConsumerId) -> bool {
        self.state().consumers.contains_key(&consumer)
    }

    /// `Some(paused)` for a live consumer.
    #[must_use]
    pub fn consumer_paused(&self, consumer: ConsumerId) -> Option<bool> {
        self.state().consumers.get(&consumer).map(|c| c.paused)
    }

    /// Count the call, apply any configured delay, then any injected failure.
    async fn enter(&self, op: MockOp) -> Result<(), EngineError> {
        let delay = {
            let mut state = self.state();
            *state.calls.entry(op).or_insert(0) += 1;
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable);
        }
        match self.state().failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_router(&self, room_id: &str) -> Result<RouterId, EngineError> {
        self.enter(MockOp::CreateRouter).await?;
        let id = RouterId::new();
        self.state().routers.insert(id, room_id.to_string());
        Ok(id)
    }

    async fn router_capabilities(&self, router: RouterId) -> Result<RtpCapabilities, EngineError> {
        self.enter(MockOp::RouterCapabilities).await?;
        if !self.state().routers.contains_key(&router) {
            return Err(EngineError::NotFound(format!("router {router}")));
        }
        Ok(self.capabilities.clone())
    }

    async fn close_router(&self, router: RouterId) -> Result<(), EngineError> {
        self.enter(MockOp::CloseRouter).await?;
        self.state().routers.remove(&router);
        Ok(())
    }

    async fn create_transport(
        &self,
        router: RouterId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError> {
        self.enter(MockOp::CreateTransport).await?;
        let mut state = self.state();
        if !state.routers.contains_key(&router) {
            return Err(EngineError::NotFound(format!("router {router}")));
        }
        let id = TransportId::new();
        state.transports.insert(
            id,
            MockTransport {
                direction,
                connected: false,
            },
        );
        Ok(TransportDescriptor {
            id,
            direction,
            ice_parameters: mock_ice_parameters(0),
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                address: "127.0.0.1".to_string(),
                protocol: "udp".to_string(),
                port: 40_000,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "AA:BB:CC:DD".to_string(),
                }],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport: TransportId,
        _dtls: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.enter(MockOp::ConnectTransport).await?;
        let mut state = self.state();
        let entry = state
            .transports
            .get_mut(&transport)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport}")))?;
        if entry.connected {
            return Err(EngineError::Rejected("connect() already called".to_string()));
        }
        entry.connected = true;
        Ok(())
    }

    async fn restart_ice(&self, transport: TransportId) -> Result<IceParameters, EngineError> {
        self.enter(MockOp::RestartIce).await?;
        if !self.state().transports.contains_key(&transport) {
            return Err(EngineError::NotFound(format!("transport {transport}")));
        }
        Ok(mock_ice_parameters(self.call_count(MockOp::RestartIce)))
    }

    async fn close_transport(&self, transport: TransportId) -> Result<(), EngineError> {
        self.enter(MockOp::CloseTransport).await?;
        let mut state = self.state();
        state.transports.remove(&transport);
        state.producers.retain(|_, p| p.transport != transport);
        state.consumers.retain(|_, c| c.transport != transport);
        Ok(())
    }

    async fn produce(
        &self,
        transport: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        self.enter(MockOp::Produce).await?;
        let mut state = self.state();
        match state.transports.get(&transport) {
            Some(t) if t.direction == TransportDirection::Send => {}
            Some(_) => {
                return Err(EngineError::Rejected(
                    "produce on a receive transport".to_string(),
                ))
            }
            None => return Err(EngineError::NotFound(format!("transport {transport}"))),
        }
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::Rejected("no codecs in rtpParameters".to_string()));
        }
        let id = ProducerId::new();
        state.producers.insert(
            id,
            MockProducer {
                transport,
                kind,
                rtp_parameters,
            },
        );
        Ok(id)
    }

    async fn close_producer(&self, producer: ProducerId) -> Result<(), EngineError> {
        self.enter(MockOp::CloseProducer).await?;
        self.state().producers.remove(&producer);
        Ok(())
    }

    async fn can_consume(
        &self,
        _router: RouterId,
        producer: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        self.enter(MockOp::CanConsume).await?;
        let state = self.state();
        let source = state
            .producers
            .get(&producer)
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer}")))?;
        Ok(source
            .rtp_parameters
            .codecs
            .iter()
            .any(|codec| capabilities.supports(source.kind, &codec.mime_type)))
    }

    async fn consume(
        &self,
        transport: TransportId,
        producer: ProducerId,
        capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescriptor, EngineError> {
        self.enter(MockOp::Consume).await?;
        let mut state = self.state();
        match state.transports.get(&transport) {
            Some(t) if t.direction == TransportDirection::Recv => {}
            Some(_) => {
                return Err(EngineError::Rejected(
                    "consume on a send transport".to_string(),
                ))
            }
            None => return Err(EngineError::NotFound(format!("transport {transport}"))),
        }
        let source = state
            .producers
            .get(&producer)
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer}")))?;

        let kind = source.kind;
        let mut rtp_parameters = source.rtp_parameters.clone();
        rtp_parameters
            .codecs
            .retain(|codec| capabilities.supports(kind, &codec.mime_type));

        let id = ConsumerId::new();
        state.consumers.insert(
            id,
            MockConsumer {
                transport,
                paused: true,
            },
        );
        Ok(ConsumerDescriptor {
            id,
            producer_id: producer,
            kind,
            rtp_parameters,
            paused: true,
        })
    }

    async fn resume_consumer(&self, consumer: ConsumerId) -> Result<(), EngineError> {
        self.enter(MockOp::ResumeConsumer).await?;
        let mut state = self.state();
        let entry = state
            .consumers
            .get_mut(&consumer)
            .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer}")))?;
        entry.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer: ConsumerId) -> Result<(), EngineError> {
        self.enter(MockOp::CloseConsumer).await?;
        self.state().consumers.remove(&consumer);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

fn mock_ice_parameters(revision: usize) -> IceParameters {
    IceParameters {
        username_fragment: format!("ufrag{revision}"),
        password: format!("password{revision}"),
        ice_lite: true,
    }
}

/// Router capabilities advertised by `MockEngine::new`.
#[must_use]
pub fn default_router_capabilities() -> RtpCapabilities {
    use super::types::RtpCodecCapability;
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: Some(2),
                parameters: serde_json::Map::new(),
                preferred_payload_type: Some(100),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                channels: None,
                parameters: serde_json::Map::new(),
                preferred_payload_type: Some(101),
            },
        ],
        header_extensions: Vec::new(),
    }
}

/// Launcher producing a fresh [`MockEngine`] per launch.
#[derive(Default)]
pub struct MockLauncher {
    engines: Mutex<Vec<Arc<MockEngine>>>,
    pending_failures: AtomicUsize,
    launches: AtomicUsize,
}

impl MockLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` launches.
    pub fn fail_launches(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of launch attempts, including failed ones.
    #[must_use]
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Most recently launched engine.
    #[must_use]
    pub fn current(&self) -> Option<Arc<MockEngine>> {
        self.engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl EngineLauncher for MockLauncher {
    async fn launch(&self) -> Result<Arc<dyn MediaEngine>, EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::Launch("injected launch failure".to_string()));
        }

        let engine = Arc::new(MockEngine::new());
        self.engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&engine));
        Ok(engine)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::types::RtpCodecParameters;

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90_000,
                channels: None,
                parameters: serde_json::Map::new(),
            }],
            ..RtpParameters::default()
        }
    }

    #[tokio::test]
    async fn test_consumers_start_paused_and_resume() {
        let engine = MockEngine::new();
        let router = engine.create_router("room-1").await.unwrap();
        let send = engine
            .create_transport(router, TransportDirection::Send)
            .await
            .unwrap();
        let recv = engine
            .create_transport(router, TransportDirection::Recv)
            .await
            .unwrap();

        let producer = engine
            .produce(send.id, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let consumer = engine
            .consume(recv.id, producer, default_router_capabilities())
            .await
            .unwrap();

        assert!(consumer.paused);
        assert_eq!(engine.consumer_paused(consumer.id), Some(true));
        engine.resume_consumer(consumer.id).await.unwrap();
        assert_eq!(engine.consumer_paused(consumer.id), Some(false));
    }

    #[tokio::test]
    async fn test_close_unknown_is_noop() {
        let engine = MockEngine::new();
        engine.close_producer(ProducerId::new()).await.unwrap();
        engine.close_consumer(ConsumerId::new()).await.unwrap();
        engine.close_transport(TransportId::new()).await.unwrap();
        engine.close_router(RouterId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_can_consume_checks_codecs() {
        let engine = MockEngine::new();
        let router = engine.create_router("room-1").await.unwrap();
        let send = engine
            .create_transport(router, TransportDirection::Send)
            .await
            .unwrap();
        let producer = engine
            .produce(send.id, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        assert!(engine
            .can_consume(router, producer, &default_router_capabilities())
            .await
            .unwrap());
        assert!(!engine
            .can_consume(router, producer, &RtpCapabilities::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_crash_fails_calls_and_clears_state() {
        let engine = MockEngine::new();
        let mut events = engine.subscribe();
        engine.create_router("room-1").await.unwrap();

        engine.crash("killed");

        assert!(!engine.is_alive());
        assert_eq!(engine.router_count(), 0);
        assert_eq!(
            engine.create_router("room-1").await,
            Err(EngineError::Unavailable)
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::WorkerDied { .. }
        ));
    }

    #[tokio::test]
    async fn test_fail_next_applies_once() {
        let engine = MockEngine::new();
        engine.fail_next(
            MockOp::CreateRouter,
            EngineError::Rejected("nope".to_string()),
        );

        assert!(engine.create_router("r").await.is_err());
        assert!(engine.create_router("r").await.is_ok());
        assert_eq!(engine.call_count(MockOp::CreateRouter), 2);
    }

    #[tokio::test]
    async fn test_launcher_failures_then_success() {
        let launcher = MockLauncher::new();
        launcher.fail_launches(1);

        assert!(launcher.launch().await.is_err());
        assert!(launcher.launch().await.is_ok());
        assert_eq!(launcher.launch_count(), 2);
        assert!(launcher.current().is_some());
    }
}
