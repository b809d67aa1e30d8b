//! Engine supervisor.
//!
//! Owns the current [`MediaEngine`] instance and restarts it when the worker
//! dies. While a restart is pending, [`EngineSupervisor::engine`] returns
//! `EngineUnavailable`; sessions established on the dead worker are not torn
//! down here.
//!
//! Each successful launch bumps the engine generation. Rooms tag their router
//! with the generation that created it and recreate it when it changes.

use super::{EngineEvent, EngineLauncher, MediaEngine, ENGINE_EVENT_CAPACITY};
use crate::errors::SfuError;
use crate::observability::metrics;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Restart backoff for a dead worker.
///
/// Attempts are unbounded; the delay doubles from `initial_delay` up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart attempt number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

struct Current {
    engine: Option<Arc<dyn MediaEngine>>,
    generation: u64,
}

/// Supervises the media engine worker.
pub struct EngineSupervisor {
    current: RwLock<Current>,
    generation: AtomicU64,
    available: Arc<AtomicBool>,
    events: broadcast::Sender<EngineEvent>,
    launcher: Arc<dyn EngineLauncher>,
    policy: RestartPolicy,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineSupervisor {
    /// Launch the first engine and start supervising it.
    ///
    /// Fails fast if the first launch fails.
    pub async fn start(
        launcher: Arc<dyn EngineLauncher>,
        policy: RestartPolicy,
        cancel_token: CancellationToken,
    ) -> Result<Arc<Self>, SfuError> {
        let engine = launcher.launch().await.map_err(|e| {
            error!(target: "sfu.engine.supervisor", error = %e, "Initial engine launch failed");
            SfuError::from(e)
        })?;

        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);

        let supervisor = Arc::new(Self {
            current: RwLock::new(Current {
                engine: Some(engine),
                generation: 1,
            }),
            generation: AtomicU64::new(1),
            available: Arc::new(AtomicBool::new(true)),
            events,
            launcher,
            policy,
            cancel_token,
            task: Mutex::new(None),
        });
        metrics::set_engine_available(true);

        let task = tokio::spawn(Arc::clone(&supervisor).run());
        *supervisor.task.lock().await = Some(task);

        info!(target: "sfu.engine.supervisor", "Media engine started");
        Ok(supervisor)
    }

    /// The live engine, or `EngineUnavailable` while restarting.
    pub async fn engine(&self) -> Result<Arc<dyn MediaEngine>, SfuError> {
        self.engine_with_generation().await.map(|(engine, _)| engine)
    }

    /// The live engine together with its generation.
    pub async fn engine_with_generation(&self) -> Result<(Arc<dyn MediaEngine>, u64), SfuError> {
        let current = self.current.read().await;
        match &current.engine {
            Some(engine) if engine.is_alive() => Ok((Arc::clone(engine), current.generation)),
            _ => Err(SfuError::EngineUnavailable),
        }
    }

    /// Generation of the most recent successful launch.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Shared availability flag (for readiness probes).
    #[must_use]
    pub fn availability_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.available)
    }

    /// Engine events, surviving restarts.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Stop supervising and shut the current engine down.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel_token.cancel();

        if let Some(task) = self.task.lock().await.take() {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(target: "sfu.engine.supervisor", "Supervisor task did not stop in time");
            }
        }

        let engine = {
            let mut current = self.current.write().await;
            current.engine.take()
        };
        self.set_available(false);

        if let Some(engine) = engine {
            engine.shutdown().await;
        }
        info!(target: "sfu.engine.supervisor", "Media engine stopped");
    }

    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        metrics::set_engine_available(available);
    }

    async fn run(self: Arc<Self>) {
        loop {
            let Some(reason) = self.watch_current().await else {
                return;
            };

            {
                let mut current = self.current.write().await;
                current.engine = None;
            }
            self.set_available(false);
            error!(
                target: "sfu.engine.supervisor",
                reason = %reason,
                "Media engine worker died, restarting"
            );

            if !self.relaunch().await {
                return;
            }
        }
    }

    /// Forward events from the current engine until it dies.
    ///
    /// Returns the death reason, or `None` when cancelled.
    async fn watch_current(&self) -> Option<String> {
        let engine = self.current.read().await.engine.clone()?;
        let mut rx = engine.subscribe();

        if !engine.is_alive() {
            return Some("worker exited during startup".to_string());
        }

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return None,
                event = rx.recv() => match event {
                    Ok(EngineEvent::WorkerDied { reason }) => {
                        let _ = self.events.send(EngineEvent::WorkerDied {
                            reason: reason.clone(),
                        });
                        return Some(reason);
                    }
                    Ok(event) => {
                        let _ = self.events.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "sfu.engine.supervisor",
                            skipped,
                            "Engine event subscriber lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let reason = "engine event channel closed".to_string();
                        let _ = self.events.send(EngineEvent::WorkerDied {
                            reason: reason.clone(),
                        });
                        return Some(reason);
                    }
                }
            }
        }
    }

    /// Retry launching with backoff. Returns false when cancelled.
    async fn relaunch(&self) -> bool {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.policy.delay_for(attempt);
            debug!(
                target: "sfu.engine.supervisor",
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Waiting before engine restart"
            );

            tokio::select! {
                () = self.cancel_token.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }

            match self.launcher.launch().await {
                Ok(engine) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    {
                        let mut current = self.current.write().await;
                        current.engine = Some(engine);
                        current.generation = generation;
                    }
                    self.set_available(true);
                    metrics::record_engine_restart();
                    info!(
                        target: "sfu.engine.supervisor",
                        generation,
                        attempts = attempt + 1,
                        "Media engine restarted"
                    );
                    return true;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!(
                        target: "sfu.engine.supervisor",
                        error = %e,
                        attempt,
                        "Engine restart failed, will retry"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::mock::MockLauncher;

    fn fast_policy() -> RestartPolicy {
        RestartPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        }
    }

    #[test]
    fn test_restart_policy_backoff_is_capped() {
        let policy = fast_policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(400));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_start_fails_fast_when_first_launch_fails() {
        let launcher = Arc::new(MockLauncher::new());
        launcher.fail_launches(1);

        let result =
            EngineSupervisor::start(launcher, fast_policy(), CancellationToken::new()).await;
        assert!(matches!(result, Err(SfuError::EngineUnavailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_makes_engine_unavailable_until_restart() {
        let launcher = Arc::new(MockLauncher::new());
        let supervisor = EngineSupervisor::start(
            Arc::clone(&launcher) as Arc<dyn EngineLauncher>,
            fast_policy(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(supervisor.generation(), 1);
        assert!(supervisor.engine().await.is_ok());

        let mut events = supervisor.subscribe();
        launcher.current().unwrap().crash("segfault");

        let event = events.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::WorkerDied { .. }));
        tokio::task::yield_now().await;
        assert!(matches!(
            supervisor.engine().await,
            Err(SfuError::EngineUnavailable)
        ));
        assert!(!supervisor.is_available());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(supervisor.engine().await.is_ok());
        assert!(supervisor.is_available());
        assert_eq!(supervisor.generation(), 2);
        assert_eq!(launcher.launch_count(), 2);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_retries_with_backoff() {
        let launcher = Arc::new(MockLauncher::new());
        let supervisor = EngineSupervisor::start(
            Arc::clone(&launcher) as Arc<dyn EngineLauncher>,
            fast_policy(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        launcher.fail_launches(2);
        launcher.current().unwrap().crash("oom");

        // 100ms (fail) + 200ms (fail) + 400ms (ok)
        tokio::time::sleep(Duration::from_millis(650)).await;
        assert!(supervisor.engine().await.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(supervisor.engine().await.is_ok());
        assert_eq!(launcher.launch_count(), 4);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let launcher = Arc::new(MockLauncher::new());
        let supervisor = EngineSupervisor::start(
            Arc::clone(&launcher) as Arc<dyn EngineLauncher>,
            fast_policy(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut events = supervisor.subscribe();

        // Let the supervisor subscribe to the engine first.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let transport_id = common::types::TransportId::new();
        launcher
            .current()
            .unwrap()
            .emit_ice_state(transport_id, crate::engine::IceState::Checking);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            EngineEvent::IceStateChanged {
                transport_id,
                state: crate::engine::IceState::Checking,
            }
        );

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_engine() {
        let launcher = Arc::new(MockLauncher::new());
        let supervisor = EngineSupervisor::start(
            Arc::clone(&launcher) as Arc<dyn EngineLauncher>,
            fast_policy(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        supervisor.shutdown(Duration::from_secs(1)).await;

        assert!(!supervisor.is_available());
        assert!(!launcher.current().unwrap().is_alive());
        assert!(supervisor.engine().await.is_err());
    }
}
