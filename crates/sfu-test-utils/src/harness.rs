//! In-process SFU: engine supervisor and room registry over `MockLauncher`.

use crate::probe::SignalingProbe;
use sfu_controller::actors::{ActorMetrics, RoomRegistryActor, RoomRegistryHandle};
use sfu_controller::config::SessionSettings;
use sfu_controller::engine::mock::{MockEngine, MockLauncher};
use sfu_controller::engine::{EngineSupervisor, RestartPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Restart backoff short enough for tests.
pub const TEST_RESTART_POLICY: RestartPolicy = RestartPolicy {
    initial_delay: Duration::from_millis(50),
    max_delay: Duration::from_millis(400),
};

/// Engine supervisor plus registry, wired to a [`MockLauncher`].
pub struct SfuHarness {
    pub launcher: Arc<MockLauncher>,
    pub supervisor: Arc<EngineSupervisor>,
    pub registry: RoomRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
    registry_task: Option<JoinHandle<()>>,
}

impl SfuHarness {
    /// Harness with default session settings.
    pub async fn new() -> Self {
        Self::with_settings(SessionSettings::default()).await
    }

    /// Harness with custom session settings.
    ///
    /// # Panics
    ///
    /// Panics if the first mock engine launch fails.
    pub async fn with_settings(settings: SessionSettings) -> Self {
        let launcher = Arc::new(MockLauncher::new());
        let supervisor = EngineSupervisor::start(
            launcher.clone(),
            TEST_RESTART_POLICY,
            CancellationToken::new(),
        )
        .await
        .expect("mock engine launches");

        let metrics = ActorMetrics::new();
        let (registry, registry_task) = RoomRegistryActor::spawn(
            Arc::clone(&supervisor),
            settings,
            Arc::clone(&metrics),
            CancellationToken::new(),
        );

        Self {
            launcher,
            supervisor,
            registry,
            metrics,
            registry_task: Some(registry_task),
        }
    }

    /// The engine currently running.
    ///
    /// # Panics
    ///
    /// Panics if no engine was ever launched.
    #[must_use]
    pub fn engine(&self) -> Arc<MockEngine> {
        self.launcher.current().expect("an engine was launched")
    }

    /// A fresh signaling connection.
    #[must_use]
    pub fn probe(&self) -> SignalingProbe {
        SignalingProbe::new(self.registry.clone())
    }

    /// Wait until the supervisor has brought up engine generation `generation`.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within ten (possibly paused) seconds.
    pub async fn wait_for_generation(&self, generation: u64) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.supervisor.generation() < generation || !self.supervisor.is_available() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("engine restarted in time");
    }

    /// Shut the registry down, then the engine.
    ///
    /// # Panics
    ///
    /// Panics if the registry does not stop within five seconds.
    pub async fn shutdown(mut self) {
        self.registry.shutdown().await.expect("registry accepts shutdown");
        if let Some(task) = self.registry_task.take() {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("registry stopped in time")
                .expect("registry task did not panic");
        }
        self.supervisor.shutdown(Duration::from_secs(5)).await;
    }
}
