//! SFU Controller
//!
//! Session orchestration service for a selective-forwarding media engine.
//!
//! # Servers
//!
//! - WebSocket signaling for peers (default: 0.0.0.0:8080, `GET /signaling`)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Launch the media worker under the `EngineSupervisor`
//! 4. Spawn the `RoomRegistryActor`
//! 5. Start health and signaling servers
//! 6. Wait for shutdown signal
//!
//! # Shutdown Flow
//!
//! Readiness drops first, then the registry tears every room and peer down
//! while the engine is still alive, then the worker is stopped.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sfu_controller::actors::{ActorMetrics, RoomRegistryActor};
use sfu_controller::config::{Config, LogFormat};
use sfu_controller::engine::worker::{WorkerLauncher, WorkerOptions};
use sfu_controller::engine::{EngineSupervisor, RestartPolicy};
use sfu_controller::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_controller::signaling::signaling_router;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// How long the registry gets to tear down every room.
const REGISTRY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the worker gets to exit after the registry is gone.
const ENGINE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration is read before tracing so the log format can be honoured;
    // a config error is reported on stderr through the default text layer.
    let config = Config::from_env();
    let log_format = config
        .as_ref()
        .map_or(LogFormat::Text, |config| config.log_format);
    init_tracing(log_format);

    info!("Starting SFU Controller");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        sfu_id = %config.sfu_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        worker_bin = %config.worker_bin,
        rtc_listen_ip = %config.rtc_listen_ip,
        rtc_announced_address = ?config.rtc_announced_address,
        max_peers_per_room = config.max_peers_per_room,
        transport_connect_timeout_seconds = config.transport_connect_timeout_seconds,
        engine_operation_timeout_seconds = config.engine_operation_timeout_seconds,
        ice_failure_grace_seconds = config.ice_failure_grace_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    // Launch the media worker (MUST succeed - nothing works without it)
    info!(worker_bin = %config.worker_bin, "Launching media worker...");
    let launcher = Arc::new(WorkerLauncher::new(WorkerOptions {
        bin: config.worker_bin.clone(),
        args: config.worker_args.clone(),
        listen_ip: config.rtc_listen_ip.clone(),
        announced_address: config.rtc_announced_address.clone(),
    }));
    let restart_policy = RestartPolicy {
        initial_delay: Duration::from_millis(config.engine_restart_delay_ms),
        max_delay: Duration::from_millis(config.engine_restart_max_delay_ms),
    };
    let supervisor = EngineSupervisor::start(launcher, restart_policy, CancellationToken::new())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to launch media worker");
            e
        })?;
    info!("Media worker running");

    let health_state = Arc::new(HealthState::new(supervisor.availability_flag()));

    info!("Initializing actor system...");
    let (registry, registry_task) = RoomRegistryActor::spawn(
        Arc::clone(&supervisor),
        config.session_settings(),
        ActorMetrics::new(),
        CancellationToken::new(),
    );
    info!("Actor system initialized");

    // Servers stop on their own token so they can outlive the registry
    // just long enough to flush close frames.
    let shutdown_token = CancellationToken::new();

    // Health server (liveness, readiness, Prometheus /metrics)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(registry.clone()).layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    info!(addr = %signaling_addr, "Signaling server bound successfully");

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("SFU Controller running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer stops sending peers
    health_state.set_not_ready();

    // Rooms tear their peers down while the engine can still close objects
    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Registry shutdown request failed");
    }
    match tokio::time::timeout(REGISTRY_SHUTDOWN_TIMEOUT, registry_task).await {
        Ok(Ok(())) => info!("Actor system stopped"),
        Ok(Err(e)) => error!(error = %e, "Registry task failed"),
        Err(_) => warn!(
            timeout_secs = REGISTRY_SHUTDOWN_TIMEOUT.as_secs(),
            "Registry did not stop in time"
        ),
    }

    supervisor.shutdown(ENGINE_SHUTDOWN_TIMEOUT).await;

    shutdown_token.cancel();

    info!("SFU Controller shutdown complete");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sfu_controller=debug,sfu=debug,tower_http=debug".into());

    let fmt_layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
