//! Health endpoints for the SFU Controller.
//!
//! Provides Kubernetes-compatible health endpoints:
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (can we accept new peers?)
//!
//! The `/metrics` endpoint is merged in by `main` from the Prometheus handle.
//!
//! # Health State
//!
//! - `live`: Always true after startup
//! - `ready`: True once startup completed and until draining begins
//! - `engine_available`: Shared with the engine supervisor; false while the
//!   media worker is restarting

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health state for the SFU Controller.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
    engine_available: Arc<AtomicBool>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false) tracking the given
    /// engine availability flag.
    #[must_use]
    pub fn new(engine_available: Arc<AtomicBool>) -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            engine_available,
        }
    }

    /// Mark the service as ready to serve traffic.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (draining).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_engine_available(&self) -> bool {
        self.engine_available.load(Ordering::SeqCst)
    }

    /// Ready when startup completed, not draining, and the engine is up.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.is_engine_available()
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
