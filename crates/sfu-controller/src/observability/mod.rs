//! Observability module for the SFU Controller.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Rooms with a video session |
//! | `sfu_peers_active` | Gauge | none | Registered peers |
//! | `sfu_producers_created_total` | Counter | `kind` | Outbound tracks created |
//! | `sfu_producers_closed_total` | Counter | `kind` | Outbound tracks closed |
//! | `sfu_consumers_created_total` | Counter | `kind` | Inbound flows created |
//! | `sfu_consume_rejected_total` | Counter | `reason` | Consume requests without a consumer |
//! | `sfu_engine_operation_latency_seconds` | Histogram | `operation` | Engine call latency |
//! | `sfu_engine_available` | Gauge | none | Worker running |
//! | `sfu_engine_restarts_total` | Counter | none | Worker restarts |
//! | `sfu_transport_failures_total` | Counter | `direction`, `layer` | ICE/DTLS failures |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Actor task panics |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
