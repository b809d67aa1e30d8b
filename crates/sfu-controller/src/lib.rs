//! SFU Controller Service Library
//!
//! Session orchestration for multi-party audio/video rooms on top of an
//! out-of-process selective-forwarding media engine:
//!
//! - Room lifecycle (one engine router per room with a video session)
//! - Per-peer transports, producers and consumers
//! - Producer discovery: who should consume what, and who already does
//! - ICE/DTLS failure detection with a bounded recovery window
//! - Idempotent teardown on leave, disconnect and engine loss
//!
//! # Architecture
//!
//! ```text
//! signaling (WebSocket, one SignalingSession per connection)
//!     │
//!     ▼
//! RoomRegistryActor (singleton)
//! └── RoomActor (one per room)
//!     └── PeerActor (one per joined connection)
//!             │
//!             ▼
//!      EngineSupervisor ──▶ MediaEngine (worker process)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and peer actors
//! - [`config`] - Service configuration from environment
//! - [`discovery`] - Consumed-set bookkeeping and announcement targeting
//! - [`engine`] - Media engine trait, worker binding, supervisor
//! - [`errors`] - Error types with client-facing error codes
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`signaling`] - WebSocket signaling surface

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actors;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod signaling;
