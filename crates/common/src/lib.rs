//! Common utilities and types shared across SFU components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

pub use types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportDirection, TransportId};
