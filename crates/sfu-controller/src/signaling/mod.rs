//! Peer signaling over WebSocket.
//!
//! - [`messages`]: JSON frame types
//! - [`session`]: per-connection request handling
//! - [`ws`]: the axum route

pub mod messages;
pub mod session;
pub mod ws;

pub use messages::{ClientMessage, ClientRequest, ServerFrame, ServerMessage};
pub use session::SignalingSession;
pub use ws::signaling_router;
