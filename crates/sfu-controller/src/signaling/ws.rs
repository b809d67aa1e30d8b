//! WebSocket route for signaling at `GET /signaling`.
//!
//! Each connection runs one [`SignalingSession`]. Requests are handled in
//! arrival order and the response is written before any notification queued
//! meanwhile. Authentication happens in front of this service.

use super::messages::ServerFrame;
use super::session::SignalingSession;
use crate::actors::RoomRegistryHandle;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Keep-alive ping interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Create the signaling router.
pub fn signaling_router(registry: RoomRegistryHandle) -> Router {
    Router::new()
        .route("/signaling", get(signaling_handler))
        .with_state(registry)
}

async fn signaling_handler(
    ws: WebSocketUpgrade,
    State(registry): State<RoomRegistryHandle>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: RoomRegistryHandle) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut events) = mpsc::unbounded_channel();
    let mut session = SignalingSession::new(registry, sink);

    info!(
        target: "sfu.signaling",
        connection_id = %session.connection_id(),
        "Signaling client connected"
    );

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = session.handle_text(&text).await;
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(
                            target: "sfu.signaling",
                            connection_id = %session.connection_id(),
                            "Signaling client disconnected"
                        );
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(
                            target: "sfu.signaling",
                            connection_id = %session.connection_id(),
                            error = %e,
                            "WebSocket receive error"
                        );
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            Some(event) = events.recv() => {
                session.observe(&event);
                let frame = ServerFrame::notification(event.into());
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close().await;

    info!(
        target: "sfu.signaling",
        connection_id = %session.connection_id(),
        "Signaling handler exiting"
    );
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(target: "sfu.signaling", error = %e, "Failed to serialize signaling frame");
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await
}
