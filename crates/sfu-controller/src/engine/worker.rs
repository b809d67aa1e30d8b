//! Media worker subprocess binding.
//!
//! The worker is an external executable speaking JSON lines over stdio:
//!
//! ```text
//! controller → worker   {"id": 7, "method": "transport.connect", "data": {...}}
//! worker → controller   {"id": 7, "ok": true, "data": {...}}
//!                       {"id": 7, "ok": false, "error": {"kind": "notFound", "message": "..."}}
//!                       {"event": "iceStateChange", "data": {"transportId": "...", "state": "failed"}}
//! ```
//!
//! stderr lines are forwarded to tracing. When the process exits every
//! pending request fails with `Unavailable` and `WorkerDied` is broadcast.

use super::types::{
    ConsumerDescriptor, DtlsParameters, DtlsState, IceCandidate, IceParameters, IceState,
    RtpCapabilities, RtpParameters, TransportDescriptor,
};
use super::{EngineEvent, EngineLauncher, MediaEngine, ENGINE_EVENT_CAPACITY};
use crate::errors::EngineError;
use async_trait::async_trait;
use common::types::{
    ConsumerId, MediaKind, ProducerId, RouterId, TransportDirection, TransportId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, EngineError>>>>>;

/// How to start the worker and what it should bind.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub bin: String,
    pub args: Vec<String>,
    pub listen_ip: String,
    pub announced_address: Option<String>,
}

#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    id: u64,
    method: &'a str,
    data: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
enum WorkerErrorKind {
    NotFound,
    #[default]
    #[serde(other)]
    Rejected,
}

#[derive(Debug, Deserialize)]
struct WorkerErrorBody {
    #[serde(default)]
    kind: WorkerErrorKind,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    id: u64,
    ok: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<WorkerErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
enum WorkerNotification {
    #[serde(rename_all = "camelCase")]
    IceStateChange {
        transport_id: TransportId,
        state: IceState,
    },
    #[serde(rename_all = "camelCase")]
    DtlsStateChange {
        transport_id: TransportId,
        state: DtlsState,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WorkerFrame {
    Response(WorkerResponse),
    Notification(WorkerNotification),
}

impl WorkerResponse {
    fn into_result(self) -> Result<Value, EngineError> {
        if self.ok {
            return Ok(self.data);
        }
        let body = self.error.unwrap_or(WorkerErrorBody {
            kind: WorkerErrorKind::Rejected,
            message: "worker returned an error without details".to_string(),
        });
        Err(match body.kind {
            WorkerErrorKind::NotFound => EngineError::NotFound(body.message),
            WorkerErrorKind::Rejected => EngineError::Rejected(body.message),
        })
    }
}

impl From<WorkerNotification> for EngineEvent {
    fn from(notification: WorkerNotification) -> Self {
        match notification {
            WorkerNotification::IceStateChange {
                transport_id,
                state,
            } => EngineEvent::IceStateChanged {
                transport_id,
                state,
            },
            WorkerNotification::DtlsStateChange {
                transport_id,
                state,
            } => EngineEvent::DtlsStateChanged {
                transport_id,
                state,
            },
        }
    }
}

/// Removes a pending entry if the caller stops waiting (e.g. timed out).
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// A running media worker process.
pub struct WorkerProcess {
    options: WorkerOptions,
    writer: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    events: broadcast::Sender<EngineEvent>,
    kill_token: CancellationToken,
}

impl WorkerProcess {
    /// Spawn the worker and start its I/O tasks.
    pub fn spawn(options: WorkerOptions) -> Result<Self, EngineError> {
        let mut child = Command::new(&options.bin)
            .args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Launch(format!("failed to spawn {}: {e}", options.bin)))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Launch("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Launch("worker stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let kill_token = CancellationToken::new();
        let (writer, writer_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_requests(stdin, writer_rx, kill_token.clone()));

        let pending_clone = Arc::clone(&pending);
        let events_clone = events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                dispatch_line(&line, &pending_clone, &events_clone);
            }
            debug!(target: "sfu.engine.worker", "Worker stdout closed");
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "sfu.engine.worker", pid, line = %line, "worker stderr");
                }
            });
        }

        tokio::spawn(watch_exit(
            child,
            Arc::clone(&pending),
            Arc::clone(&alive),
            events.clone(),
            kill_token.clone(),
        ));

        info!(target: "sfu.engine.worker", pid, bin = %options.bin, "Media worker spawned");

        Ok(Self {
            options,
            writer,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            events,
            kill_token,
        })
    }

    async fn request(&self, method: &str, data: Value) -> Result<Value, EngineError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&WorkerRequest { id, method, data })
            .map_err(|e| EngineError::Channel(format!("failed to encode {method}: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        self.writer
            .send(line)
            .map_err(|_| EngineError::Unavailable)?;

        rx.await.map_err(|_| EngineError::Unavailable)?
    }

    async fn request_as<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        data: Value,
    ) -> Result<T, EngineError> {
        let value = self.request(method, data).await?;
        serde_json::from_value(value)
            .map_err(|e| EngineError::Channel(format!("malformed {method} response: {e}")))
    }

    /// Close requests treat a missing object as already closed.
    async fn close_request(&self, method: &str, data: Value) -> Result<(), EngineError> {
        match self.request(method, data).await {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn write_requests(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    cancel_token: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            () = cancel_token.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(target: "sfu.engine.worker", error = %e, "Failed to write to worker stdin");
            break;
        }
    }
}

fn dispatch_line(
    line: &str,
    pending: &PendingMap,
    events: &broadcast::Sender<EngineEvent>,
) {
    match serde_json::from_str::<WorkerFrame>(line) {
        Ok(WorkerFrame::Response(response)) => {
            let sender = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&response.id);
            match sender {
                Some(sender) => {
                    let _ = sender.send(response.into_result());
                }
                None => {
                    debug!(
                        target: "sfu.engine.worker",
                        id = response.id,
                        "Response for unknown or abandoned request"
                    );
                }
            }
        }
        Ok(WorkerFrame::Notification(notification)) => {
            let _ = events.send(notification.into());
        }
        Err(e) => {
            warn!(target: "sfu.engine.worker", error = %e, "Unparseable worker line");
        }
    }
}

async fn watch_exit(
    mut child: Child,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    events: broadcast::Sender<EngineEvent>,
    kill_token: CancellationToken,
) {
    let reason = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => format!("worker exited: {status}"),
            Err(e) => format!("failed to wait on worker: {e}"),
        },
        () = kill_token.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(target: "sfu.engine.worker", error = %e, "Failed to kill worker");
            }
            "worker stopped".to_string()
        }
    };

    alive.store(false, Ordering::SeqCst);
    kill_token.cancel();

    let drained: Vec<_> = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for (_, sender) in drained {
        let _ = sender.send(Err(EngineError::Unavailable));
    }

    error!(target: "sfu.engine.worker", reason = %reason, "Media worker gone");
    let _ = events.send(EngineEvent::WorkerDied { reason });
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedTransport {
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedConsumer {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanConsumeReply {
    can_consume: bool,
}

#[async_trait]
impl MediaEngine for WorkerProcess {
    async fn create_router(&self, room_id: &str) -> Result<RouterId, EngineError> {
        let router_id = RouterId::new();
        self.request(
            "worker.createRouter",
            json!({ "routerId": router_id, "roomId": room_id }),
        )
        .await?;
        Ok(router_id)
    }

    async fn router_capabilities(&self, router: RouterId) -> Result<RtpCapabilities, EngineError> {
        self.request_as("router.getRtpCapabilities", json!({ "routerId": router }))
            .await
    }

    async fn close_router(&self, router: RouterId) -> Result<(), EngineError> {
        self.close_request("router.close", json!({ "routerId": router }))
            .await
    }

    async fn create_transport(
        &self,
        router: RouterId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError> {
        let transport_id = TransportId::new();
        let created: CreatedTransport = self
            .request_as(
                "router.createWebRtcTransport",
                json!({
                    "routerId": router,
                    "transportId": transport_id,
                    "direction": direction,
                    "listenIp": self.options.listen_ip,
                    "announcedAddress": self.options.announced_address,
                }),
            )
            .await?;
        Ok(TransportDescriptor {
            id: transport_id,
            direction,
            ice_parameters: created.ice_parameters,
            ice_candidates: created.ice_candidates,
            dtls_parameters: created.dtls_parameters,
        })
    }

    async fn connect_transport(
        &self,
        transport: TransportId,
        dtls: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.request(
            "transport.connect",
            json!({ "transportId": transport, "dtlsParameters": dtls }),
        )
        .await
        .map(|_| ())
    }

    async fn restart_ice(&self, transport: TransportId) -> Result<IceParameters, EngineError> {
        self.request_as("transport.restartIce", json!({ "transportId": transport }))
            .await
    }

    async fn close_transport(&self, transport: TransportId) -> Result<(), EngineError> {
        self.close_request("transport.close", json!({ "transportId": transport }))
            .await
    }

    async fn produce(
        &self,
        transport: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        let producer_id = ProducerId::new();
        self.request(
            "transport.produce",
            json!({
                "transportId": transport,
                "producerId": producer_id,
                "kind": kind,
                "rtpParameters": rtp_parameters,
            }),
        )
        .await?;
        Ok(producer_id)
    }

    async fn close_producer(&self, producer: ProducerId) -> Result<(), EngineError> {
        self.close_request("producer.close", json!({ "producerId": producer }))
            .await
    }

    async fn can_consume(
        &self,
        router: RouterId,
        producer: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        let reply: CanConsumeReply = self
            .request_as(
                "router.canConsume",
                json!({
                    "routerId": router,
                    "producerId": producer,
                    "rtpCapabilities": capabilities,
                }),
            )
            .await?;
        Ok(reply.can_consume)
    }

    async fn consume(
        &self,
        transport: TransportId,
        producer: ProducerId,
        capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescriptor, EngineError> {
        let consumer_id = ConsumerId::new();
        let created: CreatedConsumer = self
            .request_as(
                "transport.consume",
                json!({
                    "transportId": transport,
                    "consumerId": consumer_id,
                    "producerId": producer,
                    "rtpCapabilities": capabilities,
                    "paused": true,
                }),
            )
            .await?;
        Ok(ConsumerDescriptor {
            id: consumer_id,
            producer_id: producer,
            kind: created.kind,
            rtp_parameters: created.rtp_parameters,
            paused: true,
        })
    }

    async fn resume_consumer(&self, consumer: ConsumerId) -> Result<(), EngineError> {
        self.request("consumer.resume", json!({ "consumerId": consumer }))
            .await
            .map(|_| ())
    }

    async fn close_consumer(&self, consumer: ConsumerId) -> Result<(), EngineError> {
        self.close_request("consumer.close", json!({ "consumerId": consumer }))
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.kill_token.cancel();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill_token.cancel();
    }
}

/// Launches [`WorkerProcess`] instances from configuration.
pub struct WorkerLauncher {
    options: WorkerOptions,
}

impl WorkerLauncher {
    #[must_use]
    pub fn new(options: WorkerOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl EngineLauncher for WorkerLauncher {
    async fn launch(&self) -> Result<Arc<dyn MediaEngine>, EngineError> {
        let worker = WorkerProcess::spawn(self.options.clone())?;
        Ok(Arc::new(worker))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pending_map() -> PendingMap {
        Arc::new(Mutex::new(HashMap::new()))
    }

    fn options(bin: &str) -> WorkerOptions {
        WorkerOptions {
            bin: bin.to_string(),
            args: Vec::new(),
            listen_ip: "127.0.0.1".to_string(),
            announced_address: None,
        }
    }

    #[test]
    fn test_request_frame_format() {
        let frame = WorkerRequest {
            id: 3,
            method: "producer.close",
            data: json!({ "producerId": "p" }),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["method"], "producer.close");
        assert_eq!(value["data"]["producerId"], "p");
    }

    #[tokio::test]
    async fn test_response_is_routed_to_pending_request() {
        let pending = pending_map();
        let (events, _) = broadcast::channel(8);
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(9, tx);

        dispatch_line(r#"{"id":9,"ok":true,"data":{"canConsume":true}}"#, &pending, &events);

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["canConsume"], true);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_response_kinds() {
        let pending = pending_map();
        let (events, _) = broadcast::channel(8);

        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(1, tx);
        dispatch_line(
            r#"{"id":1,"ok":false,"error":{"kind":"notFound","message":"no such transport"}}"#,
            &pending,
            &events,
        );
        assert_eq!(
            rx.await.unwrap(),
            Err(EngineError::NotFound("no such transport".to_string()))
        );

        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(2, tx);
        dispatch_line(
            r#"{"id":2,"ok":false,"error":{"kind":"somethingElse","message":"bad dtls"}}"#,
            &pending,
            &events,
        );
        assert_eq!(
            rx.await.unwrap(),
            Err(EngineError::Rejected("bad dtls".to_string()))
        );
    }

    #[tokio::test]
    async fn test_notification_becomes_engine_event() {
        let pending = pending_map();
        let (events, mut rx) = broadcast::channel(8);
        let transport_id = TransportId::new();

        let line = json!({
            "event": "iceStateChange",
            "data": { "transportId": transport_id, "state": "failed" }
        })
        .to_string();
        dispatch_line(&line, &pending, &events);

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::IceStateChanged {
                transport_id,
                state: IceState::Failed,
            }
        );
    }

    #[test]
    fn test_garbage_line_is_ignored() {
        let pending = pending_map();
        let (events, _) = broadcast::channel(8);
        dispatch_line("not json at all", &pending, &events);
        dispatch_line(r#"{"event":"unknownEvent","data":{}}"#, &pending, &events);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_launch_error() {
        let result = WorkerProcess::spawn(options("/nonexistent/media-worker"));
        assert!(matches!(result, Err(EngineError::Launch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_worker_fails_requests() {
        let worker = WorkerProcess::spawn(options("true")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.is_alive() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker should exit");

        assert_eq!(
            worker.create_router("room").await,
            Err(EngineError::Unavailable)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pending_request_fails_when_worker_killed() {
        let worker = Arc::new(WorkerProcess::spawn(options("cat")).unwrap());

        // `cat` echoes the request back; it parses as neither a response nor
        // a notification, so the request stays pending until the kill.
        let pending = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.close_router(RouterId::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(EngineError::Unavailable));
    }
}
