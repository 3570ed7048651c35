//! Bus client: connection lifecycle, correlation and reconnect.
//!
//! One socket at a time. Each connection gets a read task (decode frames,
//! resolve pending requests, publish events) and a write task (drain the
//! frame queue). A generation counter ties tasks to their connection so a
//! stale reader can never tear down its successor.
//!
//! ```text
//! start() ──connect──► [read task] ──response──► pending[requestId].tx
//!                      │            ──broadcast/request──► events
//!                      └─ EOF/error ─► reject pending ─► reconnect after delay
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::framing::{encode_frame, FrameDecoder};
use super::{BusError, BusEvent};
use crate::constants::{
    BUS_RECONNECT_DELAY, BUS_REQUEST_TIMEOUT, EVENT_CHANNEL_CAPACITY, MAX_BUFFERED_BYTES,
    MAX_FRAME_SIZE, READ_BUFFER_SIZE,
};

/// Connection settings for [`BusClient`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Path of the bus domain socket.
    pub socket_path: PathBuf,
    /// Sent as `clientType` in the `initialize` handshake.
    pub client_type: String,
    /// Default deadline for correlated requests.
    pub request_timeout: Duration,
    /// Delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Single-frame ceiling.
    pub max_frame_size: usize,
    /// Undecoded-bytes ceiling.
    pub max_buffered_bytes: usize,
}

impl BusConfig {
    /// Settings with default timeouts and ceilings.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client_type: "switchboard".to_string(),
            request_timeout: BUS_REQUEST_TIMEOUT,
            reconnect_delay: BUS_RECONNECT_DELAY,
            max_frame_size: MAX_FRAME_SIZE,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
        }
    }
}

/// Client for the framed broadcast bus.
///
/// Cheap to clone; clones share the connection, pending map and events.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("socket_path", &self.inner.config.socket_path)
            .field("client_id", &self.client_id())
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: BusConfig,
    state: Mutex<BusState>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, BusError>>>>,
    events: broadcast::Sender<BusEvent>,
    stopped: AtomicBool,
    /// Set while a reconnect is scheduled or running.
    reconnecting: AtomicBool,
}

#[derive(Default)]
struct BusState {
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    client_id: Option<String>,
    generation: u64,
    connection_token: Option<CancellationToken>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl BusClient {
    /// Create an unconnected client.
    pub fn new(config: BusConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BusState::default()),
                pending: Mutex::new(HashMap::new()),
                events,
                stopped: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// Connect and run the `initialize` handshake.
    ///
    /// Returns the `clientId` assigned by the bus. If already connected the
    /// existing id is returned. On failure a reconnect is scheduled.
    pub async fn start(&self) -> Result<String, BusError> {
        self.inner.stopped.store(false, Ordering::SeqCst);
        match self.inner.connect().await {
            Ok(client_id) => Ok(client_id),
            Err(e) => {
                log::warn!("[Bus] Start failed: {e}");
                self.inner.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Send a correlated request using the default deadline.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, BusError> {
        self.inner
            .request(method, params, self.inner.config.request_timeout)
            .await
    }

    /// Send a correlated request with an explicit deadline.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        self.inner.request(method, params, timeout).await
    }

    /// Fire-and-forget broadcast to every bus client.
    pub fn send_broadcast(&self, method: &str, params: Value) -> Result<(), BusError> {
        let (writer, source) = self.inner.writer()?;
        let frame = encode_frame(&json!({
            "type": "broadcast",
            "sourceClientId": source,
            "method": method,
            "params": params,
        }))?;
        writer.send(frame).map_err(|_| BusError::ConnectionClosed)
    }

    /// Answer a peer request received as [`BusEvent::Request`].
    pub fn respond(&self, request_id: &str, outcome: Result<Value, Value>) -> Result<(), BusError> {
        let (writer, source) = self.inner.writer()?;
        let mut message = json!({
            "type": "response",
            "requestId": request_id,
            "sourceClientId": source,
        });
        match outcome {
            Ok(result) => message["result"] = result,
            Err(error) => message["error"] = error,
        }
        writer
            .send(encode_frame(&message)?)
            .map_err(|_| BusError::ConnectionClosed)
    }

    /// Tear down the socket, reject pending requests and cancel any
    /// scheduled reconnect.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.stopped.store(true, Ordering::SeqCst);
        let was_connected = {
            let mut state = inner.state();
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            if let Some(token) = state.connection_token.take() {
                token.cancel();
            }
            state.client_id = None;
            state.writer.take().is_some()
        };
        inner.reconnecting.store(false, Ordering::SeqCst);
        inner.reject_all(&BusError::Stopped);

        if was_connected {
            log::info!("[Bus] Stopped");
            let _ = inner.events.send(BusEvent::Disconnected);
        }
    }

    /// Subscribe to broadcasts, peer requests and connection changes.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    /// Identity assigned by the last successful handshake.
    pub fn client_id(&self) -> Option<String> {
        self.inner.state().client_id.clone()
    }

    /// Whether a handshaken socket is live.
    pub fn is_connected(&self) -> bool {
        self.inner.state().client_id.is_some()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(
        &self,
    ) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Result<Value, BusError>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> Result<(mpsc::UnboundedSender<Vec<u8>>, Option<String>), BusError> {
        let state = self.state();
        let writer = state.writer.clone().ok_or(BusError::NotConnected)?;
        Ok((writer, state.client_id.clone()))
    }

    async fn connect(self: &Arc<Self>) -> Result<String, BusError> {
        let existing = self.state().client_id.clone();
        if let Some(client_id) = existing {
            return Ok(client_id);
        }

        let path = &self.config.socket_path;
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| BusError::Connect(format!("{}: {e}", path.display())))?;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }

        let (read_half, write_half) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let token = CancellationToken::new();
        let generation = {
            let mut state = self.state();
            if let Some(old) = state.connection_token.take() {
                old.cancel();
            }
            state.generation += 1;
            state.writer = Some(frame_tx);
            state.client_id = None;
            state.connection_token = Some(token.clone());
            state.generation
        };

        tokio::spawn(write_loop(write_half, frame_rx, token.clone()));
        tokio::spawn(read_loop(Arc::clone(self), read_half, generation, token));

        let handshake = self
            .request(
                "initialize",
                json!({ "clientType": self.config.client_type }),
                self.config.request_timeout,
            )
            .await
            .and_then(|result| {
                result
                    .get("clientId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        BusError::Protocol("initialize response missing clientId".to_string())
                    })
            });

        let client_id = match handshake {
            Ok(client_id) => client_id,
            Err(e) => {
                self.drop_connection(generation);
                return Err(e);
            }
        };

        {
            let mut state = self.state();
            if state.generation != generation || state.writer.is_none() {
                return Err(BusError::ConnectionClosed);
            }
            state.client_id = Some(client_id.clone());
        }

        log::info!("[Bus] Connected to {} as {client_id}", path.display());
        let _ = self.events.send(BusEvent::Connected {
            client_id: client_id.clone(),
        });
        Ok(client_id)
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let (writer, source) = self.writer()?;
        let request_id = Uuid::new_v4().to_string();
        let frame = encode_frame(&json!({
            "type": "request",
            "requestId": request_id,
            "sourceClientId": source,
            "method": method,
            "params": params,
        }))?;

        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id.clone(), tx);
        // Removes the entry on timeout, send failure, or caller drop.
        let _guard = scopeguard::guard(request_id, |id| {
            self.pending().remove(&id);
        });

        if writer.send(frame).is_err() {
            return Err(BusError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BusError::ConnectionClosed),
            Err(_) => {
                log::warn!("[Bus] Request '{method}' timed out after {timeout:?}");
                Err(BusError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Route one decoded frame.
    fn handle_frame(&self, frame: Value) {
        let source_client_id = frame
            .get("sourceClientId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        match frame.get("type").and_then(Value::as_str) {
            Some("response") => {
                let Some(request_id) = frame.get("requestId").and_then(Value::as_str) else {
                    log::warn!("[Bus] Response without requestId dropped");
                    return;
                };
                let Some(tx) = self.pending().remove(request_id) else {
                    log::debug!("[Bus] Discarding response for unknown request {request_id}");
                    return;
                };
                let outcome = match frame.get("error") {
                    Some(error) if !error.is_null() => Err(BusError::Application(error.clone())),
                    _ => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            Some("broadcast") => {
                let _ = self.events.send(BusEvent::Broadcast {
                    source_client_id,
                    method,
                    params,
                });
            }
            Some("request") => {
                let Some(request_id) = frame.get("requestId").and_then(Value::as_str) else {
                    log::warn!("[Bus] Peer request without requestId dropped");
                    return;
                };
                let _ = self.events.send(BusEvent::Request {
                    request_id: request_id.to_string(),
                    source_client_id,
                    method,
                    params,
                });
            }
            other => {
                log::debug!("[Bus] Ignoring frame of type {other:?}");
            }
        }
    }

    /// Detach the connection of `generation` if it is still current.
    fn drop_connection(&self, generation: u64) -> bool {
        let mut state = self.state();
        if state.generation != generation || state.writer.is_none() {
            return false;
        }
        state.writer = None;
        state.client_id = None;
        if let Some(token) = state.connection_token.take() {
            token.cancel();
        }
        true
    }

    fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: &str) {
        if !self.drop_connection(generation) {
            return;
        }
        log::warn!("[Bus] Connection lost: {reason}");
        self.reject_all(&BusError::ConnectionClosed);
        let _ = self.events.send(BusEvent::Disconnected);
        self.schedule_reconnect();
    }

    fn reject_all(&self, error: &BusError) {
        let drained: Vec<_> = self.pending().drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Schedule one reconnect attempt unless stopped or already scheduled.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state();
        let inner = Arc::clone(self);
        let delay = self.config.reconnect_delay;
        state.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.stopped.load(Ordering::SeqCst) {
                inner.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            log::info!(
                "[Bus] Reconnecting to {}",
                inner.config.socket_path.display()
            );
            let result = inner.connect().await;
            inner.reconnecting.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                log::warn!("[Bus] Reconnect failed: {e}");
                inner.schedule_reconnect();
                return;
            }
            // A loss seen while the guard was held scheduled nothing.
            let lost = inner.state().writer.is_none();
            if lost {
                log::warn!("[Bus] Connection lost during reconnect");
                inner.schedule_reconnect();
            }
        }));
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    mut reader: OwnedReadHalf,
    generation: u64,
    token: CancellationToken,
) {
    let mut decoder =
        FrameDecoder::with_limits(inner.config.max_frame_size, inner.config.max_buffered_bytes);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        let read = tokio::select! {
            () = token.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break "closed by peer".to_string(),
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        inner.handle_frame(frame);
                    }
                }
                Err(e) => {
                    log::error!("[Bus] Frame decode error: {e}");
                    break format!("protocol error: {e}");
                }
            },
            Err(e) => break format!("read error: {e}"),
        }
    };

    inner.handle_disconnect(generation, &reason);
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frame_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            () = token.cancelled() => break,
            data = frame_rx.recv() => data,
        };
        let Some(data) = data else { break };
        if let Err(e) = writer.write_all(&data).await {
            log::error!("[Bus] Write error: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
