//! RPC client: spawn, handshake, correlate, stop.
//!
//! Each spawned process gets three tasks (stdin writer, stdout reader,
//! stderr logger) plus an exit watcher that owns the [`Child`]. A generation
//! counter ties the watcher to its process, so an exit that races with
//! `stop()` or a respawn is ignored.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lines::LineBuffer;
use super::message::{self, Incoming};
use super::{ConnectionState, RpcError, RpcEvent};
use crate::constants::{
    ASSISTANT_INITIALIZE_TIMEOUT, ASSISTANT_REQUEST_TIMEOUT, EVENT_CHANNEL_CAPACITY,
    READ_BUFFER_SIZE,
};

/// How long the exit watcher waits for stdout to drain after exit.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

type SharedStart = Shared<BoxFuture<'static, Result<(), RpcError>>>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

/// How to launch the assistant.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Executable.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory; inherits ours when `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// `clientInfo.name` sent in `initialize`.
    pub client_name: String,
    /// `clientInfo.version` sent in `initialize`.
    pub client_version: String,
    /// Default request deadline.
    pub request_timeout: Duration,
    /// Deadline for the `initialize` request.
    pub initialize_timeout: Duration,
}

impl RpcConfig {
    /// Launch `program` with no arguments and default timeouts.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            client_name: "switchboard".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: ASSISTANT_REQUEST_TIMEOUT,
            initialize_timeout: ASSISTANT_INITIALIZE_TIMEOUT,
        }
    }
}

/// Client for the assistant subprocess.
///
/// Cheap to clone; clones share the process and pending map.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("program", &self.inner.config.program)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: RpcConfig,
    state: Mutex<ProcState>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    next_start_epoch: AtomicU64,
    events: broadcast::Sender<RpcEvent>,
}

struct ProcState {
    connection: ConnectionState,
    generation: u64,
    stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    kill_token: Option<CancellationToken>,
    starting: Option<(u64, SharedStart)>,
}

impl RpcClient {
    /// Create a client; nothing is spawned until [`RpcClient::start`].
    pub fn new(config: RpcConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ProcState {
                    connection: ConnectionState::Disconnected,
                    generation: 0,
                    stdin_tx: None,
                    kill_token: None,
                    starting: None,
                }),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_start_epoch: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Spawn the process if needed and complete the handshake.
    ///
    /// Concurrent callers await the same in-flight attempt, so the process
    /// is spawned at most once per attempt.
    pub async fn start(&self) -> Result<(), RpcError> {
        let start = {
            let mut state = self.inner.state();
            if state.connection == ConnectionState::Initialized {
                return Ok(());
            }
            if let Some((_, start)) = &state.starting {
                start.clone()
            } else {
                let epoch = self.inner.next_start_epoch.fetch_add(1, Ordering::SeqCst);
                let inner = Arc::clone(&self.inner);
                let start = async move { inner.run_start(epoch).await }.boxed().shared();
                state.starting = Some((epoch, start.clone()));
                start
            }
        };
        start.await
    }

    /// Send a request and await its response.
    ///
    /// `timeout` defaults to the configured request deadline.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        self.inner.request(method, params, timeout).await
    }

    /// Send a notification; no response is expected.
    pub fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.inner.write(message::notification_line(method, params))
    }

    /// Answer an assistant-initiated request.
    pub fn respond(&self, id: &Value, outcome: Result<Value, Value>) -> Result<(), RpcError> {
        self.inner.write(message::response_line(id, outcome))
    }

    /// Kill the process, reject pending requests and reset to `Disconnected`.
    pub fn stop(&self) {
        let was_running = {
            let mut state = self.inner.state();
            let was_running = state.connection != ConnectionState::Disconnected;
            state.generation += 1;
            state.connection = ConnectionState::Disconnected;
            state.stdin_tx = None;
            state.starting = None;
            if let Some(token) = state.kill_token.take() {
                token.cancel();
            }
            was_running
        };
        self.inner.reject_all(&RpcError::Stopped);

        if was_running {
            log::info!("[Rpc] Assistant stopped");
            self.inner.emit_state(ConnectionState::Disconnected, None);
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state().connection
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending().len()
    }

    /// Subscribe to state changes, notifications and peer requests.
    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ProcState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_state(&self, state: ConnectionState, exit_code: Option<i32>) {
        let _ = self.events.send(RpcEvent::StateChanged { state, exit_code });
    }

    async fn run_start(self: Arc<Self>, epoch: u64) -> Result<(), RpcError> {
        let result = self.spawn_and_initialize().await;
        let mut state = self.state();
        if matches!(state.starting, Some((current, _)) if current == epoch) {
            state.starting = None;
        }
        result
    }

    async fn spawn_and_initialize(self: &Arc<Self>) -> Result<(), RpcError> {
        let generation = self.spawn()?;

        let params = json!({
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            }
        });
        let handshake = match self
            .request("initialize", Some(params), self.config.initialize_timeout)
            .await
        {
            Ok(_) => self.write(message::notification_line("initialized", None)),
            Err(e) => Err(e),
        };
        if let Err(e) = handshake {
            log::error!("[Rpc] Initialize failed: {e}");
            self.abandon(generation, &e);
            return Err(e);
        }

        {
            let mut state = self.state();
            if state.generation != generation {
                return Err(RpcError::Stopped);
            }
            state.connection = ConnectionState::Initialized;
        }
        log::info!("[Rpc] Assistant initialized");
        self.emit_state(ConnectionState::Initialized, None);
        Ok(())
    }

    /// Spawn the process unless one is running. Returns its generation.
    fn spawn(self: &Arc<Self>) -> Result<u64, RpcError> {
        let mut state = self.state();
        if state.connection != ConnectionState::Disconnected {
            return Ok(state.generation);
        }
        state.connection = ConnectionState::Spawning;
        self.emit_state(ConnectionState::Spawning, None);

        let program = &self.config.program;
        let mut cmd = Command::new(program);
        cmd.args(&self.config.args)
            .envs(self.config.env.iter().map(|(k, v)| (k, v)))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let spawned = cmd.spawn().map_err(|e| format!("{}: {e}", program.display()));
        let mut child = match spawned {
            Ok(child) => child,
            Err(message) => {
                state.connection = ConnectionState::Disconnected;
                self.emit_state(ConnectionState::Disconnected, None);
                log::error!("[Rpc] Spawn failed: {message}");
                return Err(RpcError::Spawn(message));
            }
        };
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            state.connection = ConnectionState::Disconnected;
            self.emit_state(ConnectionState::Disconnected, None);
            return Err(RpcError::Spawn("child stdio was not captured".to_string()));
        };

        state.generation += 1;
        let generation = state.generation;
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let kill = CancellationToken::new();
        state.stdin_tx = Some(stdin_tx);
        state.kill_token = Some(kill.clone());
        state.connection = ConnectionState::Connected;
        drop(state);

        log::info!(
            "[Rpc] Spawned assistant {} (pid {:?})",
            program.display(),
            child.id()
        );
        self.emit_state(ConnectionState::Connected, None);

        tokio::spawn(write_loop(stdin, stdin_rx));
        let reader = tokio::spawn(read_loop(Arc::clone(self), stdout));
        tokio::spawn(stderr_loop(stderr));
        tokio::spawn(watch_exit(Arc::clone(self), child, generation, kill, reader));
        Ok(generation)
    }

    fn write(&self, line: Vec<u8>) -> Result<(), RpcError> {
        let stdin = self.state().stdin_tx.clone().ok_or(RpcError::NotRunning)?;
        stdin.send(line).map_err(|_| RpcError::NotRunning)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let stdin = self.state().stdin_tx.clone().ok_or(RpcError::NotRunning)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        // Removes the entry on timeout, send failure, or caller drop.
        let _guard = scopeguard::guard(id, |id| {
            self.pending().remove(&id);
        });

        if stdin.send(message::request_line(id, method, params)).is_err() {
            return Err(RpcError::NotRunning);
        }
        log::debug!("[Rpc] -> {method} (id {id})");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Stopped),
            Err(_) => {
                log::warn!("[Rpc] Request '{method}' (id {id}) timed out after {timeout:?}");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn handle_message(&self, message: Value) {
        match message::classify(message) {
            Incoming::Response { id, outcome } => {
                let Some(tx) = self.pending().remove(&id) else {
                    log::debug!("[Rpc] Dropping response for unknown or expired id {id}");
                    return;
                };
                let _ = tx.send(outcome.map_err(RpcError::Application));
            }
            Incoming::Notification { method, params } => {
                let _ = self.events.send(RpcEvent::Notification { method, params });
            }
            Incoming::Request { id, method, params } => {
                let _ = self.events.send(RpcEvent::Request { id, method, params });
            }
            Incoming::MalformedResponse { id, reason } => {
                log::warn!("[Rpc] {reason}");
                if let Some(tx) = self.pending().remove(&id) {
                    let _ = tx.send(Err(RpcError::Protocol(reason)));
                }
            }
            Incoming::Invalid(reason) => {
                log::warn!("[Rpc] Dropping unclassifiable message: {reason}");
            }
        }
    }

    /// Kill the process of `generation` and return to `Disconnected` at once.
    ///
    /// The generation is bumped so the dying process's exit is ignored and a
    /// following `start()` spawns afresh.
    fn abandon(&self, generation: u64, error: &RpcError) {
        {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.generation += 1;
            state.connection = ConnectionState::Disconnected;
            state.stdin_tx = None;
            if let Some(token) = state.kill_token.take() {
                token.cancel();
            }
        }
        self.reject_all(error);
        self.emit_state(ConnectionState::Disconnected, None);
    }

    fn handle_exit(&self, generation: u64, code: Option<i32>) {
        {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.stdin_tx = None;
            state.kill_token = None;
            state.starting = None;
        }
        log::warn!("[Rpc] Assistant exited (code {code:?})");
        self.reject_all(&RpcError::ProcessExited { code });
        self.emit_state(ConnectionState::Disconnected, code);
    }

    fn reject_all(&self, error: &RpcError) {
        let drained: Vec<_> = self.pending().drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

async fn write_loop(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = stdin.write_all(&line).await {
            log::warn!("[Rpc] stdin write failed: {e}");
            break;
        }
        let _ = stdin.flush().await;
    }
}

async fn read_loop(inner: Arc<Inner>, mut stdout: ChildStdout) {
    let mut lines = LineBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for message in lines.push(&buf[..n]) {
                    inner.handle_message(message);
                }
            }
            Err(e) => {
                log::warn!("[Rpc] stdout read failed: {e}");
                break;
            }
        }
    }
    if let Some(message) = lines.finish() {
        inner.handle_message(message);
    }
}

async fn stderr_loop(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("[Rpc] stderr: {line}");
    }
}

async fn watch_exit(
    inner: Arc<Inner>,
    mut child: Child,
    generation: u64,
    kill: CancellationToken,
    reader: JoinHandle<()>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = kill.cancelled() => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                log::warn!("[Rpc] Kill failed: {e}");
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("[Rpc] Waiting for assistant failed: {e}");
            None
        }
    };

    // Deliver responses written just before exit.
    let _ = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, reader).await;
    inner.handle_exit(generation, code);
}
