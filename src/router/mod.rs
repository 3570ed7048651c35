//! Router / dispatcher.
//!
//! One task owns every registry and folds every event in sequence:
//!
//! ```text
//! UI socket ──┐                                   ┌─► RpcClient (assistant)
//! fetch tasks ├─► RouterEvent ─► Router ──────────┼─► BusClient
//! flush timer ┘        ▲           │              ├─► TerminalManager
//!                      │           ▼              └─► WorkerBridge
//! rpc/bus forwarders ──┘   Arc<dyn Connection>::send(envelope)
//! ```
//!
//! View messages fall into exactly one of three buckets ([`MessageKind`]):
//! forwarded to a backend, resolved from local state, or answered with a
//! typed `unsupported` error. Replies echo `requestId`; a message without one
//! only hears back on failure (as `bridge-error`).

// Rust guideline compliant 2026-02

pub mod envelope;
pub mod messages;
pub mod persistence;
pub mod schedule;
pub mod state;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};

use crate::bus::{BusClient, BusConfig, BusEvent};
use crate::connection::{AuthGate, Connection, ConnectionId};
use crate::constants::PERSIST_DEBOUNCE;
use crate::error::BridgeError;
use crate::rpc::{RpcClient, RpcConfig, RpcEvent};
use crate::terminal::{
    CreateRequest, Fanout, Launcher, TerminalConfig, TerminalEvent, TerminalManager,
    TerminalOutput,
};
use crate::worker::{Delivery, WorkerBridge, WorkerConfig, WorkerEvent};
use envelope::{bridge_error, field, push, str_field, u16_field, EnvelopeType};
use messages::{ForwardedKind, LocalKind, MessageKind};
use persistence::{AtomStore, PersistedAtoms};
use schedule::ScheduledTask;
use state::{SharedObjects, WorkspaceRoots};

/// Everything the router reacts to.
#[derive(Debug)]
pub enum RouterEvent {
    /// A UI connection opened.
    ClientConnected(Arc<dyn Connection>),
    /// A UI connection closed or failed.
    ClientDisconnected(ConnectionId),
    /// An envelope arrived on a connection.
    Envelope {
        /// Sender.
        connection: ConnectionId,
        /// Parsed JSON envelope.
        envelope: Value,
    },
    /// Assistant client event.
    Rpc(RpcEvent),
    /// Bus client event.
    Bus(BusEvent),
    /// Terminal backend event.
    Terminal(TerminalEvent),
    /// Worker process event.
    Worker(WorkerEvent),
    /// A forwarded call finished.
    Reply {
        /// Caller.
        connection: ConnectionId,
        /// Kind of the original message.
        request_type: &'static str,
        /// `requestId` of the original message.
        request_id: Option<Value>,
        /// Result to relay.
        outcome: Result<Value, BridgeError>,
    },
    /// A fetch finished. Dropped if it was cancelled meanwhile.
    FetchCompleted {
        /// Caller.
        connection: ConnectionId,
        /// Bookkeeping key derived from `request_id`.
        key: String,
        /// `requestId` of the fetch.
        request_id: Value,
        /// Result to relay.
        outcome: Result<Value, BridgeError>,
    },
    /// Debounce timer fired.
    FlushAtoms,
    /// Leave the event loop and dispose.
    Shutdown,
}

/// Injected collaborators.
#[derive(Debug)]
pub struct Collaborators {
    /// Decides whether a connection may register.
    pub auth: Box<dyn AuthGate>,
    /// Persisted atom storage.
    pub atoms: Box<dyn AtomStore>,
    /// Terminal backend launcher.
    pub launcher: Box<dyn Launcher>,
}

/// Router construction options.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Assistant process. `None` disables `assistant-*` and `fetch`.
    pub assistant: Option<RpcConfig>,
    /// Bus socket. `None` disables `bus-*`.
    pub bus: Option<BusConfig>,
    /// Terminal defaults.
    pub terminal: TerminalConfig,
    /// Worker process.
    pub worker: WorkerConfig,
    /// Initial workspace roots.
    pub workspace_roots: Vec<String>,
    /// Debounce for persisted atom writes.
    pub persist_debounce: Duration,
    /// Version reported in `bridge-ready`.
    pub version: String,
}

impl RouterOptions {
    /// Options with every optional backend disabled.
    pub fn new(terminal: TerminalConfig, worker: WorkerConfig) -> Self {
        Self {
            assistant: None,
            bus: None,
            terminal,
            worker,
            workspace_roots: Vec::new(),
            persist_debounce: PERSIST_DEBOUNCE,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The dispatcher.
pub struct Router {
    version: String,
    auth: Box<dyn AuthGate>,
    connections: BTreeMap<ConnectionId, Arc<dyn Connection>>,
    rpc: Option<RpcClient>,
    bus: Option<BusClient>,
    terminals: TerminalManager,
    worker: WorkerBridge,
    roots: WorkspaceRoots,
    shared: SharedObjects,
    atoms: PersistedAtoms,
    flush: ScheduledTask,
    persist_debounce: Duration,
    fetches: HashMap<(ConnectionId, String), AbortHandle>,
    forwarders: Vec<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<RouterEvent>,
    rx: mpsc::UnboundedReceiver<RouterEvent>,
    terminal_rx: mpsc::UnboundedReceiver<TerminalEvent>,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    disposed: bool,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("connections", &self.connections.len())
            .field("terminals", &self.terminals)
            .field("fetches", &self.fetches.len())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Build a router. Nothing is spawned until [`Router::start`].
    pub fn new(options: RouterOptions, collaborators: Collaborators) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        Self {
            version: options.version,
            auth: collaborators.auth,
            connections: BTreeMap::new(),
            rpc: options.assistant.map(RpcClient::new),
            bus: options.bus.map(BusClient::new),
            terminals: TerminalManager::new(options.terminal, collaborators.launcher, terminal_tx),
            worker: WorkerBridge::new(options.worker, worker_tx),
            roots: WorkspaceRoots::new(options.workspace_roots),
            shared: SharedObjects::default(),
            atoms: PersistedAtoms::load(collaborators.atoms),
            flush: ScheduledTask::new(),
            persist_debounce: options.persist_debounce,
            fetches: HashMap::new(),
            forwarders: Vec::new(),
            tx,
            rx,
            terminal_rx,
            worker_rx,
            disposed: false,
        }
    }

    /// Sender for posting events into the loop.
    pub fn sender(&self) -> mpsc::UnboundedSender<RouterEvent> {
        self.tx.clone()
    }

    /// Subscribe to the leaf clients and connect the bus.
    ///
    /// The assistant is spawned lazily on first use.
    pub fn start(&mut self) {
        if let Some(rpc) = &self.rpc {
            self.forwarders
                .push(relay(rpc.subscribe(), self.tx.clone(), RouterEvent::Rpc, "Rpc"));
        }
        if let Some(bus) = &self.bus {
            self.forwarders
                .push(relay(bus.subscribe(), self.tx.clone(), RouterEvent::Bus, "Bus"));
            let bus = bus.clone();
            self.forwarders.push(tokio::spawn(async move {
                if let Err(e) = bus.start().await {
                    log::warn!("[Router] Bus unavailable at startup: {e}");
                }
            }));
        }
    }

    /// Wait for the next event from any source.
    pub async fn next_event(&mut self) -> RouterEvent {
        tokio::select! {
            Some(event) = self.rx.recv() => event,
            Some(event) = self.terminal_rx.recv() => RouterEvent::Terminal(event),
            Some(event) = self.worker_rx.recv() => RouterEvent::Worker(event),
        }
    }

    /// Event loop. Returns after [`RouterEvent::Shutdown`], disposed.
    pub async fn run(mut self) {
        self.start();
        log::info!("[Router] Event loop starting");
        loop {
            match self.next_event().await {
                RouterEvent::Shutdown => break,
                event => self.handle_event(event),
            }
        }
        self.dispose();
        log::info!("[Router] Event loop exited");
    }

    /// Fold one event in.
    pub fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::ClientConnected(connection) => {
                if let Err(e) = self.register_client(connection) {
                    log::debug!("[Router] Registration refused: {e}");
                }
            }
            RouterEvent::ClientDisconnected(id) => self.unregister_client(id),
            RouterEvent::Envelope {
                connection,
                envelope,
            } => self.handle_envelope(connection, envelope),
            RouterEvent::Rpc(event) => self.on_rpc_event(event),
            RouterEvent::Bus(event) => self.on_bus_event(event),
            RouterEvent::Terminal(event) => {
                if let Some(fanout) = self.terminals.handle_event(event) {
                    self.deliver_terminal(fanout);
                }
            }
            RouterEvent::Worker(event) => {
                let deliveries = self.worker.handle_event(event);
                self.deliver_worker(deliveries);
            }
            RouterEvent::Reply {
                connection,
                request_type,
                request_id,
                outcome,
            } => self.reply(connection, request_type, request_id, outcome),
            RouterEvent::FetchCompleted {
                connection,
                key,
                request_id,
                outcome,
            } => {
                if self.fetches.remove(&(connection, key)).is_some() {
                    self.reply(connection, ForwardedKind::Fetch.as_str(), Some(request_id), outcome);
                }
            }
            RouterEvent::FlushAtoms => {
                self.flush.complete();
                self.atoms.flush();
            }
            RouterEvent::Shutdown => self.dispose(),
        }
    }

    // ─── Connections ───

    /// Admit a connection and send it `bridge-ready`.
    pub fn register_client(&mut self, connection: Arc<dyn Connection>) -> Result<ConnectionId, BridgeError> {
        let id = connection.id();
        if self.disposed {
            connection.close();
            return Err(BridgeError::Transport("router is shut down".to_string()));
        }
        if !self.auth.is_authorized(connection.as_ref()) {
            log::warn!("[Router] Rejected unauthorized {id}");
            let err = BridgeError::Unauthorized;
            connection.send(encode(&bridge_error(&err)));
            connection.close();
            return Err(err);
        }

        connection.send(encode(&envelope::bridge_ready(id, &self.version)));
        self.connections.insert(id, connection);
        log::info!("[Router] Registered {id} ({} connected)", self.connections.len());
        Ok(id)
    }

    /// Forget a connection and everything it owned.
    pub fn unregister_client(&mut self, id: ConnectionId) {
        if self.connections.remove(&id).is_none() {
            return;
        }
        self.shared.remove_connection(id);
        self.fetches.retain(|(connection, _), handle| {
            if *connection == id {
                handle.abort();
                false
            } else {
                true
            }
        });
        let closed = self.terminals.remove_listener(id);
        self.worker.remove_connection(id);
        log::info!(
            "[Router] Unregistered {id} ({} connected, {} terminals closed)",
            self.connections.len(),
            closed.len()
        );
    }

    /// Registered connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Fetches still in flight.
    pub fn pending_fetches(&self) -> usize {
        self.fetches.len()
    }

    /// True once [`Router::dispose`] ran.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ─── Envelopes ───

    /// Dispatch one envelope. Handler panics become `handler` errors.
    pub fn handle_envelope(&mut self, connection: ConnectionId, envelope: Value) {
        if !self.connections.contains_key(&connection) {
            log::debug!("[Router] Dropping envelope from unregistered {connection}");
            return;
        }
        let request = envelope.get("message").and_then(|message| {
            let kind = message.get("type")?.as_str()?.to_string();
            Some((kind, field(message, "requestId").cloned()))
        });

        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(connection, envelope)));
        if let Err(panic) = outcome {
            let message = panic_message(panic.as_ref());
            log::error!("[Router] Handler panicked for {connection}: {message}");
            let err = BridgeError::Handler(message);
            match request {
                Some((kind, Some(request_id))) => {
                    self.send(connection, &envelope::response(&kind, request_id, Err(&err)));
                }
                _ => self.send(connection, &bridge_error(&err)),
            }
        }
    }

    fn dispatch(&mut self, connection: ConnectionId, mut envelope: Value) {
        let Some(kind) = envelope.get("type").and_then(Value::as_str).map(str::to_owned) else {
            let err = BridgeError::invalid("envelope needs a string 'type'");
            return self.send(connection, &bridge_error(&err));
        };
        match EnvelopeType::parse(&kind) {
            Some(EnvelopeType::ViewMessage) => match envelope.get_mut("message").map(Value::take) {
                Some(message) if message.is_object() => self.handle_view_message(connection, message),
                _ => {
                    let err = BridgeError::invalid("view-message needs a 'message' object");
                    self.send(connection, &bridge_error(&err));
                }
            },
            Some(EnvelopeType::WorkerMessage) => self.handle_worker_message(connection, envelope),
            Some(outbound) => {
                let err = BridgeError::invalid(format!("'{}' is outbound-only", outbound.as_str()));
                self.send(connection, &bridge_error(&err));
            }
            None => {
                let err = BridgeError::invalid(format!("unknown envelope type '{kind}'"));
                self.send(connection, &bridge_error(&err));
            }
        }
    }

    fn handle_view_message(&mut self, connection: ConnectionId, message: Value) {
        let Some(name) = message.get("type").and_then(Value::as_str).map(str::to_string) else {
            let err = BridgeError::invalid("view message needs a string 'type'");
            return self.send(connection, &bridge_error(&err));
        };
        let request_id = field(&message, "requestId").cloned();

        match MessageKind::parse(&name) {
            None => {
                let err = BridgeError::invalid(format!("unknown message type '{name}'"));
                self.reply(connection, &name, request_id, Err(err));
            }
            Some(MessageKind::Unsupported(kind)) => {
                log::debug!("[Router] {connection} sent unsupported '{name}'");
                let err = BridgeError::Unsupported(kind.as_str().to_string());
                self.reply(connection, kind.as_str(), request_id, Err(err));
            }
            Some(MessageKind::Local(kind)) => {
                let outcome = self.resolve_local(connection, kind, &message);
                self.reply(connection, kind.as_str(), request_id, outcome);
            }
            Some(MessageKind::Forwarded(kind)) => {
                match self.forward(connection, kind, request_id.clone(), &message) {
                    Ok(Some(result)) => self.reply(connection, kind.as_str(), request_id, Ok(result)),
                    Ok(None) => {}
                    Err(err) => self.reply(connection, kind.as_str(), request_id, Err(err)),
                }
            }
        }
    }

    fn handle_worker_message(&mut self, connection: ConnectionId, mut envelope: Value) {
        if let Some(worker_id) = envelope.get("workerId").and_then(Value::as_str) {
            if worker_id != self.worker.worker_id() {
                let err = BridgeError::invalid(format!("unknown worker '{worker_id}'"));
                return self.send(connection, &bridge_error(&err));
            }
        }
        let payload = match envelope.get_mut("payload").map(Value::take) {
            Some(payload) if payload.is_object() => payload,
            _ => {
                let err = BridgeError::invalid("worker-message needs a 'payload' object");
                return self.send(connection, &bridge_error(&err));
            }
        };
        let deliveries = self.worker.post_message(connection, payload);
        self.deliver_worker(deliveries);
    }

    // ─── Local state ───

    fn resolve_local(
        &mut self,
        connection: ConnectionId,
        kind: LocalKind,
        message: &Value,
    ) -> Result<Value, BridgeError> {
        match kind {
            LocalKind::Ping => Ok(json!("pong")),
            LocalKind::AssistantStatus => Ok(self.status()),
            LocalKind::WorkspaceRootsGet => to_json(&self.roots),
            LocalKind::WorkspaceRootsSet => {
                let roots = message
                    .get("roots")
                    .and_then(Value::as_array)
                    .ok_or_else(|| BridgeError::invalid("'roots' must be an array of strings"))?
                    .iter()
                    .map(|root| {
                        root.as_str()
                            .ok_or_else(|| BridgeError::invalid("'roots' must be an array of strings"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let active = message.get("active").and_then(Value::as_str);
                self.roots.set(roots, active);
                self.roots_changed(connection)
            }
            LocalKind::WorkspaceRootAdd => {
                if self.roots.add(str_field(message, "root")?) {
                    self.roots_changed(connection)
                } else {
                    to_json(&self.roots)
                }
            }
            LocalKind::WorkspaceRootRemove => {
                if self.roots.remove(str_field(message, "root")?) {
                    self.roots_changed(connection)
                } else {
                    to_json(&self.roots)
                }
            }
            LocalKind::SharedObjectSubscribe => {
                let key = str_field(message, "key")?;
                let value = self.shared.subscribe(connection, key);
                Ok(json!({ "key": key, "value": value }))
            }
            LocalKind::SharedObjectUnsubscribe => {
                let key = str_field(message, "key")?;
                Ok(json!({ "unsubscribed": self.shared.unsubscribe(connection, key) }))
            }
            LocalKind::SharedObjectSet => {
                let key = str_field(message, "key")?;
                let value = message.get("value").cloned().unwrap_or(Value::Null);
                let update = push("shared-object-updated", json!({ "key": key, "value": value }));
                for subscriber in self.shared.set(key, value.clone()) {
                    if subscriber != connection {
                        self.send(subscriber, &update);
                    }
                }
                Ok(json!({ "key": key, "value": value }))
            }
            LocalKind::PersistedAtomSync => Ok(json!({ "atoms": self.atoms.all() })),
            LocalKind::PersistedAtomUpdate => {
                let key = str_field(message, "key")?;
                let value = message.get("value").cloned().unwrap_or(Value::Null);
                if self.atoms.update(key, value.clone()) {
                    self.schedule_flush();
                    let update = push("persisted-atom-updated", json!({ "key": key, "value": value }));
                    self.broadcast_except(connection, &update);
                }
                Ok(json!({ "key": key }))
            }
            LocalKind::PersistedAtomReset => {
                let key = str_field(message, "key")?;
                let reset = self.atoms.reset(key);
                if reset {
                    self.schedule_flush();
                    let update = push("persisted-atom-updated", json!({ "key": key, "value": null }));
                    self.broadcast_except(connection, &update);
                }
                Ok(json!({ "key": key, "reset": reset }))
            }
            LocalKind::TerminalList => {
                let sessions = to_json(&self.terminals.list())?;
                Ok(json!({ "sessions": sessions }))
            }
        }
    }

    fn roots_changed(&self, connection: ConnectionId) -> Result<Value, BridgeError> {
        let roots = to_json(&self.roots)?;
        self.broadcast_except(connection, &push("workspace-roots-changed", roots.clone()));
        Ok(roots)
    }

    fn status(&self) -> Value {
        json!({
            "assistant": {
                "configured": self.rpc.is_some(),
                "state": self.rpc.as_ref().map(RpcClient::state),
                "pendingRequests": self.rpc.as_ref().map_or(0, RpcClient::pending_requests),
            },
            "bus": {
                "configured": self.bus.is_some(),
                "connected": self.bus.as_ref().is_some_and(BusClient::is_connected),
                "clientId": self.bus.as_ref().and_then(BusClient::client_id),
            },
            "worker": {
                "id": self.worker.worker_id(),
                "running": self.worker.is_running(),
                "pendingRequests": self.worker.pending_requests(),
            },
            "terminals": self.terminals.len(),
            "connections": self.connections.len(),
        })
    }

    fn schedule_flush(&mut self) {
        let tx = self.tx.clone();
        self.flush.schedule(self.persist_debounce, move || {
            let _ = tx.send(RouterEvent::FlushAtoms);
        });
    }

    // ─── Forwarded ───

    /// Returns `Ok(None)` when the reply comes later as an event.
    fn forward(
        &mut self,
        connection: ConnectionId,
        kind: ForwardedKind,
        request_id: Option<Value>,
        message: &Value,
    ) -> Result<Option<Value>, BridgeError> {
        let request_type = kind.as_str();
        match kind {
            ForwardedKind::AssistantRequest => {
                let rpc = self.rpc()?;
                let method = str_field(message, "method")?.to_string();
                let params = field(message, "params").cloned();
                let timeout = timeout_field(message)?;
                self.spawn_reply(
                    connection,
                    request_type,
                    request_id,
                    call_assistant(rpc, method, params, timeout),
                );
                Ok(None)
            }
            ForwardedKind::AssistantNotification => {
                let rpc = self.rpc()?;
                let method = str_field(message, "method")?.to_string();
                let params = field(message, "params").cloned();
                self.spawn_reply(connection, request_type, request_id, async move {
                    rpc.start().await?;
                    rpc.send_notification(&method, params)?;
                    Ok(Value::Null)
                });
                Ok(None)
            }
            ForwardedKind::AssistantResponse => {
                let rpc = self.rpc()?;
                let id = field(message, "id").ok_or_else(|| BridgeError::invalid("'id' is required"))?;
                let outcome = match field(message, "error") {
                    Some(error) => Err(error.clone()),
                    None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                };
                rpc.respond(id, outcome)?;
                Ok(Some(Value::Null))
            }
            ForwardedKind::AssistantRestart => {
                let rpc = self.rpc()?;
                log::info!("[Router] {connection} restarting the assistant");
                rpc.stop();
                self.spawn_reply(connection, request_type, request_id, async move {
                    rpc.start().await?;
                    Ok(json!({ "state": rpc.state() }))
                });
                Ok(None)
            }
            ForwardedKind::Fetch => {
                let request_id =
                    request_id.ok_or_else(|| BridgeError::invalid("fetch needs a 'requestId'"))?;
                let rpc = self.rpc()?;
                let method = str_field(message, "method")?.to_string();
                let params = field(message, "params").cloned();
                let timeout = timeout_field(message)?;

                let key = id_key(&request_id);
                let tx = self.tx.clone();
                let task_key = key.clone();
                let task = tokio::spawn(async move {
                    let outcome = call_assistant(rpc, method, params, timeout).await;
                    let _ = tx.send(RouterEvent::FetchCompleted {
                        connection,
                        key: task_key,
                        request_id,
                        outcome,
                    });
                });
                if let Some(previous) = self.fetches.insert((connection, key), task.abort_handle()) {
                    previous.abort();
                }
                Ok(None)
            }
            ForwardedKind::CancelFetch => {
                if let Some(request_id) = request_id {
                    if let Some(task) = self.fetches.remove(&(connection, id_key(&request_id))) {
                        task.abort();
                        log::debug!("[Router] {connection} cancelled fetch {request_id}");
                    }
                }
                Ok(None)
            }
            ForwardedKind::BusRequest => {
                let bus = self.bus()?;
                let method = str_field(message, "method")?.to_string();
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let timeout = timeout_field(message)?;
                self.spawn_reply(connection, request_type, request_id, async move {
                    let result = match timeout {
                        Some(timeout) => bus.send_request_with_timeout(&method, params, timeout).await,
                        None => bus.send_request(&method, params).await,
                    };
                    Ok(result?)
                });
                Ok(None)
            }
            ForwardedKind::BusBroadcast => {
                let bus = self.bus()?;
                let method = str_field(message, "method")?;
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                bus.send_broadcast(method, params)?;
                Ok(Some(Value::Null))
            }
            ForwardedKind::TerminalCreate | ForwardedKind::TerminalAttach => {
                let request: CreateRequest = serde_json::from_value(message.clone())
                    .map_err(|e| BridgeError::invalid(format!("invalid terminal request: {e}")))?;
                if kind == ForwardedKind::TerminalAttach {
                    let session_id = request
                        .session_id
                        .as_deref()
                        .ok_or_else(|| BridgeError::invalid("terminal-attach needs a 'sessionId'"))?;
                    if !self.terminals.contains(session_id) {
                        return Err(BridgeError::invalid(format!(
                            "unknown terminal session '{session_id}'"
                        )));
                    }
                }
                let outcome = self.terminals.create_or_attach(connection, request)?;
                to_json(&outcome).map(Some)
            }
            ForwardedKind::TerminalWrite => {
                let session_id = str_field(message, "sessionId")?;
                self.terminals.write(session_id, str_field(message, "data")?)?;
                Ok(Some(Value::Null))
            }
            ForwardedKind::TerminalResize => {
                let session_id = str_field(message, "sessionId")?;
                let cols = u16_field(message, "cols")?
                    .ok_or_else(|| BridgeError::invalid("'cols' is required"))?;
                let rows = u16_field(message, "rows")?
                    .ok_or_else(|| BridgeError::invalid("'rows' is required"))?;
                self.terminals.resize(session_id, cols, rows)?;
                Ok(Some(Value::Null))
            }
            ForwardedKind::TerminalClose => {
                let session_id = str_field(message, "sessionId")?;
                let listeners = self.terminals.close(session_id);
                let exit = push("terminal-exit", json!({ "sessionId": session_id, "code": null }));
                for listener in &listeners {
                    if *listener != connection {
                        self.send(*listener, &exit);
                    }
                }
                Ok(Some(json!({ "closed": !listeners.is_empty() })))
            }
            ForwardedKind::TerminalDetach => {
                let session_id = str_field(message, "sessionId")?;
                let closed = self.terminals.detach(connection, session_id);
                Ok(Some(json!({ "closed": closed })))
            }
        }
    }

    fn rpc(&self) -> Result<RpcClient, BridgeError> {
        self.rpc
            .clone()
            .ok_or_else(|| BridgeError::Transport("assistant is not configured".to_string()))
    }

    fn bus(&self) -> Result<BusClient, BridgeError> {
        self.bus
            .clone()
            .ok_or_else(|| BridgeError::Transport("bus is not configured".to_string()))
    }

    fn spawn_reply<F>(
        &self,
        connection: ConnectionId,
        request_type: &'static str,
        request_id: Option<Value>,
        call: F,
    ) where
        F: Future<Output = Result<Value, BridgeError>> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = call.await;
            let _ = tx.send(RouterEvent::Reply {
                connection,
                request_type,
                request_id,
                outcome,
            });
        });
    }

    // ─── Backend events ───

    fn on_rpc_event(&mut self, event: RpcEvent) {
        match event {
            RpcEvent::StateChanged { state, exit_code } => {
                self.broadcast(&push(
                    "assistant-status",
                    json!({ "state": state, "exitCode": exit_code }),
                ));
            }
            RpcEvent::Notification { method, params } => {
                self.broadcast(&push(
                    "assistant-notification",
                    json!({ "method": method, "params": params }),
                ));
            }
            RpcEvent::Request { id, method, params } => {
                if self.connections.is_empty() {
                    log::warn!("[Router] No view to answer assistant request '{method}'");
                    if let Some(rpc) = &self.rpc {
                        let error = json!({ "code": -32001, "message": "no view is connected" });
                        if let Err(e) = rpc.respond(&id, Err(error)) {
                            log::debug!("[Router] Could not answer assistant request: {e}");
                        }
                    }
                    return;
                }
                self.broadcast(&push(
                    "assistant-request",
                    json!({ "id": id, "method": method, "params": params }),
                ));
            }
        }
    }

    fn on_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected { client_id } => {
                self.broadcast(&push("bus-status", json!({ "connected": true, "clientId": client_id })));
            }
            BusEvent::Disconnected => {
                self.broadcast(&push("bus-status", json!({ "connected": false })));
            }
            BusEvent::Broadcast {
                source_client_id,
                method,
                params,
            } => {
                self.broadcast(&push(
                    "bus-broadcast",
                    json!({ "sourceClientId": source_client_id, "method": method, "params": params }),
                ));
            }
            BusEvent::Request {
                request_id, method, ..
            } => {
                log::debug!("[Router] Declining bus request '{method}'");
                if let Some(bus) = &self.bus {
                    let error = json!({
                        "code": "unsupported",
                        "message": format!("'{method}' is not handled here"),
                    });
                    if let Err(e) = bus.respond(&request_id, Err(error)) {
                        log::debug!("[Router] Could not answer bus request: {e}");
                    }
                }
            }
        }
    }

    fn deliver_terminal(&self, fanout: Fanout) {
        let session_id = fanout.session_id;
        let message = match fanout.output {
            TerminalOutput::Data(data) => {
                push("terminal-data", json!({ "sessionId": session_id, "data": data }))
            }
            TerminalOutput::Error(message) => {
                push("terminal-error", json!({ "sessionId": session_id, "message": message }))
            }
            TerminalOutput::Exit { code } => {
                push("terminal-exit", json!({ "sessionId": session_id, "code": code }))
            }
        };
        for listener in fanout.listeners {
            self.send(listener, &message);
        }
    }

    fn deliver_worker(&self, deliveries: Vec<Delivery>) {
        let worker_id = self.worker.worker_id();
        for delivery in deliveries {
            match delivery {
                Delivery::To {
                    connection,
                    payload,
                } => self.send(connection, &envelope::worker_event(worker_id, payload)),
                Delivery::Broadcast { payload } => {
                    self.broadcast(&envelope::worker_event(worker_id, payload));
                }
            }
        }
    }

    // ─── Output ───

    fn reply(
        &self,
        connection: ConnectionId,
        request_type: &str,
        request_id: Option<Value>,
        outcome: Result<Value, BridgeError>,
    ) {
        match (request_id, outcome) {
            (Some(request_id), Ok(result)) => {
                self.send(connection, &envelope::response(request_type, request_id, Ok(result)));
            }
            (Some(request_id), Err(err)) => {
                self.send(connection, &envelope::response(request_type, request_id, Err(&err)));
            }
            (None, Ok(_)) => {}
            (None, Err(err)) => {
                log::debug!("[Router] '{request_type}' from {connection} failed: {err}");
                self.send(connection, &bridge_error(&err));
            }
        }
    }

    fn send(&self, connection: ConnectionId, envelope: &Value) {
        if let Some(target) = self.connections.get(&connection) {
            if !target.send(encode(envelope)) {
                log::debug!("[Router] {connection} is gone; dropped message");
            }
        }
    }

    fn broadcast(&self, envelope: &Value) {
        let bytes = encode(envelope);
        for connection in self.connections.values() {
            connection.send(bytes.clone());
        }
    }

    fn broadcast_except(&self, skip: ConnectionId, envelope: &Value) {
        let bytes = encode(envelope);
        for (id, connection) in &self.connections {
            if *id != skip {
                connection.send(bytes.clone());
            }
        }
    }

    // ─── Teardown ───

    /// Release everything. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        log::info!("[Router] Disposing");

        self.flush.cancel();
        self.atoms.flush();
        for (_, task) in self.fetches.drain() {
            task.abort();
        }
        if let Some(rpc) = &self.rpc {
            rpc.stop();
        }
        if let Some(bus) = &self.bus {
            bus.stop();
        }
        let rejected = self.worker.stop();
        self.deliver_worker(rejected);
        self.terminals.dispose();
        for task in self.forwarders.drain(..) {
            task.abort();
        }
        for (_, connection) in std::mem::take(&mut self.connections) {
            connection.close();
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Relay a broadcast receiver into the router channel.
fn relay<E>(
    mut events: broadcast::Receiver<E>,
    tx: mpsc::UnboundedSender<RouterEvent>,
    wrap: fn(E) -> RouterEvent,
    tag: &'static str,
) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if tx.send(wrap(event)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("[Router] {tag} forwarder lagged, {missed} events lost");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn call_assistant(
    rpc: RpcClient,
    method: String,
    params: Option<Value>,
    timeout: Option<Duration>,
) -> Result<Value, BridgeError> {
    rpc.start().await?;
    Ok(rpc.send_request(&method, params, timeout).await?)
}

fn timeout_field(message: &Value) -> Result<Option<Duration>, BridgeError> {
    match field(message, "timeoutMs") {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|ms| Some(Duration::from_millis(ms)))
            .ok_or_else(|| BridgeError::invalid("'timeoutMs' must be a non-negative integer")),
    }
}

/// Fetch bookkeeping key. String and numeric ids never collide.
fn id_key(request_id: &Value) -> String {
    request_id.to_string()
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|e| BridgeError::Handler(e.to_string()))
}

fn encode(envelope: &Value) -> Vec<u8> {
    envelope.to_string().into_bytes()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

// ─── Tests ───

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{AllowAll, ChannelConnection};
    use crate::terminal::{BackendKind, LaunchSpec, TerminalBackend, TerminalError, TerminalEventKind};
    use persistence::MemoryAtomStore;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Launches {
        specs: Vec<LaunchSpec>,
        closed: Vec<String>,
    }

    #[derive(Debug)]
    struct FakeLauncher {
        launches: Arc<Mutex<Launches>>,
        panic_on_launch: bool,
    }

    #[derive(Debug)]
    struct FakeBackend {
        session_id: String,
        launches: Arc<Mutex<Launches>>,
    }

    impl Launcher for FakeLauncher {
        fn probe(&mut self, kind: BackendKind) -> bool {
            kind != BackendKind::PtyBridge
        }

        fn launch(
            &mut self,
            _kind: BackendKind,
            spec: &LaunchSpec,
            _events: mpsc::UnboundedSender<TerminalEvent>,
        ) -> Result<Box<dyn TerminalBackend>, TerminalError> {
            assert!(!self.panic_on_launch, "launcher blew up");
            self.launches.lock().unwrap().specs.push(spec.clone());
            Ok(Box::new(FakeBackend {
                session_id: spec.session_id.clone(),
                launches: Arc::clone(&self.launches),
            }))
        }
    }

    impl TerminalBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::ScriptPty
        }

        fn write(&mut self, _data: &str) -> Result<(), TerminalError> {
            Ok(())
        }

        fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), TerminalError> {
            Ok(())
        }

        fn close(&mut self) {
            self.launches.lock().unwrap().closed.push(self.session_id.clone());
        }
    }

    #[derive(Debug)]
    struct DenyAll;

    impl AuthGate for DenyAll {
        fn is_authorized(&self, _connection: &dyn Connection) -> bool {
            false
        }
    }

    struct Harness {
        router: Router,
        store: MemoryAtomStore,
        launches: Arc<Mutex<Launches>>,
    }

    fn options() -> RouterOptions {
        let terminal = TerminalConfig {
            default_shell: "/bin/sh".to_string(),
            default_cwd: None,
            scrollback_bytes: 4096,
        };
        let worker = WorkerConfig {
            worker_id: "git".to_string(),
            program: None,
            args: Vec::new(),
        };
        let mut options = RouterOptions::new(terminal, worker);
        options.workspace_roots = vec!["/repo/".to_string()];
        options.version = "test".to_string();
        options
    }

    fn harness_with(options: RouterOptions, panic_on_launch: bool) -> Harness {
        let store = MemoryAtomStore::default();
        let launches = Arc::new(Mutex::new(Launches::default()));
        let collaborators = Collaborators {
            auth: Box::new(AllowAll),
            atoms: Box::new(store.clone()),
            launcher: Box::new(FakeLauncher {
                launches: Arc::clone(&launches),
                panic_on_launch,
            }),
        };
        Harness {
            router: Router::new(options, collaborators),
            store,
            launches,
        }
    }

    fn harness() -> Harness {
        harness_with(options(), false)
    }

    fn connect(router: &mut Router) -> (ConnectionId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let id = ConnectionId::next();
        let (connection, rx) = ChannelConnection::new(id);
        router.register_client(Arc::new(connection)).unwrap();
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(serde_json::from_slice(&bytes).unwrap());
        }
        out
    }

    fn view(message: Value) -> Value {
        json!({ "type": "view-message", "message": message })
    }

    fn only(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Value {
        let mut messages = drain(rx);
        assert_eq!(messages.len(), 1, "expected one message, got {messages:?}");
        messages.remove(0)
    }

    #[tokio::test]
    async fn test_register_sends_bridge_ready() {
        let mut h = harness();
        let (id, mut rx) = connect(&mut h.router);
        let ready = only(&mut rx);
        assert_eq!(ready["type"], "bridge-ready");
        assert_eq!(ready["connectionId"], json!(id));
        assert_eq!(ready["version"], "test");
        assert_eq!(h.router.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_connection_is_rejected() {
        let collaborators = Collaborators {
            auth: Box::new(DenyAll),
            atoms: Box::new(MemoryAtomStore::default()),
            launcher: Box::new(FakeLauncher {
                launches: Arc::default(),
                panic_on_launch: false,
            }),
        };
        let mut router = Router::new(options(), collaborators);
        let (connection, mut rx) = ChannelConnection::new(ConnectionId::next());
        let closed = connection.closed_token();

        let err = router.register_client(Arc::new(connection)).unwrap_err();
        assert!(matches!(err, BridgeError::Unauthorized));
        assert!(closed.is_cancelled());
        assert_eq!(only(&mut rx)["error"]["kind"], "unauthorized");
        assert_eq!(router.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_events_are_folded_without_panicking() {
        let mut h = harness();
        let (id, mut rx) = connect(&mut h.router);
        drain(&mut rx);

        // A transport may report a disconnect the router already handled.
        h.router.handle_event(RouterEvent::ClientDisconnected(id));
        h.router.handle_event(RouterEvent::ClientDisconnected(id));
        assert_eq!(h.router.connection_count(), 0);

        h.router.dispose();
        let (late, mut late_rx) = ChannelConnection::new(ConnectionId::next());
        let closed = late.closed_token();
        h.router.handle_event(RouterEvent::ClientConnected(Arc::new(late)));
        assert!(closed.is_cancelled());
        assert!(drain(&mut late_rx).is_empty());
        assert_eq!(h.router.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_and_error_replies() {
        let mut h = harness();
        let (id, mut rx) = connect(&mut h.router);
        drain(&mut rx);

        h.router.handle_envelope(id, view(json!({"type": "ping", "requestId": 1})));
        let pong = only(&mut rx);
        assert_eq!(pong["message"]["result"], "pong");
        assert_eq!(pong["message"]["requestId"], 1);

        h.router.handle_envelope(id, view(json!({"type": "set-badge-count", "requestId": 2})));
        let reply = only(&mut rx);
        assert_eq!(reply["message"]["ok"], false);
        assert_eq!(reply["message"]["error"]["kind"], "unsupported");

        h.router.handle_envelope(id, view(json!({"type": "warp-drive", "requestId": 3})));
        assert_eq!(only(&mut rx)["message"]["error"]["kind"], "invalid-request");

        // No requestId: success is silent, failure is a bridge-error.
        h.router.handle_envelope(id, view(json!({"type": "ping"})));
        assert!(drain(&mut rx).is_empty());
        h.router.handle_envelope(id, view(json!({"type": "warp-drive"})));
        assert_eq!(only(&mut rx)["type"], "bridge-error");
    }

    #[tokio::test]
    async fn test_outbound_and_unknown_envelopes_get_bridge_error() {
        let mut h = harness();
        let (id, mut rx) = connect(&mut h.router);
        drain(&mut rx);

        for envelope in [
            json!({"type": "main-message", "message": {}}),
            json!({"type": "bridge-ready"}),
            json!({"type": "teleport"}),
            json!({"no": "type"}),
            json!({"type": "view-message", "message": "ping"}),
        ] {
            h.router.handle_envelope(id, envelope);
            let reply = only(&mut rx);
            assert_eq!(reply["type"], "bridge-error");
            assert_eq!(reply["error"]["kind"], "invalid-request");
        }
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_handler_error() {
        let mut h = harness_with(options(), true);
        let (id, mut rx) = connect(&mut h.router);
        drain(&mut rx);

        h.router.handle_envelope(
            id,
            view(json!({"type": "terminal-create", "requestId": "t", "sessionId": "boom"})),
        );
        let reply = only(&mut rx);
        assert_eq!(reply["message"]["requestId"], "t");
        assert_eq!(reply["message"]["requestType"], "terminal-create");
        assert_eq!(reply["message"]["error"]["kind"], "handler");

        h.router.handle_envelope(id, view(json!({"type": "ping", "requestId": 2})));
        assert_eq!(only(&mut rx)["message"]["result"], "pong");
    }

    #[tokio::test]
    async fn test_workspace_roots_broadcast_to_other_connections() {
        let mut h = harness();
        let (a, mut rx_a) = connect(&mut h.router);
        let (_b, mut rx_b) = connect(&mut h.router);
        drain(&mut rx_a);
        drain(&mut rx_b);

        h.router.handle_envelope(a, view(json!({"type": "workspace-root-add", "requestId": 1, "root": "/src/app/"})));
        let reply = only(&mut rx_a);
        assert_eq!(reply["message"]["result"]["roots"], json!(["/repo", "/src/app"]));
        let changed = only(&mut rx_b);
        assert_eq!(changed["message"]["type"], "workspace-roots-changed");
        assert_eq!(changed["message"]["active"], "/repo");

        // No change, no broadcast.
        h.router.handle_envelope(a, view(json!({"type": "workspace-root-add", "requestId": 2, "root": "/repo"})));
        drain(&mut rx_a);
        assert!(drain(&mut rx_b).is_empty());

        h.router.handle_envelope(
            a,
            view(json!({"type": "workspace-roots-set", "requestId": 3, "roots": ["/x/", "/y"], "active": "/y/"})),
        );
        assert_eq!(only(&mut rx_a)["message"]["result"], json!({"roots": ["/x", "/y"], "active": "/y"}));
        assert_eq!(only(&mut rx_b)["message"]["roots"], json!(["/x", "/y"]));

        h.router.handle_envelope(a, view(json!({"type": "workspace-roots-set", "requestId": 4, "roots": [1]})));
        assert_eq!(only(&mut rx_a)["message"]["error"]["kind"], "invalid-request");
    }

    #[tokio::test]
    async fn test_shared_object_updates_reach_subscribers() {
        let mut h = harness();
        let (a, mut rx_a) = connect(&mut h.router);
        let (b, mut rx_b) = connect(&mut h.router);
        drain(&mut rx_a);
        drain(&mut rx_b);

        h.router.handle_envelope(b, view(json!({"type": "shared-object-subscribe", "requestId": 1, "key": "theme"})));
        assert_eq!(only(&mut rx_b)["message"]["result"], json!({"key": "theme", "value": null}));

        h.router.handle_envelope(a, view(json!({"type": "shared-object-set", "requestId": 2, "key": "theme", "value": "dark"})));
        assert_eq!(only(&mut rx_a)["message"]["ok"], true);
        let update = only(&mut rx_b);
        assert_eq!(update["message"]["type"], "shared-object-updated");
        assert_eq!(update["message"]["value"], "dark");

        h.router.unregister_client(b);
        h.router.handle_envelope(a, view(json!({"type": "shared-object-set", "key": "theme", "value": "light"})));
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(h.router.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_atom_updates_are_debounced_and_flushed_on_dispose() {
        let mut h = harness();
        let (id, mut rx) = connect(&mut h.router);

        for n in 0..3 {
            h.router.handle_envelope(id, view(json!({"type": "persisted-atom-update", "key": "sidebar", "value": n})));
        }
        assert_eq!(h.store.saves(), 0);

        let event = h.router.next_event().await;
        assert!(matches!(event, RouterEvent::FlushAtoms));
        h.router.handle_event(event);
        assert_eq!(h.store.saves(), 1);
        assert_eq!(h.store.atoms().get("sidebar"), Some(&json!(2)));

        h.router.handle_envelope(id, view(json!({"type": "persisted-atom-sync", "requestId": 1})));
        let sync = drain(&mut rx).pop().unwrap();
        assert_eq!(sync["message"]["result"]["atoms"], json!({"sidebar": 2}));

        h.router.handle_envelope(id, view(json!({"type": "persisted-atom-reset", "key": "sidebar"})));
        h.router.dispose();
        assert_eq!(h.store.saves(), 2);
        assert!(h.store.atoms().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_never_replies() {
        let mut opts = options();
        opts.assistant = Some(RpcConfig::new("/nonexistent/switchboard-assistant"));
        let mut h = harness_with(opts, false);
        let (id, mut rx) = connect(&mut h.router);
        drain(&mut rx);

        h.router.handle_envelope(id, view(json!({"type": "fetch", "requestId": "f1", "method": "files/read"})));
        assert_eq!(h.router.pending_fetches(), 1);
        h.router.handle_envelope(id, view(json!({"type": "cancel-fetch", "requestId": "f1"})));
        assert_eq!(h.router.pending_fetches(), 0);

        h.router.handle_envelope(id, view(json!({"type": "fetch", "requestId": "f2", "method": "files/read"})));
        let event = h.router.next_event().await;
        h.router.handle_event(event);

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1, "{replies:?}");
        assert_eq!(replies[0]["message"]["requestId"], "f2");
        assert_eq!(replies[0]["message"]["error"]["kind"], "transport");
        assert_eq!(h.router.pending_fetches(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_backends_report_transport_errors() {
        let mut h = harness();
        let (id, mut rx) = connect(&mut h.router);
        drain(&mut rx);

        for kind in ["assistant-request", "bus-request", "fetch"] {
            h.router.handle_envelope(id, view(json!({"type": kind, "requestId": kind, "method": "x"})));
            assert_eq!(only(&mut rx)["message"]["error"]["kind"], "transport");
        }

        h.router.handle_envelope(id, view(json!({"type": "assistant-status", "requestId": 1})));
        let status = only(&mut rx);
        assert_eq!(status["message"]["result"]["assistant"]["configured"], false);
        assert_eq!(status["message"]["result"]["connections"], 1);
    }

    #[tokio::test]
    async fn test_terminals_fan_out_and_close_with_last_listener() {
        let mut h = harness();
        let (a, mut rx_a) = connect(&mut h.router);
        let (b, mut rx_b) = connect(&mut h.router);
        drain(&mut rx_a);
        drain(&mut rx_b);

        let create = json!({"type": "terminal-create", "requestId": 1, "sessionId": "s1"});
        h.router.handle_envelope(a, view(create.clone()));
        h.router.handle_envelope(b, view(create));
        assert_eq!(h.launches.lock().unwrap().specs.len(), 1);
        assert_eq!(only(&mut rx_a)["message"]["result"]["created"], true);
        let attached = only(&mut rx_b);
        assert_eq!(attached["message"]["result"]["created"], false);
        assert_eq!(attached["message"]["result"]["backend"], "script-pty");

        let instance = h.launches.lock().unwrap().specs[0].instance;
        h.router.handle_event(RouterEvent::Terminal(TerminalEvent {
            session_id: "s1".to_string(),
            instance,
            kind: TerminalEventKind::Data(b"hello".to_vec()),
        }));
        assert_eq!(only(&mut rx_a)["message"]["data"], "hello");
        assert_eq!(only(&mut rx_b)["message"]["type"], "terminal-data");

        h.router.handle_envelope(a, view(json!({"type": "terminal-resize", "requestId": 2, "sessionId": "s1", "cols": 100, "rows": 30})));
        assert_eq!(only(&mut rx_a)["message"]["error"]["kind"], "capability");

        h.router.handle_envelope(a, view(json!({"type": "terminal-attach", "requestId": 3, "sessionId": "nope"})));
        assert_eq!(only(&mut rx_a)["message"]["error"]["kind"], "invalid-request");

        h.router.unregister_client(a);
        assert!(h.launches.lock().unwrap().closed.is_empty());
        h.router.unregister_client(b);
        assert_eq!(h.launches.lock().unwrap().closed, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_terminal_close_notifies_other_listeners() {
        let mut h = harness();
        let (a, mut rx_a) = connect(&mut h.router);
        let (b, mut rx_b) = connect(&mut h.router);
        let create = json!({"type": "terminal-create", "sessionId": "s1"});
        h.router.handle_envelope(a, view(create.clone()));
        h.router.handle_envelope(b, view(create));
        drain(&mut rx_a);
        drain(&mut rx_b);

        h.router.handle_envelope(a, view(json!({"type": "terminal-close", "requestId": 1, "sessionId": "s1"})));
        assert_eq!(only(&mut rx_a)["message"]["result"]["closed"], true);
        let exit = only(&mut rx_b);
        assert_eq!(exit["message"]["type"], "terminal-exit");
        assert_eq!(exit["message"]["sessionId"], "s1");
    }

    #[tokio::test]
    async fn test_worker_messages_route_replies() {
        let mut h = harness();
        let (id, mut rx) = connect(&mut h.router);
        drain(&mut rx);

        h.router.handle_envelope(
            id,
            json!({
                "type": "worker-message",
                "workerId": "git",
                "payload": {"type": "worker-request", "request": {"id": 7, "method": "status"}},
            }),
        );
        let event = only(&mut rx);
        assert_eq!(event["type"], "worker-event");
        assert_eq!(event["workerId"], "git");
        assert_eq!(event["payload"]["type"], "worker-response");
        assert_eq!(event["payload"]["response"]["id"], 7);
        assert_eq!(event["payload"]["response"]["error"]["code"], "worker-unavailable");

        h.router.handle_envelope(id, json!({"type": "worker-message", "workerId": "svn", "payload": {}}));
        assert_eq!(only(&mut rx)["type"], "bridge-error");
    }

    #[tokio::test]
    async fn test_dispose_closes_connections_and_is_idempotent() {
        let mut h = harness();
        let (connection, _rx) = ChannelConnection::new(ConnectionId::next());
        let closed = connection.closed_token();
        h.router.register_client(Arc::new(connection)).unwrap();

        h.router.dispose();
        h.router.dispose();
        assert!(closed.is_cancelled());
        assert!(h.router.is_disposed());
        assert_eq!(h.router.connection_count(), 0);

        let (late, _rx) = ChannelConnection::new(ConnectionId::next());
        assert!(h.router.register_client(Arc::new(late)).is_err());
    }
}
