//! Terminal session manager.
//!
//! Multiplexes interactive shell sessions across UI connections:
//!
//! ```text
//! conn-1 ─┐                    ┌─ Session "a" ── backend (pty-bridge) ─┐
//! conn-2 ─┼─ TerminalManager ──┤                                       ├─► TerminalEvent
//! conn-3 ─┘                    └─ Session "b" ── backend (pipe) ───────┘
//! ```
//!
//! A session has at most one process and any number of listeners. It is
//! destroyed when its process exits or its last listener leaves. Output is
//! decoded as UTF-8 across chunk boundaries, fanned out to every listener,
//! and kept in a bounded scrollback that is replayed on attach.
//!
//! Backends are chosen by priority, each gated by a memoized [`Capability`]:
//! a negative probe is never repeated and a failed launch demotes the kind
//! for the rest of the process lifetime. `pipe` is the floor and is never
//! demoted.

pub mod backend;
pub mod bridge;
pub mod cwd;
pub mod process;
pub mod pty_host;
pub mod scrollback;
pub mod utf8;

pub use backend::{
    BackendKind, Capability, LaunchSpec, Launcher, ProcessLauncher, TerminalBackend,
    TerminalEvent, TerminalEventKind,
};

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::connection::ConnectionId;
use crate::constants::{DEFAULT_COLS, DEFAULT_ROWS, TERMINAL_SCROLLBACK_BYTES};
use scrollback::Scrollback;
use utf8::Utf8Decoder;

/// Terminal failures.
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    /// The session's backend cannot resize.
    #[error("resize is not supported by the {0} backend")]
    ResizeUnsupported(BackendKind),
    /// Every backend is unavailable.
    #[error("no terminal backend is available")]
    NoBackend,
    /// The backend failed to start.
    #[error("failed to launch terminal: {0}")]
    Launch(String),
    /// Talking to a running backend failed.
    #[error("terminal I/O failed: {0}")]
    Io(String),
}

/// Manager-wide defaults.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Shell used when a request names none.
    pub default_shell: String,
    /// Directory used when a request names none.
    pub default_cwd: Option<String>,
    /// Scrollback budget per session.
    pub scrollback_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_shell: std::env::var("SHELL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/bin/sh".to_string()),
            default_cwd: None,
            scrollback_bytes: TERMINAL_SCROLLBACK_BYTES,
        }
    }
}

/// `terminal-create` / `terminal-attach` parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    /// Existing or desired session id; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Command line run with `shell -c`; interactive shell when absent.
    #[serde(default)]
    pub command: Option<String>,
    /// Requested working directory.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Shell override.
    #[serde(default)]
    pub shell: Option<String>,
    /// Extra environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Initial width.
    #[serde(default)]
    pub cols: Option<u16>,
    /// Initial height.
    #[serde(default)]
    pub rows: Option<u16>,
}

/// Result of [`TerminalManager::create_or_attach`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachOutcome {
    /// Session id (generated if the request had none).
    pub session_id: String,
    /// True when a process was launched for this call.
    pub created: bool,
    /// Backend running the session.
    pub backend: BackendKind,
    /// Shell program.
    pub shell: String,
    /// Working directory in use.
    pub cwd: PathBuf,
    /// True when the requested directory was unusable.
    pub cwd_fallback: bool,
    /// Buffered output to replay.
    pub replay: String,
    /// Notes gathered while starting the session.
    pub startup_log: Vec<String>,
}

/// Row of [`TerminalManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id.
    pub session_id: String,
    /// Backend running the session.
    pub backend: BackendKind,
    /// Shell program.
    pub shell: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Attached listeners.
    pub listeners: usize,
    /// Current width.
    pub cols: u16,
    /// Current height.
    pub rows: u16,
}

/// Decoded output ready for listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutput {
    /// Text output.
    Data(String),
    /// Backend error.
    Error(String),
    /// Process exit; the session is gone.
    Exit {
        /// Exit code.
        code: Option<i32>,
    },
}

/// Output addressed to a session's listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fanout {
    /// Session id.
    pub session_id: String,
    /// Every listener at the time of the event.
    pub listeners: Vec<ConnectionId>,
    /// Payload.
    pub output: TerminalOutput,
}

struct Session {
    instance: u64,
    kind: BackendKind,
    shell: String,
    cwd: PathBuf,
    cwd_fallback: bool,
    cols: u16,
    rows: u16,
    backend: Box<dyn TerminalBackend>,
    startup_log: Vec<String>,
    listeners: BTreeSet<ConnectionId>,
    scrollback: Scrollback,
    decoder: Utf8Decoder,
}

impl Session {
    fn outcome(&self, session_id: &str, created: bool) -> AttachOutcome {
        AttachOutcome {
            session_id: session_id.to_string(),
            created,
            backend: self.kind,
            shell: self.shell.clone(),
            cwd: self.cwd.clone(),
            cwd_fallback: self.cwd_fallback,
            replay: self.scrollback.snapshot(),
            startup_log: self.startup_log.clone(),
        }
    }
}

/// Owner of every terminal session.
pub struct TerminalManager {
    config: TerminalConfig,
    launcher: Box<dyn Launcher>,
    events: mpsc::UnboundedSender<TerminalEvent>,
    sessions: HashMap<String, Session>,
    capabilities: HashMap<BackendKind, Capability>,
    next_instance: u64,
}

impl std::fmt::Debug for TerminalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalManager")
            .field("sessions", &self.sessions.len())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl TerminalManager {
    /// Create a manager. Backend events are delivered on `events`.
    pub fn new(
        config: TerminalConfig,
        launcher: Box<dyn Launcher>,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Self {
        Self {
            config,
            launcher,
            events,
            sessions: HashMap::new(),
            capabilities: HashMap::new(),
            next_instance: 0,
        }
    }

    /// Attach `connection` to a session, launching it if it does not exist.
    pub fn create_or_attach(
        &mut self,
        connection: ConnectionId,
        request: CreateRequest,
    ) -> Result<AttachOutcome, TerminalError> {
        let session_id = request
            .session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.listeners.insert(connection);
            log::info!("[Terminal] {connection} attached to {session_id}");
            return Ok(session.outcome(&session_id, false));
        }

        let shell = request
            .shell
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.config.default_shell.clone());
        let resolved = cwd::resolve_cwd(
            request
                .cwd
                .as_deref()
                .or(self.config.default_cwd.as_deref()),
        );
        let mut startup_log: Vec<String> = resolved.note.iter().cloned().collect();

        let args = match request.command.filter(|c| !c.trim().is_empty()) {
            Some(command) => vec!["-c".to_string(), command],
            None => vec!["-i".to_string()],
        };
        let mut env: Vec<(String, String)> = request.env.into_iter().collect();
        env.sort();
        let cols = request.cols.filter(|&c| c > 0).unwrap_or(DEFAULT_COLS);
        let rows = request.rows.filter(|&r| r > 0).unwrap_or(DEFAULT_ROWS);

        self.next_instance += 1;
        let spec = LaunchSpec {
            session_id: session_id.clone(),
            instance: self.next_instance,
            program: shell.clone(),
            args,
            cwd: resolved.path.clone(),
            env,
            cols,
            rows,
        };
        let (kind, backend) = self.launch(&spec, &mut startup_log)?;
        if !kind.supports_resize() {
            startup_log.push(format!(
                "Running on the {kind} backend; window resizing is unavailable."
            ));
        }

        log::info!(
            "[Terminal] {connection} created {session_id} ({kind}, {shell}, {})",
            resolved.path.display()
        );
        let session = Session {
            instance: spec.instance,
            kind,
            shell,
            cwd: resolved.path,
            cwd_fallback: resolved.fallback,
            cols,
            rows,
            backend,
            startup_log,
            listeners: BTreeSet::from([connection]),
            scrollback: Scrollback::new(self.config.scrollback_bytes.max(1)),
            decoder: Utf8Decoder::new(),
        };
        let outcome = session.outcome(&session_id, true);
        self.sessions.insert(session_id, session);
        Ok(outcome)
    }

    fn launch(
        &mut self,
        spec: &LaunchSpec,
        startup_log: &mut Vec<String>,
    ) -> Result<(BackendKind, Box<dyn TerminalBackend>), TerminalError> {
        for kind in BackendKind::PRIORITY {
            if !self.is_available(kind) {
                continue;
            }
            match self.launcher.launch(kind, spec, self.events.clone()) {
                Ok(backend) => return Ok((kind, backend)),
                Err(e) => {
                    log::warn!("[Terminal] {kind} launch failed: {e}");
                    startup_log.push(format!("The {kind} backend failed to start: {e}"));
                    if kind != BackendKind::Pipe {
                        self.capabilities.insert(kind, Capability::Unavailable);
                    }
                }
            }
        }
        Err(TerminalError::NoBackend)
    }

    fn is_available(&mut self, kind: BackendKind) -> bool {
        match self.capability(kind) {
            Capability::Available => true,
            Capability::Unavailable => false,
            Capability::Unknown => {
                let available = self.launcher.probe(kind);
                let capability = if available {
                    Capability::Available
                } else {
                    Capability::Unavailable
                };
                self.capabilities.insert(kind, capability);
                available
            }
        }
    }

    /// Memoized capability of `kind`.
    pub fn capability(&self, kind: BackendKind) -> Capability {
        self.capabilities.get(&kind).copied().unwrap_or_default()
    }

    /// Send input. Unknown sessions are ignored.
    pub fn write(&mut self, session_id: &str, data: &str) -> Result<(), TerminalError> {
        match self.sessions.get_mut(session_id) {
            Some(session) => session.backend.write(data),
            None => Ok(()),
        }
    }

    /// Resize. Unknown sessions are ignored; backends without resize
    /// support report a capability error and keep running.
    pub fn resize(&mut self, session_id: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Ok(());
        };
        if !session.kind.supports_resize() {
            return Err(TerminalError::ResizeUnsupported(session.kind));
        }
        session.backend.resize(cols, rows)?;
        session.cols = cols;
        session.rows = rows;
        Ok(())
    }

    /// Kill a session. Returns the listeners it had; empty if unknown.
    pub fn close(&mut self, session_id: &str) -> Vec<ConnectionId> {
        let Some(mut session) = self.sessions.remove(session_id) else {
            return Vec::new();
        };
        log::info!("[Terminal] Closing {session_id}");
        session.backend.close();
        session.listeners.into_iter().collect()
    }

    /// Detach one listener. Returns true if that closed the session.
    pub fn detach(&mut self, connection: ConnectionId, session_id: &str) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session.listeners.remove(&connection);
        if session.listeners.is_empty() {
            self.close(session_id);
            return true;
        }
        false
    }

    /// Detach `connection` everywhere. Returns the sessions this closed.
    pub fn remove_listener(&mut self, connection: ConnectionId) -> Vec<String> {
        let mut orphaned = Vec::new();
        for (session_id, session) in &mut self.sessions {
            if session.listeners.remove(&connection) && session.listeners.is_empty() {
                orphaned.push(session_id.clone());
            }
        }
        for session_id in &orphaned {
            self.close(session_id);
        }
        orphaned
    }

    /// Fold a backend event into session state.
    ///
    /// Returns the output to deliver and to whom, or `None` when the event
    /// belongs to a closed or replaced session or decodes to nothing yet.
    pub fn handle_event(&mut self, event: TerminalEvent) -> Option<Fanout> {
        let session = self.sessions.get_mut(&event.session_id)?;
        if session.instance != event.instance {
            log::debug!("[Terminal] Ignoring stale event for {}", event.session_id);
            return None;
        }

        let output = match event.kind {
            TerminalEventKind::Data(bytes) => {
                let text = session.decoder.decode(&bytes);
                if text.is_empty() {
                    return None;
                }
                session.scrollback.push(&text);
                TerminalOutput::Data(text)
            }
            TerminalEventKind::Error(message) => {
                log::warn!("[Terminal] {} error: {message}", event.session_id);
                TerminalOutput::Error(message)
            }
            TerminalEventKind::Exit { code } => {
                let session = self.sessions.remove(&event.session_id)?;
                log::info!("[Terminal] {} exited (code {code:?})", event.session_id);
                return Some(Fanout {
                    session_id: event.session_id,
                    listeners: session.listeners.into_iter().collect(),
                    output: TerminalOutput::Exit { code },
                });
            }
        };

        Some(Fanout {
            listeners: session.listeners.iter().copied().collect(),
            session_id: event.session_id,
            output,
        })
    }

    /// Summaries of every live session, sorted by id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|(session_id, session)| SessionSummary {
                session_id: session_id.clone(),
                backend: session.kind,
                shell: session.shell.clone(),
                cwd: session.cwd.clone(),
                listeners: session.listeners.len(),
                cols: session.cols,
                rows: session.rows,
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    /// True if `session_id` is live.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session.
    pub fn dispose(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for session_id in ids {
            self.close(&session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct FakeLog {
        probes: Vec<BackendKind>,
        launches: Vec<(BackendKind, LaunchSpec)>,
        writes: Vec<(String, String)>,
        resizes: Vec<(String, u16, u16)>,
        closed: Vec<String>,
    }

    #[derive(Debug)]
    struct FakeLauncher {
        unavailable: Vec<BackendKind>,
        failing: Vec<BackendKind>,
        log: Arc<Mutex<FakeLog>>,
    }

    #[derive(Debug)]
    struct FakeBackend {
        kind: BackendKind,
        session_id: String,
        log: Arc<Mutex<FakeLog>>,
    }

    impl Launcher for FakeLauncher {
        fn probe(&mut self, kind: BackendKind) -> bool {
            self.log.lock().unwrap().probes.push(kind);
            !self.unavailable.contains(&kind)
        }

        fn launch(
            &mut self,
            kind: BackendKind,
            spec: &LaunchSpec,
            _events: mpsc::UnboundedSender<TerminalEvent>,
        ) -> Result<Box<dyn TerminalBackend>, TerminalError> {
            self.log.lock().unwrap().launches.push((kind, spec.clone()));
            if self.failing.contains(&kind) {
                return Err(TerminalError::Launch(format!("{kind} exploded")));
            }
            Ok(Box::new(FakeBackend {
                kind,
                session_id: spec.session_id.clone(),
                log: Arc::clone(&self.log),
            }))
        }
    }

    impl TerminalBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn write(&mut self, data: &str) -> Result<(), TerminalError> {
            self.log
                .lock()
                .unwrap()
                .writes
                .push((self.session_id.clone(), data.to_string()));
            Ok(())
        }

        fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError> {
            self.log
                .lock()
                .unwrap()
                .resizes
                .push((self.session_id.clone(), cols, rows));
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closed.push(self.session_id.clone());
        }
    }

    fn manager(
        unavailable: &[BackendKind],
        failing: &[BackendKind],
    ) -> (TerminalManager, Arc<Mutex<FakeLog>>) {
        let log = Arc::new(Mutex::new(FakeLog::default()));
        let launcher = FakeLauncher {
            unavailable: unavailable.to_vec(),
            failing: failing.to_vec(),
            log: Arc::clone(&log),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = TerminalConfig {
            default_shell: "/bin/sh".to_string(),
            default_cwd: None,
            scrollback_bytes: 1024,
        };
        (TerminalManager::new(config, Box::new(launcher), tx), log)
    }

    fn request(session_id: &str) -> CreateRequest {
        CreateRequest {
            session_id: Some(session_id.to_string()),
            ..CreateRequest::default()
        }
    }

    fn data(session_id: &str, instance: u64, bytes: &[u8]) -> TerminalEvent {
        TerminalEvent {
            session_id: session_id.to_string(),
            instance,
            kind: TerminalEventKind::Data(bytes.to_vec()),
        }
    }

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);
    const C: ConnectionId = ConnectionId(3);

    #[test]
    fn test_same_session_id_from_two_connections_spawns_once() {
        let (mut terminals, log) = manager(&[], &[]);
        let first = terminals.create_or_attach(A, request("shared")).unwrap();
        let second = terminals.create_or_attach(B, request("shared")).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.backend, BackendKind::PtyBridge);
        assert_eq!(log.lock().unwrap().launches.len(), 1);
        assert_eq!(terminals.list()[0].listeners, 2);
    }

    #[test]
    fn test_generated_session_id_and_interactive_default() {
        let (mut terminals, log) = manager(&[], &[]);
        let outcome = terminals
            .create_or_attach(A, CreateRequest::default())
            .unwrap();
        assert_eq!(outcome.session_id.len(), 36);
        let log = log.lock().unwrap();
        let (_, spec) = &log.launches[0];
        assert_eq!(spec.program, "/bin/sh");
        assert_eq!(spec.args, vec!["-i".to_string()]);
        assert_eq!((spec.cols, spec.rows), (DEFAULT_COLS, DEFAULT_ROWS));
    }

    #[test]
    fn test_command_runs_through_shell() {
        let (mut terminals, log) = manager(&[], &[]);
        terminals
            .create_or_attach(
                A,
                CreateRequest {
                    command: Some("cargo test".to_string()),
                    shell: Some("/bin/bash".to_string()),
                    cols: Some(120),
                    rows: Some(40),
                    ..request("build")
                },
            )
            .unwrap();
        let log = log.lock().unwrap();
        let (_, spec) = &log.launches[0];
        assert_eq!(spec.program, "/bin/bash");
        assert_eq!(spec.args, vec!["-c".to_string(), "cargo test".to_string()]);
        assert_eq!((spec.cols, spec.rows), (120, 40));
    }

    #[test]
    fn test_first_detach_keeps_process_last_detach_kills() {
        let (mut terminals, log) = manager(&[], &[]);
        terminals.create_or_attach(A, request("s")).unwrap();
        terminals.create_or_attach(B, request("s")).unwrap();

        assert!(!terminals.detach(A, "s"));
        assert!(log.lock().unwrap().closed.is_empty());
        assert_eq!(terminals.len(), 1);

        assert!(terminals.detach(B, "s"));
        assert_eq!(log.lock().unwrap().closed, vec!["s".to_string()]);
        assert!(terminals.is_empty());
    }

    #[test]
    fn test_unknown_session_operations_are_noops() {
        let (mut terminals, log) = manager(&[], &[]);
        terminals.write("missing", "ls\n").unwrap();
        terminals.resize("missing", 100, 30).unwrap();
        assert!(terminals.close("missing").is_empty());
        assert!(!terminals.detach(A, "missing"));
        assert!(terminals
            .handle_event(data("missing", 1, b"x"))
            .is_none());
        let log = log.lock().unwrap();
        assert!(log.writes.is_empty() && log.resizes.is_empty() && log.closed.is_empty());
    }

    #[test]
    fn test_resize_capability_per_backend() {
        let (mut terminals, log) = manager(&[BackendKind::PtyBridge], &[]);
        let outcome = terminals.create_or_attach(A, request("script")).unwrap();
        assert_eq!(outcome.backend, BackendKind::ScriptPty);
        assert!(outcome
            .startup_log
            .iter()
            .any(|line| line.contains("resizing is unavailable")));

        let err = terminals.resize("script", 100, 30).unwrap_err();
        assert!(matches!(err, TerminalError::ResizeUnsupported(BackendKind::ScriptPty)));
        assert_eq!(terminals.len(), 1);
        assert!(log.lock().unwrap().resizes.is_empty());

        let (mut terminals, log) = manager(&[], &[]);
        terminals.create_or_attach(A, request("pty")).unwrap();
        terminals.resize("pty", 132, 43).unwrap();
        assert_eq!(log.lock().unwrap().resizes, vec![("pty".to_string(), 132, 43)]);
        assert_eq!((terminals.list()[0].cols, terminals.list()[0].rows), (132, 43));
    }

    #[test]
    fn test_capability_cache_memoizes_and_demotes_on_launch_failure() {
        let (mut terminals, log) =
            manager(&[BackendKind::PtyBridge], &[BackendKind::ScriptPty]);

        let first = terminals.create_or_attach(A, request("one")).unwrap();
        assert_eq!(first.backend, BackendKind::Pipe);
        assert!(first
            .startup_log
            .iter()
            .any(|line| line.contains("script-pty backend failed")));
        assert_eq!(terminals.capability(BackendKind::PtyBridge), Capability::Unavailable);
        assert_eq!(terminals.capability(BackendKind::ScriptPty), Capability::Unavailable);
        assert_eq!(terminals.capability(BackendKind::Pipe), Capability::Available);

        let second = terminals.create_or_attach(A, request("two")).unwrap();
        assert_eq!(second.backend, BackendKind::Pipe);

        let log = log.lock().unwrap();
        assert_eq!(
            log.probes,
            vec![BackendKind::PtyBridge, BackendKind::ScriptPty, BackendKind::Pipe]
        );
        let kinds: Vec<BackendKind> = log.launches.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![BackendKind::ScriptPty, BackendKind::Pipe, BackendKind::Pipe]
        );
    }

    #[test]
    fn test_no_backend_available() {
        let (mut terminals, _log) = manager(&BackendKind::PRIORITY, &[]);
        let err = terminals.create_or_attach(A, request("x")).unwrap_err();
        assert!(matches!(err, TerminalError::NoBackend));
        assert!(terminals.is_empty());
    }

    #[test]
    fn test_output_fans_out_decodes_utf8_and_replays() {
        let (mut terminals, log) = manager(&[], &[]);
        terminals.create_or_attach(A, request("s")).unwrap();
        terminals.create_or_attach(B, request("s")).unwrap();
        let instance = log.lock().unwrap().launches[0].1.instance;

        let e_acute = "é".as_bytes();
        let first = terminals
            .handle_event(data("s", instance, &[b'a', e_acute[0]]))
            .unwrap();
        assert_eq!(first.listeners, vec![A, B]);
        assert_eq!(first.output, TerminalOutput::Data("a".to_string()));

        let second = terminals
            .handle_event(data("s", instance, &[e_acute[1], b'!']))
            .unwrap();
        assert_eq!(second.output, TerminalOutput::Data("é!".to_string()));

        // A lone continuation prefix produces nothing yet.
        assert!(terminals
            .handle_event(data("s", instance, &e_acute[..1]))
            .is_none());

        // Events from an earlier process instance are ignored.
        assert!(terminals
            .handle_event(data("s", instance + 100, b"stale"))
            .is_none());

        let late = terminals.create_or_attach(C, request("s")).unwrap();
        assert_eq!(late.replay, "aé!");
    }

    #[test]
    fn test_exit_removes_session_and_notifies_listeners() {
        let (mut terminals, log) = manager(&[], &[]);
        terminals.create_or_attach(A, request("s")).unwrap();
        terminals.create_or_attach(B, request("s")).unwrap();
        let instance = log.lock().unwrap().launches[0].1.instance;

        let fanout = terminals
            .handle_event(TerminalEvent {
                session_id: "s".to_string(),
                instance,
                kind: TerminalEventKind::Exit { code: Some(0) },
            })
            .unwrap();
        assert_eq!(fanout.listeners, vec![A, B]);
        assert_eq!(fanout.output, TerminalOutput::Exit { code: Some(0) });
        assert!(terminals.is_empty());

        // Reusing the id launches a fresh process.
        assert!(terminals.create_or_attach(A, request("s")).unwrap().created);
    }

    #[test]
    fn test_remove_listener_closes_only_orphaned_sessions() {
        let (mut terminals, log) = manager(&[], &[]);
        terminals.create_or_attach(A, request("mine")).unwrap();
        terminals.create_or_attach(A, request("ours")).unwrap();
        terminals.create_or_attach(B, request("ours")).unwrap();

        let closed = terminals.remove_listener(A);
        assert_eq!(closed, vec!["mine".to_string()]);
        assert_eq!(log.lock().unwrap().closed, vec!["mine".to_string()]);
        assert_eq!(terminals.list().len(), 1);
        assert_eq!(terminals.list()[0].session_id, "ours");
    }

    #[test]
    fn test_cwd_fallback_is_reported() {
        let (mut terminals, log) = manager(&[], &[]);
        let outcome = terminals
            .create_or_attach(
                A,
                CreateRequest {
                    cwd: Some("/definitely/not/a/dir".to_string()),
                    ..request("s")
                },
            )
            .unwrap();
        assert!(outcome.cwd_fallback);
        assert!(outcome.cwd.is_dir());
        assert!(outcome.startup_log[0].contains("/definitely/not/a/dir"));
        assert_eq!(log.lock().unwrap().launches[0].1.cwd, outcome.cwd);
    }

    #[test]
    fn test_write_reaches_backend_and_dispose_closes_all() {
        let (mut terminals, log) = manager(&[], &[]);
        terminals.create_or_attach(A, request("a")).unwrap();
        terminals.create_or_attach(B, request("b")).unwrap();
        terminals.write("a", "echo hi\n").unwrap();
        assert_eq!(
            log.lock().unwrap().writes,
            vec![("a".to_string(), "echo hi\n".to_string())]
        );

        terminals.dispose();
        assert!(terminals.is_empty());
        let mut closed = log.lock().unwrap().closed.clone();
        closed.sort();
        assert_eq!(closed, vec!["a".to_string(), "b".to_string()]);
    }
}
