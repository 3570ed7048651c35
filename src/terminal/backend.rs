//! Terminal backends and the launcher that starts them.
//!
//! Three ways to run a shell, best first:
//!
//! | kind         | how                                   | resize |
//! |--------------|---------------------------------------|--------|
//! | `pty-bridge` | helper process owning a real PTY      | yes    |
//! | `script-pty` | `python3` `pty.spawn` wrapper          | no     |
//! | `pipe`       | plain stdin/stdout/stderr pipes       | no     |
//!
//! Running backends report output, errors and exit as [`TerminalEvent`]s
//! on the channel handed to [`Launcher::launch`].

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

use super::bridge::BridgeBackend;
use super::process::ChildBackend;
use super::TerminalError;

/// Backend families in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Helper process owning a real PTY.
    PtyBridge,
    /// Python `pty.spawn` wrapper.
    ScriptPty,
    /// Plain pipes.
    Pipe,
}

impl BackendKind {
    /// Every kind, best first.
    pub const PRIORITY: [Self; 3] = [Self::PtyBridge, Self::ScriptPty, Self::Pipe];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PtyBridge => "pty-bridge",
            Self::ScriptPty => "script-pty",
            Self::Pipe => "pipe",
        }
    }

    /// Whether a live resize reaches the process.
    pub fn supports_resize(self) -> bool {
        matches!(self, Self::PtyBridge)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memoized availability of a backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capability {
    /// Not probed yet.
    #[default]
    Unknown,
    /// Probe passed and no launch has failed.
    Available,
    /// Probe or launch failed; never retried.
    Unavailable,
}

/// Output of a running backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEventKind {
    /// Raw output bytes (stdout and stderr interleaved).
    Data(Vec<u8>),
    /// Backend-level error message.
    Error(String),
    /// Process exited.
    Exit {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
    },
}

/// Event from one session's backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEvent {
    /// Session that produced it.
    pub session_id: String,
    /// Launch instance; events from a replaced process are ignored.
    pub instance: u64,
    /// Payload.
    pub kind: TerminalEventKind,
}

/// Everything a launcher needs to start a session process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Session id.
    pub session_id: String,
    /// Launch instance stamped on every event.
    pub instance: u64,
    /// Program to run (usually the shell).
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory, already resolved.
    pub cwd: PathBuf,
    /// Extra environment.
    pub env: Vec<(String, String)>,
    /// Initial width.
    pub cols: u16,
    /// Initial height.
    pub rows: u16,
}

/// Handle to a running session process.
pub trait TerminalBackend: Send + fmt::Debug {
    /// Which family this backend belongs to.
    fn kind(&self) -> BackendKind;

    /// Send keyboard input.
    fn write(&mut self, data: &str) -> Result<(), TerminalError>;

    /// Change the window size.
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError>;

    /// Terminate the process. Idempotent.
    fn close(&mut self);
}

/// Probes and launches backends.
pub trait Launcher: Send + fmt::Debug {
    /// Cheap availability check. Called at most once per kind.
    fn probe(&mut self, kind: BackendKind) -> bool;

    /// Start `spec` with backend `kind`.
    fn launch(
        &mut self,
        kind: BackendKind,
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Result<Box<dyn TerminalBackend>, TerminalError>;
}

/// Launcher that starts real processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Bridge executable and leading args (e.g. this binary + `pty-bridge`).
    /// `None` disables the bridge backend.
    pub bridge: Option<(PathBuf, Vec<String>)>,
    /// Python interpreter for the script backend.
    pub python: String,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            bridge: None,
            python: "python3".to_string(),
        }
    }
}

impl ProcessLauncher {
    /// Launcher whose bridge is `program` followed by `args`.
    pub fn with_bridge(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            bridge: Some((program.into(), args)),
            ..Self::default()
        }
    }
}

impl Launcher for ProcessLauncher {
    fn probe(&mut self, kind: BackendKind) -> bool {
        let available = match kind {
            BackendKind::PtyBridge => self
                .bridge
                .as_ref()
                .is_some_and(|(program, _)| program.is_file()),
            BackendKind::ScriptPty => which::which(&self.python).is_ok(),
            BackendKind::Pipe => true,
        };
        log::info!("[Terminal] Probe {kind}: {}", if available { "available" } else { "unavailable" });
        available
    }

    fn launch(
        &mut self,
        kind: BackendKind,
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Result<Box<dyn TerminalBackend>, TerminalError> {
        match kind {
            BackendKind::PtyBridge => {
                let (program, args) = self
                    .bridge
                    .as_ref()
                    .ok_or_else(|| TerminalError::Launch("no bridge configured".to_string()))?;
                Ok(Box::new(BridgeBackend::launch(program, args, spec, events)?))
            }
            BackendKind::ScriptPty => Ok(Box::new(ChildBackend::launch_script(
                &self.python,
                spec,
                events,
            )?)),
            BackendKind::Pipe => Ok(Box::new(ChildBackend::launch_pipe(spec, events)?)),
        }
    }
}
