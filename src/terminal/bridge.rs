//! PTY bridge backend and its line protocol.
//!
//! The bridge is a helper process (by default `switchboard pty-bridge`)
//! that owns a real PTY. It speaks newline-delimited JSON:
//!
//! ```text
//! stdin  ◄── {"type":"write","data":"ls\r"}
//!            {"type":"resize","cols":120,"rows":40}
//!            {"type":"close"}
//! stdout ──► {"type":"data","data":"..."}
//!            {"type":"error","message":"..."}
//!            {"type":"exit","code":0}
//! ```
//!
//! `data` is always valid UTF-8; the bridge decodes PTY bytes with carry-over
//! before emitting.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backend::{BackendKind, LaunchSpec, TerminalBackend, TerminalEvent, TerminalEventKind};
use super::process::Emitter;
use super::TerminalError;

/// Grace period between `close` and a hard kill.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Command sent to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BridgeCommand {
    /// Keyboard input.
    Write {
        /// Input text.
        data: String,
    },
    /// Window size change.
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
    /// Terminate the session.
    Close,
}

/// Event emitted by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BridgeEvent {
    /// Decoded output.
    Data {
        /// Output text.
        data: String,
    },
    /// Non-fatal bridge error.
    Error {
        /// Description.
        message: String,
    },
    /// The PTY child exited.
    Exit {
        /// Exit code, `None` when unknown.
        code: Option<i32>,
    },
}

impl BridgeCommand {
    /// Serialize as one protocol line.
    pub fn to_line(&self) -> Vec<u8> {
        encode_line(self)
    }
}

impl BridgeEvent {
    /// Serialize as one protocol line.
    pub fn to_line(&self) -> Vec<u8> {
        encode_line(self)
    }
}

fn encode_line<T: Serialize>(message: &T) -> Vec<u8> {
    // Plain enums of strings and integers always serialize.
    let mut line = serde_json::to_vec(message).unwrap_or_default();
    line.push(b'\n');
    line
}

/// Session running behind a bridge process.
#[derive(Debug)]
pub struct BridgeBackend {
    commands: Option<mpsc::UnboundedSender<BridgeCommand>>,
    kill: CancellationToken,
}

impl BridgeBackend {
    /// Spawn `program args.. --cols C --rows R --cwd DIR -- shell shell_args..`.
    pub fn launch(
        program: &Path,
        args: &[String],
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Result<Self, TerminalError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--cols")
            .arg(spec.cols.to_string())
            .arg("--rows")
            .arg(spec.rows.to_string())
            .arg("--cwd")
            .arg(&spec.cwd)
            .arg("--")
            .arg(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TerminalError::Launch(format!("pty bridge {}: {e}", program.display())))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TerminalError::Launch("bridge stdio was not captured".to_string()));
        };

        log::info!(
            "[Terminal] Session {} started via pty-bridge (pid {:?})",
            spec.session_id,
            child.id()
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let emitter = Emitter {
            session_id: spec.session_id.clone(),
            instance: spec.instance,
            events,
        };
        let saw_exit = Arc::new(AtomicBool::new(false));

        tokio::spawn(send_commands(stdin, command_rx));
        let reader = tokio::spawn(read_events(stdout, emitter.clone(), Arc::clone(&saw_exit)));
        tokio::spawn(watch_bridge(child, kill.clone(), reader, emitter, saw_exit));

        Ok(Self {
            commands: Some(commands),
            kill,
        })
    }

    fn send(&self, command: BridgeCommand) -> Result<(), TerminalError> {
        self.commands
            .as_ref()
            .ok_or_else(|| TerminalError::Io("pty bridge closed".to_string()))?
            .send(command)
            .map_err(|_| TerminalError::Io("pty bridge closed".to_string()))
    }
}

impl TerminalBackend for BridgeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PtyBridge
    }

    fn write(&mut self, data: &str) -> Result<(), TerminalError> {
        self.send(BridgeCommand::Write {
            data: data.to_string(),
        })
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.send(BridgeCommand::Resize { cols, rows })
    }

    fn close(&mut self) {
        if self.commands.is_some() {
            let _ = self.send(BridgeCommand::Close);
            self.commands = None;
        }
        self.kill.cancel();
    }
}

impl Drop for BridgeBackend {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn send_commands(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<BridgeCommand>) {
    while let Some(command) = rx.recv().await {
        if stdin.write_all(&command.to_line()).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_events(stdout: ChildStdout, emitter: Emitter, saw_exit: Arc<AtomicBool>) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let event = match serde_json::from_str::<BridgeEvent>(&line) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("[Terminal] Dropping invalid bridge line: {e}");
                continue;
            }
        };
        let kind = match event {
            BridgeEvent::Data { data } => TerminalEventKind::Data(data.into_bytes()),
            BridgeEvent::Error { message } => TerminalEventKind::Error(message),
            BridgeEvent::Exit { code } => {
                saw_exit.store(true, Ordering::SeqCst);
                TerminalEventKind::Exit { code }
            }
        };
        if !emitter.emit(kind) {
            break;
        }
    }
}

async fn watch_bridge(
    mut child: Child,
    kill: CancellationToken,
    reader: JoinHandle<()>,
    emitter: Emitter,
    saw_exit: Arc<AtomicBool>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = kill.cancelled() => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            // Let the bridge honour `close` before forcing it.
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    let _ = tokio::time::timeout(CLOSE_GRACE, reader).await;
    if !saw_exit.load(Ordering::SeqCst) {
        let code = status.ok().and_then(|s| s.code());
        emitter.emit(TerminalEventKind::Exit { code });
    }
}
