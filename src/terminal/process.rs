//! Pipe-based backends: plain pipes and the `pty.spawn` wrapper.
//!
//! Both run the session program as a child with piped stdio. The script
//! variant wraps it in Python's `pty.spawn` so the program sees a TTY and
//! produces realistic output, but the wrapper has no way to forward a
//! window-size change.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backend::{BackendKind, LaunchSpec, TerminalBackend, TerminalEvent, TerminalEventKind};
use super::TerminalError;

/// Python driver: run argv[1:] under a PTY and exit with its status.
const PTY_SPAWN_SCRIPT: &str =
    "import os,pty,sys\nstatus=pty.spawn(sys.argv[1:])\nsys.exit(os.WEXITSTATUS(status) if os.WIFEXITED(status) else 1)";

/// How long the exit watcher waits for output readers to drain.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

const CHUNK_SIZE: usize = 8 * 1024;

/// Child process with piped stdio.
#[derive(Debug)]
pub struct ChildBackend {
    kind: BackendKind,
    stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    kill: CancellationToken,
}

impl ChildBackend {
    /// Run the session program directly on pipes.
    pub fn launch_pipe(
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Result<Self, TerminalError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        Self::spawn(BackendKind::Pipe, cmd, spec, events)
    }

    /// Run the session program under `python -c pty.spawn(...)`.
    pub fn launch_script(
        python: &str,
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Result<Self, TerminalError> {
        let mut cmd = Command::new(python);
        cmd.arg("-c")
            .arg(PTY_SPAWN_SCRIPT)
            .arg(&spec.program)
            .args(&spec.args)
            .env("COLUMNS", spec.cols.to_string())
            .env("LINES", spec.rows.to_string());
        Self::spawn(BackendKind::ScriptPty, cmd, spec, events)
    }

    fn spawn(
        kind: BackendKind,
        mut cmd: Command,
        spec: &LaunchSpec,
        events: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Result<Self, TerminalError> {
        cmd.current_dir(&spec.cwd)
            .env("TERM", "xterm-256color")
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TerminalError::Launch(format!("{kind} {}: {e}", spec.program)))?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(TerminalError::Launch("child stdio was not captured".to_string()));
        };

        log::info!(
            "[Terminal] Session {} started via {kind} (pid {:?})",
            spec.session_id,
            child.id()
        );

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let emitter = Emitter {
            session_id: spec.session_id.clone(),
            instance: spec.instance,
            events,
        };

        tokio::spawn(write_stdin(stdin, stdin_rx));
        let readers = [
            tokio::spawn(pump_output(stdout, emitter.clone())),
            tokio::spawn(pump_output(stderr, emitter.clone())),
        ];
        tokio::spawn(watch_exit(child, kill.clone(), readers, emitter));

        Ok(Self {
            kind,
            stdin_tx: Some(stdin_tx),
            kill,
        })
    }
}

impl TerminalBackend for ChildBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn write(&mut self, data: &str) -> Result<(), TerminalError> {
        let tx = self
            .stdin_tx
            .as_ref()
            .ok_or_else(|| TerminalError::Io("terminal input closed".to_string()))?;
        tx.send(data.as_bytes().to_vec())
            .map_err(|_| TerminalError::Io("terminal input closed".to_string()))
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> Result<(), TerminalError> {
        Err(TerminalError::ResizeUnsupported(self.kind))
    }

    fn close(&mut self) {
        self.stdin_tx = None;
        self.kill.cancel();
    }
}

impl Drop for ChildBackend {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Stamps events with the session they belong to.
#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    pub(crate) session_id: String,
    pub(crate) instance: u64,
    pub(crate) events: mpsc::UnboundedSender<TerminalEvent>,
}

impl Emitter {
    pub(crate) fn emit(&self, kind: TerminalEventKind) -> bool {
        self.events
            .send(TerminalEvent {
                session_id: self.session_id.clone(),
                instance: self.instance,
                kind,
            })
            .is_ok()
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, emitter: Emitter) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if !emitter.emit(TerminalEventKind::Data(buf[..n].to_vec())) {
                    break;
                }
            }
        }
    }
}

async fn watch_exit(
    mut child: Child,
    kill: CancellationToken,
    readers: [JoinHandle<()>; 2],
    emitter: Emitter,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = kill.cancelled() => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = status.ok().and_then(|s| s.code());

    for reader in readers {
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
    }
    log::info!(
        "[Terminal] Session {} exited (code {code:?})",
        emitter.session_id
    );
    emitter.emit(TerminalEventKind::Exit { code });
}
