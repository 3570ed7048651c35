//! `pty-bridge` subcommand: host one PTY session over stdio.
//!
//! ```text
//! stdin (BridgeCommand lines) ──► [stdin thread] ──┐
//!                                                  ├─► main loop ──► PTY writer / resize / kill
//! child.wait()               ──► [wait thread]  ──┘
//! PTY reader ──► [reader thread] ──► UTF-8 decode ──► stdout (BridgeEvent lines)
//! ```
//!
//! stdout belongs to the protocol; logging goes to stderr. The process ends
//! after the child exits and its final `exit` event is written.

// Rust guideline compliant 2026-02

use std::io::{BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};

use super::bridge::{BridgeCommand, BridgeEvent};
use crate::constants::PTY_DRAIN_TIMEOUT;
use super::utf8::Utf8Decoder;

/// Parameters of one hosted session.
#[derive(Debug, Clone)]
pub struct PtyHostOptions {
    /// Initial width.
    pub cols: u16,
    /// Initial height.
    pub rows: u16,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Program followed by its arguments.
    pub command: Vec<String>,
}

enum HostMessage {
    Command(BridgeCommand),
    StdinClosed,
    ChildExited(Option<i32>),
}

/// Serialized access to the protocol stream.
#[derive(Clone)]
struct EventSink {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl EventSink {
    fn emit(&self, event: &BridgeEvent) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if out.write_all(&event.to_line()).and_then(|()| out.flush()).is_err() {
            log::debug!("[PtyBridge] stdout closed");
        }
    }
}

/// Open a new PTY pair with the given dimensions.
fn open_pty(rows: u16, cols: u16) -> Result<PtyPair> {
    native_pty_system()
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("Failed to open PTY")
}

fn build_command(options: &PtyHostOptions) -> Result<CommandBuilder> {
    let Some((program, args)) = options.command.split_first() else {
        bail!("pty-bridge needs a command to run");
    };
    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    if let Some(cwd) = &options.cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");
    Ok(cmd)
}

/// Run the bridge until the hosted child exits. Returns its exit code.
pub fn run(options: &PtyHostOptions) -> Result<i32> {
    let cmd = build_command(options)?;
    let pair = open_pty(options.rows, options.cols)?;
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("Failed to spawn {:?}", options.command))?;
    drop(pair.slave);
    log::info!(
        "[PtyBridge] Spawned {:?} ({}x{})",
        options.command,
        options.cols,
        options.rows
    );

    let master = pair.master;
    let mut reader = master.try_clone_reader().context("Failed to clone PTY reader")?;
    let mut writer = master.take_writer().context("Failed to take PTY writer")?;
    let mut killer = child.clone_killer();

    let sink = EventSink {
        out: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
    };
    let (tx, rx) = mpsc::channel::<HostMessage>();

    let reader_sink = sink.clone();
    let (drained_tx, drained_rx) = mpsc::channel::<()>();
    let reader_thread = thread::spawn(move || {
        let mut decoder = Utf8Decoder::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                // EIO once the child side closes.
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = decoder.decode(&buf[..n]);
                    if !data.is_empty() {
                        reader_sink.emit(&BridgeEvent::Data { data });
                    }
                }
            }
        }
        let tail = decoder.finish();
        if !tail.is_empty() {
            reader_sink.emit(&BridgeEvent::Data { data: tail });
        }
        let _ = drained_tx.send(());
    });

    let stdin_tx = tx.clone();
    let stdin_sink = sink.clone();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BridgeCommand>(&line) {
                Ok(command) => {
                    if stdin_tx.send(HostMessage::Command(command)).is_err() {
                        return;
                    }
                }
                Err(e) => stdin_sink.emit(&BridgeEvent::Error {
                    message: format!("invalid command: {e}"),
                }),
            }
        }
        let _ = stdin_tx.send(HostMessage::StdinClosed);
    });

    thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                log::warn!("[PtyBridge] wait failed: {e}");
                None
            }
        };
        let _ = tx.send(HostMessage::ChildExited(code));
    });

    let mut killed = false;
    let code = loop {
        let Ok(message) = rx.recv() else { break None };
        match message {
            HostMessage::Command(BridgeCommand::Write { data }) => {
                if let Err(e) = writer.write_all(data.as_bytes()).and_then(|()| writer.flush()) {
                    sink.emit(&BridgeEvent::Error {
                        message: format!("write failed: {e}"),
                    });
                }
            }
            HostMessage::Command(BridgeCommand::Resize { cols, rows }) => {
                let size = PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                };
                if let Err(e) = master.resize(size) {
                    sink.emit(&BridgeEvent::Error {
                        message: format!("resize failed: {e}"),
                    });
                }
            }
            HostMessage::Command(BridgeCommand::Close) | HostMessage::StdinClosed => {
                if !killed {
                    killed = true;
                    if let Err(e) = killer.kill() {
                        log::warn!("[PtyBridge] kill failed: {e}");
                    }
                }
            }
            HostMessage::ChildExited(code) => break code,
        }
    };

    drop(writer);
    drop(master);
    if !await_reader(reader_thread, &drained_rx, PTY_DRAIN_TIMEOUT) {
        log::warn!("[PtyBridge] PTY still held open after exit; not waiting for more output");
    }
    sink.emit(&BridgeEvent::Exit { code });
    log::info!("[PtyBridge] Child exited (code {code:?})");
    Ok(code.unwrap_or(1))
}

/// Join the reader if it signals `drained` within `timeout`.
///
/// Returns false when the thread was left running.
fn await_reader(reader: thread::JoinHandle<()>, drained: &mpsc::Receiver<()>, timeout: Duration) -> bool {
    match drained.recv_timeout(timeout) {
        // Disconnected means the thread ended without signalling (it panicked).
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            let _ = reader.join();
            true
        }
        Err(RecvTimeoutError::Timeout) => false,
    }
}
