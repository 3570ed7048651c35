//! Offloaded task worker bridge.
//!
//! Runs one worker process (by default `switchboard git-worker`) and
//! multiplexes every connection's requests onto it:
//!
//! ```text
//! conn-1 {id:1} ─┐                       ┌─► worker {id:1}
//!                ├─ WorkerBridge ─ stdin ┤
//! conn-2 {id:1} ─┘   (id rewrite)        └─► worker {id:2}
//!
//! worker stdout ─► WorkerEvent ─► router ─► handle_event ─► Delivery
//! ```
//!
//! Request ids are only unique per connection, so each `worker-request` is
//! rewritten to a bridge-unique id and the original is restored on the way
//! back. The pending map is owned by the router task; the reader task only
//! forwards parsed lines.
//!
//! The process starts lazily on the first message. When its executable
//! cannot be found every request is answered at once with a
//! `worker-unavailable` error.

// Rust guideline compliant 2026-02

pub mod git;
pub mod protocol;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionId;
use crate::constants::READ_BUFFER_SIZE;
use crate::rpc::lines::LineBuffer;
use protocol::WorkerResponse;

/// How long the exit watcher waits for the reader to drain.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Worker process settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Id used in `worker-message` / `worker-event` envelopes.
    pub worker_id: String,
    /// Worker executable. `None` means no worker is installed.
    pub program: Option<PathBuf>,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
}

/// Output of the worker's background tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// One parsed stdout line.
    Message {
        /// Process generation that produced it.
        generation: u64,
        /// Parsed JSON.
        payload: Value,
    },
    /// The process exited.
    Exited {
        /// Process generation that exited.
        generation: u64,
        /// Exit code, `None` when killed.
        code: Option<i32>,
    },
}

/// Payload to hand to connections.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// For exactly one connection.
    To {
        /// Recipient.
        connection: ConnectionId,
        /// Worker message.
        payload: Value,
    },
    /// For every connection.
    Broadcast {
        /// Worker message.
        payload: Value,
    },
}

#[derive(Debug)]
struct Pending {
    connection: ConnectionId,
    original_id: Value,
}

#[derive(Debug)]
struct WorkerProcess {
    generation: u64,
    stdin: mpsc::UnboundedSender<Vec<u8>>,
    kill: CancellationToken,
}

/// Bridge between connections and the worker process.
#[derive(Debug)]
pub struct WorkerBridge {
    config: WorkerConfig,
    events: mpsc::UnboundedSender<WorkerEvent>,
    process: Option<WorkerProcess>,
    pending: HashMap<u64, Pending>,
    next_id: u64,
    generation: u64,
}

impl WorkerBridge {
    /// Create a bridge. Process output is delivered on `events`.
    pub fn new(config: WorkerConfig, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            config,
            events,
            process: None,
            pending: HashMap::new(),
            next_id: 0,
            generation: 0,
        }
    }

    /// Worker id used in envelopes.
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// True while a worker process is running.
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Handle a payload posted by `connection`.
    ///
    /// Returns replies that can be produced without the worker (errors).
    pub fn post_message(&mut self, connection: ConnectionId, payload: Value) -> Vec<Delivery> {
        match protocol::message_type(&payload) {
            Some(protocol::CANCEL) => {
                self.cancel(connection, &payload);
                Vec::new()
            }
            Some(protocol::REQUEST) => self.request(connection, payload),
            _ => {
                if let Err(message) = self.ensure_started() {
                    log::debug!("[Worker] Dropping message: {message}");
                } else {
                    self.send(&payload);
                }
                Vec::new()
            }
        }
    }

    fn request(&mut self, connection: ConnectionId, mut payload: Value) -> Vec<Delivery> {
        let original_id = protocol::request_id(&payload).cloned().unwrap_or(Value::Null);
        let reply = |code: &str, message: String| {
            vec![Delivery::To {
                connection,
                payload: WorkerResponse::err(original_id.clone(), code, message).into_message(),
            }]
        };

        let Some(request) = payload.get_mut("request").and_then(Value::as_object_mut) else {
            return reply("invalid-request", "worker-request needs a request object".to_string());
        };
        if let Err(message) = self.ensure_started() {
            return reply(protocol::UNAVAILABLE_CODE, message);
        }

        // Nothing to route an answer back by, so nothing to track.
        if original_id.is_null() {
            if !self.send(&payload) {
                return reply(protocol::UNAVAILABLE_CODE, "worker input closed".to_string());
            }
            log::debug!("[Worker] {connection} request without id forwarded untracked");
            return Vec::new();
        }

        self.next_id += 1;
        let bridge_id = self.next_id;
        request.insert("id".to_string(), Value::from(bridge_id));
        self.pending.insert(
            bridge_id,
            Pending {
                connection,
                original_id: original_id.clone(),
            },
        );

        if !self.send(&payload) {
            self.pending.remove(&bridge_id);
            return reply(protocol::UNAVAILABLE_CODE, "worker input closed".to_string());
        }
        log::debug!("[Worker] {connection} request {original_id} -> {bridge_id}");
        Vec::new()
    }

    fn cancel(&mut self, connection: ConnectionId, payload: &Value) {
        let Some(original_id) = protocol::request_id(payload) else {
            return;
        };
        let cancelled: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.connection == connection && &p.original_id == original_id)
            .map(|(id, _)| *id)
            .collect();
        for bridge_id in cancelled {
            self.pending.remove(&bridge_id);
            log::debug!("[Worker] {connection} cancelled {original_id}");
            let notice = serde_json::json!({
                "type": protocol::CANCEL,
                "request": { "id": bridge_id },
            });
            self.send(&notice);
        }
    }

    /// Fold a background event in. Returns the resulting deliveries.
    pub fn handle_event(&mut self, event: WorkerEvent) -> Vec<Delivery> {
        match event {
            WorkerEvent::Message {
                generation,
                mut payload,
            } => {
                if generation != self.generation {
                    return Vec::new();
                }
                if protocol::message_type(&payload) != Some(protocol::RESPONSE) {
                    return vec![Delivery::Broadcast { payload }];
                }
                let bridge_id = payload
                    .get("response")
                    .and_then(|r| r.get("id"))
                    .and_then(Value::as_u64);
                let Some(pending) = bridge_id.and_then(|id| self.pending.remove(&id)) else {
                    log::debug!("[Worker] Dropping response with no owner: {bridge_id:?}");
                    return Vec::new();
                };
                if let Some(response) = payload.get_mut("response").and_then(Value::as_object_mut) {
                    response.insert("id".to_string(), pending.original_id);
                }
                vec![Delivery::To {
                    connection: pending.connection,
                    payload,
                }]
            }
            WorkerEvent::Exited { generation, code } => {
                if self.process.as_ref().map(|p| p.generation) != Some(generation) {
                    return Vec::new();
                }
                log::warn!("[Worker] Worker exited (code {code:?})");
                self.process = None;
                self.reject_all(&format!("worker exited (code {code:?})"))
            }
        }
    }

    /// Forget every request `connection` is waiting on.
    pub fn remove_connection(&mut self, connection: ConnectionId) {
        self.pending.retain(|_, p| p.connection != connection);
    }

    /// Kill the worker and answer every pending request with an error.
    pub fn stop(&mut self) -> Vec<Delivery> {
        if let Some(process) = self.process.take() {
            log::info!("[Worker] Stopping worker");
            process.kill.cancel();
        }
        self.generation += 1;
        self.reject_all("worker stopped")
    }

    fn reject_all(&mut self, message: &str) -> Vec<Delivery> {
        let mut pending: Vec<(u64, Pending)> = self.pending.drain().collect();
        pending.sort_by_key(|(id, _)| *id);
        pending
            .into_iter()
            .map(|(_, p)| Delivery::To {
                connection: p.connection,
                payload: WorkerResponse::err(p.original_id, "worker-exited", message)
                    .into_message(),
            })
            .collect()
    }

    fn send(&self, message: &Value) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| p.stdin.send(protocol::to_line(message)).is_ok())
    }

    fn ensure_started(&mut self) -> Result<(), String> {
        if self.process.is_some() {
            return Ok(());
        }
        let program = self
            .config
            .program
            .as_ref()
            .and_then(|p| which::which(p).ok())
            .ok_or_else(|| "worker unavailable".to_string())?;

        let mut child = Command::new(&program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("worker unavailable: {e}"))?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err("worker unavailable: stdio was not captured".to_string());
        };

        self.generation += 1;
        let generation = self.generation;
        log::info!(
            "[Worker] Started {} (pid {:?})",
            program.display(),
            child.id()
        );

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        tokio::spawn(write_loop(stdin, stdin_rx));
        tokio::spawn(stderr_loop(stderr));
        let reader = tokio::spawn(read_loop(stdout, generation, self.events.clone()));
        tokio::spawn(watch_exit(
            child,
            kill.clone(),
            reader,
            generation,
            self.events.clone(),
        ));

        self.process = Some(WorkerProcess {
            generation,
            stdin: stdin_tx,
            kill,
        });
        Ok(())
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        if let Some(process) = &self.process {
            process.kill.cancel();
        }
    }
}

async fn write_loop(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(line) = rx.recv().await {
        if stdin.write_all(&line).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    mut stdout: ChildStdout,
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut lines = LineBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for payload in lines.push(&buf[..n]) {
            if events
                .send(WorkerEvent::Message {
                    generation,
                    payload,
                })
                .is_err()
            {
                return;
            }
        }
    }
    if let Some(payload) = lines.finish() {
        let _ = events.send(WorkerEvent::Message {
            generation,
            payload,
        });
    }
}

async fn stderr_loop(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("[Worker] stderr: {line}");
    }
}

async fn watch_exit(
    mut child: Child,
    kill: CancellationToken,
    reader: JoinHandle<()>,
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
    let code = status.ok().and_then(|s| s.code());
    let _ = events.send(WorkerEvent::Exited { generation, code });
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Announces itself, then answers every request with `"done"`.
    const ECHO_WORKER: &str = r#"printf '{"type":"worker-log","message":"up"}\n'
while read -r line; do
  case "$line" in *worker-request-cancel*) continue;; esac
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"type":"worker-response","response":{"id":%s,"result":"done"}}\n' "$id"
done"#;

    fn bridge(script: &str) -> (WorkerBridge, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = WorkerConfig {
            worker_id: "git".to_string(),
            program: Some(PathBuf::from("/bin/sh")),
            args: vec!["-c".to_string(), script.to_string()],
        };
        (WorkerBridge::new(config, tx), rx)
    }

    fn request(id: Value) -> Value {
        json!({"type": "worker-request", "request": {"id": id, "method": "status", "params": {}}})
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Pump events until `count` targeted deliveries were produced.
    async fn collect_replies(
        bridge: &mut WorkerBridge,
        rx: &mut mpsc::UnboundedReceiver<WorkerEvent>,
        count: usize,
    ) -> (Vec<(ConnectionId, Value)>, Vec<Value>) {
        let mut replies = Vec::new();
        let mut broadcasts = Vec::new();
        while replies.len() < count {
            for delivery in bridge.handle_event(next_event(rx).await) {
                match delivery {
                    Delivery::To {
                        connection,
                        payload,
                    } => replies.push((connection, payload)),
                    Delivery::Broadcast { payload } => broadcasts.push(payload),
                }
            }
        }
        (replies, broadcasts)
    }

    #[tokio::test]
    async fn test_colliding_ids_route_back_to_their_connections() {
        let (mut bridge, mut rx) = bridge(ECHO_WORKER);
        assert!(!bridge.is_running());

        let a = ConnectionId(1);
        let b = ConnectionId(2);
        assert!(bridge.post_message(a, request(json!(1))).is_empty());
        assert!(bridge.is_running());
        assert!(bridge.post_message(b, request(json!(1))).is_empty());
        assert_eq!(bridge.pending_requests(), 2);

        let (mut replies, broadcasts) = collect_replies(&mut bridge, &mut rx, 2).await;
        replies.sort_by_key(|(conn, _)| *conn);
        assert_eq!(replies[0].0, a);
        assert_eq!(replies[1].0, b);
        for (_, payload) in &replies {
            assert_eq!(payload["response"]["id"], json!(1));
            assert_eq!(payload["response"]["result"], json!("done"));
        }
        assert_eq!(broadcasts, vec![json!({"type": "worker-log", "message": "up"})]);
        assert_eq!(bridge.pending_requests(), 0);
        bridge.stop();
    }

    #[tokio::test]
    async fn test_cancelled_request_gets_no_reply() {
        let (mut bridge, mut rx) = bridge(ECHO_WORKER);
        let a = ConnectionId(1);
        let b = ConnectionId(2);

        bridge.post_message(a, request(json!("slow")));
        bridge.post_message(a, json!({"type": "worker-request-cancel", "request": {"id": "slow"}}));
        assert_eq!(bridge.pending_requests(), 0);
        bridge.post_message(b, request(json!("after")));

        let (replies, _) = collect_replies(&mut bridge, &mut rx, 1).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, b);
        assert_eq!(replies[0].1["response"]["id"], json!("after"));
        bridge.stop();
    }

    #[tokio::test]
    async fn test_missing_executable_answers_unavailable_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        for program in [None, Some(PathBuf::from("/nonexistent/worker"))] {
            let mut bridge = WorkerBridge::new(
                WorkerConfig {
                    worker_id: "git".to_string(),
                    program,
                    args: Vec::new(),
                },
                tx.clone(),
            );
            let replies = bridge.post_message(ConnectionId(4), request(json!(12)));
            let [Delivery::To {
                connection,
                payload,
            }] = replies.as_slice()
            else {
                panic!("expected one reply, got {replies:?}");
            };
            assert_eq!(*connection, ConnectionId(4));
            assert_eq!(payload["response"]["id"], json!(12));
            assert_eq!(payload["response"]["error"]["code"], "worker-unavailable");
            assert!(!bridge.is_running());
        }
    }

    #[tokio::test]
    async fn test_request_without_body_is_rejected() {
        let (mut bridge, _rx) = bridge(ECHO_WORKER);
        let replies = bridge.post_message(ConnectionId(1), json!({"type": "worker-request"}));
        assert_eq!(replies.len(), 1);
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_request_without_id_is_forwarded_untracked() {
        let (mut bridge, _rx) = bridge("cat >/dev/null");
        let missing = json!({"type": "worker-request", "request": {"method": "status", "params": {}}});
        assert!(bridge.post_message(ConnectionId(1), missing).is_empty());
        assert!(bridge.post_message(ConnectionId(1), request(Value::Null)).is_empty());

        assert!(bridge.is_running());
        assert_eq!(bridge.pending_requests(), 0);
        assert!(bridge.stop().is_empty());
    }

    #[tokio::test]
    async fn test_exit_answers_pending_with_error() {
        let (mut bridge, mut rx) = bridge("read -r line; exit 3");
        bridge.post_message(ConnectionId(7), request(json!(1)));

        let (replies, _) = collect_replies(&mut bridge, &mut rx, 1).await;
        assert_eq!(replies[0].0, ConnectionId(7));
        assert_eq!(replies[0].1["response"]["error"]["code"], "worker-exited");
        assert!(!bridge.is_running());
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_remove_connection_then_stop() {
        let (mut bridge, _rx) = bridge("cat >/dev/null");
        bridge.post_message(ConnectionId(1), request(json!(1)));
        bridge.post_message(ConnectionId(2), request(json!(2)));

        bridge.remove_connection(ConnectionId(1));
        let replies = bridge.stop();
        assert_eq!(replies.len(), 1);
        let Delivery::To {
            connection,
            payload,
        } = &replies[0]
        else {
            panic!("expected a targeted reply");
        };
        assert_eq!(*connection, ConnectionId(2));
        assert_eq!(payload["response"]["id"], json!(2));
        assert!(!bridge.is_running());
        assert!(bridge.stop().is_empty());
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut bridge = WorkerBridge::new(
            WorkerConfig {
                worker_id: "git".to_string(),
                program: None,
                args: Vec::new(),
            },
            tx,
        );
        let stale = WorkerEvent::Message {
            generation: 42,
            payload: json!({"type": "worker-log"}),
        };
        assert!(bridge.handle_event(stale).is_empty());
        assert!(bridge
            .handle_event(WorkerEvent::Exited {
                generation: 42,
                code: Some(0)
            })
            .is_empty());
    }
}
