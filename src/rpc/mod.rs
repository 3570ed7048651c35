//! Assistant subprocess client.
//!
//! The assistant is a long-lived child process that speaks newline-delimited
//! JSON on its standard streams:
//!
//! ```text
//! switchboard ──{"id":N,"method":..}\n──► stdin
//!             ◄─{"id":N,"result":..}\n── stdout
//!             ◄─{"method":..}\n───────── stdout (notifications, peer requests)
//!             ◄─ text ─────────────────── stderr (logged at debug)
//! ```
//!
//! Lifecycle: `Disconnected → Spawning → Connected → Initialized`. Any exit
//! returns to `Disconnected` and rejects everything pending. Nothing
//! restarts the process implicitly.

pub mod client;
pub mod lines;
pub mod message;

pub use client::{RpcClient, RpcConfig};

use serde::Serialize;
use serde_json::Value;

/// Lifecycle of the assistant process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// No process.
    Disconnected,
    /// Spawn in progress.
    Spawning,
    /// Process running, handshake not finished.
    Connected,
    /// Handshake finished; ready for traffic.
    Initialized,
}

/// Failures reported by [`RpcClient`].
///
/// `Clone` because concurrent `start()` callers share one outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The process exited while the request was pending.
    #[error("assistant process exited (code {code:?})")]
    ProcessExited {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
    },
    /// The client was stopped while the request was pending.
    #[error("assistant client stopped")]
    Stopped,
    /// No process to talk to.
    #[error("assistant process is not running")]
    NotRunning,
    /// The process could not be spawned.
    #[error("failed to spawn assistant: {0}")]
    Spawn(String),
    /// No response before the deadline.
    #[error("assistant request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Method that was waiting.
        method: String,
        /// Deadline that expired.
        timeout_ms: u64,
    },
    /// The assistant answered with an error object.
    #[error("assistant returned an error")]
    Application(Value),
    /// Malformed traffic from the assistant.
    #[error("assistant protocol error: {0}")]
    Protocol(String),
}

/// Events published by [`RpcClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    /// The connection state changed.
    StateChanged {
        /// New state.
        state: ConnectionState,
        /// Exit code when the change was caused by process exit.
        exit_code: Option<i32>,
    },
    /// Assistant notification.
    Notification {
        /// Notification method.
        method: String,
        /// Notification params.
        params: Value,
    },
    /// Assistant-initiated request. Answer with [`RpcClient::respond`].
    Request {
        /// Id to echo back.
        id: Value,
        /// Requested method.
        method: String,
        /// Request params.
        params: Value,
    },
}
