//! Router-level error taxonomy.
//!
//! Leaf transports report failures with their own enums ([`RpcError`],
//! [`BusError`], [`TerminalError`]). The router folds them into
//! [`BridgeError`], whose [`ErrorKind`] is what the view sees. Every error
//! crosses a component boundary as data; nothing is thrown at the caller.

use serde::Serialize;
use serde_json::{json, Value};

use crate::bus::BusError;
use crate::rpc::RpcError;
use crate::terminal::TerminalError;

/// Discriminant serialized into every error reply as `error.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Socket or process failure; the owning transport resets.
    Transport,
    /// Malformed frame or JSON; fatal to the transport instance.
    Protocol,
    /// No matching response before the deadline.
    Timeout,
    /// The backend answered with an explicit error object.
    Application,
    /// The selected backend cannot perform the operation.
    Capability,
    /// The message type is known but has no implementation here.
    Unsupported,
    /// The message could not be parsed or names an unknown type.
    InvalidRequest,
    /// The connection did not pass the auth gate.
    Unauthorized,
    /// A handler failed unexpectedly.
    Handler,
}

impl ErrorKind {
    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Application => "application",
            Self::Capability => "capability",
            Self::Unsupported => "unsupported",
            Self::InvalidRequest => "invalid-request",
            Self::Unauthorized => "unauthorized",
            Self::Handler => "handler",
        }
    }
}

/// Error surfaced to a UI connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Socket or process failure.
    #[error("{0}")]
    Transport(String),
    /// Malformed input from a backend.
    #[error("{0}")]
    Protocol(String),
    /// Deadline expired.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Method that was waiting.
        method: String,
        /// Deadline that expired.
        timeout_ms: u64,
    },
    /// Backend error object, relayed verbatim.
    #[error("backend returned an error")]
    Application(Value),
    /// Operation unsupported by the active backend.
    #[error("{0}")]
    Capability(String),
    /// Known message type with no implementation in this environment.
    #[error("'{0}' is not available in this environment")]
    Unsupported(String),
    /// Unparseable or unknown message.
    #[error("{0}")]
    InvalidRequest(String),
    /// Rejected by the auth gate.
    #[error("connection is not authorized")]
    Unauthorized,
    /// Handler failed unexpectedly.
    #[error("handler error: {0}")]
    Handler(String),
}

impl BridgeError {
    /// Error kind reported to the view.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Application(_) => ErrorKind::Application,
            Self::Capability(_) => ErrorKind::Capability,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Handler(_) => ErrorKind::Handler,
        }
    }

    /// Shorthand for an invalid-request error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// JSON shape placed under `error` in replies.
    ///
    /// Application errors carry the backend object untouched in `data`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Application(data) => json!({
                "kind": self.kind(),
                "message": data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("backend returned an error"),
                "data": data,
            }),
            other => json!({
                "kind": other.kind(),
                "message": other.to_string(),
            }),
        }
    }
}

impl From<RpcError> for BridgeError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout { method, timeout_ms } => Self::Timeout { method, timeout_ms },
            RpcError::Application(value) => Self::Application(value),
            RpcError::Protocol(message) => Self::Protocol(message),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<BusError> for BridgeError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout { method, timeout_ms } => Self::Timeout { method, timeout_ms },
            BusError::Application(value) => Self::Application(value),
            BusError::Protocol(message) => Self::Protocol(message),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<TerminalError> for BridgeError {
    fn from(err: TerminalError) -> Self {
        match err {
            TerminalError::ResizeUnsupported(_) => Self::Capability(err.to_string()),
            TerminalError::NoBackend | TerminalError::Launch(_) | TerminalError::Io(_) => {
                Self::Transport(err.to_string())
            }
        }
    }
}
