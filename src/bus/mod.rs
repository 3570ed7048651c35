//! Framed broadcast-bus client.
//!
//! The bus is a local domain socket shared by several desktop processes.
//! Every message is a length-prefixed JSON frame (see [`framing`]):
//!
//! ```text
//! switchboard ──request{requestId}──► bus ──► peer
//!             ◄─response{requestId}── bus ◄── peer
//!             ◄─broadcast──────────── bus ◄── any client
//! ```
//!
//! [`BusClient`] correlates responses by `requestId`, surfaces unsolicited
//! frames as [`BusEvent`]s, and reconnects after a fixed delay when the
//! socket drops.

pub mod client;
pub mod framing;

pub use client::{BusClient, BusConfig};
pub use framing::{encode_frame, FrameDecoder, FrameError};

use serde_json::Value;

/// Failures reported by [`BusClient`].
///
/// `Clone` so the same failure can be handed to every rejected waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// No live socket.
    #[error("bus is not connected")]
    NotConnected,
    /// The socket closed while the request was pending.
    #[error("bus connection closed")]
    ConnectionClosed,
    /// The client was stopped while the request was pending.
    #[error("bus client stopped")]
    Stopped,
    /// Could not reach the bus socket.
    #[error("bus connect failed: {0}")]
    Connect(String),
    /// No response before the deadline.
    #[error("bus request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Method that was waiting.
        method: String,
        /// Deadline that expired.
        timeout_ms: u64,
    },
    /// The peer answered with an error object.
    #[error("bus peer returned an error")]
    Application(Value),
    /// Malformed frame or handshake.
    #[error("bus protocol error: {0}")]
    Protocol(String),
}

impl From<FrameError> for BusError {
    fn from(err: FrameError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Unsolicited traffic and connection changes published by [`BusClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Handshake completed; `client_id` is our identity on the bus.
    Connected {
        /// Identity assigned by the bus.
        client_id: String,
    },
    /// The socket closed. A reconnect may follow.
    Disconnected,
    /// A broadcast from another bus client.
    Broadcast {
        /// Sender identity, when the bus supplied one.
        source_client_id: Option<String>,
        /// Broadcast method.
        method: String,
        /// Broadcast params.
        params: Value,
    },
    /// A peer request addressed to us. Answer with [`BusClient::respond`].
    Request {
        /// Correlation id to echo back.
        request_id: String,
        /// Requesting client.
        source_client_id: Option<String>,
        /// Requested method.
        method: String,
        /// Request params.
        params: Value,
    },
}
