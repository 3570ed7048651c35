//! UI-side connection identity and the seams the router talks through.
//!
//! - `ConnectionId`: unique per accepted connection, never reused
//! - `Connection`: duplex channel handed to the router by a front door
//! - `AuthGate`: decides whether a connection may register
//!
//! [`ChannelConnection`] is the stock implementation: outbound envelopes go
//! into an unbounded queue drained by whoever owns the transport.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Unique identifier for a UI connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next process-wide id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One UI-side duplex channel.
///
/// Inbound traffic reaches the router as events; this trait covers the
/// outbound half.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Stable identifier.
    fn id(&self) -> ConnectionId;

    /// Queue one serialized envelope. Returns `false` once the peer is gone.
    fn send(&self, payload: Vec<u8>) -> bool;

    /// Close the transport. Default: nothing to close.
    fn close(&self) {}
}

/// Decides whether a connection may register with the router.
pub trait AuthGate: Send + Sync + fmt::Debug {
    /// `true` admits the connection.
    fn is_authorized(&self, connection: &dyn Connection) -> bool;
}

/// Admits every connection. Token checks live in front of the socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthGate for AllowAll {
    fn is_authorized(&self, _connection: &dyn Connection) -> bool {
        true
    }
}

/// Connection backed by an unbounded channel of serialized envelopes.
#[derive(Debug)]
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

impl ChannelConnection {
    /// Create a connection and the receiver its transport drains.
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Token cancelled by [`Connection::close`].
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, payload: Vec<u8>) -> bool {
        !self.closed.is_cancelled() && self.tx.send(payload).is_ok()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
