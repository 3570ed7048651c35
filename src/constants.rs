//! Application-wide constants for switchboard.
//!
//! This module centralizes timeouts, size ceilings and channel capacities
//! so they are discoverable in one place. Constants are grouped by the
//! transport they govern.
//!
//! # Categories
//!
//! - **Assistant**: subprocess RPC timeouts
//! - **Bus**: framed socket limits and reconnect policy
//! - **Terminal**: session defaults and scrollback
//! - **Router**: persistence debounce and event fan-out

use std::time::Duration;

// ============================================================================
// Assistant subprocess (RPC)
// ============================================================================

/// Default deadline for a correlated assistant request.
///
/// Individual requests may override this (`timeoutMs` on `fetch`).
pub const ASSISTANT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the `initialize` handshake after spawning the assistant.
pub const ASSISTANT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(15);

// ============================================================================
// Broadcast bus
// ============================================================================

/// Maximum payload size of a single bus frame (16 MB).
///
/// Same cap the hub socket protocol has always used. A prefix declaring more
/// than this is rejected before any payload byte is buffered.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum bytes held by a frame decoder without completing a frame (32 MB).
pub const MAX_BUFFERED_BYTES: usize = 32 * 1024 * 1024;

/// Default deadline for a correlated bus request.
pub const BUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed delay before the single reconnect attempt after a bus disconnect.
pub const BUS_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Socket read buffer size shared by the bus client and the UI socket.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Terminals
// ============================================================================

/// Default terminal width when the view does not send one.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height when the view does not send one.
pub const DEFAULT_ROWS: u16 = 24;

/// Bytes of recent output kept per session for replay on attach.
pub const TERMINAL_SCROLLBACK_BYTES: usize = 256 * 1024;

/// How long `pty-bridge` waits for trailing PTY output after the child exits.
///
/// A grandchild that inherited the PTY can keep the reader blocked forever;
/// past this window the reader thread is abandoned.
pub const PTY_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Router
// ============================================================================

/// Debounce window for flushing persisted atoms to the store.
pub const PERSIST_DEBOUNCE: Duration = Duration::from_millis(250);

/// Capacity of the broadcast channels leaf clients publish events on.
///
/// Slow subscribers that fall further behind than this miss events and are
/// told via `RecvError::Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Identifier of the version-control worker in `worker-message` envelopes.
pub const GIT_WORKER_ID: &str = "git";
