//! switchboard - local bridge and dispatch core.
//!
//! This crate multiplexes UI connections onto the backends a desktop
//! workspace needs: an assistant subprocess, a shared IPC bus, interactive
//! terminals and an offloaded version-control worker.
//!
//! # Architecture
//!
//! The crate follows a single-owner event loop pattern:
//!
//! - **Router** - owns every registry, dispatches envelopes, folds events
//! - **RpcClient** - JSON-RPC 2.0 over an assistant's stdio
//! - **BusClient** - length-prefixed JSON frames over a Unix socket
//! - **TerminalManager** - shell sessions over three backend families
//! - **WorkerBridge** - request/response relay to a worker process
//! - **UiSocketServer** - the front door UI processes connect to
//!
//! # Modules
//!
//! - [`router`] - dispatcher and its local state
//! - [`rpc`] - subprocess RPC client
//! - [`bus`] - framed bus client
//! - [`terminal`] - terminal session manager
//! - [`worker`] - worker bridge and the built-in git worker
//! - [`config`] - configuration loading

// Library modules
pub mod bus;
pub mod router;
pub mod rpc;
pub mod terminal;
pub mod ui_socket;
pub mod worker;

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;

// Re-export commonly used types
pub use config::Config;
pub use connection::{AllowAll, AuthGate, Connection, ConnectionId};
pub use error::{BridgeError, ErrorKind};
pub use router::{Collaborators, Router, RouterEvent, RouterOptions};
