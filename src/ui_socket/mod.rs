//! Local front door for UI processes.
//!
//! # Architecture
//!
//! ```text
//! UI process                           switchboard
//! ┌──────────────┐                    ┌──────────────────────┐
//! │ UnixStream   │◄──────────────────►│ UiSocketServer       │
//! │              │  frames over       │  UnixListener        │
//! │              │  Unix socket       │  read/write tasks    │
//! └──────────────┘                    │  per connection      │
//!                                     └──────────┬───────────┘
//!                                                │ RouterEvent
//!                                                ▼
//!                                          Router event loop
//! ```
//!
//! # Wire protocol
//!
//! The same length-prefixed JSON framing the bus uses
//! (`[u32 LE length][JSON envelope]`, see [`crate::bus::framing`]). Each
//! frame is one upstream envelope.

pub mod client_conn;
pub mod server;

pub use server::UiSocketServer;
