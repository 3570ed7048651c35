//! Unix domain socket server for UI connections.
//!
//! Listens on a Unix socket and wires each accepted stream to the router
//! (see [`super::client_conn`]). Each connection is announced as
//! `RouterEvent::ClientConnected`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::client_conn;
use crate::router::RouterEvent;

/// sun_path is 104 bytes on macOS and 108 on Linux; use the smaller.
const MAX_SOCKET_PATH: usize = 104;

/// Unix domain socket server feeding the router.
#[derive(Debug)]
pub struct UiSocketServer {
    socket_path: PathBuf,
    accept_handle: JoinHandle<()>,
}

impl UiSocketServer {
    /// Start listening at `socket_path`.
    ///
    /// Removes any stale socket file, binds the listener, sets permissions
    /// to 0600, and spawns the accept loop.
    pub fn start(socket_path: PathBuf, router_tx: UnboundedSender<RouterEvent>) -> Result<Self> {
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "Socket path too long ({path_len} bytes, max {}): {}\n\
                 Consider setting SWITCHBOARD_UI_SOCKET to a shorter path.",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove stale socket: {}", socket_path.display()))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;
        log::info!("[Socket] Listening on {}", socket_path.display());

        let accept_handle = tokio::spawn(accept_loop(listener, router_tx, socket_path.clone()));
        Ok(Self {
            socket_path,
            accept_handle,
        })
    }

    /// Stop accepting and remove the socket file.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("[Socket] Could not remove {}: {e}", self.socket_path.display());
            }
        }
    }

    /// Path to the socket file.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn accept_loop(
    listener: UnixListener,
    router_tx: UnboundedSender<RouterEvent>,
    socket_path: PathBuf,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                if !client_conn::attach(stream, &router_tx) {
                    log::warn!("[Socket] Router channel closed, stopping accept loop");
                    break;
                }
            }
            Err(e) => {
                if !socket_path.exists() {
                    log::info!("[Socket] Socket file removed, stopping accept loop");
                    break;
                }
                log::error!("[Socket] Accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
