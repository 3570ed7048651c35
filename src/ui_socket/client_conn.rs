//! Per-connection I/O tasks for socket clients.
//!
//! The router talks to a [`ChannelConnection`]; these tasks move its queue
//! onto the socket and turn inbound frames into [`RouterEvent`]s.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::bus::framing::{encode_payload, FrameDecoder};
use crate::connection::{ChannelConnection, ConnectionId};
use crate::constants::READ_BUFFER_SIZE;
use crate::router::RouterEvent;

/// Wire an accepted stream to the router.
///
/// Returns `false` if the router channel is already closed.
pub(crate) fn attach(stream: UnixStream, router_tx: &UnboundedSender<RouterEvent>) -> bool {
    let id = ConnectionId::next();
    let (connection, outbound) = ChannelConnection::new(id);
    let closed = connection.closed_token();
    let (reader, writer) = stream.into_split();

    // Announce before reading so no envelope can overtake registration.
    if router_tx
        .send(RouterEvent::ClientConnected(Arc::new(connection)))
        .is_err()
    {
        return false;
    }
    log::info!("[Socket] Client connected: {id}");

    tokio::spawn(write_loop(id, writer, outbound, closed.clone()));
    tokio::spawn(read_loop(id, reader, router_tx.clone(), closed));
    true
}

/// Read loop: decodes frames and posts envelopes.
async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    router_tx: UnboundedSender<RouterEvent>,
    closed: CancellationToken,
) {
    // Every exit reports the disconnect exactly once, including a close
    // started by a failed write. The router ignores ids it no longer holds.
    let _disconnect = scopeguard::guard(
        (router_tx.clone(), closed.clone()),
        move |(router_tx, closed)| {
            closed.cancel();
            let _ = router_tx.send(RouterEvent::ClientDisconnected(id));
        },
    );

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            () = closed.cancelled() => {
                log::debug!("[Socket] {id} closed");
                return;
            }
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                log::info!("[Socket] Client disconnected: {id}");
                break;
            }
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        let event = RouterEvent::Envelope {
                            connection: id,
                            envelope,
                        };
                        if router_tx.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    log::error!("[Socket] Frame decode error for {id}: {e}");
                    break;
                }
            },
            Err(e) => {
                log::error!("[Socket] Read error for {id}: {e}");
                break;
            }
        }
    }
}

/// Write loop: frames queued envelopes onto the socket.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            () = closed.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let frame = match encode_payload(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("[Socket] Dropping envelope for {id}: {e}");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            log::error!("[Socket] Write error for {id}: {e}");
            closed.cancel();
            break;
        }
    }

    // Flush what the router queued before closing (e.g. a final bridge-error).
    while let Ok(payload) = outbound.try_recv() {
        match encode_payload(&payload) {
            Ok(frame) => {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            Err(e) => log::error!("[Socket] Dropping envelope for {id}: {e}"),
        }
    }
    let _ = writer.shutdown().await;
}
