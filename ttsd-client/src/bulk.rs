//! Bulk/file channel client side: a persistent connection the daemon uses to
//! stream `BulkEvent`s and to probe liveness with a `hello`/`hello_ack`
//! round-trip.
//!
//! Mirrors `ttsd-daemon/src/server.rs`'s `serve_bulk_connection`: the first
//! frame sent is the client's own pid (so the daemon can route events and
//! probes to it), then the connection is read in a loop for the rest of its
//! life.

use std::sync::Arc;

use tokio::net::UnixStream;
use tracing::warn;

use ttsd_core::protocol::{BulkFrame, Mode};
use ttsd_core::transport::{read_framed, write_framed};

use crate::handle::ClientHandle;

/// Connects to the mode's bulk socket, registers `pid`, and spawns a task
/// that feeds incoming events to `handle` (via `ClientHandle::apply_remote_event`,
/// which updates local state and fires callbacks under the same
/// reentrancy guard as the handle's own synchronous methods) and answers
/// liveness probes for as long as the connection stays open.
pub async fn spawn_bulk_listener(
    mode: Mode,
    pid: u32,
    handle: Arc<ClientHandle>,
) -> std::io::Result<()> {
    let root = ttsd_core::default_socket_root();
    let path = ttsd_core::bulk_socket_path(&root, mode);
    let mut stream = UnixStream::connect(&path).await?;
    write_framed(&mut stream, &pid).await?;

    tokio::spawn(async move {
        loop {
            match read_framed::<_, BulkFrame>(&mut stream).await {
                Ok(Some(BulkFrame::Hello)) => {
                    if write_framed(&mut stream, &BulkFrame::HelloAck).await.is_err() {
                        break;
                    }
                }
                Ok(Some(BulkFrame::Event(event))) => {
                    handle.apply_remote_event(event);
                }
                Ok(Some(BulkFrame::HelloAck)) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!("bulk channel read failed: {e}");
                    break;
                }
            }
        }
    });

    Ok(())
}
