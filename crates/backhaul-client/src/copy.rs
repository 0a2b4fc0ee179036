//! Shared byte-copy and close utilities
//!
//! Bidirectional relays run each direction as its own task. When one
//! direction hits end-of-stream it shuts down the write side of the opposite
//! end (half-close) and the other direction keeps draining until it finishes
//! too. An error in either direction tears the whole relay down.

use crate::error::RelayError;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;
use tracing::debug;

/// One multiplexed logical connection as seen by the relays.
///
/// Implemented for every owned, sendable duplex byte stream.
pub trait VirtualConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> VirtualConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Bytes moved by a relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Remote peer -> local backend
    pub to_backend: u64,
    /// Local backend -> remote peer
    pub to_remote: u64,
}

/// Copy bytes both ways between `conn` and `backend` until both directions
/// have finished, then release both ends.
///
/// If either direction fails the other copy task is aborted, so neither end
/// outlives the relay.
pub async fn relay_bidirectional<C, B>(conn: C, backend: B) -> Result<CopyStats, RelayError>
where
    C: VirtualConnection,
    B: VirtualConnection,
{
    let (mut conn_read, mut conn_write) = tokio::io::split(conn);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let mut to_backend = tokio::spawn(async move {
        let result = tokio::io::copy(&mut conn_read, &mut backend_write).await;
        if result.is_ok() {
            let _ = backend_write.shutdown().await;
        }
        result
    });

    let mut to_remote = tokio::spawn(async move {
        let result = tokio::io::copy(&mut backend_read, &mut conn_write).await;
        if result.is_ok() {
            let _ = conn_write.shutdown().await;
        }
        result
    });

    let mut sent = None;
    let mut received = None;

    while sent.is_none() || received.is_none() {
        let (result, other) = tokio::select! {
            result = &mut to_backend, if sent.is_none() => {
                (copy_result(result, "remote -> backend").map(|n| sent = Some(n)), &mut to_remote)
            }
            result = &mut to_remote, if received.is_none() => {
                (copy_result(result, "backend -> remote").map(|n| received = Some(n)), &mut to_backend)
            }
        };

        if let Err(e) = result {
            other.abort();
            // Wait for the aborted task so its halves are dropped before returning
            let _ = other.await;
            return Err(e);
        }
    }

    let (to_backend, to_remote) = (sent.unwrap_or_default(), received.unwrap_or_default());
    debug!(to_backend, to_remote, "Bidirectional copy finished");
    Ok(CopyStats {
        to_backend,
        to_remote,
    })
}

fn copy_result(
    result: Result<io::Result<u64>, JoinError>,
    direction: &str,
) -> Result<u64, RelayError> {
    match result {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => {
            debug!("Copy {} ended with error: {}", direction, e);
            Err(RelayError::Stream(e))
        }
        Err(e) => Err(RelayError::Stream(io::Error::new(
            io::ErrorKind::Other,
            format!("copy task {} failed: {}", direction, e),
        ))),
    }
}

/// Shut down the write side and release the stream
pub async fn close<C>(mut conn: C)
where
    C: AsyncWrite + Unpin,
{
    if let Err(e) = conn.shutdown().await {
        debug!("Error while closing stream: {}", e);
    }
}
