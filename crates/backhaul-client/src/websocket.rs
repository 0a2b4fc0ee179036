//! WebSocket relay
//!
//! Performs the upgrade handshake against the backend over a raw TCP
//! connection, then copies bytes both ways without looking at frames.

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::copy::{close, relay_bidirectional, CopyStats, VirtualConnection};
use crate::error::RelayError;
use crate::http_parser::{read_response, InboundRequest};
use crate::http_proxy::{is_backend_failure, BAD_GATEWAY};
use crate::rewrite::rewrite_request;

/// Backend side of a completed upgrade
struct Upgraded {
    stream: TcpStream,
    /// Raw `101` response head
    head: Bytes,
    /// Bytes the backend sent right after the head
    leftover: BytesMut,
}

/// Relay one WebSocket session to `target`.
///
/// Consumes and closes `conn`. Nothing from the backend reaches the remote
/// peer unless the backend answered `101 Switching Protocols`.
pub async fn forward<C>(
    mut conn: C,
    request: InboundRequest,
    target: Option<&Url>,
) -> Result<CopyStats, RelayError>
where
    C: VirtualConnection,
{
    let upgraded = match upgrade(request, target).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!("WebSocket handshake failed: {}", e);
            if is_backend_failure(&e) {
                if let Err(write_err) = conn.write_all(BAD_GATEWAY).await {
                    debug!("Failed to send 502 to remote peer: {}", write_err);
                }
            }
            close(conn).await;
            return Err(e);
        }
    };

    let Upgraded {
        stream,
        head,
        leftover,
    } = upgraded;

    let forwarded = async {
        conn.write_all(&head).await?;
        if !leftover.is_empty() {
            conn.write_all(&leftover).await?;
        }
        conn.flush().await
    };
    if let Err(e) = forwarded.await {
        close(stream).await;
        close(conn).await;
        return Err(RelayError::Stream(e));
    }

    let mut stats = relay_bidirectional(conn, stream).await?;
    stats.to_remote += (head.len() + leftover.len()) as u64;
    Ok(stats)
}

async fn upgrade(request: InboundRequest, target: Option<&Url>) -> Result<Upgraded, RelayError> {
    let target = target.ok_or_else(|| RelayError::NoTarget(request.head.target.clone()))?;
    let rewritten = rewrite_request(&request.head, target)?;
    let address = rewritten.address;

    info!(uri = %rewritten.head.target, backend = %address, "Upgrading WebSocket");

    let mut stream = TcpStream::connect(&address)
        .await
        .map_err(|source| RelayError::Dial {
            address: address.clone(),
            source,
        })?;

    let handshake_failed = |reason: String| RelayError::Handshake {
        address: address.clone(),
        reason,
    };

    let sent = async {
        stream.write_all(&rewritten.head.encode()).await?;
        if !request.buffered.is_empty() {
            stream.write_all(&request.buffered).await?;
        }
        stream.flush().await
    };
    sent.await
        .map_err(|e| handshake_failed(format!("failed to send upgrade request: {}", e)))?;

    let (response, head, leftover) = read_response(&mut stream)
        .await
        .map_err(|e| handshake_failed(e.to_string()))?;

    if response.status != 101 {
        return Err(handshake_failed(format!(
            "backend answered {} {}",
            response.status, response.reason
        )));
    }

    debug!(leftover = leftover.len(), "WebSocket upgrade accepted");
    Ok(Upgraded {
        stream,
        head,
        leftover,
    })
}
