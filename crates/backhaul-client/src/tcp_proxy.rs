//! Raw TCP relay

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::copy::{close, relay_bidirectional, CopyStats, VirtualConnection};
use crate::error::RelayError;

/// Relay `conn` to `address`, the backend configured for `selector`.
///
/// Lookup happens before this is called; a port without a configured backend
/// never reaches the relay.
pub async fn forward<C>(conn: C, selector: &str, address: &str) -> Result<CopyStats, RelayError>
where
    C: VirtualConnection,
{
    info!(selector, backend = address, "Forwarding TCP stream");

    let backend = match TcpStream::connect(address).await {
        Ok(stream) => stream,
        Err(source) => {
            close(conn).await;
            return Err(RelayError::Dial {
                address: address.to_string(),
                source,
            });
        }
    };
    if let Err(e) = backend.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on backend: {}", e);
    }

    relay_bidirectional(conn, backend).await
}
