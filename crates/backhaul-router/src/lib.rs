//! Target resolution for inbound tunnel streams
//!
//! Maps the forwarding descriptor carried by each stream (`host:port`, `port`
//! or `host`) to a local backend. HTTP and WebSocket streams resolve through a
//! [`TargetResolver`] with host/port/host precedence and a default fallback;
//! TCP streams use an exact-match [`TcpTargets`] table.
//!
//! Tables are built once and never mutated, so lookups need no locking.

pub mod resolver;
pub mod tcp;

pub use resolver::{resolve, Resolution, TargetResolver};
pub use tcp::TcpTargets;

use thiserror::Error;

/// Router errors
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid target for {selector:?}: {reason}")]
    InvalidTarget { selector: String, reason: String },

    #[error("Invalid backend address for {selector:?}: {address}")]
    InvalidAddress { selector: String, address: String },

    #[error("No targets configured")]
    Empty,
}

/// Which precedence step produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchedBy {
    /// Full descriptor matched a table key
    HostPort,
    /// Port substring matched a table key
    Port,
    /// Host substring matched a table key
    Host,
    /// Fell back to the default target
    Default,
}

/// Split `host:port` or `[v6-host]:port` into its parts.
///
/// Returns `None` for descriptors without a port separator or with an
/// unbracketed IPv6 literal, mirroring the usual `SplitHostPort` rules.
pub fn split_host_port(descriptor: &str) -> Option<(&str, &str)> {
    if let Some(rest) = descriptor.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port = rest[end + 1..].strip_prefix(':')?;
        if port.contains(':') {
            return None;
        }
        return Some((host, port));
    }

    let idx = descriptor.rfind(':')?;
    let (host, port) = (&descriptor[..idx], &descriptor[idx + 1..]);
    if host.contains(':') || host.contains('[') || host.contains(']') {
        return None;
    }
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.com:80"), Some(("a.com", "80")));
        assert_eq!(split_host_port(":8080"), Some(("", "8080")));
        assert_eq!(split_host_port("[::1]:443"), Some(("::1", "443")));
        assert_eq!(split_host_port("a.com:"), Some(("a.com", "")));
    }

    #[test]
    fn test_split_host_port_malformed() {
        assert_eq!(split_host_port("a.com"), None);
        assert_eq!(split_host_port("8080"), None);
        assert_eq!(split_host_port("::1:80"), None);
        assert_eq!(split_host_port("[::1]"), None);
        assert_eq!(split_host_port("[::1]:80:90"), None);
    }
}
