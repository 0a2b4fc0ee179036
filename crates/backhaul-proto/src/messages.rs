//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Control message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Incomplete control message")]
    Incomplete,

    #[error("Failed to encode control message: {0}")]
    Encode(String),

    #[error("Failed to decode control message: {0}")]
    Decode(String),

    #[error("Invalid tunnel {name}: {reason}")]
    InvalidTunnel { name: String, reason: String },
}

/// Protocol carried by a multiplexed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP/1.x request/response exchange
    Http,
    /// WebSocket upgrade followed by raw frames
    Ws,
    /// Raw TCP bytes
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Ws => "ws",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "ws" => Ok(Protocol::Ws),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(ProtoError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Metadata accompanying every inbound multiplexed stream.
///
/// Built by the session layer when the relay server opens a stream and
/// consumed read-only by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Stream identifier, used as connection identity in logs
    pub stream_id: StreamId,
    /// Declared protocol. `None` lets the dispatcher classify the stream
    /// from the HTTP request head.
    pub protocol: Option<Protocol>,
    /// Forwarding descriptor of the exposed rule: `host:port`, `port` or `host`
    pub forwarded_by: String,
}

impl ControlMessage {
    pub fn new(stream_id: StreamId, protocol: Protocol, forwarded_by: impl Into<String>) -> Self {
        Self {
            stream_id,
            protocol: Some(protocol),
            forwarded_by: forwarded_by.into(),
        }
    }

    /// Control message without a declared protocol
    pub fn undeclared(stream_id: StreamId, forwarded_by: impl Into<String>) -> Self {
        Self {
            stream_id,
            protocol: None,
            forwarded_by: forwarded_by.into(),
        }
    }
}

/// Registration-time description of an exposed tunnel.
///
/// Consumed by the session/registration layer; the dispatcher never reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    #[serde(rename = "proto")]
    pub protocol: Protocol,
    /// Public host name for HTTP and WebSocket tunnels
    #[serde(default)]
    pub host: Option<String>,
    /// Explicit address (remote port for TCP tunnels)
    #[serde(default)]
    pub addr: Option<String>,
    /// Basic auth credential, `user:password`
    #[serde(default)]
    pub auth: Option<String>,
}

impl Tunnel {
    /// Check that the fields required by the protocol are present
    pub fn validate(&self, name: &str) -> Result<(), ProtoError> {
        let invalid = |reason: &str| ProtoError::InvalidTunnel {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        match self.protocol {
            Protocol::Http | Protocol::Ws => {
                if self.host.as_deref().map_or(true, str::is_empty) {
                    return Err(invalid("host is required"));
                }
            }
            Protocol::Tcp => {
                if self.addr.as_deref().map_or(true, str::is_empty) {
                    return Err(invalid("addr is required"));
                }
                if self.host.is_some() {
                    return Err(invalid("host is not supported for tcp tunnels"));
                }
            }
        }

        if let Some(auth) = &self.auth {
            if !auth.contains(':') {
                return Err(invalid("auth must be in user:password form"));
            }
        }

        Ok(())
    }
}
