//! Client-side stream dispatcher for reverse tunnels
//!
//! The session layer hands every inbound multiplexed stream to a
//! [`Dispatcher`] together with its [`ControlMessage`]. The dispatcher
//! resolves the local backend and bridges the stream to it through one of
//! three relays: plain HTTP, WebSocket pass-through, or raw TCP.

pub mod config;
pub mod copy;
pub mod dispatcher;
pub mod error;
pub mod http_parser;
pub mod http_proxy;
pub mod observer;
pub mod rewrite;
pub mod tcp_proxy;
pub mod websocket;

pub use config::{ConfigError, RelayConfig, TargetsConfig};
pub use copy::{relay_bidirectional, CopyStats, VirtualConnection};
pub use dispatcher::{
    ConnectionInfo, ConnectionState, Dispatcher, DispatcherBuilder, Outcome, Rejection,
};
pub use error::RelayError;
pub use observer::{DispatchObserver, TracingObserver};

pub use backhaul_proto::{ControlMessage, Protocol, StreamId, Tunnel};
pub use backhaul_router::{MatchedBy, TargetResolver, TcpTargets};
