//! Per-stream dispatch
//!
//! Every inbound multiplexed stream goes through the same state machine:
//!
//! ```text
//! Created -> Resolving -> Forwarding -> Closed
//!                     \-> Rejected   -> Closed
//! ```
//!
//! Resolving picks the relay from the declared protocol (or classifies the
//! request head when none is declared) and resolves the backend. Forwarding
//! hands the stream to exactly one relay, which closes it when done.

use std::sync::Arc;

use backhaul_proto::{ControlMessage, Protocol, ProtoError, StreamId, MAX_CONTROL_MESSAGE_SIZE};
use backhaul_router::{TargetResolver, TcpTargets};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};
use url::Url;

use crate::copy::{close, CopyStats, VirtualConnection};
use crate::error::RelayError;
use crate::http_parser::{read_request, InboundRequest};
use crate::http_proxy::BAD_GATEWAY;
use crate::observer::{DispatchObserver, TracingObserver};
use crate::{http_proxy, tcp_proxy, websocket};

/// Lifecycle of one dispatched stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Created,
    Resolving,
    Forwarding,
    Rejected,
    Closed,
}

/// Identity of a dispatched stream, as reported to observers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub stream_id: StreamId,
    pub forwarded_by: String,
    pub declared: Option<Protocol>,
}

impl From<&ControlMessage> for ConnectionInfo {
    fn from(msg: &ControlMessage) -> Self {
        Self {
            stream_id: msg.stream_id,
            forwarded_by: msg.forwarded_by.clone(),
            declared: msg.protocol,
        }
    }
}

/// Why a stream was refused before reaching a relay
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("no {protocol} target for {descriptor:?}")]
    NoTarget {
        protocol: Protocol,
        descriptor: String,
    },

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("no relay configured for {0}")]
    UnsupportedProtocol(Protocol),
}

impl Rejection {
    /// HTTP and WebSocket peers are told the backend is unavailable
    fn answers_bad_gateway(&self) -> bool {
        matches!(
            self,
            Rejection::NoTarget {
                protocol: Protocol::Http | Protocol::Ws,
                ..
            }
        )
    }
}

/// Final result of handling one stream
#[derive(Debug)]
pub enum Outcome {
    Completed {
        protocol: Protocol,
        stats: CopyStats,
    },
    Rejected(Rejection),
    Failed {
        protocol: Option<Protocol>,
        error: RelayError,
    },
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}

/// Relay chosen for a stream, with everything it needs
enum Route<'a> {
    Http {
        request: InboundRequest,
        target: &'a Url,
    },
    Ws {
        request: InboundRequest,
        target: &'a Url,
    },
    Tcp {
        selector: String,
        address: &'a str,
    },
}

/// Resolution stopped before any relay was involved
enum Halt {
    Rejected(Rejection),
    Failed {
        protocol: Option<Protocol>,
        error: RelayError,
    },
}

struct Inner {
    http: Option<TargetResolver>,
    ws: Option<TargetResolver>,
    tcp: Option<TcpTargets>,
    observer: Arc<dyn DispatchObserver>,
}

/// Entry point for inbound multiplexed streams.
///
/// Cheap to clone; all clones share the same immutable target tables.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

#[derive(Default)]
pub struct DispatcherBuilder {
    http: Option<TargetResolver>,
    ws: Option<TargetResolver>,
    tcp: Option<TcpTargets>,
    observer: Option<Arc<dyn DispatchObserver>>,
}

impl DispatcherBuilder {
    pub fn http(mut self, resolver: TargetResolver) -> Self {
        self.http = Some(resolver);
        self
    }

    pub fn ws(mut self, resolver: TargetResolver) -> Self {
        self.ws = Some(resolver);
        self
    }

    pub fn tcp(mut self, targets: TcpTargets) -> Self {
        self.tcp = Some(targets);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                http: self.http,
                ws: self.ws,
                tcp: self.tcp,
                observer: self
                    .observer
                    .unwrap_or_else(|| Arc::new(TracingObserver)),
            }),
        }
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn http_resolver(&self) -> Option<&TargetResolver> {
        self.inner.http.as_ref()
    }

    pub fn ws_resolver(&self) -> Option<&TargetResolver> {
        self.inner.ws.as_ref()
    }

    pub fn tcp_targets(&self) -> Option<&TcpTargets> {
        self.inner.tcp.as_ref()
    }

    /// Handle `conn` on its own task and return immediately
    pub fn dispatch<C>(&self, conn: C, msg: ControlMessage) -> JoinHandle<Outcome>
    where
        C: VirtualConnection,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.handle(conn, &msg).await })
    }

    /// Handle `conn` to completion on the current task
    pub async fn handle<C>(&self, conn: C, msg: &ControlMessage) -> Outcome
    where
        C: VirtualConnection,
    {
        let info = ConnectionInfo::from(msg);
        let span = info_span!("stream", id = msg.stream_id, by = %msg.forwarded_by);
        let outcome = self.run(conn, msg, &info).instrument(span).await;
        self.inner.observer.on_outcome(&info, &outcome);
        outcome
    }

    /// Read a length-prefixed [`ControlMessage`] off `conn`, then handle the
    /// rest of the stream according to it
    pub async fn serve_framed<C>(&self, mut conn: C) -> Outcome
    where
        C: VirtualConnection,
    {
        match read_preamble(&mut conn).await {
            Ok(msg) => self.handle(conn, &msg).await,
            Err(error) => {
                close(conn).await;
                let outcome = match error {
                    RelayError::Parse(reason) => Outcome::Rejected(Rejection::Malformed(reason)),
                    error => Outcome::Failed {
                        protocol: None,
                        error,
                    },
                };
                self.inner
                    .observer
                    .on_outcome(&ConnectionInfo::default(), &outcome);
                outcome
            }
        }
    }

    fn transition(&self, info: &ConnectionInfo, from: ConnectionState, to: ConnectionState) {
        self.inner.observer.on_transition(info, from, to);
    }

    async fn run<C>(&self, mut conn: C, msg: &ControlMessage, info: &ConnectionInfo) -> Outcome
    where
        C: VirtualConnection,
    {
        self.transition(info, ConnectionState::Created, ConnectionState::Resolving);

        let route = match self.route(&mut conn, msg).await {
            Ok(route) => route,
            Err(Halt::Rejected(rejection)) => {
                self.transition(info, ConnectionState::Resolving, ConnectionState::Rejected);
                if rejection.answers_bad_gateway() {
                    if let Err(e) = conn.write_all(BAD_GATEWAY).await {
                        debug!("Failed to send 502 to remote peer: {}", e);
                    }
                }
                close(conn).await;
                self.transition(info, ConnectionState::Rejected, ConnectionState::Closed);
                return Outcome::Rejected(rejection);
            }
            Err(Halt::Failed { protocol, error }) => {
                close(conn).await;
                self.transition(info, ConnectionState::Resolving, ConnectionState::Closed);
                return Outcome::Failed { protocol, error };
            }
        };

        self.transition(info, ConnectionState::Resolving, ConnectionState::Forwarding);
        let (protocol, result) = match route {
            Route::Http { request, target } => (
                Protocol::Http,
                http_proxy::forward(conn, request, Some(target)).await,
            ),
            Route::Ws { request, target } => (
                Protocol::Ws,
                websocket::forward(conn, request, Some(target)).await,
            ),
            Route::Tcp { selector, address } => (
                Protocol::Tcp,
                tcp_proxy::forward(conn, &selector, address).await,
            ),
        };
        self.transition(info, ConnectionState::Forwarding, ConnectionState::Closed);

        match result {
            Ok(stats) => Outcome::Completed { protocol, stats },
            Err(error) => Outcome::Failed {
                protocol: Some(protocol),
                error,
            },
        }
    }

    async fn route<'a, C>(&'a self, conn: &mut C, msg: &ControlMessage) -> Result<Route<'a>, Halt>
    where
        C: AsyncRead + Unpin,
    {
        let declared = msg.protocol;

        if declared == Some(Protocol::Tcp) {
            let targets = self
                .inner
                .tcp
                .as_ref()
                .ok_or(Halt::Rejected(Rejection::UnsupportedProtocol(Protocol::Tcp)))?;
            let selector = TcpTargets::selector_for(&msg.forwarded_by);
            let address = targets.lookup(selector).ok_or_else(|| {
                Halt::Rejected(Rejection::NoTarget {
                    protocol: Protocol::Tcp,
                    descriptor: msg.forwarded_by.clone(),
                })
            })?;
            return Ok(Route::Tcp {
                selector: selector.to_string(),
                address,
            });
        }

        if let Some(protocol) = declared {
            if self.resolver(protocol).is_none() {
                return Err(Halt::Rejected(Rejection::UnsupportedProtocol(protocol)));
            }
        }

        let request = read_request(conn).await.map_err(|error| match error {
            RelayError::Parse(reason) => Halt::Rejected(Rejection::Malformed(reason)),
            error => Halt::Failed {
                protocol: declared,
                error,
            },
        })?;

        let protocol = declared.unwrap_or(if request.head.is_websocket_upgrade() {
            Protocol::Ws
        } else {
            Protocol::Http
        });

        let resolver = self
            .resolver(protocol)
            .ok_or(Halt::Rejected(Rejection::UnsupportedProtocol(protocol)))?;
        let resolution = resolver.resolve(&msg.forwarded_by).ok_or_else(|| {
            Halt::Rejected(Rejection::NoTarget {
                protocol,
                descriptor: msg.forwarded_by.clone(),
            })
        })?;

        debug!(
            %protocol,
            target = %resolution.target,
            matched_by = ?resolution.matched_by,
            "Resolved backend"
        );

        let target = resolution.target;
        Ok(if protocol == Protocol::Ws {
            Route::Ws { request, target }
        } else {
            Route::Http { request, target }
        })
    }

    fn resolver(&self, protocol: Protocol) -> Option<&TargetResolver> {
        match protocol {
            Protocol::Http => self.inner.http.as_ref(),
            Protocol::Ws => self.inner.ws.as_ref(),
            Protocol::Tcp => None,
        }
    }
}

/// Read `[u32 length][bincode ControlMessage]` from the start of a stream
async fn read_preamble<R>(reader: &mut R) -> Result<ControlMessage, RelayError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_CONTROL_MESSAGE_SIZE {
        return Err(RelayError::parse(
            ProtoError::MessageTooLarge(len).to_string(),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    ControlMessage::decode(&payload).map_err(|e| RelayError::parse(e.to_string()))
}
