//! HTTP relay: one request/response exchange per stream
//!
//! The request head arrives already parsed. The head is rewritten for the
//! resolved backend and the request goes out over a fresh hyper HTTP/1.1
//! connection, with the body streamed off the stream as the backend takes it.
//! The response head is written back as received and the body is streamed
//! frame by frame, re-chunked when the backend used chunked encoding.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame};
use hyper::client::conn::http1;
use hyper::ext::ReasonPhrase;
use hyper::header::{CONNECTION, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};
use url::Url;

use crate::copy::{close, CopyStats, VirtualConnection};
use crate::error::RelayError;
use crate::http_parser::{header_contains, BodyReader, InboundRequest};
use crate::rewrite::{rewrite_request, RewrittenRequest};

/// Sent to the remote peer when no backend could serve the request
pub(crate) const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 12\r\n\
Connection: close\r\n\
\r\n\
Bad Gateway\n";

/// Request headers that only apply to the inbound hop
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request body as handed to hyper
type OutboundBody = UnsyncBoxBody<Bytes, io::Error>;

/// Shared between the streamed request body and the exchange driving it
#[derive(Default)]
struct BodyProgress {
    sent: AtomicU64,
    failure: Mutex<Option<RelayError>>,
}

impl BodyProgress {
    fn fail(&self, error: RelayError) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(error);
        }
    }

    fn take_failure(&self) -> Option<RelayError> {
        self.failure.lock().ok().and_then(|mut failure| failure.take())
    }
}

/// Forward one HTTP request to `target` and stream the response back.
///
/// Consumes and closes `conn` whatever happens. Malformed input closes the
/// stream silently; a missing target or an unreachable backend answers
/// `502 Bad Gateway` first.
pub async fn forward<C>(
    conn: C,
    request: InboundRequest,
    target: Option<&Url>,
) -> Result<CopyStats, RelayError>
where
    C: VirtualConnection,
{
    let (reader, mut writer) = tokio::io::split(conn);
    let mut responded = false;
    let result = exchange(reader, &mut writer, request, target, &mut responded).await;

    if let Err(e) = &result {
        if !responded && is_backend_failure(e) {
            if let Err(write_err) = writer.write_all(BAD_GATEWAY).await {
                debug!("Failed to send 502 to remote peer: {}", write_err);
            }
        }
    }

    close(writer).await;
    result
}

pub(crate) fn is_backend_failure(error: &RelayError) -> bool {
    matches!(
        error,
        RelayError::NoTarget(_)
            | RelayError::Dial { .. }
            | RelayError::Handshake { .. }
            | RelayError::Http(_)
    )
}

async fn exchange<C>(
    reader: ReadHalf<C>,
    writer: &mut WriteHalf<C>,
    request: InboundRequest,
    target: Option<&Url>,
    responded: &mut bool,
) -> Result<CopyStats, RelayError>
where
    C: VirtualConnection,
{
    let target = target.ok_or_else(|| RelayError::NoTarget(request.head.target.clone()))?;

    let (head, body) = BodyReader::new(request, reader)?;
    let rewritten = rewrite_request(&head, target)?;
    let progress = Arc::new(BodyProgress::default());
    let outbound = build_request(&rewritten, stream_body(body, progress.clone()))?;
    let method = outbound.method().clone();

    info!(
        method = %method,
        uri = %outbound.uri(),
        backend = %rewritten.address,
        "Forwarding HTTP request"
    );

    let stream = TcpStream::connect(&rewritten.address)
        .await
        .map_err(|source| RelayError::Dial {
            address: rewritten.address.clone(),
            source,
        })?;

    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Backend connection closed: {}", e);
        }
    });

    let response = match sender.send_request(outbound).await {
        Ok(response) => response,
        // A request body that broke off is the remote side's failure
        Err(e) => return Err(progress.take_failure().unwrap_or(RelayError::Http(e))),
    };
    let status = response.status().as_u16();
    *responded = true;

    let to_remote = write_response(writer, &method, response).await?;
    debug!(status, to_remote, "HTTP response relayed");

    Ok(CopyStats {
        to_backend: progress.sent.load(Ordering::Relaxed),
        to_remote,
    })
}

/// Stream the request body to hyper as the backend connection pulls it
fn stream_body<R>(body: BodyReader<R>, progress: Arc<BodyProgress>) -> OutboundBody
where
    R: AsyncRead + Unpin + Send + 'static,
{
    if body.is_done() {
        return Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync();
    }

    let frames = futures_util::stream::unfold(Some(body), move |state| {
        let progress = progress.clone();
        async move {
            let Some(mut body) = state else {
                return None;
            };
            match body.next_chunk().await {
                Ok(Some(data)) => {
                    progress.sent.fetch_add(data.len() as u64, Ordering::Relaxed);
                    Some((Ok(Frame::data(data)), Some(body)))
                }
                Ok(None) => None,
                Err(e) => {
                    debug!("Request body broke off: {}", e);
                    progress.fail(e);
                    let aborted = io::Error::new(io::ErrorKind::Other, "request body aborted");
                    Some((Err(aborted), None))
                }
            }
        }
    });

    StreamBody::new(frames).boxed_unsync()
}

/// Build the outbound hyper request from a rewritten head
fn build_request<B>(rewritten: &RewrittenRequest, body: B) -> Result<Request<B>, RelayError> {
    let head = &rewritten.head;
    let method = Method::from_bytes(head.method.as_bytes())
        .map_err(|e| RelayError::parse(format!("invalid method {:?}: {}", head.method, e)))?;

    let mut builder = Request::builder()
        .method(method)
        .uri(head.target.as_str())
        .version(Version::HTTP_11);

    for (name, value) in &head.headers {
        if is_hop_by_hop(name) || header_contains(&head.headers, "connection", name) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(body)
        .map_err(|e| RelayError::parse(format!("failed to build request: {}", e)))
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

/// Responses that never carry a body, whatever their headers say
fn is_bodyless(method: &Method, status: StatusCode) -> bool {
    method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn encode_response_head<B>(response: &Response<B>) -> Vec<u8> {
    let version = match response.version() {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let status = response.status();
    let mut raw = format!("{} {} ", version, status.as_u16()).into_bytes();

    // hyper only keeps the reason phrase when it differs from the canonical one
    match response.extensions().get::<ReasonPhrase>() {
        Some(reason) => raw.extend_from_slice(reason.as_bytes()),
        None => raw.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes()),
    }
    raw.extend_from_slice(b"\r\n");

    for (name, value) in response.headers() {
        // One exchange per stream, the remote side sees `Connection: close`
        if name == CONNECTION || name.as_str() == "keep-alive" {
            continue;
        }
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"Connection: close\r\n\r\n");
    raw
}

/// Write the response to `conn`, returning the number of bytes written.
///
/// `method` is the request's; HEAD answers and 1xx/204/304 statuses go out
/// as a bare head.
async fn write_response<W, B>(
    conn: &mut W,
    method: &Method,
    response: Response<B>,
) -> Result<u64, RelayError>
where
    W: AsyncWrite + Unpin,
    B: Body<Data = Bytes> + Unpin,
    RelayError: From<B::Error>,
{
    let head = encode_response_head(&response);
    conn.write_all(&head).await?;
    let mut written = head.len() as u64;

    if is_bodyless(method, response.status()) {
        conn.flush().await?;
        return Ok(written);
    }

    let chunked = is_chunked(response.headers());
    let mut body = response.into_body();
    let mut trailers = None;

    while let Some(frame) = body.frame().await {
        match frame?.into_data() {
            Ok(data) if data.is_empty() => {}
            Ok(data) => {
                if chunked {
                    let size = format!("{:x}\r\n", data.len());
                    conn.write_all(size.as_bytes()).await?;
                    conn.write_all(&data).await?;
                    conn.write_all(b"\r\n").await?;
                    written += (size.len() + data.len() + 2) as u64;
                } else {
                    conn.write_all(&data).await?;
                    written += data.len() as u64;
                }
            }
            Err(frame) => {
                if let Ok(map) = frame.into_trailers() {
                    trailers = Some(map);
                }
            }
        }
    }

    if chunked {
        let mut tail = b"0\r\n".to_vec();
        for (name, value) in trailers.iter().flatten() {
            tail.extend_from_slice(name.as_str().as_bytes());
            tail.extend_from_slice(b": ");
            tail.extend_from_slice(value.as_bytes());
            tail.extend_from_slice(b"\r\n");
        }
        tail.extend_from_slice(b"\r\n");
        conn.write_all(&tail).await?;
        written += tail.len() as u64;
    }

    conn.flush().await?;
    Ok(written)
}
