//! HTTP/1.x request and response head parsing using httparse.
//!
//! The dispatcher reads the request head off the virtual connection once; the
//! HTTP and WebSocket relays then work from the parsed head plus whatever
//! bytes were already buffered past it. Request bodies are never collected:
//! [`BodyReader`] hands them out piece by piece as the backend takes them.

use crate::error::RelayError;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Maximum size of a request or response head (64KB)
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum length of a chunk-size or trailer line
const MAX_LINE: usize = 8 * 1024;

/// Largest piece of body read off the stream at once
const BODY_READ_SIZE: usize = 16 * 1024;

/// Parsed HTTP request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request target as sent (origin-form or absolute-form)
    pub target: String,
    /// Minor HTTP version (0 or 1)
    pub version: u8,
    /// Request headers in wire order
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn new(method: &str, target: &str) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            version: 1,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// First value of a header (case-insensitive name)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Replace every occurrence of a header with a single value
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(idx) => {
                self.headers[idx].1 = value.to_string();
                let mut seen = 0;
                self.headers.retain(|(n, _)| {
                    if n.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Body length from Content-Length
    pub fn content_length(&self) -> Result<Option<u64>, RelayError> {
        self.header("content-length")
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|_| RelayError::parse(format!("invalid Content-Length {:?}", v)))
            })
            .transpose()
    }

    pub fn is_chunked(&self) -> bool {
        header_contains(&self.headers, "transfer-encoding", "chunked")
    }

    /// GET with `Connection: upgrade` and `Upgrade: websocket`
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == "GET"
            && header_contains(&self.headers, "connection", "upgrade")
            && header_contains(&self.headers, "upgrade", "websocket")
    }

    /// Path and raw query of the request target (empty query when absent)
    pub fn path_and_query(&self) -> Result<(String, String), RelayError> {
        if self.target == "*" {
            return Ok(("*".to_string(), String::new()));
        }
        let uri: http::Uri = self
            .target
            .parse()
            .map_err(|e| RelayError::parse(format!("invalid request target {:?}: {}", self.target, e)))?;
        Ok((
            uri.path().to_string(),
            uri.query().unwrap_or_default().to_string(),
        ))
    }

    /// Serialize back to wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(256);
        raw.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            raw.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        raw
    }
}

/// Parsed HTTP response head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

/// A request head read off a stream plus the bytes received after it
#[derive(Debug)]
pub struct InboundRequest {
    pub head: RequestHead,
    pub buffered: BytesMut,
}

impl InboundRequest {
    pub fn new(head: RequestHead) -> Self {
        Self {
            head,
            buffered: BytesMut::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Bytes left before the body ends
    Length(u64),
    /// Bytes left in the current chunk, `None` before the next size line
    Chunked(Option<u64>),
    Done,
}

/// Incremental reader for a request body framed by Content-Length or by
/// chunked transfer coding.
///
/// Chunked bodies are decoded; chunk extensions and trailers are dropped.
/// At most one read's worth of body is held at a time, whatever the length.
#[derive(Debug)]
pub struct BodyReader<R> {
    reader: R,
    buffered: BytesMut,
    framing: Framing,
}

impl<R> BodyReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Body of `request`, continuing with the bytes already buffered past
    /// its head and then `reader`.
    pub fn new(request: InboundRequest, reader: R) -> Result<(RequestHead, Self), RelayError> {
        let framing = if request.head.is_chunked() {
            Framing::Chunked(None)
        } else {
            match request.head.content_length()? {
                Some(0) | None => Framing::Done,
                Some(len) => Framing::Length(len),
            }
        };

        Ok((
            request.head,
            Self {
                reader,
                buffered: request.buffered,
                framing,
            },
        ))
    }

    /// True once the whole body has been handed out (or there never was one)
    pub fn is_done(&self) -> bool {
        self.framing == Framing::Done
    }

    /// Next piece of the body, `None` at its end
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, RelayError> {
        loop {
            match self.framing {
                Framing::Done => return Ok(None),
                Framing::Length(0) => self.framing = Framing::Done,
                Framing::Length(remaining) => {
                    let data = self.take(remaining, "stream closed inside request body").await?;
                    self.framing = Framing::Length(remaining - data.len() as u64);
                    return Ok(Some(data));
                }
                Framing::Chunked(None) => {
                    let size = self.chunk_size().await?;
                    if size == 0 {
                        // Trailers, terminated by an empty line
                        while !read_line(&mut self.reader, &mut self.buffered)
                            .await?
                            .is_empty()
                        {}
                        self.framing = Framing::Done;
                    } else {
                        self.framing = Framing::Chunked(Some(size));
                    }
                }
                Framing::Chunked(Some(0)) => {
                    fill(&mut self.reader, &mut self.buffered, 2).await?;
                    if &self.buffered[..2] != b"\r\n" {
                        return Err(RelayError::parse("chunk not terminated by CRLF"));
                    }
                    self.buffered.advance(2);
                    self.framing = Framing::Chunked(None);
                }
                Framing::Chunked(Some(remaining)) => {
                    let data = self.take(remaining, "stream closed inside chunked body").await?;
                    self.framing = Framing::Chunked(Some(remaining - data.len() as u64));
                    return Ok(Some(data));
                }
            }
        }
    }

    /// Up to `max` bytes, reading only when nothing is buffered
    async fn take(&mut self, max: u64, context: &str) -> Result<Bytes, RelayError> {
        if self.buffered.is_empty() {
            self.buffered.reserve(BODY_READ_SIZE);
            if self.reader.read_buf(&mut self.buffered).await? == 0 {
                return Err(RelayError::unexpected_eof(context));
            }
        }
        let len = self
            .buffered
            .len()
            .min(usize::try_from(max).unwrap_or(usize::MAX));
        Ok(self.buffered.split_to(len).freeze())
    }

    async fn chunk_size(&mut self) -> Result<u64, RelayError> {
        let line = read_line(&mut self.reader, &mut self.buffered).await?;
        let size_str = std::str::from_utf8(&line)
            .map_err(|_| RelayError::parse("chunk size is not UTF-8"))?
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        u64::from_str_radix(size_str, 16)
            .map_err(|_| RelayError::parse(format!("invalid chunk size {:?}", size_str)))
    }
}

/// Does any `name` header carry `token` in its comma-separated value list
pub fn header_contains(headers: &[(String, String)], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Try to parse a request head. `Ok(None)` means more data is needed.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(header_len)) => {
            let head = RequestHead {
                method: req.method.unwrap_or("").to_string(),
                target: req.path.unwrap_or("").to_string(),
                version: req.version.unwrap_or(1),
                headers: collect_headers(req.headers),
            };
            debug!(
                "Parsed HTTP request: {} {} ({} headers)",
                head.method,
                head.target,
                head.headers.len()
            );
            Ok(Some((head, header_len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(RelayError::parse(format!("invalid HTTP request: {}", e))),
    }
}

/// Try to parse a response head. `Ok(None)` means more data is needed.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    match resp.parse(buf) {
        Ok(httparse::Status::Complete(header_len)) => Ok(Some((
            ResponseHead {
                status: resp.code.unwrap_or(0),
                reason: resp.reason.unwrap_or("").to_string(),
                headers: collect_headers(resp.headers),
            },
            header_len,
        ))),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(RelayError::parse(format!("invalid HTTP response: {}", e))),
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect()
}

/// Read a request head from `reader`
pub async fn read_request<R>(reader: &mut R) -> Result<InboundRequest, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some((head, header_len)) = parse_request_head(&buf)? {
            buf.advance(header_len);
            return Ok(InboundRequest {
                head,
                buffered: buf,
            });
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(RelayError::parse("request head too large"));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(if buf.is_empty() {
                RelayError::unexpected_eof("stream closed before a request was received")
            } else {
                RelayError::parse("incomplete request head")
            });
        }
    }
}

/// Read a response head from `reader`, returning it with the raw head bytes
/// and anything received after them
pub async fn read_response<R>(reader: &mut R) -> Result<(ResponseHead, Bytes, BytesMut), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some((head, header_len)) = parse_response_head(&buf)? {
            let raw = buf.split_to(header_len).freeze();
            return Ok((head, raw, buf));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(RelayError::parse("response head too large"));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(RelayError::unexpected_eof(
                "backend closed before sending a response",
            ));
        }
    }
}

async fn fill<R>(reader: &mut R, buf: &mut BytesMut, len: usize) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < len {
        if reader.read_buf(buf).await? == 0 {
            return Err(RelayError::unexpected_eof("stream closed inside request body"));
        }
    }
    Ok(())
}

async fn read_line<R>(reader: &mut R, buf: &mut BytesMut) -> Result<BytesMut, RelayError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos);
            buf.advance(2);
            return Ok(line);
        }
        if buf.len() > MAX_LINE {
            return Err(RelayError::parse("chunk line too long"));
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(RelayError::unexpected_eof("stream closed inside chunked body"));
        }
    }
}
