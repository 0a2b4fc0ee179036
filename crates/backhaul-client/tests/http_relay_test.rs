//! Integration tests for the HTTP relay
//!
//! An axum server plays the local backend; the remote peer is a hyper client
//! (or raw bytes) on the far end of an in-memory duplex stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::routing::{any, get, post};
use axum::Router;
use backhaul_client::{
    ControlMessage, Dispatcher, Outcome, Protocol, Rejection, RelayError, TargetResolver,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::client::conn::http1;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn echo(
    State(hits): State<Arc<AtomicUsize>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> String {
    hits.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| {
        headers
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_else(|| "<missing>".to_string())
    };
    format!(
        "{} {} host={} ua={:?} body={}",
        method,
        uri,
        header("host"),
        header("user-agent"),
        body
    )
}

async fn upload(State(hits): State<Arc<AtomicUsize>>, body: Bytes) -> String {
    hits.fetch_add(1, Ordering::SeqCst);
    let sum: u64 = body.iter().map(|b| *b as u64).sum();
    format!("{} {}", body.len(), sum)
}

async fn stream(State(hits): State<Arc<AtomicUsize>>) -> Body {
    hits.fetch_add(1, Ordering::SeqCst);
    Body::from_stream(futures_util::stream::iter(vec![
        Ok::<_, std::io::Error>("hello "),
        Ok("streamed "),
        Ok("world"),
    ]))
}

/// Start the backend; the counter tracks every request it sees
async fn spawn_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));

    let app = Router::new()
        .route("/base/echo", any(echo))
        .route("/base/stream", get(stream))
        .route("/base/upload", post(upload))
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, hits)
}

fn dispatcher_for(backend: SocketAddr) -> Dispatcher {
    let routes = HashMap::from([(
        "app.example.com:80".to_string(),
        format!("http://{}/base?key=abc", backend),
    )]);
    let resolver = TargetResolver::parse(None, &routes, &["http"]).unwrap();
    Dispatcher::builder().http(resolver).build()
}

/// Send one request from the remote side and collect the response
async fn roundtrip(
    dispatcher: &Dispatcher,
    descriptor: &str,
    request: Request<Full<Bytes>>,
) -> (StatusCode, HeaderMap, Bytes, Outcome) {
    let (remote, conn) = duplex(64 * 1024);
    let handle = dispatcher.dispatch(conn, ControlMessage::undeclared(1, descriptor));

    let (mut sender, connection) = http1::handshake(TokioIo::new(remote)).await.unwrap();
    tokio::spawn(connection);

    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();

    (status, headers, body, handle.await.unwrap())
}

#[tokio::test]
async fn test_request_is_rewritten_for_backend() {
    let (backend, hits) = spawn_backend().await;
    let dispatcher = dispatcher_for(backend);

    let request = Request::get("/echo?page=2")
        .header("host", "app.example.com")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body, outcome) = roundtrip(&dispatcher, "app.example.com:80", request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        format!("GET /base/echo?key=abc&page=2 host={} ua=\"\" body=", backend)
    );
    assert!(matches!(
        outcome,
        Outcome::Completed {
            protocol: Protocol::Http,
            ..
        }
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_request_body_and_user_agent_are_forwarded() {
    let (backend, _) = spawn_backend().await;
    let dispatcher = dispatcher_for(backend);

    let request = Request::post("/echo")
        .header("host", "app.example.com")
        .header("user-agent", "integration/1.0")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(b"{\"name\":\"backhaul\"}")))
        .unwrap();
    let (status, _, body, outcome) = roundtrip(&dispatcher, "app.example.com:80", request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        format!(
            "POST /base/echo?key=abc host={} ua=\"integration/1.0\" body={{\"name\":\"backhaul\"}}",
            backend
        )
    );
    match outcome {
        Outcome::Completed { stats, .. } => assert_eq!(stats.to_backend, 19),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_chunked_request_body_is_decoded() {
    let (backend, _) = spawn_backend().await;
    let dispatcher = dispatcher_for(backend);

    let (mut remote, conn) = duplex(64 * 1024);
    let handle = dispatcher.dispatch(conn, ControlMessage::new(2, Protocol::Http, "app.example.com:80"));

    remote
        .write_all(
            b"PUT /echo HTTP/1.1\r\nHost: app.example.com\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nchun\r\n3\r\nked\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let mut reply = Vec::new();
    remote.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8(reply).unwrap();

    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
    assert!(reply.ends_with("body=chunked"), "{}", reply);
    assert!(handle.await.unwrap().is_completed());
}

#[tokio::test]
async fn test_streamed_response_is_rechunked() {
    let (backend, _) = spawn_backend().await;
    let dispatcher = dispatcher_for(backend);

    let request = Request::get("/stream")
        .header("host", "app.example.com")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body, outcome) =
        roundtrip(&dispatcher, "app.example.com:80", request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("transfer-encoding").unwrap(), "chunked");
    assert_eq!(body, "hello streamed world");
    assert!(outcome.is_completed());
}

#[tokio::test]
async fn test_missing_target_answers_bad_gateway() {
    let (backend, hits) = spawn_backend().await;
    let dispatcher = dispatcher_for(backend);

    let request = Request::get("/echo")
        .header("host", "elsewhere.example.com")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _, outcome) = roundtrip(&dispatcher, "elsewhere.example.com:80", request).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        outcome.rejection(),
        Some(&Rejection::NoTarget {
            protocol: Protocol::Http,
            descriptor: "elsewhere.example.com:80".to_string(),
        })
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_backend_answers_bad_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);

    let dispatcher = Dispatcher::builder()
        .http(TargetResolver::single(
            format!("http://{}", closed).parse().unwrap(),
        ))
        .build();

    let request = Request::get("/")
        .header("host", "app.example.com")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _, outcome) = roundtrip(&dispatcher, "app.example.com:80", request).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(matches!(
        outcome,
        Outcome::Failed {
            protocol: Some(Protocol::Http),
            error: RelayError::Dial { .. }
        }
    ));
}

#[tokio::test]
async fn test_malformed_request_never_reaches_backend() {
    let (backend, hits) = spawn_backend().await;
    let dispatcher = dispatcher_for(backend);

    let (mut remote, conn) = duplex(1024);
    let handle = dispatcher.dispatch(conn, ControlMessage::undeclared(3, "app.example.com:80"));
    remote.write_all(b"BROKEN REQUEST LINE\r\n\r\n").await.unwrap();

    let mut reply = Vec::new();
    remote.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty());
    assert!(matches!(
        handle.await.unwrap(),
        Outcome::Rejected(Rejection::Malformed(_))
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // The dispatcher keeps serving
    let request = Request::get("/echo")
        .header("host", "app.example.com")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _, outcome) = roundtrip(&dispatcher, "app.example.com:80", request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(outcome.is_completed());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn checksum(data: &[u8]) -> String {
    let sum: u64 = data.iter().map(|b| *b as u64).sum();
    format!("{} {}", data.len(), sum)
}

#[tokio::test]
async fn test_large_request_body_is_streamed() {
    let (backend, hits) = spawn_backend().await;
    let dispatcher = dispatcher_for(backend);
    let data = payload(1024 * 1024);

    let request = Request::post("/upload")
        .header("host", "app.example.com")
        .body(Full::new(Bytes::from(data.clone())))
        .unwrap();
    let (status, _, body, outcome) = roundtrip(&dispatcher, "app.example.com:80", request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, checksum(&data));
    match outcome {
        Outcome::Completed { stats, .. } => assert_eq!(stats.to_backend, 1024 * 1024),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_large_chunked_request_body_is_streamed() {
    let (backend, _) = spawn_backend().await;
    let dispatcher = dispatcher_for(backend);
    let data = payload(512 * 1024);

    // No Content-Length, so the remote side sends chunked
    let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = data
        .chunks(10_000)
        .map(|piece| Ok(Frame::data(Bytes::copy_from_slice(piece))))
        .collect();

    let (remote, conn) = duplex(64 * 1024);
    let handle = dispatcher.dispatch(conn, ControlMessage::undeclared(4, "app.example.com:80"));
    let (mut sender, connection) = http1::handshake(TokioIo::new(remote)).await.unwrap();
    tokio::spawn(connection);

    let request = Request::post("/upload")
        .header("host", "app.example.com")
        .body(StreamBody::new(futures_util::stream::iter(frames)))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();

    assert_eq!(body, checksum(&data));
    assert!(handle.await.unwrap().is_completed());
}

#[tokio::test]
async fn test_truncated_request_body_gets_no_response() {
    let (backend, _) = spawn_backend().await;
    let dispatcher = dispatcher_for(backend);

    let (mut remote, conn) = duplex(1024);
    let handle = dispatcher.dispatch(conn, ControlMessage::undeclared(5, "app.example.com:80"));

    remote
        .write_all(b"POST /upload HTTP/1.1\r\nHost: app.example.com\r\nContent-Length: 100\r\n\r\nonly ten b")
        .await
        .unwrap();
    remote.shutdown().await.unwrap();

    let mut reply = Vec::new();
    remote.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty(), "{}", String::from_utf8_lossy(&reply));
    assert!(matches!(
        handle.await.unwrap(),
        Outcome::Failed {
            protocol: Some(Protocol::Http),
            error: RelayError::Stream(_)
        }
    ));
}

/// A backend that answers every request with a bodyless chunked head
async fn spawn_head_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                socket
                    .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                    .await
                    .unwrap();
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_head_response_is_relayed_verbatim() {
    let backend = spawn_head_backend().await;
    let dispatcher = Dispatcher::builder()
        .http(TargetResolver::single(
            format!("http://{}", backend).parse().unwrap(),
        ))
        .build();

    let (mut remote, conn) = duplex(1024);
    let handle = dispatcher.dispatch(conn, ControlMessage::undeclared(6, "app.example.com:80"));
    remote
        .write_all(b"HEAD /raw HTTP/1.1\r\nHost: app.example.com\r\n\r\n")
        .await
        .unwrap();

    let mut reply = Vec::new();
    remote.read_to_end(&mut reply).await.unwrap();
    assert_eq!(
        String::from_utf8(reply).unwrap(),
        "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\nConnection: close\r\n\r\n"
    );
    assert!(handle.await.unwrap().is_completed());
}
