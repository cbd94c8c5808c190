//! End-to-end tests against a live listener.
//!
//! # Design
//! Each test starts an `EmbedServer` on an ephemeral loopback port and talks
//! to it either through `ureq` (plain request/response checks) or through a
//! raw `TcpStream` when the exact bytes, pipelining or connection state
//! matter.

use std::net::SocketAddr;
use std::time::Duration;

use embed_http_core::{
    Context, EmbedServer, HandlerFault, Headers, Method, Reply, Request, Response, ServerConfig,
    Token,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

fn ping(_: &Request, _: &mut Context) -> Result<Reply, HandlerFault> {
    Ok(Response::text(200, "pong").into())
}

fn echo(req: &Request, _: &mut Context) -> Result<Reply, HandlerFault> {
    Ok(Response::new(200)
        .with_header("Content-Type", "application/octet-stream")
        .with_body(req.body().to_vec())
        .into())
}

/// A route that defers every request and reports the token on `tx`.
fn deferring(tx: mpsc::UnboundedSender<Token>) -> impl embed_http_core::Handler {
    move |_: &Request, ctx: &mut Context| -> Result<Reply, HandlerFault> {
        let token = ctx.defer()?;
        tx.send(token)
            .map_err(|_| HandlerFault::new("token receiver gone"))?;
        Ok(Reply::Pending(token))
    }
}

async fn start(config: ServerConfig) -> (EmbedServer, SocketAddr, mpsc::UnboundedReceiver<Token>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut server = EmbedServer::new(config);
    server
        .route(Method::Get, "/ping", ping)
        .unwrap()
        .route(Method::Post, "/echo", echo)
        .unwrap()
        .route(Method::Get, "/later", deferring(tx))
        .unwrap()
        .route(Method::Get, "/panic", |_: &Request, _: &mut Context| -> Result<Reply, HandlerFault> {
            panic!("handler exploded")
        })
        .unwrap();
    let addr = server.start(0).await.unwrap();
    (server, addr, rx)
}

/// Write `raw` and read until the server closes the connection.
async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8(out).unwrap()
}

/// Read exactly one Content-Length framed response from `stream`.
async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
    }
    let head = String::from_utf8(buf.clone()).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    buf.extend_from_slice(&body);
    String::from_utf8(buf).unwrap()
}

fn http_get(url: String) -> (u16, String) {
    let agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .new_agent();
    let mut response = agent.get(&url).call().expect("HTTP transport error");
    let status = response.status().as_u16();
    let body = response.body_mut().read_to_string().unwrap_or_default();
    (status, body)
}

fn http_post_empty(url: String) -> u16 {
    let agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .new_agent();
    let response = agent.post(&url).send_empty().expect("HTTP transport error");
    response.status().as_u16()
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_scenario() {
    let (mut server, addr, _tokens) = start(ServerConfig::default()).await;
    let base = format!("http://{addr}");

    let (status, body) = tokio::task::spawn_blocking({
        let url = format!("{base}/ping");
        move || http_get(url)
    })
    .await
    .unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "pong");

    let (status, _) = tokio::task::spawn_blocking({
        let url = format!("{base}/missing");
        move || http_get(url)
    })
    .await
    .unwrap();
    assert_eq!(status, 404);

    let status = tokio::task::spawn_blocking({
        let url = format!("{base}/ping");
        move || http_post_empty(url)
    })
    .await
    .unwrap();
    assert_eq!(status, 404);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn method_mismatch_is_405_when_configured() {
    let config = ServerConfig {
        method_not_allowed: true,
        ..ServerConfig::default()
    };
    let (mut server, addr, _tokens) = start(config).await;
    let text = exchange(addr, b"POST /ping HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{text}");
    assert!(text.contains("Allow: GET\r\n"), "{text}");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn synchronous_reply_is_written_byte_for_byte() {
    let mut server = EmbedServer::new(ServerConfig::default());
    server
        .route(Method::Get, "/exact", |_: &Request, _: &mut Context| -> Result<Reply, HandlerFault> {
            Ok(Response::new(201)
                .with_header("X-One", "1")
                .with_header("x-two", "two words")
                .with_body(b"body".to_vec())
                .into())
        })
        .unwrap();
    let addr = server.start(0).await.unwrap();

    let text = exchange(addr, b"GET /exact HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert_eq!(
        text,
        "HTTP/1.1 201 Created\r\nX-One: 1\r\nx-two: two words\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbody"
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn keep_alive_serves_pipelined_requests_in_order() {
    let (mut server, addr, _tokens) = start(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /ping HTTP/1.1\r\n\r\nPOST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /missing HTTP/1.1\r\n\r\n",
        )
        .await
        .unwrap();

    let first = read_response(&mut stream).await;
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(first.ends_with("pong"));
    let second = read_response(&mut stream).await;
    assert!(second.ends_with("\r\n\r\nabc"));
    let third = read_response(&mut stream).await;
    assert!(third.starts_with("HTTP/1.1 404 Not Found\r\n"));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn chunked_request_body_is_reassembled() {
    let (mut server, addr, _tokens) = start(ServerConfig::default()).await;
    let text = exchange(
        addr,
        b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n",
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("\r\n\r\nfoobar"), "{text}");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_request_gets_400_and_close() {
    let (mut server, addr, _tokens) = start(ServerConfig::default()).await;
    let text = exchange(addr, b"NOT A REQUEST\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
    assert!(text.contains("Connection: close\r\n"));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_body_gets_413() {
    let config = ServerConfig {
        max_request_bytes: 16,
        ..ServerConfig::default()
    };
    let (mut server, addr, _tokens) = start(config).await;
    let text = exchange(addr, b"POST /echo HTTP/1.1\r\nContent-Length: 100\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 413 "), "{text}");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn unterminated_chunk_size_line_gets_413_and_close() {
    let config = ServerConfig {
        max_request_bytes: 1024,
        ..ServerConfig::default()
    };
    let (mut server, addr, _tokens) = start(config).await;
    let mut raw = b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1;".to_vec();
    raw.extend(std::iter::repeat(b'x').take(2048));
    let text = exchange(addr, &raw).await;
    assert!(text.starts_with("HTTP/1.1 413 "), "{text}");
    assert!(text.contains("Connection: close\r\n"), "{text}");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn head_reply_has_length_but_no_body() {
    let mut server = EmbedServer::new(ServerConfig::default());
    server.route(Method::Head, "/ping", ping).unwrap();
    server.route(Method::Get, "/ping", ping).unwrap();
    let addr = server.start(0).await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"HEAD /ping HTTP/1.1\r\n\r\nGET /ping HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Length: 4\r\n"), "{head}");

    // The next response starts right after the head; no stray body bytes.
    let next = read_response(&mut stream).await;
    assert!(next.starts_with("HTTP/1.1 200 OK\r\n"), "{next}");
    assert!(next.ends_with("pong"), "{next}");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn handler_panic_is_500_and_server_keeps_serving() {
    let (mut server, addr, _tokens) = start(ServerConfig::default()).await;
    let text = exchange(addr, b"GET /panic HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{text}");
    let text = exchange(addr, b"GET /ping HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(text.ends_with("pong"));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn deferred_request_is_completed_exactly_once() {
    let (mut server, addr, mut tokens) = start(ServerConfig::default()).await;
    let client = tokio::spawn(async move {
        exchange(addr, b"GET /later HTTP/1.1\r\nConnection: close\r\n\r\n").await
    });

    let token = tokens.recv().await.unwrap();
    assert_eq!(server.pending_count(), 1);

    // A parked request does not hold up other connections.
    let text = exchange(addr, b"GET /ping HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(text.ends_with("pong"));

    let completer = server.completer().unwrap();
    let headers: Headers = [("X-Source", "host")].into_iter().collect();
    assert!(completer.complete_parts(token, 200, headers, b"done".to_vec()));
    assert!(!completer.complete(token, Response::text(500, "again")));

    let text = client.await.unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("X-Source: host\r\n"));
    assert!(text.ends_with("done"));
    assert_eq!(server.pending_count(), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn uncompleted_request_expires_with_504() {
    let config = ServerConfig {
        pending_timeout_ms: 100,
        sweep_interval_ms: 20,
        ..ServerConfig::default()
    };
    let (mut server, addr, mut tokens) = start(config).await;
    let client = tokio::spawn(async move {
        exchange(addr, b"GET /later HTTP/1.1\r\nConnection: close\r\n\r\n").await
    });
    let token = tokens.recv().await.unwrap();

    let text = client.await.unwrap();
    assert!(text.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"), "{text}");
    assert_eq!(server.pending_count(), 0);
    assert!(!server.complete(token, Response::new(200)));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_fails_parked_requests_and_closes_connections() {
    let (mut server, addr, mut tokens) = start(ServerConfig::default()).await;
    let parked = tokio::spawn(async move {
        exchange(addr, b"GET /later HTTP/1.1\r\n\r\n").await
    });
    tokens.recv().await.unwrap();

    let mut idle = TcpStream::connect(addr).await.unwrap();
    idle.write_all(b"GET /ping HTTP/1.1\r\n\r\n").await.unwrap();
    let first = read_response(&mut idle).await;
    assert!(first.ends_with("pong"));

    server.stop().await.unwrap();

    let text = parked.await.unwrap();
    assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{text}");
    assert!(text.contains("Connection: close\r\n"));

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(1), idle.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "idle keep-alive connection should be closed");

    assert_eq!(server.pending_count(), 0);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn tokens_do_not_survive_a_restart() {
    let (mut server, addr, mut tokens) = start(ServerConfig::default()).await;
    let parked = tokio::spawn(async move {
        exchange(addr, b"GET /later HTTP/1.1\r\nConnection: close\r\n\r\n").await
    });
    let token = tokens.recv().await.unwrap();
    server.stop().await.unwrap();
    parked.await.unwrap();

    server.start(0).await.unwrap();
    assert!(!server.complete(token, Response::new(200)));
    server.stop().await.unwrap();
}
