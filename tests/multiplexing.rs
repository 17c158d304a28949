//! End-to-end tests: TLS and plaintext clients against one listening port.

use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use multihttp::{ServerConfig, ServerError};

mod common;

use common::{Credentials, GET_ROOT};

#[tokio::test]
async fn plaintext_request_without_credentials() {
    let server = common::start_server(ServerConfig::default(), common::test_router()).await;

    let body = common::http_client()
        .get(server.url("/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "secure=false protocol=None");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn both_transports_share_one_port() {
    let creds = Credentials::generate();
    let server = common::start_server(creds.config(), common::test_router()).await;

    let plain = common::http_client()
        .get(server.url("/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(plain, "secure=false protocol=None");

    let mut tls = common::connect_tls(server.addr, &creds.cert_der, &[b"http/1.1"])
        .await
        .unwrap();
    let response = common::roundtrip(&mut tls, GET_ROOT).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with("secure=true protocol=Http1"), "got: {response}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn h2_is_negotiated_over_tls() {
    let creds = Credentials::generate();
    let server = common::start_server(creds.config(), common::test_router()).await;

    let tls = common::connect_tls(server.addr, &creds.cert_der, &[b"h2", b"http/1.1"])
        .await
        .unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .uri("https://localhost/")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.version(), Version::HTTP_2);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"secure=true protocol=H2");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn http2_disabled_offers_only_http1() {
    let creds = Credentials::generate();
    let mut config = creds.config();
    config.http2 = false;
    let server = common::start_server(config, common::test_router()).await;

    let mut tls = common::connect_tls(server.addr, &creds.cert_der, &[b"h2", b"http/1.1"])
        .await
        .unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    let response = common::roundtrip(&mut tls, GET_ROOT).await;
    assert!(response.ends_with("secure=true protocol=Http1"), "got: {response}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn handshake_byte_without_credentials_is_plaintext() {
    let server = common::start_server(ServerConfig::default(), common::test_router()).await;

    // 0x16 in front of a request line is an invalid method once it reaches HTTP parsing.
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut request = vec![22u8];
    request.extend_from_slice(GET_ROOT);
    let response = common::roundtrip(&mut stream, &request).await;
    assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn silent_connection_does_not_block_others() {
    let server = common::start_server(ServerConfig::default(), common::test_router()).await;

    let _silent = TcpStream::connect(server.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        common::http_client().get(server.url("/")).send(),
    )
    .await
    .expect("request stalled behind a silent connection")
    .unwrap();
    assert!(response.status().is_success());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn client_closing_before_first_byte() {
    let server = common::start_server(ServerConfig::default(), common::test_router()).await;

    for _ in 0..3 {
        let stream = TcpStream::connect(server.addr).await.unwrap();
        drop(stream);
    }

    let response = common::http_client().get(server.url("/")).send().await.unwrap();
    assert!(response.status().is_success());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn classification_deadline_closes_silent_connection() {
    let mut config = ServerConfig::default();
    config.timeouts.read_secs = 1;
    let server = common::start_server(config, common::test_router()).await;

    let mut silent = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), silent.read(&mut buf))
        .await
        .expect("silent connection was never closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn missing_key_serves_plaintext_only() {
    let creds = Credentials::generate();
    let config = ServerConfig::default().with_tls(creds.cert(), "/nonexistent/multihttp/key.pem");
    let server = common::start_server(config, common::test_router()).await;

    let body = common::http_client()
        .get(server.url("/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "secure=false protocol=None");

    let attempt = tokio::time::timeout(
        Duration::from_secs(5),
        common::connect_tls(server.addr, &creds.cert_der, &[b"http/1.1"]),
    )
    .await;
    assert!(!matches!(attempt, Ok(Ok(_))), "TLS handshake unexpectedly succeeded");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unreadable_key_fails_before_serving() {
    let creds = Credentials::generate();
    let garbage = common::scratch_file("key.pem", b"-----BEGIN NOTHING-----\n");
    let config = ServerConfig::default().with_tls(creds.cert(), garbage.to_string_lossy());
    let server = common::start_server(config, common::test_router()).await;

    let result = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("serve did not return")
        .unwrap();
    match result {
        Err(ServerError::Credentials(e)) => {
            assert!(e.to_string().starts_with("cannot load credential pair"), "got: {e}");
        }
        other => panic!("expected a credential error, got {other:?}"),
    }

    let _ = std::fs::remove_file(garbage);
}

#[tokio::test]
async fn request_body_reaches_handler_intact() {
    let creds = Credentials::generate();
    let server = common::start_server(creds.config(), common::test_router()).await;

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let echoed = common::http_client()
        .post(server.url("/echo"))
        .body(payload.clone())
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(&echoed[..], &payload[..]);

    let mut tls = common::connect_tls(server.addr, &creds.cert_der, &[b"http/1.1"])
        .await
        .unwrap();
    let request = b"POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
    let response = common::roundtrip(&mut tls, request).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with("\r\n\r\nhello"), "got: {response}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_connection() {
    let server = common::start_server(ServerConfig::default(), common::test_router()).await;

    let mut idle = TcpStream::connect(server.addr).await.unwrap();
    idle.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    let mut buf = vec![0u8; 1024];
    let n = idle.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

    server.stop().await.unwrap();

    // The kept-alive connection is closed by the drain.
    let read = tokio::time::timeout(Duration::from_secs(2), idle.read(&mut buf))
        .await
        .expect("connection left open after shutdown");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn slow_handler_outlives_idle_timeout() {
    let mut config = ServerConfig::default();
    config.timeouts.idle_secs = 1;
    let server = common::start_server(config, common::test_router()).await;

    let response = common::http_client()
        .get(server.url("/slow"))
        .send()
        .await
        .expect("in-flight request was cut off by the idle timeout");
    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "done");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn slow_h2_handler_outlives_idle_timeout() {
    let creds = Credentials::generate();
    let mut config = creds.config();
    config.timeouts.idle_secs = 1;
    let server = common::start_server(config, common::test_router()).await;

    let tls = common::connect_tls(server.addr, &creds.cert_der, &[b"h2"])
        .await
        .unwrap();
    let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .uri("https://localhost/slow")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"done");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn idle_keep_alive_connection_is_closed() {
    let mut config = ServerConfig::default();
    config.timeouts.idle_secs = 1;
    let server = common::start_server(config, common::test_router()).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("idle connection was never closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_not_held_by_stalled_handshake() {
    let creds = Credentials::generate();
    let mut config = creds.config();
    config.timeouts.read_secs = 0;
    config.timeouts.read_header_secs = 0;
    let server = common::start_server(config, common::test_router()).await;

    let mut stalled = TcpStream::connect(server.addr).await.unwrap();
    stalled.write_all(&[22]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(3), server.stop())
        .await
        .expect("shutdown waited on a stalled handshake")
        .unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stalled.read(&mut buf))
        .await
        .expect("stalled connection left open after shutdown");
    assert!(matches!(read, Ok(0) | Err(_)));
}
