//! Shared utilities for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::Extension;
use axum::routing::{get, post};
use axum::Router;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use multihttp::{ConnectionInfo, MultiplexingServer, ServerConfig, ServerError, Shutdown};

/// Self-signed credential pair for `localhost`, written to scratch files.
///
/// The files are removed on drop.
pub struct Credentials {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_der: CertificateDer<'static>,
}

impl Credentials {
    pub fn generate() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = scratch_file("cert.pem", cert.pem().as_bytes());
        let key_path = scratch_file("key.pem", key_pair.serialize_pem().as_bytes());
        Self {
            cert_path,
            key_path,
            cert_der: cert.der().clone(),
        }
    }

    pub fn cert(&self) -> String {
        self.cert_path.to_string_lossy().into_owned()
    }

    pub fn key(&self) -> String {
        self.key_path.to_string_lossy().into_owned()
    }

    /// Config with this pair installed and otherwise default settings.
    pub fn config(&self) -> ServerConfig {
        ServerConfig::default().with_tls(self.cert(), self.key())
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.cert_path);
        let _ = std::fs::remove_file(&self.key_path);
    }
}

pub fn scratch_file(name: &str, contents: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("multihttp-{}-{}", uuid::Uuid::new_v4(), name));
    std::fs::write(&path, contents).unwrap();
    path
}

/// A server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Trigger shutdown and wait for the serve call to return.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked")
    }
}

pub async fn start_server(config: ServerConfig, router: Router) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let signal = shutdown.signal();

    let handle = tokio::spawn(async move {
        MultiplexingServer::new(config)
            .serve_with_shutdown(listener, router, signal)
            .await
    });

    TestServer {
        addr,
        shutdown,
        handle,
    }
}

async fn describe(Extension(conn): Extension<ConnectionInfo>) -> String {
    format!("secure={} protocol={:?}", conn.secure, conn.protocol)
}

async fn echo(body: Bytes) -> Bytes {
    body
}

/// How long `GET /slow` takes to answer.
pub const SLOW_HANDLER_DELAY: Duration = Duration::from_secs(2);

async fn slow() -> &'static str {
    tokio::time::sleep(SLOW_HANDLER_DELAY).await;
    "done"
}

/// `GET /` describes the connection, `POST /echo` returns the request body
/// and `GET /slow` answers after [`SLOW_HANDLER_DELAY`].
pub fn test_router() -> Router {
    Router::new()
        .route("/", get(describe))
        .route("/echo", post(echo))
        .route("/slow", get(slow))
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// TLS 1.3 client trusting `cert`, offering `alpn` in order.
pub fn tls_connector(cert: &CertificateDer<'static>, alpn: &[&[u8]]) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.clone()).unwrap();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    TlsConnector::from(Arc::new(config))
}

pub async fn connect_tls(
    addr: SocketAddr,
    cert: &CertificateDer<'static>,
    alpn: &[&[u8]],
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from("localhost").unwrap();
    tls_connector(cert, alpn).connect(server_name, tcp).await
}

/// Write `request` and read until the peer closes or errors.
pub async fn roundtrip<S>(stream: &mut S, request: &[u8]) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await.unwrap();
    stream.flush().await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&response).into_owned()
}

pub const GET_ROOT: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
