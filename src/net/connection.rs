//! Per-connection identity and the stream handed to the HTTP engine.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Describe a connection to request handlers (peer, secure, ALPN)
//! - Unify plaintext and TLS streams behind one `AsyncRead + AsyncWrite`

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;

use super::peek::PeekedStream;
use super::tls::NegotiatedProtocol;

/// Source of connection IDs. Only uniqueness matters, so ordering is relaxed.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection details attached to every request's extensions.
///
/// Handlers read it with `axum::Extension<ConnectionInfo>` or
/// `request.extensions().get::<ConnectionInfo>()`.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// True when the connection completed a TLS handshake.
    pub secure: bool,
    pub protocol: NegotiatedProtocol,
}

impl ConnectionInfo {
    /// Short label used in logs and metrics.
    pub fn transport(&self) -> &'static str {
        if self.secure {
            "tls"
        } else {
            "plain"
        }
    }
}

/// A classified connection after any TLS handshake has completed.
pub enum SecuredStream<S> {
    Plain(PeekedStream<S>),
    Tls(Box<TlsStream<PeekedStream<S>>>),
}

impl<S> SecuredStream<S> {
    pub fn is_secure(&self) -> bool {
        matches!(self, SecuredStream::Tls(_))
    }

    /// Protocol agreed via ALPN; always `None` for plaintext.
    pub fn negotiated_protocol(&self) -> NegotiatedProtocol {
        match self {
            SecuredStream::Plain(_) => NegotiatedProtocol::None,
            SecuredStream::Tls(tls) => NegotiatedProtocol::from_alpn(tls.get_ref().1.alpn_protocol()),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SecuredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecuredStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SecuredStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SecuredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecuredStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SecuredStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SecuredStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            SecuredStream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            SecuredStream::Plain(s) => s.is_write_vectored(),
            SecuredStream::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecuredStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SecuredStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SecuredStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SecuredStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
