//! Protocol-sniffing TCP listener.
//!
//! # Responsibilities
//! - Accept incoming TCP connections
//! - Read exactly one byte from each to tell TLS from plaintext
//! - Hand back the connection with that byte replayable, wrapped in a
//!   lazy TLS negotiator when it opens a TLS handshake and credentials exist
//!
//! # Design Decisions
//! - Classification reads run concurrently, so a silent client never
//!   holds up the connections behind it
//! - The TLS handshake is not driven here; the connection task drives it
//! - Only listener-level failures are fatal to the accept loop

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use super::connection::SecuredStream;
use super::peek::PeekedStream;
use super::tls::TLS_HANDSHAKE_RECORD;

/// Error returned by [`SniffingListener::accept`].
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener itself failed; no further connections can be accepted.
    #[error("failed to accept: {0}")]
    Listener(#[source] io::Error),

    /// A single connection failed before it could be handed out.
    #[error("connection{} dropped during classification: {source}", peer.map(|p| format!(" from {p}")).unwrap_or_default())]
    Connection {
        peer: Option<SocketAddr>,
        #[source]
        source: io::Error,
    },
}

impl AcceptError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AcceptError::Listener(_))
    }

    pub fn into_io(self) -> io::Error {
        match self {
            AcceptError::Listener(e) => e,
            AcceptError::Connection { source, .. } => source,
        }
    }
}

/// A connection after its first byte has been inspected.
pub enum ClassifiedStream<S> {
    /// Anything that does not open with a TLS handshake record, or any
    /// connection when no credentials are configured.
    Plain(PeekedStream<S>),
    /// Opens with a TLS handshake record. The handshake runs on first poll.
    Tls(tokio_rustls::Accept<PeekedStream<S>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClassifiedStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClassifiedStream::Tls(_))
    }

    /// Complete the TLS handshake, if there is one.
    pub async fn negotiate(self) -> io::Result<SecuredStream<S>> {
        match self {
            ClassifiedStream::Plain(stream) => Ok(SecuredStream::Plain(stream)),
            ClassifiedStream::Tls(handshake) => Ok(SecuredStream::Tls(Box::new(handshake.await?))),
        }
    }
}

/// Read the classification byte from `stream` and wrap it accordingly.
///
/// A read error drops (and so closes) the stream. End-of-stream is not an
/// error: the write half is shut down and the returned wrapper reads as
/// empty.
pub async fn classify<S>(mut stream: S, acceptor: Option<&TlsAcceptor>) -> io::Result<ClassifiedStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first = [0u8; 1];
    if stream.read(&mut first).await? == 0 {
        let _ = stream.shutdown().await;
        return Ok(ClassifiedStream::Plain(PeekedStream::eof(stream)));
    }

    let peeked = PeekedStream::new(stream, first[0]);
    match acceptor {
        Some(acceptor) if first[0] == TLS_HANDSHAKE_RECORD => {
            Ok(ClassifiedStream::Tls(acceptor.accept(peeked)))
        }
        // Byte 22 without credentials is served as plaintext.
        _ => Ok(ClassifiedStream::Plain(peeked)),
    }
}

/// A classified connection ready for the HTTP engine.
pub struct Accepted {
    pub stream: ClassifiedStream<TcpStream>,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

type Classification =
    Pin<Box<dyn Future<Output = (SocketAddr, SocketAddr, io::Result<ClassifiedStream<TcpStream>>)> + Send>>;

/// A TCP listener that classifies each connection before handing it out.
pub struct SniffingListener {
    inner: TcpListener,
    acceptor: Option<TlsAcceptor>,
    classify_timeout: Option<Duration>,
    pending: FuturesUnordered<Classification>,
}

impl SniffingListener {
    /// Wrap `inner`. With no acceptor every connection is served as plaintext.
    pub fn new(inner: TcpListener, acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            inner,
            acceptor,
            classify_timeout: None,
            pending: FuturesUnordered::new(),
        }
    }

    /// Bound how long a new connection may stay silent before it is dropped.
    pub fn with_classify_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.classify_timeout = timeout;
        self
    }

    pub fn is_secure(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Connections accepted but not yet classified.
    pub fn pending_classifications(&self) -> usize {
        self.pending.len()
    }

    /// Accept the next classified connection.
    ///
    /// Cancel safe: connections awaiting classification stay queued.
    pub async fn accept(&mut self) -> Result<Accepted, AcceptError> {
        loop {
            tokio::select! {
                Some((peer_addr, local_addr, classified)) = self.pending.next(), if !self.pending.is_empty() => {
                    return match classified {
                        Ok(stream) => {
                            tracing::trace!(
                                peer_addr = %peer_addr,
                                tls = stream.is_tls(),
                                "connection classified"
                            );
                            Ok(Accepted { stream, peer_addr, local_addr })
                        }
                        Err(source) => Err(AcceptError::Connection { peer: Some(peer_addr), source }),
                    };
                }
                accepted = self.inner.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(v) => v,
                        Err(e) if is_connection_error(&e) => {
                            return Err(AcceptError::Connection { peer: None, source: e });
                        }
                        Err(e) => return Err(AcceptError::Listener(e)),
                    };
                    tracing::debug!(
                        peer_addr = %peer_addr,
                        pending = self.pending.len(),
                        "connection accepted"
                    );
                    let classification = self.classification(stream, peer_addr);
                    self.pending.push(classification);
                }
            }
        }
    }

    fn classification(&self, stream: TcpStream, peer_addr: SocketAddr) -> Classification {
        let acceptor = self.acceptor.clone();
        let deadline = self.classify_timeout;
        Box::pin(async move {
            let local_addr = match stream.local_addr() {
                Ok(addr) => addr,
                Err(e) => return (peer_addr, peer_addr, Err(e)),
            };
            let classified = match deadline {
                Some(limit) => tokio::time::timeout(limit, classify(stream, acceptor.as_ref()))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no data before classification deadline",
                        ))
                    }),
                None => classify(stream, acceptor.as_ref()).await,
            };
            (peer_addr, local_addr, classified)
        })
    }
}

/// Accept errors that concern one connection rather than the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
