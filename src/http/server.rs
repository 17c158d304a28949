//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Bind the listening socket (or take one from the caller)
//! - Load the optional credential pair
//! - Build the sniffing listener and run the accept loop
//! - Serve each connection with HTTP/1.1 and HTTP/2 on its own task
//! - Attach `ConnectionInfo` to every request before the handler sees it
//! - Drain connections on shutdown

use std::borrow::Cow;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::{Service, ServiceExt};
use tracing::Instrument;

use crate::config::{ServerConfig, TimeoutConfig};
use crate::net::deadline::{ActiveRequests, DeadlineStream, RequestGuard};
use crate::net::listener::{Accepted, SniffingListener};
use crate::net::tls::{self, NegotiatedProtocol, TlsError};
use crate::net::{ConnectionId, ConnectionInfo};
use crate::observability::metrics;

/// hyper refuses HTTP/1 read buffers smaller than this.
const MIN_HTTP1_BUF_SIZE: usize = 8192;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by the serve entry points.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot start listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Credentials(#[from] TlsError),

    #[error("listener failed: {0}")]
    Accept(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Per-connection settings derived from [`ServerConfig`].
#[derive(Debug, Clone)]
struct ConnectionSettings {
    handshake_timeout: Duration,
    header_read_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_header_bytes: usize,
    http2: bool,
}

impl ConnectionSettings {
    fn from_config(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.timeouts.classify(),
            header_read_timeout: config.timeouts.read_header(),
            idle_timeout: config.timeouts.idle(),
            write_timeout: config.timeouts.write(),
            max_header_bytes: config.max_header_bytes,
            http2: config.http2,
        }
    }

    /// Connection builder for a stream whose ALPN outcome is `protocol`.
    fn builder(&self, protocol: NegotiatedProtocol) -> auto::Builder<TokioExecutor> {
        let mut builder = auto::Builder::new(TokioExecutor::new());

        {
            let mut http1 = builder.http1();
            http1
                .timer(TokioTimer::new())
                .max_buf_size(self.max_header_bytes.max(MIN_HTTP1_BUF_SIZE));
            if let Some(timeout) = self.header_read_timeout {
                http1.header_read_timeout(timeout);
            }
        }
        builder
            .http2()
            .timer(TokioTimer::new())
            .max_header_list_size(u32::try_from(self.max_header_bytes).unwrap_or(u32::MAX));

        match protocol {
            NegotiatedProtocol::H2 => builder.http2_only(),
            NegotiatedProtocol::Http1 => builder.http1_only(),
            NegotiatedProtocol::None if !self.http2 => builder.http1_only(),
            NegotiatedProtocol::None => builder,
        }
    }
}

/// Serves TLS and plaintext HTTP from one listening socket.
pub struct MultiplexingServer {
    config: ServerConfig,
}

impl MultiplexingServer {
    /// Create a new server with the given configuration. Performs no I/O.
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind `config.bind_address` and serve until the listener fails.
    pub async fn listen_and_serve<S, B>(self, handler: S) -> Result<(), ServerError>
    where
        S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
        S::Future: Send + 'static,
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        self.listen_and_serve_with_shutdown(handler, std::future::pending())
            .await
    }

    /// Bind `config.bind_address` and serve until `signal` resolves.
    pub async fn listen_and_serve_with_shutdown<S, B, F>(
        self,
        handler: S,
        signal: F,
    ) -> Result<(), ServerError>
    where
        S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
        S::Future: Send + 'static,
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&*bind_target(&self.config.bind_address))
            .await
            .map_err(|source| ServerError::Bind {
                address: self.config.bind_address.clone(),
                source,
            })?;
        self.serve_with_shutdown(listener, handler, signal).await
    }

    /// Serve on an already-bound listener until it fails.
    pub async fn serve<S, B>(self, listener: TcpListener, handler: S) -> Result<(), ServerError>
    where
        S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
        S::Future: Send + 'static,
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        self.serve_with_shutdown(listener, handler, std::future::pending())
            .await
    }

    /// Serve on an already-bound listener until `signal` resolves.
    ///
    /// Credential problems are reported before the first accept. After
    /// `signal` resolves, no new connections are accepted and in-flight
    /// connections are shut down gracefully before this returns.
    pub async fn serve_with_shutdown<S, B, F>(
        self,
        listener: TcpListener,
        handler: S,
        signal: F,
    ) -> Result<(), ServerError>
    where
        S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
        S::Future: Send + 'static,
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
        F: Future<Output = ()> + Send,
    {
        let acceptor = tls::load_credentials(
            &self.config.tls.cert_path,
            &self.config.tls.key_path,
            self.config.http2,
        )?;

        let mut listener = SniffingListener::new(listener, acceptor)
            .with_classify_timeout(Some(self.config.timeouts.classify()));
        let local_addr = listener.local_addr()?;
        let settings = Arc::new(ConnectionSettings::from_config(&self.config));

        tracing::info!(
            address = %local_addr,
            secure = listener.is_secure(),
            http2 = settings.http2,
            "multiplexing server listening"
        );

        let (drain_tx, drain_rx) = watch::channel(());
        tokio::pin!(signal);

        let result = loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut signal => {
                    tracing::info!("shutdown requested; no longer accepting connections");
                    break Ok(());
                }
            };

            match accepted {
                Ok(accepted) => {
                    let id = ConnectionId::new();
                    let span = tracing::debug_span!(
                        "connection",
                        id = %id,
                        peer_addr = %accepted.peer_addr,
                    );
                    tokio::spawn(
                        serve_connection(
                            id,
                            accepted,
                            handler.clone(),
                            Arc::clone(&settings),
                            drain_rx.clone(),
                        )
                        .instrument(span),
                    );
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "listener failed; stopping server");
                    break Err(ServerError::Accept(e.into_io()));
                }
                Err(e) => {
                    metrics::record_classification_failure();
                    tracing::debug!(error = %e, "connection dropped before serving");
                }
            }
        };

        drop(listener);
        drop(drain_rx);

        if result.is_ok() {
            drain_tx.send_replace(());
            drain_tx.closed().await;
            tracing::info!("all connections drained");
        }
        result
    }
}

/// `:port` binds every interface.
fn bind_target(address: &str) -> Cow<'_, str> {
    match address.strip_prefix(':') {
        Some(port) => Cow::Owned(format!("0.0.0.0:{port}")),
        None => Cow::Borrowed(address),
    }
}

/// Drive one classified connection to completion.
async fn serve_connection<S, B>(
    id: ConnectionId,
    accepted: Accepted,
    handler: S,
    settings: Arc<ConnectionSettings>,
    mut drain: watch::Receiver<()>,
) where
    S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let started = Instant::now();
    let Accepted {
        stream,
        peer_addr,
        local_addr,
    } = accepted;

    let negotiated = tokio::select! {
        negotiated = tokio::time::timeout(settings.handshake_timeout, stream.negotiate()) => {
            negotiated.unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out")))
        }
        _ = drain.changed() => {
            tracing::debug!("shutdown during tls handshake; dropping connection");
            return;
        }
    };
    let stream = match negotiated {
        Ok(stream) => stream,
        Err(e) => {
            metrics::record_handshake_failure();
            tracing::debug!(error = %e, "tls handshake failed");
            return;
        }
    };

    let info = ConnectionInfo {
        id,
        peer_addr,
        local_addr,
        secure: stream.is_secure(),
        protocol: stream.negotiated_protocol(),
    };
    let transport = info.transport();
    metrics::record_accepted(transport);
    tracing::debug!(transport, protocol = ?info.protocol, "serving connection");

    let builder = settings.builder(info.protocol);
    let active = ActiveRequests::new();
    let io = TokioIo::new(
        DeadlineStream::new(stream, settings.idle_timeout, settings.write_timeout)
            .with_active_requests(active.clone()),
    );
    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(info.clone());
        let guard = active.start();
        let response = handler.clone().oneshot(request);
        async move {
            let response = response.await?;
            Ok::<_, Infallible>(response.map(|body| TrackedBody::new(body, guard)))
        }
    });

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = drain.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    match result {
        Ok(()) => tracing::debug!("connection closed"),
        Err(e) => tracing::debug!(error = %e, "connection ended with error"),
    }
    metrics::record_connection_closed(transport, started);
}

/// Response body that keeps its request counted as active until the body
/// has been sent (or dropped).
struct TrackedBody<B> {
    inner: Pin<Box<B>>,
    _guard: RequestGuard,
}

impl<B> TrackedBody<B> {
    fn new(body: B, guard: RequestGuard) -> Self {
        Self {
            inner: Box::pin(body),
            _guard: guard,
        }
    }
}

impl<B: Body> Body for TrackedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.inner.as_mut().poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Bind `addr` and serve `handler` with every timeout disabled.
///
/// Connections that never send a byte are still dropped after
/// [`CLASSIFY_TIMEOUT_FLOOR`](crate::config::schema::CLASSIFY_TIMEOUT_FLOOR).
/// TLS is enabled when both `cert_file` and `key_file` exist.
pub async fn multi_listen_and_serve<S, B>(
    addr: impl Into<String>,
    handler: S,
    cert_file: &str,
    key_file: &str,
) -> Result<(), ServerError>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let mut config = ServerConfig::with_address(addr).with_tls(cert_file, key_file);
    config.timeouts = TimeoutConfig::disabled();
    MultiplexingServer::new(config).listen_and_serve(handler).await
}

/// Serve `handler` on `listener` with every timeout disabled.
///
/// TLS is enabled when both `cert_file` and `key_file` exist.
pub async fn multi_serve<S, B>(
    listener: TcpListener,
    handler: S,
    cert_file: &str,
    key_file: &str,
) -> Result<(), ServerError>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let mut config = ServerConfig::default().with_tls(cert_file, key_file);
    config.timeouts = TimeoutConfig::disabled();
    if let Ok(addr) = listener.local_addr() {
        config.bind_address = addr.to_string();
    }
    MultiplexingServer::new(config).serve(listener, handler).await
}
