//! Idle and write deadlines for a single connection.
//!
//! hyper enforces the header read timeout itself; the idle and write
//! timeouts are enforced here, below the HTTP engine, so they apply to
//! HTTP/1 and HTTP/2 alike.
//!
//! The idle deadline only runs while no request is in flight on the
//! connection.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

/// A stall timer armed while an operation is pending.
#[derive(Debug)]
struct Deadline {
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    armed: bool,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            sleep: None,
            armed: false,
        }
    }

    /// Called when the operation is pending. Errors once the stall outlasts the timeout.
    fn poll_expired(&mut self, cx: &mut Context<'_>, what: &'static str) -> io::Result<()> {
        let Some(timeout) = self.timeout else {
            return Ok(());
        };
        let timer = self.sleep.get_or_insert_with(|| Box::pin(sleep(timeout)));
        if !self.armed {
            timer.as_mut().reset(Instant::now() + timeout);
            self.armed = true;
        }
        match timer.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.armed = false;
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{what} stalled for {timeout:?}"),
                ))
            }
            Poll::Pending => Ok(()),
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

/// Requests currently being handled on one connection.
#[derive(Debug, Clone, Default)]
pub struct ActiveRequests(Arc<AtomicUsize>);

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a request as started. It counts until the guard is dropped.
    pub fn start(&self) -> RequestGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        RequestGuard(Arc::clone(&self.0))
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }
}

/// Keeps a request counted in [`ActiveRequests`] while alive.
#[derive(Debug)]
pub struct RequestGuard(Arc<AtomicUsize>);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Wraps a stream and fails reads or writes that stall past their timeout.
///
/// `None` disables the corresponding deadline. With [`ActiveRequests`]
/// attached, the read deadline is suspended while any request is active.
#[derive(Debug)]
pub struct DeadlineStream<S> {
    inner: S,
    read: Deadline,
    write: Deadline,
    active: Option<ActiveRequests>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, idle_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            read: Deadline::new(idle_timeout),
            write: Deadline::new(write_timeout),
            active: None,
        }
    }

    /// Only run the idle deadline while `active` has no requests.
    pub fn with_active_requests(mut self, active: ActiveRequests) -> Self {
        self.active = Some(active);
        self
    }

    fn is_idle(&self) -> bool {
        self.active.as_ref().map_or(true, ActiveRequests::is_idle)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.read.disarm();
                Poll::Ready(res)
            }
            Poll::Pending if !this.is_idle() => {
                this.read.disarm();
                Poll::Pending
            }
            Poll::Pending => match this.read.poll_expired(cx, "read") {
                Ok(()) => Poll::Pending,
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> DeadlineStream<S> {
    fn track<T>(&mut self, cx: &mut Context<'_>, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        match poll {
            Poll::Ready(res) => {
                self.write.disarm();
                if res.is_ok() {
                    // Outbound progress restarts the idle clock.
                    self.read.disarm();
                }
                Poll::Ready(res)
            }
            Poll::Pending => match self.write.poll_expired(cx, "write") {
                Ok(()) => Poll::Pending,
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.track(cx, poll)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.track(cx, poll)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.track(cx, poll)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
