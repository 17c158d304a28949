//! One-byte replay wrapper used by protocol classification.
//!
//! # Responsibilities
//! - Hold the byte consumed while classifying a connection
//! - Hand that byte back as the first byte of the next read
//! - Carry an end-of-stream seen during classification forward to the reader
//! - Shut a failed connection down as soon as the failure is seen
//!
//! # Design Decisions
//! - Replay state is an explicit enum, drained exactly once
//! - Everything except the first read goes straight to the inner stream

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What the next read still owes the caller.
#[derive(Debug)]
enum Replay {
    /// The classification byte has not been handed back yet.
    Byte(u8),
    /// The peer closed before sending anything.
    Eof,
    /// A read issued alongside the replayed byte failed.
    Deferred(io::Error),
    /// Nothing left to replay; reads go to the inner stream.
    Drained,
}

/// A stream whose first byte was already consumed and is replayed on read.
///
/// Callers observe exactly the byte sequence the inner stream would have
/// produced had the byte never been read.
#[derive(Debug)]
pub struct PeekedStream<S> {
    inner: S,
    replay: Replay,
}

impl<S> PeekedStream<S> {
    /// Wrap `inner`, replaying `byte` before anything else.
    pub fn new(inner: S, byte: u8) -> Self {
        Self {
            inner,
            replay: Replay::Byte(byte),
        }
    }

    /// Wrap `inner` whose classification read hit end-of-stream.
    ///
    /// The first read returns zero bytes.
    pub fn eof(inner: S) -> Self {
        Self {
            inner,
            replay: Replay::Eof,
        }
    }

    /// The replayed byte, if it has not been read yet.
    pub fn pending_byte(&self) -> Option<u8> {
        match self.replay {
            Replay::Byte(b) => Some(b),
            _ => None,
        }
    }

    /// True once the replay has been handed to a reader.
    pub fn is_drained(&self) -> bool {
        matches!(self.replay, Replay::Drained)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consume the wrapper and return the inner stream.
    ///
    /// A byte that was never replayed is lost.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        // A zero-sized read must not swallow the replay.
        if buf.remaining() == 0 && !matches!(this.replay, Replay::Drained) {
            return Poll::Ready(Ok(()));
        }

        match std::mem::replace(&mut this.replay, Replay::Drained) {
            Replay::Drained => Pin::new(&mut this.inner).poll_read(cx, buf),
            Replay::Eof => Poll::Ready(Ok(())),
            Replay::Deferred(err) => Poll::Ready(Err(err)),
            Replay::Byte(b) => {
                buf.put_slice(&[b]);
                if buf.remaining() > 0 {
                    // Top up from the socket, but never hold the replayed byte
                    // hostage to a read that is not ready yet.
                    if let Poll::Ready(Err(err)) = Pin::new(&mut this.inner).poll_read(cx, buf) {
                        tracing::trace!(error = %err, "read after replayed byte failed; deferring");
                        // Best effort; the error itself is still reported on the next read.
                        let _ = Pin::new(&mut this.inner).poll_shutdown(cx);
                        this.replay = Replay::Deferred(err);
                    }
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
