//! An owned read buffer over a Tokio byte stream.
//!
//! [`Prebuffered`] lets the wire decoders accumulate input, inspect it, and
//! consume it piecewise. Reads through its own `AsyncRead` impl drain the
//! buffer before falling through to the inner stream, and writes pass
//! straight through, so a stream can change hands between decoders without
//! losing bytes that were read ahead.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 8 * 1024;

/// A read buffer wrapped around a byte stream.
pub struct Prebuffered<S> {
    inner: S,
    buf: BytesMut,
}

impl<S> std::fmt::Debug for Prebuffered<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prebuffered")
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + Unpin> Prebuffered<S> {
    pub fn new(inner: S) -> Self {
        Self::with_initial(inner, Bytes::new())
    }

    /// Wraps `inner` with `initial` as bytes that were already read from it.
    pub fn with_initial(inner: S, initial: Bytes) -> Self {
        let mut buf = BytesMut::with_capacity(INITIAL_CAPACITY.max(initial.len()));
        buf.extend_from_slice(&initial);
        Self { inner, buf }
    }

    /// Returns the unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Discards `n` bytes from the front of the buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Removes and returns the first `n` buffered bytes.
    pub(crate) fn split_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Removes and returns everything buffered.
    pub(crate) fn take_buffer(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Buffers more data from the inner reader.
    ///
    /// Returns the number of bytes read; zero means the stream ended.
    pub(crate) async fn buffer_more(&mut self) -> io::Result<usize> {
        self.buf.reserve(INITIAL_CAPACITY);
        self.inner.read_buf(&mut self.buf).await
    }

    /// Reads until at least `len` bytes are buffered.
    ///
    /// Returns false if the stream ended first.
    pub(crate) async fn fill_to(&mut self, len: usize) -> io::Result<bool> {
        while self.buf.len() < len {
            if self.buffer_more().await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reads until the inner stream ends, then returns everything buffered.
    pub(crate) async fn read_remaining(&mut self) -> io::Result<Bytes> {
        while self.buffer_more().await? != 0 {}
        Ok(self.take_buffer())
    }

    /// Returns the buffer and the inner stream.
    pub(crate) fn into_parts(self) -> (Bytes, S) {
        (self.buf.freeze(), self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !out.has_remaining_mut() {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining_mut());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
