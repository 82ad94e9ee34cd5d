//! Buffered connection with non-consuming lookahead.
//!
//! Every protocol sniffer works on a [`Conn`]: bytes pulled in by [`Conn::peek`]
//! stay in the read buffer and are handed out again by the consuming reads,
//! so a layer stacked on top (SOCKS5 decoder, TLS acceptor, HTTP parser) sees
//! the stream from its very first byte.
use std::io::{Error, ErrorKind};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Upper bound for a single lookahead; a TLS record never exceeds this.
pub const MAX_PEEK: usize = 5 + 16 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// Anything a [`Conn`] can wrap once boxed.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A type erased stream, used when layers are swapped at runtime.
pub type BoxStream = Box<dyn Stream>;

/// Conn
#[derive(Debug)]
pub struct Conn<S> {
  inner: S,
  buf: Vec<u8>,
  pos: usize,
  closed: bool,
}

impl<S> Conn<S> {
  /// Wrap a raw stream.
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      buf: Vec::new(),
      pos: 0,
      closed: false,
    }
  }
  /// Number of bytes read from the underlying stream but not yet consumed.
  pub fn buffered(&self) -> usize {
    self.buf.len() - self.pos
  }
  /// Whether [`Conn::close`] or a shutdown already ran.
  pub fn is_closed(&self) -> bool {
    self.closed
  }
  /// Gets a reference to the underlying stream.
  pub fn get_ref(&self) -> &S {
    &self.inner
  }
  /// Gets a mutable reference to the underlying stream.
  ///
  /// Reading from it directly skips any buffered bytes.
  pub fn get_mut(&mut self) -> &mut S {
    &mut self.inner
  }
  fn compact(&mut self) {
    if self.pos == 0 {
      return;
    }
    if self.pos >= self.buf.len() {
      self.buf.clear();
    } else {
      self.buf.drain(..self.pos);
    }
    self.pos = 0;
  }
  fn consume_buffered(&mut self, amt: usize) {
    self.pos = std::cmp::min(self.pos + amt, self.buf.len());
  }
}

impl<S: AsyncRead + Unpin> Conn<S> {
  fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<usize>> {
    let start = self.buf.len();
    self.buf.resize(start + READ_CHUNK, 0);
    let mut read_buf = ReadBuf::new(&mut self.buf[start..]);
    let res = Pin::new(&mut self.inner).poll_read(cx, &mut read_buf);
    let n = read_buf.filled().len();
    self.buf.truncate(start + n);
    match res {
      Poll::Ready(Ok(())) => Poll::Ready(Ok(n)),
      Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
      Poll::Pending => Poll::Pending,
    }
  }
  /// Returns up to `n` bytes without consuming them.
  ///
  /// Waits until `n` bytes are buffered; a shorter slice comes back only when
  /// the underlying stream hit end of file first.
  pub async fn peek(&mut self, n: usize) -> std::io::Result<&[u8]> {
    if n > MAX_PEEK {
      return Err(Error::new(
        ErrorKind::InvalidInput,
        format!("peek of {} bytes exceeds {}", n, MAX_PEEK),
      ));
    }
    if self.buffered() < n {
      self.compact();
    }
    while self.buffered() < n {
      let read = std::future::poll_fn(|cx| self.poll_fill(cx)).await?;
      if read == 0 {
        break;
      }
    }
    let end = self.pos + std::cmp::min(n, self.buffered());
    Ok(&self.buf[self.pos..end])
  }
}

impl<S: AsyncWrite + Unpin> Conn<S> {
  /// Shuts the write side down once; later calls are no-ops.
  pub async fn close(&mut self) -> std::io::Result<()> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    match self.inner.shutdown().await {
      Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
      res => res,
    }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Conn<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if this.buffered() == 0 {
      this.compact();
      return Pin::new(&mut this.inner).poll_read(cx, buf);
    }
    let n = std::cmp::min(buf.remaining(), this.buffered());
    buf.put_slice(&this.buf[this.pos..this.pos + n]);
    this.consume_buffered(n);
    Poll::Ready(Ok(()))
  }
}

impl<S: AsyncRead + Unpin> AsyncBufRead for Conn<S> {
  fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<&[u8]>> {
    let this = self.get_mut();
    if this.buffered() == 0 {
      this.compact();
      ready!(this.poll_fill(cx))?;
    }
    Poll::Ready(Ok(&this.buf[this.pos..]))
  }

  fn consume(self: Pin<&mut Self>, amt: usize) {
    self.get_mut().consume_buffered(amt);
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Conn<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    if self.closed {
      return Poll::Ready(Ok(()));
    }
    let res = ready!(Pin::new(&mut self.inner).poll_shutdown(cx));
    self.closed = true;
    match res {
      Err(e) if e.kind() == ErrorKind::NotConnected => Poll::Ready(Ok(())),
      res => Poll::Ready(res),
    }
  }
}
