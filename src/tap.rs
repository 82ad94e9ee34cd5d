//! A writer that forwards everything to its destination and drops a copy
//! of each chunk into a bounded side channel.
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Chunks the side channel holds before the relay waits on its consumer.
pub const FEED_CAPACITY: usize = 50;
const COPY_BUF: usize = 16 * 1024;

/// Tap
#[derive(Debug)]
pub struct Tap<W> {
  inner: W,
  feed: Option<mpsc::Sender<Bytes>>,
}

impl<W: AsyncWrite + Unpin> Tap<W> {
  /// Wrap `inner`; the receiver yields a copy of every written chunk and
  /// ends once the tap is closed or dropped.
  pub fn new(inner: W) -> (Self, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(FEED_CAPACITY);
    (
      Self {
        inner,
        feed: Some(tx),
      },
      rx,
    )
  }

  /// Copy `buf` into the feed, then write all of it to the destination.
  ///
  /// A zero-length write signals end of data: the feed is closed and the
  /// destination is left untouched. A feed whose receiver is gone is
  /// dropped silently and forwarding continues.
  pub async fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    if buf.is_empty() {
      self.close_feed();
      return Ok(0);
    }
    if let Some(feed) = &self.feed {
      if feed.send(Bytes::copy_from_slice(buf)).await.is_err() {
        tracing::trace!("tap receiver went away");
        self.feed = None;
      }
    }
    self.inner.write_all(buf).await?;
    Ok(buf.len())
  }

  /// Close the feed and shut the destination down.
  pub async fn shutdown(&mut self) -> std::io::Result<()> {
    self.close_feed();
    self.inner.shutdown().await
  }

  /// Stop copying; the receiver sees the end of its stream.
  pub fn close_feed(&mut self) {
    self.feed = None;
  }

  /// Whether chunks are still being copied
  pub fn is_tapping(&self) -> bool {
    self.feed.is_some()
  }

  /// Gets a mutable reference to the destination.
  pub fn get_mut(&mut self) -> &mut W {
    &mut self.inner
  }

  /// Unwraps the destination, closing the feed.
  pub fn into_inner(self) -> W {
    self.inner
  }
}

/// Move bytes from `reader` through `tap` until end of file, then send the
/// end-of-data signal. Returns the number of bytes relayed.
pub async fn copy<R, W>(reader: &mut R, tap: &mut Tap<W>) -> std::io::Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; COPY_BUF];
  let mut total = 0u64;
  loop {
    let n = match reader.read(&mut buf).await {
      Ok(n) => n,
      Err(e) => {
        tap.close_feed();
        return Err(e);
      }
    };
    if n == 0 {
      tap.write(&[]).await?;
      tap.get_mut().flush().await?;
      return Ok(total);
    }
    tap.write(&buf[..n]).await?;
    total += n as u64;
  }
}
