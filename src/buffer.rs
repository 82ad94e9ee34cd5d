//! Append-only in-memory log with independent readers.
//!
//! One producer appends chunks; any number of [`Reader`]s walk the log from
//! the start at their own pace. Readers block until data arrives, the log
//! is closed, or their optional timeout elapses.
use crate::errors::{Error, Result};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio::time::Sleep;

#[derive(Debug, Default)]
struct State {
  chunks: Vec<Bytes>,
  closed: bool,
}

impl State {
  /// Grows on every append and on close.
  fn generation(&self) -> usize {
    self.chunks.len() * 2 + usize::from(self.closed)
  }
}

#[derive(Debug, Default)]
struct Shared {
  state: Mutex<State>,
  notify: Notify,
  readers: AtomicUsize,
  had_reader: AtomicBool,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Readers existed and every one of them is gone.
  fn is_abandoned(&self) -> bool {
    self.had_reader.load(Ordering::Acquire) && self.readers.load(Ordering::Acquire) == 0
  }
}

/// Producer handle. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
  shared: Arc<Shared>,
}

impl Buffer {
  /// Empty open buffer
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a chunk and wake every waiting reader.
  ///
  /// Empty chunks and writes after [`Buffer::close`] are ignored.
  pub fn write(&self, chunk: impl Into<Bytes>) {
    let chunk = chunk.into();
    if chunk.is_empty() {
      return;
    }
    {
      let mut state = self.shared.lock();
      if state.closed {
        tracing::trace!("dropping {} bytes written after close", chunk.len());
        return;
      }
      state.chunks.push(chunk);
    }
    self.shared.notify.notify_waiters();
  }

  /// Mark the end of the log. Returns `false` if it was already closed.
  pub fn close(&self) -> bool {
    {
      let mut state = self.shared.lock();
      if state.closed {
        return false;
      }
      state.closed = true;
    }
    self.shared.notify.notify_waiters();
    true
  }

  /// Whether [`Buffer::close`] ran
  pub fn is_closed(&self) -> bool {
    self.shared.lock().closed
  }

  /// Number of bytes held by the log
  pub fn len(&self) -> usize {
    self.shared.lock().chunks.iter().map(Bytes::len).sum()
  }

  /// No bytes appended yet
  pub fn is_empty(&self) -> bool {
    self.shared.lock().chunks.is_empty()
  }

  /// A new reader positioned at the start of the log.
  pub fn reader(&self) -> Reader {
    self.shared.readers.fetch_add(1, Ordering::AcqRel);
    self.shared.had_reader.store(true, Ordering::Release);
    Reader {
      shared: self.shared.clone(),
      chunk: 0,
      offset: 0,
      timeout: None,
      wait: None,
      deadline: None,
    }
  }

  /// Append everything received on `feed`, then close.
  ///
  /// Once every reader created so far has been dropped nobody can observe
  /// the log any more: the feed is released, which stops the tap from
  /// copying, and the retained chunks are freed.
  pub async fn consume(self, mut feed: mpsc::Receiver<Bytes>) {
    while let Some(chunk) = feed.recv().await {
      if self.shared.is_abandoned() {
        break;
      }
      self.write(chunk);
    }
    drop(feed);
    self.close();
    if self.shared.is_abandoned() {
      tracing::debug!("all readers gone, released the feed");
      self.shared.lock().chunks.clear();
    }
  }
}

type WaitFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Independent cursor over a [`Buffer`].
pub struct Reader {
  shared: Arc<Shared>,
  chunk: usize,
  offset: usize,
  timeout: Option<Duration>,
  wait: Option<WaitFuture>,
  deadline: Option<Pin<Box<Sleep>>>,
}

impl std::fmt::Debug for Reader {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Reader")
      .field("chunk", &self.chunk)
      .field("offset", &self.offset)
      .field("timeout", &self.timeout)
      .finish()
  }
}

impl Reader {
  /// How long a read may wait for new data; `None` waits forever.
  pub fn set_timeout(&mut self, timeout: Option<Duration>) {
    self.timeout = timeout;
    self.deadline = None;
  }

  /// Current timeout
  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  /// Read into `out`, waiting for data if the cursor is at the end.
  ///
  /// Fails with [`Error::EndOfStream`] once the buffer is closed and fully
  /// read, or [`Error::Timeout`] when nothing arrived in time. A timed out
  /// reader keeps its position and can be read again.
  pub async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
    std::future::poll_fn(|cx| self.poll_fill(cx, out)).await
  }

  fn reset_wait(&mut self) {
    self.wait = None;
    self.deadline = None;
  }

  fn poll_fill(&mut self, cx: &mut Context<'_>, out: &mut [u8]) -> Poll<Result<usize>> {
    if out.is_empty() {
      return Poll::Ready(Ok(0));
    }
    loop {
      let shared = self.shared.clone();
      let generation = {
        let state = shared.lock();
        if self.chunk < state.chunks.len() {
          let n = copy_out(&state.chunks, &mut self.chunk, &mut self.offset, out);
          drop(state);
          self.reset_wait();
          return Poll::Ready(Ok(n));
        }
        if state.closed {
          drop(state);
          self.reset_wait();
          return Poll::Ready(Err(Error::EndOfStream));
        }
        state.generation()
      };

      let wait = self
        .wait
        .get_or_insert_with(|| Box::pin(wait_for_change(shared, generation)));
      if wait.as_mut().poll(cx).is_ready() {
        self.wait = None;
        continue;
      }

      if self.deadline.is_none() {
        if let Some(timeout) = self.timeout {
          self.deadline = Some(Box::pin(tokio::time::sleep(timeout)));
        }
      }
      if let Some(deadline) = self.deadline.as_mut() {
        ready!(deadline.as_mut().poll(cx));
        self.reset_wait();
        return Poll::Ready(Err(Error::Timeout));
      }
      return Poll::Pending;
    }
  }
}

fn copy_out(chunks: &[Bytes], chunk: &mut usize, offset: &mut usize, out: &mut [u8]) -> usize {
  let mut written = 0;
  while written < out.len() && *chunk < chunks.len() {
    let current = &chunks[*chunk];
    let available = &current[*offset..];
    let n = std::cmp::min(available.len(), out.len() - written);
    out[written..written + n].copy_from_slice(&available[..n]);
    written += n;
    *offset += n;
    if *offset == current.len() {
      *chunk += 1;
      *offset = 0;
    }
  }
  written
}

async fn wait_for_change(shared: Arc<Shared>, seen: usize) {
  loop {
    let notified = shared.notify.notified();
    tokio::pin!(notified);
    // register before checking so a write in between is not missed
    notified.as_mut().enable();
    if shared.lock().generation() != seen {
      return;
    }
    notified.await;
  }
}

impl Drop for Reader {
  fn drop(&mut self) {
    self.shared.readers.fetch_sub(1, Ordering::AcqRel);
  }
}

impl AsyncRead for Reader {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    let out = buf.initialize_unfilled();
    match ready!(this.poll_fill(cx, out)) {
      Ok(n) => {
        buf.advance(n);
        Poll::Ready(Ok(()))
      }
      Err(Error::EndOfStream) => Poll::Ready(Ok(())),
      Err(e) => Poll::Ready(Err(e.into())),
    }
  }
}
