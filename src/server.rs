//! TCP acceptor for the logged and unlogged listeners
use crate::context::Context;
use crate::errors::Result;
use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, info_span, Instrument};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bound listeners, ready to accept.
pub struct Server {
  ctx: Arc<Context>,
  listeners: Vec<(TcpListener, bool)>,
}

impl Server {
  /// Bind `listen` (logged) and, when given, `listen_alt` (unlogged).
  pub async fn bind(ctx: Arc<Context>, listen: &str, listen_alt: Option<&str>) -> Result<Self> {
    let mut listeners = vec![(TcpListener::bind(listen).await?, true)];
    if let Some(alt) = listen_alt {
      listeners.push((TcpListener::bind(alt).await?, false));
    }
    for (listener, logged) in &listeners {
      info!(
        "Listening on {} ({})",
        listener.local_addr()?,
        if *logged { "logged" } else { "unlogged" }
      );
    }
    Ok(Self { ctx, listeners })
  }

  /// Local addresses with their logged flag, in bind order
  pub fn local_addrs(&self) -> Vec<(SocketAddr, bool)> {
    self
      .listeners
      .iter()
      .filter_map(|(l, logged)| l.local_addr().ok().map(|a| (a, *logged)))
      .collect()
  }

  /// Accept on every listener until the process exits.
  pub async fn run(self) {
    let mut tasks = Vec::new();
    for (listener, logged) in self.listeners {
      tasks.push(tokio::spawn(accept_loop(listener, self.ctx.clone(), logged)));
    }
    for task in tasks {
      if let Err(e) = task.await {
        error!("accept loop stopped: {}", e);
      }
    }
  }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<Context>, logged: bool) {
  loop {
    match listener.accept().await {
      Ok((stream, peer)) => on_connect(&ctx, stream, peer, logged),
      Err(e) => {
        error!("accept failed: {}", e);
        tokio::time::sleep(ACCEPT_BACKOFF).await;
      }
    }
  }
}

/// Register and spawn a session for an accepted connection.
pub fn on_connect(ctx: &Arc<Context>, stream: TcpStream, peer: SocketAddr, logged: bool) {
  info!("Connection from: {}", peer);
  if let Err(e) = stream.set_nodelay(true) {
    tracing::debug!("set_nodelay: {}", e);
  }
  let guard = ctx.sessions().register(peer, logged);
  let span = info_span!("session", id = guard.id(), %peer);
  let session = Session::new(guard.id(), stream, peer, ctx.clone(), logged);
  let sessions = ctx.sessions().clone();
  tokio::spawn(
    async move {
      session.handle().await;
      drop(guard);
      let live = sessions.list();
      if let Some(oldest) = live.first() {
        tracing::debug!(
          "{} sessions live, oldest #{} from {} open for {:?}",
          live.len(),
          oldest.id,
          oldest.peer,
          oldest.started.elapsed()
        );
      }
    }
    .instrument(span),
  );
}
