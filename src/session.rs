//! Per-connection orchestration
//!
//! A session starts as a raw TCP connection and grows a chain of layers as
//! protocols are recognized: SOCKS5 on top of TCP, then optionally TLS on top
//! of the SOCKS5 tunnel. Whatever the outcome, every layer is closed when the
//! session ends.
use crate::conn::{BoxStream, Conn, Stream};
use crate::context::Context;
use crate::errors::{new_io_error, Error, Result};
use crate::relay;
use crate::sniff;
use crate::socks5::{Socks5Server, TargetAddr};
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One protocol layer of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
  /// accepted TCP connection
  Tcp {
    /// client address
    peer: SocketAddr,
  },
  /// SOCKS5 CONNECT tunnel
  Socks5 {
    /// requested destination
    target: TargetAddr,
  },
  /// intercepted TLS
  Tls {
    /// name presented to the remote
    server_name: String,
  },
}

impl fmt::Display for Layer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Layer::Tcp { peer } => write!(f, "tcp({})", peer),
      Layer::Socks5 { target } => write!(f, "socks5({})", target),
      Layer::Tls { server_name } => write!(f, "tls({})", server_name),
    }
  }
}

#[derive(Debug, Clone, Copy)]
enum Protocol {
  Socks5,
  Tls,
  Http,
}

/// Session
pub struct Session {
  id: u64,
  ctx: Arc<Context>,
  conn: Option<Conn<BoxStream>>,
  layers: Vec<Layer>,
  log_http: bool,
}

impl Session {
  /// New session over an accepted connection. `log_http` is false for
  /// sessions from the unlogged listener.
  pub fn new<S: Stream + 'static>(
    id: u64,
    stream: S,
    peer: SocketAddr,
    ctx: Arc<Context>,
    log_http: bool,
  ) -> Self {
    Self {
      id,
      ctx,
      conn: Some(Conn::new(Box::new(stream))),
      layers: vec![Layer::Tcp { peer }],
      log_http,
    }
  }

  /// Session id
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Layers pushed so far, outermost first
  pub fn layers(&self) -> &[Layer] {
    &self.layers
  }

  /// Whether [`Session::close`] ran or the connection was handed to a relay
  pub fn is_closed(&self) -> bool {
    self.conn.is_none()
  }

  /// Close the current top layer, which tears down the ones below it.
  /// Safe to call more than once.
  pub async fn close(&mut self) {
    if let Some(mut conn) = self.conn.take() {
      if let Err(e) = conn.close().await {
        debug!("close: {}", e);
      }
      debug!("closed {}", self.describe());
    }
  }

  /// Run the session to completion and close it.
  pub async fn handle(mut self) {
    match self.run().await {
      Ok(()) => debug!("session finished: {}", self.describe()),
      Err(e @ Error::Dial { .. }) => info!("{}", e),
      Err(e) => debug!("session failed: {}", e),
    }
    self.close().await;
  }

  fn describe(&self) -> String {
    self
      .layers
      .iter()
      .map(ToString::to_string)
      .collect::<Vec<_>>()
      .join(" > ")
  }

  fn conn_mut(&mut self) -> Result<&mut Conn<BoxStream>> {
    self
      .conn
      .as_mut()
      .ok_or_else(|| new_io_error(ErrorKind::NotConnected, "session closed"))
  }

  fn take_conn(&mut self) -> Result<Conn<BoxStream>> {
    self
      .conn
      .take()
      .ok_or_else(|| new_io_error(ErrorKind::NotConnected, "session closed"))
  }

  /// Replace the top of the chain with `stream`.
  fn chain<S: Stream + 'static>(&mut self, stream: S, layer: Layer) {
    debug!("push {}", layer);
    self.conn = Some(Conn::new(Box::new(stream)));
    self.layers.push(layer);
  }

  /// Check whether the buffered connection speaks `protocol`. A client that stays
  /// silent for `timeout` does not match.
  async fn sniff(&mut self, timeout: Duration, protocol: Protocol) -> Result<bool> {
    let conn = self.conn_mut()?;
    let check = async {
      match protocol {
        Protocol::Socks5 => sniff::is_socks5(conn).await,
        Protocol::Tls => sniff::is_tls(conn).await,
        Protocol::Http => sniff::is_http(conn).await,
      }
    };
    Ok(tokio::time::timeout(timeout, check).await.unwrap_or(false))
  }

  async fn run(&mut self) -> Result<()> {
    let handshake_timeout = self.ctx.handshake_timeout();
    if !self.sniff(handshake_timeout, Protocol::Socks5).await? {
      if self.sniff(handshake_timeout, Protocol::Http).await? {
        info!("Detected HTTP, not a SOCKS5 client");
      } else {
        info!("SOCKS not detected");
      }
      return Ok(());
    }

    let conn = self.conn_mut()?;
    let request = tokio::time::timeout(handshake_timeout, Socks5Server::handshake(conn))
      .await
      .map_err(|_| new_io_error(ErrorKind::TimedOut, "socks5 handshake timed out"))??;
    let target = request.target;
    info!("CONNECT: {}", target);
    self.layers.push(Layer::Socks5 {
      target: target.clone(),
    });

    let sniff_timeout = self.ctx.sniff_timeout();
    if self.sniff(sniff_timeout, Protocol::Tls).await? {
      self.intercept(&target).await
    } else {
      let remote = self.ctx.dial(&target.to_host_port()).await?;
      self.relay(remote, target.host()).await
    }
  }

  async fn intercept(&mut self, target: &TargetAddr) -> Result<()> {
    let sni = sniff::peek_server_name(self.conn_mut()?).await;
    let server_name = sni.unwrap_or_else(|| target.host());
    info!("TLS detected, server name {}", server_name);

    let remote = self.ctx.dial(&target.to_host_port()).await?;
    let remote = self.ctx.tls().connect_remote(remote, &server_name).await?;
    let client = self.take_conn()?;
    let client = self.ctx.tls().accept_client(client, &target.host()).await?;
    self.chain(client, Layer::Tls { server_name });
    self.relay(remote, target.host()).await
  }

  async fn relay<R: Stream>(&mut self, remote: R, host: String) -> Result<()> {
    let client = self.take_conn()?;
    if self.log_http && self.ctx.log_http() {
      debug!("logging HTTP for {}", host);
      relay::pipe_logged(
        client,
        remote,
        host,
        self.ctx.exporter().clone(),
        self.ctx.read_timeout(),
      )
      .await;
    } else {
      relay::pipe(client, remote).await;
    }
    Ok(())
  }
}
