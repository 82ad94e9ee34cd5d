//! Outbound address rewriting and dialing.
use crate::errors::{new_io_error, Error, Result};
use serde::{Deserialize, Serialize};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tracing::info;

/// Mapping from `host:port` or bare `host` to a replacement.
///
/// An exact `host:port` entry replaces the whole address. A bare `host`
/// entry replaces only the host and keeps the requested port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Wiring(HashMap<String, String>);

impl Wiring {
  /// Empty table: every address routes to itself.
  pub fn new() -> Self {
    Self::default()
  }

  /// Add or replace one entry.
  pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
    self.0.insert(from.into(), to.into());
  }

  /// Number of entries
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// No entries
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Rewrite a full `host:port` address.
  pub fn route(&self, address: &str) -> Result<String> {
    if let Some(to) = self.0.get(address) {
      return Ok(to.clone());
    }
    let (host, port) = split_host_port(address)?;
    Ok(join_host_port(&self.route_host(&host, port), port))
  }

  /// Rewrite only the host part of `host:port`.
  pub fn route_host(&self, host: &str, port: u16) -> String {
    if let Some(to) = self.0.get(&join_host_port(host, port)) {
      return split_host_port(to)
        .map(|(h, _)| h)
        .unwrap_or_else(|_| to.clone());
    }
    self.0.get(host).cloned().unwrap_or_else(|| host.to_string())
  }
}

impl FromIterator<(String, String)> for Wiring {
  fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// Split `host:port` or `[v6]:port`.
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
  let invalid = || new_io_error(ErrorKind::InvalidInput, &format!("invalid address {}", address));
  let (host, port) = if let Some(rest) = address.strip_prefix('[') {
    let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
    (host, rest.strip_prefix(':').ok_or_else(invalid)?)
  } else {
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.contains(':') {
      return Err(invalid());
    }
    (host, port)
  };
  let port = port.parse().map_err(|_| invalid())?;
  Ok((host.to_string(), port))
}

/// Inverse of [`split_host_port`]; IPv6 hosts get brackets.
pub fn join_host_port(host: &str, port: u16) -> String {
  if host.contains(':') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}

/// Opens TCP connections to remote targets after routing them.
#[derive(Debug, Clone)]
pub struct Dialer {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
}

impl Default for Dialer {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: true,
    }
  }
}

impl Dialer {
  /// Dialer with the given connect timeout
  pub fn new(connect_timeout: Option<Duration>) -> Self {
    Self {
      connect_timeout,
      ..Self::default()
    }
  }

  /// Route `address` through `wiring` and connect to the result.
  ///
  /// Every resolved address is tried in turn; the last failure is returned.
  pub async fn dial(&self, wiring: &Wiring, address: &str) -> Result<TcpStream> {
    let routed = wiring.route(address)?;
    if routed != address {
      info!("Routed {} -> {}", address, routed);
    }
    let addrs = tokio::net::lookup_host(routed.as_str())
      .await
      .map_err(|source| Error::Dial {
        address: routed.clone(),
        source,
      })?;
    let mut last_err = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => last_err = Some(e),
      }
    }
    Err(Error::Dial {
      address: routed,
      source: last_err
        .unwrap_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no addresses resolved")),
    })
  }

  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    match self.connect_timeout {
      None => socket.connect(addr).await,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| std::io::Error::new(ErrorKind::TimedOut, x.to_string()))?,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn wiring(entries: &[(&str, &str)]) -> Wiring {
    entries
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn exact_entry_replaces_whole_address() {
    let w = wiring(&[("api.example.com:443", "127.0.0.1:8443")]);
    assert_eq!(w.route("api.example.com:443").unwrap(), "127.0.0.1:8443");
    assert_eq!(w.route("api.example.com:80").unwrap(), "api.example.com:80");
  }

  #[test]
  fn host_entry_keeps_port() {
    let w = wiring(&[("example.com", "10.0.0.5")]);
    assert_eq!(w.route("example.com:443").unwrap(), "10.0.0.5:443");
    assert_eq!(w.route("example.com:8080").unwrap(), "10.0.0.5:8080");
    assert_eq!(w.route("other.com:443").unwrap(), "other.com:443");
  }

  #[test]
  fn route_host_prefers_exact_entry() {
    let w = wiring(&[("example.com:443", "10.0.0.1:9443"), ("example.com", "10.0.0.2")]);
    assert_eq!(w.route_host("example.com", 443), "10.0.0.1");
    assert_eq!(w.route_host("example.com", 80), "10.0.0.2");
    assert_eq!(w.route_host("nowhere.test", 80), "nowhere.test");
  }

  #[test]
  fn ipv6_addresses() {
    assert_eq!(split_host_port("[::1]:443").unwrap(), ("::1".to_string(), 443));
    assert_eq!(join_host_port("::1", 443), "[::1]:443");
    let w = wiring(&[("::1", "127.0.0.1")]);
    assert_eq!(w.route("[::1]:80").unwrap(), "127.0.0.1:80");
    assert!(split_host_port("::1:443").is_err());
    assert!(split_host_port("example.com").is_err());
  }

  #[test]
  fn yaml_is_a_plain_map() {
    let w: Wiring = serde_yaml::from_str("example.com: 127.0.0.1\n\"a.test:443\": \"b.test:8443\"\n").unwrap();
    assert_eq!(w.len(), 2);
    assert_eq!(w.route("a.test:443").unwrap(), "b.test:8443");
  }

  #[tokio::test]
  async fn dial_follows_the_route() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let w = wiring(&[("intercepted.test", "127.0.0.1")]);
    let dialer = Dialer::default();
    let target = format!("intercepted.test:{}", port);
    let (stream, accepted) = tokio::join!(dialer.dial(&w, &target), listener.accept());
    assert_eq!(
      stream.unwrap().peer_addr().unwrap(),
      accepted.unwrap().0.local_addr().unwrap()
    );
  }

  #[tokio::test]
  async fn dial_failure_names_the_routed_address() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let err = Dialer::default()
      .dial(&Wiring::new(), &format!("127.0.0.1:{}", port))
      .await
      .unwrap_err();
    match err {
      Error::Dial { address, .. } => assert_eq!(address, format!("127.0.0.1:{}", port)),
      other => panic!("unexpected {}", other),
    }
  }
}
