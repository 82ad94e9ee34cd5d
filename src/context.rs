//! Process-wide state shared by every session
use crate::ca::{CertificateAuthority, CertificateManager};
use crate::config::Config;
use crate::errors::Result;
use crate::export::Exporter;
use crate::tls::{client_config, TlsInterceptor};
use crate::wiring::{Dialer, Wiring};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::rustls::RootCertStore;

/// Built once at startup and passed to every session as `Arc<Context>`.
pub struct Context {
  certs: Arc<CertificateManager>,
  tls: TlsInterceptor,
  dialer: Dialer,
  wiring: RwLock<Arc<Wiring>>,
  sessions: SessionRegistry,
  exporter: Arc<Exporter>,
  read_timeout: Duration,
  handshake_timeout: Duration,
  sniff_timeout: Duration,
  log_http: bool,
}

impl Context {
  /// Assemble the context from config, the root CA and the remote trust store.
  pub fn new(
    config: &Config,
    ca: CertificateAuthority,
    roots: RootCertStore,
    exporter: Exporter,
  ) -> Result<Self> {
    let certs = Arc::new(CertificateManager::new(
      Arc::new(ca),
      config.leaf_cache_capacity,
    ));
    let client = Arc::new(client_config(roots)?);
    Ok(Self {
      tls: TlsInterceptor::new(certs.clone(), client, config.handshake_timeout()),
      certs,
      dialer: Dialer::new(config.connect_timeout()),
      wiring: RwLock::new(Arc::new(config.wire.clone())),
      sessions: SessionRegistry::default(),
      exporter: Arc::new(exporter),
      read_timeout: config.read_timeout(),
      handshake_timeout: config.handshake_timeout(),
      sniff_timeout: config.sniff_timeout(),
      log_http: config.log_http,
    })
  }

  /// Swap in the reloadable part of `config`, the wiring table.
  pub fn apply(&self, config: &Config) {
    *self.wiring.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config.wire.clone());
    tracing::info!("Applied config: {} wiring entries", config.wire.len());
  }

  /// Current routing table
  pub fn wiring(&self) -> Arc<Wiring> {
    self
      .wiring
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Route and connect to `address` with the current wiring.
  pub async fn dial(&self, address: &str) -> Result<TcpStream> {
    let wiring = self.wiring();
    self.dialer.dial(&wiring, address).await
  }

  /// Leaf issuer
  pub fn certs(&self) -> &Arc<CertificateManager> {
    &self.certs
  }

  /// TLS handshakes
  pub fn tls(&self) -> &TlsInterceptor {
    &self.tls
  }

  /// Live sessions
  pub fn sessions(&self) -> &SessionRegistry {
    &self.sessions
  }

  /// Record fan-out
  pub fn exporter(&self) -> &Arc<Exporter> {
    &self.exporter
  }

  /// Reader timeout used by HTTP reconstruction
  pub fn read_timeout(&self) -> Duration {
    self.read_timeout
  }

  /// SOCKS5 and TLS handshake bound
  pub fn handshake_timeout(&self) -> Duration {
    self.handshake_timeout
  }

  /// How long a sniffer waits for the first bytes
  pub fn sniff_timeout(&self) -> Duration {
    self.sniff_timeout
  }

  /// Whether HTTP reconstruction is enabled at all
  pub fn log_http(&self) -> bool {
    self.log_http
  }
}

/// One live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
  /// session id
  pub id: u64,
  /// client address
  pub peer: SocketAddr,
  /// accepted on the logged listener
  pub logged: bool,
  /// accept time
  pub started: Instant,
}

#[derive(Debug, Default)]
struct Registry {
  next_id: AtomicU64,
  sessions: Mutex<HashMap<u64, SessionInfo>>,
}

/// Tracks live sessions. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
  inner: Arc<Registry>,
}

impl SessionRegistry {
  /// Add a session; it is removed when the returned guard drops.
  pub fn register(&self, peer: SocketAddr, logged: bool) -> SessionGuard {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let info = SessionInfo {
      id,
      peer,
      logged,
      started: Instant::now(),
    };
    self
      .inner
      .sessions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, info);
    SessionGuard {
      registry: self.clone(),
      id,
    }
  }

  /// Snapshot of live sessions, oldest first
  pub fn list(&self) -> Vec<SessionInfo> {
    let sessions = self
      .inner
      .sessions
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let mut list: Vec<_> = sessions.values().cloned().collect();
    list.sort_by_key(|s| s.id);
    list
  }

  /// Number of live sessions
  pub fn len(&self) -> usize {
    self
      .inner
      .sessions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  /// No live sessions
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn unregister(&self, id: u64) {
    self
      .inner
      .sessions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&id);
  }
}

/// Removes its session from the registry on drop.
#[derive(Debug)]
pub struct SessionGuard {
  registry: SessionRegistry,
  id: u64,
}

impl SessionGuard {
  /// The registered session id
  pub fn id(&self) -> u64 {
    self.id
  }
}

impl Drop for SessionGuard {
  fn drop(&mut self) {
    self.registry.unregister(self.id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::KeyAlgorithm;

  #[test]
  fn guard_unregisters_on_drop() {
    let registry = SessionRegistry::default();
    let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
    let a = registry.register(peer, true);
    let b = registry.register(peer, false);
    assert_ne!(a.id(), b.id());
    assert_eq!(registry.len(), 2);
    drop(a);
    let live = registry.list();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, b.id());
    assert!(!live[0].logged);
    drop(b);
    assert!(registry.is_empty());
  }

  #[test]
  fn apply_swaps_wiring() {
    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, "tapsocks").unwrap();
    let ctx = Context::new(&Config::default(), ca, RootCertStore::empty(), Exporter::default()).unwrap();
    let before = ctx.wiring();
    assert!(before.is_empty());

    let mut config = Config::default();
    config.wire.insert("example.com", "127.0.0.1");
    ctx.apply(&config);

    assert!(before.is_empty());
    assert_eq!(ctx.wiring().route("example.com:80").unwrap(), "127.0.0.1:80");
  }
}
