//! Both legs of a TLS interception.
//!
//! The remote leg is a normal verifying TLS client. The client leg is a TLS
//! server whose certificate is issued on the fly for the name the client asked
//! for.
use crate::ca::CertificateManager;
use crate::errors::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{client, server, LazyConfigAcceptor, TlsConnector};

const ALPN_HTTP11: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
  Arc::new(tokio_rustls::rustls::crypto::ring::default_provider())
}

/// Client configuration for the remote leg.
pub fn client_config(roots: RootCertStore) -> Result<ClientConfig> {
  let mut config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}

/// Picks a leaf by SNI, falling back to the SOCKS5 target host.
struct LeafResolver {
  certs: Arc<CertificateManager>,
  fallback: String,
}

impl std::fmt::Debug for LeafResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafResolver")
      .field("fallback", &self.fallback)
      .finish()
  }
}

impl ResolvesServerCert for LeafResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let host = client_hello.server_name().unwrap_or(self.fallback.as_str());
    tracing::debug!("issuing leaf for {}", host);
    match self.certs.certified_key(host) {
      Ok(key) => Some(key),
      Err(e) => {
        tracing::error!("no certificate for {}: {}", host, e);
        None
      }
    }
  }
}

/// Server configuration for the client leg of one session.
///
/// `http11` selects `http/1.1` by ALPN. Leave it off when the client did not
/// offer it, otherwise the handshake fails for lack of a common protocol.
pub fn server_config(
  certs: Arc<CertificateManager>,
  fallback_host: &str,
  http11: bool,
) -> Result<ServerConfig> {
  let resolver = LeafResolver {
    certs,
    fallback: fallback_host.to_string(),
  };
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));
  if http11 {
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  }
  Ok(config)
}

/// Performs the two handshakes of an interception.
#[derive(Clone)]
pub struct TlsInterceptor {
  certs: Arc<CertificateManager>,
  connector: TlsConnector,
  handshake_timeout: Duration,
}

impl TlsInterceptor {
  /// Interceptor issuing from `certs` and verifying remotes against `client`.
  pub fn new(
    certs: Arc<CertificateManager>,
    client: Arc<ClientConfig>,
    handshake_timeout: Duration,
  ) -> Self {
    Self {
      certs,
      connector: TlsConnector::from(client),
      handshake_timeout,
    }
  }

  /// The leaf issuer
  pub fn certs(&self) -> &Arc<CertificateManager> {
    &self.certs
  }

  /// TLS client handshake with the real remote, presenting `server_name`.
  pub async fn connect_remote<IO>(&self, stream: IO, server_name: &str) -> Result<client::TlsStream<IO>>
  where
    IO: AsyncRead + AsyncWrite + Unpin,
  {
    let domain = ServerName::try_from(server_name.to_owned())
      .map_err(|e| Error::tls_handshake(format!("invalid server name {}: {}", server_name, e)))?;
    tokio::time::timeout(self.handshake_timeout, self.connector.connect(domain, stream))
      .await
      .map_err(|_| Error::tls_handshake(format!("remote handshake with {} timed out", server_name)))?
      .map_err(|e| Error::tls_handshake(format!("remote {}: {}", server_name, e)))
  }

  /// TLS server handshake with the client using a freshly issued leaf.
  ///
  /// `fallback_host` names the leaf when the ClientHello carries no SNI.
  /// ALPN answers `http/1.1` only to clients that offer it.
  pub async fn accept_client<IO>(&self, stream: IO, fallback_host: &str) -> Result<server::TlsStream<IO>>
  where
    IO: AsyncRead + AsyncWrite + Unpin,
  {
    let handshake = async {
      let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
        .await
        .map_err(|e| Error::tls_handshake(format!("client hello: {}", e)))?;
      let http11 = start
        .client_hello()
        .alpn()
        .is_some_and(|mut offered| offered.any(|p| p == ALPN_HTTP11));
      let config = server_config(self.certs.clone(), fallback_host, http11)?;
      start
        .into_stream(Arc::new(config))
        .await
        .map_err(|e| Error::tls_handshake(format!("client: {}", e)))
    };
    tokio::time::timeout(self.handshake_timeout, handshake)
      .await
      .map_err(|_| Error::tls_handshake("client handshake timed out"))?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::{tests::common_name, CertificateAuthority, KeyAlgorithm};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  fn interceptor() -> (TlsInterceptor, Arc<CertificateAuthority>) {
    let ca = Arc::new(CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, "tapsocks").unwrap());
    let certs = Arc::new(CertificateManager::new(ca.clone(), 0));
    let mut roots = RootCertStore::empty();
    roots.add(ca.ca_cert_der().clone()).unwrap();
    let client = Arc::new(client_config(roots).unwrap());
    (
      TlsInterceptor::new(certs, client, Duration::from_secs(5)),
      ca,
    )
  }

  async fn handshake(sni: &str, fallback: &str) -> Option<String> {
    let (interceptor, _ca) = interceptor();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let fallback = fallback.to_string();
    let acceptor = interceptor.clone();
    let server = tokio::spawn(async move {
      let mut tls = acceptor.accept_client(server_io, &fallback).await.unwrap();
      let mut buf = [0u8; 4];
      tls.read_exact(&mut buf).await.unwrap();
      tls.write_all(&buf).await.unwrap();
      tls.flush().await.unwrap();
    });
    let mut tls = interceptor.connect_remote(client_io, sni).await.unwrap();
    tls.write_all(b"ping").await.unwrap();
    let mut echo = [0u8; 4];
    tls.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping");
    let leaf = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
    server.await.unwrap();
    common_name(&leaf)
  }

  #[tokio::test]
  async fn leaf_follows_sni() {
    assert_eq!(
      handshake("example.com", "ignored.test").await.as_deref(),
      Some("example.com")
    );
  }

  #[tokio::test]
  async fn ip_literal_uses_fallback_host() {
    // rustls sends no SNI for IP addresses
    assert_eq!(
      handshake("127.0.0.1", "127.0.0.1").await.as_deref(),
      Some("127.0.0.1")
    );
  }

  #[tokio::test]
  async fn alpn_follows_client_offer() {
    let (interceptor, ca) = interceptor();
    for (offer, expected) in [
      (vec![b"h2".to_vec()], None),
      (vec![b"h2".to_vec(), ALPN_HTTP11.to_vec()], Some(ALPN_HTTP11)),
      (Vec::new(), None),
    ] {
      let mut roots = RootCertStore::empty();
      roots.add(ca.ca_cert_der().clone()).unwrap();
      let mut config = client_config(roots).unwrap();
      config.alpn_protocols = offer;
      let connector = TlsConnector::from(Arc::new(config));

      let (client_io, server_io) = tokio::io::duplex(64 * 1024);
      let acceptor = interceptor.clone();
      let server = tokio::spawn(async move {
        let mut tls = acceptor.accept_client(server_io, "alpn.test").await.unwrap();
        let mut buf = [0u8; 2];
        tls.read_exact(&mut buf).await.unwrap();
        tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec)
      });
      let domain = ServerName::try_from("alpn.test").unwrap();
      let mut tls = connector.connect(domain, client_io).await.unwrap();
      tls.write_all(b"hi").await.unwrap();
      tls.flush().await.unwrap();
      let negotiated = server.await.unwrap();
      assert_eq!(negotiated.as_deref(), expected);
      assert_eq!(tls.get_ref().1.alpn_protocol(), expected);
    }
  }

  #[tokio::test]
  async fn untrusted_remote_fails() {
    let (interceptor, _) = interceptor();
    let (other, _) = self::interceptor();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move { other.accept_client(server_io, "example.com").await.is_err() });
    assert!(interceptor
      .connect_remote(client_io, "example.com")
      .await
      .is_err());
    assert!(server.await.unwrap());
  }
}
