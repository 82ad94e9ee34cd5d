//! On-disk layout of the proxy data directory
//!
//! ```text
//! <data>/ca/ca.key       root private key (PEM, 0400)
//! <data>/ca/ca.key.pub   root public key (PEM, 0400)
//! <data>/ca/ca.crt       root certificate (PEM, 0400)
//! <data>/certs/roots.pem extra trusted roots for the remote leg (optional)
//! ```
use crate::ca::{issue_root_certificate, issue_root_key, CertificateAuthority, KeyAlgorithm};
use crate::errors::{Error, Result};
use rcgen::KeyPair;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::RootCertStore;
use tracing::{info, warn};

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o400;

/// Paths of the CA material and extra trusted roots under a data directory.
#[derive(Debug, Clone)]
pub struct CertificateStore {
  data_dir: PathBuf,
}

impl CertificateStore {
  /// Store rooted at `data_dir`
  pub fn new(data_dir: impl Into<PathBuf>) -> Self {
    Self {
      data_dir: data_dir.into(),
    }
  }
  /// `<data>/ca/ca.key`
  pub fn key_path(&self) -> PathBuf {
    self.data_dir.join("ca").join("ca.key")
  }
  /// `<data>/ca/ca.key.pub`
  pub fn public_key_path(&self) -> PathBuf {
    self.data_dir.join("ca").join("ca.key.pub")
  }
  /// `<data>/ca/ca.crt`
  pub fn cert_path(&self) -> PathBuf {
    self.data_dir.join("ca").join("ca.crt")
  }
  /// `<data>/certs/roots.pem`
  pub fn roots_path(&self) -> PathBuf {
    self.data_dir.join("certs").join("roots.pem")
  }

  /// Load the root CA, generating whatever is missing.
  ///
  /// A new key always invalidates the certificate on disk.
  pub async fn load_or_create(
    &self,
    algorithm: KeyAlgorithm,
    organization: &str,
  ) -> Result<CertificateAuthority> {
    create_dir(&self.data_dir.join("ca")).await?;
    create_dir(&self.data_dir.join("certs")).await?;

    let key_path = self.key_path();
    let cert_path = self.cert_path();
    if !exists(&key_path).await {
      // whatever belonged to the previous key goes first
      remove_stale(&cert_path).await?;
      remove_stale(&self.public_key_path()).await?;
      info!("Generating {:?} private key -> {}", algorithm, key_path.display());
      let key = issue_root_key(algorithm)?;
      write_private(&key_path, key.serialize_pem().as_bytes()).await?;
      write_private(&self.public_key_path(), key.public_key_pem().as_bytes()).await?;
    }
    let key_pem = tokio::fs::read_to_string(&key_path).await?;

    if !exists(&cert_path).await {
      let key = KeyPair::from_pem(&key_pem)
        .map_err(|e| Error::issuance(format!("Failed to parse CA key: {}", e)))?;
      let cert = issue_root_certificate(&key, organization)?;
      write_private(&cert_path, cert.pem().as_bytes()).await?;
      info!("Generated a new CA certificate -> {}", cert_path.display());
      info!("Install it in your client's trust store to intercept TLS");
    }
    let cert_pem = tokio::fs::read_to_string(&cert_path).await?;

    CertificateAuthority::from_pem(&cert_pem, &key_pem)
  }

  /// Roots trusted when connecting to the real remote: the bundled
  /// webpki roots plus any certificates in `certs/roots.pem`.
  pub async fn trusted_roots(&self) -> Result<RootCertStore> {
    let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let path = self.roots_path();
    if !exists(&path).await {
      return Ok(roots);
    }
    let pem = tokio::fs::read(&path).await?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice()).collect::<std::io::Result<Vec<_>>>()?;
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
      warn!("Ignored {} unparsable roots in {}", ignored, path.display());
    }
    info!("Loaded {} extra roots from {}", added, path.display());
    Ok(roots)
  }
}

async fn exists(path: &Path) -> bool {
  tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn remove_stale(path: &Path) -> Result<()> {
  match tokio::fs::remove_file(path).await {
    Ok(()) => {
      warn!("Removed {}, it belonged to the previous CA key", path.display());
      Ok(())
    }
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e.into()),
  }
}

async fn create_dir(path: &Path) -> Result<()> {
  let mut builder = tokio::fs::DirBuilder::new();
  builder.recursive(true);
  #[cfg(unix)]
  builder.mode(DIR_MODE);
  builder.create(path).await?;
  Ok(())
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
  let mut options = tokio::fs::OpenOptions::new();
  options.write(true).create_new(true);
  #[cfg(unix)]
  options.mode(FILE_MODE);
  let mut file = options.open(path).await?;
  file.write_all(contents).await?;
  file.flush().await?;
  Ok(())
}
