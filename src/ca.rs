//! Certificate Authority (CA) for the intercepting proxy
//!
//! Holds the root key and certificate and signs a short-lived leaf for every
//! host the proxy impersonates.
//!

use crate::errors::{Error, Result};
use moka::sync::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SignatureAlgorithm,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;

/// Root certificate validity in days (10 years)
pub const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaf certificate validity in seconds (24 hours)
pub const LEAF_TTL_SECS: i64 = 24 * 60 * 60;
/// Cached leaves are dropped well before they expire
const CACHE_TTL: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// Key algorithm for the root and leaf keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
  /// ECDSA over P-256 with SHA-256
  #[default]
  EcdsaP256,
  /// ECDSA over P-384 with SHA-384
  EcdsaP384,
  /// Ed25519
  Ed25519,
}

impl KeyAlgorithm {
  fn signature_algorithm(self) -> &'static SignatureAlgorithm {
    match self {
      KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
      KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
      KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
    }
  }
}

/// Generate a new root key pair.
pub fn issue_root_key(algorithm: KeyAlgorithm) -> Result<KeyPair> {
  KeyPair::generate_for(algorithm.signature_algorithm())
    .map_err(|e| Error::issuance(format!("Failed to generate key pair: {}", e)))
}

/// Build a self-signed CA certificate for `key`.
pub fn issue_root_certificate(key: &KeyPair, organization: &str) -> Result<rcgen::Certificate> {
  let mut params = CertificateParams::default();
  params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

  let name = format!("{} Root CA", organization);
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, name.as_str());
  dn.push(DnType::OrganizationName, name.as_str());
  dn.push(DnType::CountryName, "US");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

  let now = OffsetDateTime::now_utc();
  params.not_before = now;
  params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

  params
    .self_signed(key)
    .map_err(|e| Error::issuance(format!("Failed to generate CA: {}", e)))
}

/// Root key and certificate. Immutable once built, so it can be shared
/// freely between sessions issuing leaves concurrently.
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
}

impl CertificateAuthority {
  /// Build from a PEM encoded root certificate and private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::issuance(format!("Failed to parse CA key: {}", e)))?;

    // Parse PEM to DER for rustls
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::issuance("No certificate found in PEM"))?
      .map_err(|e| Error::issuance(format!("Failed to parse PEM: {}", e)))?;

    let (_, cert) = x509_parser::parse_x509_certificate(&ca_cert_der)
      .map_err(|e| Error::issuance(format!("Failed to parse CA cert: {}", e)))?;
    if cert.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
      return Err(Error::issuance("CA certificate does not match the CA key"));
    }

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::issuance(format!("Failed to create issuer from CA cert: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
    })
  }

  /// Generate a fresh in-memory root.
  pub fn generate(algorithm: KeyAlgorithm, organization: &str) -> Result<Self> {
    let key_pair = issue_root_key(algorithm)?;
    let cert = issue_root_certificate(&key_pair, organization)?;
    Self::from_pem(&cert.pem(), &key_pair.serialize_pem())
  }

  /// Issue a server certificate for `hostname` signed by this CA.
  ///
  /// Returns the chain `[leaf, root]` and the leaf's private key.
  pub fn issue_leaf(
    &self,
    hostname: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();

    // Generate random serial number for uniqueness
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // IP literals get both an iPAddress and a dNSName entry
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::issuance(format!("Invalid domain name: {}", hostname))
      })?)]
    };

    params.is_ca = IsCa::ExplicitNoCa;
    // digitalSignature is needed for ECDSA/EdDSA keys under TLS 1.3
    params.key_usages = vec![
      KeyUsagePurpose::KeyEncipherment,
      KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    // ring cannot generate RSA keys, so an RSA root signs ECDSA leaves
    let key_pair = KeyPair::generate_for(self.issuer.key().algorithm())
      .or_else(|_| KeyPair::generate())
      .map_err(|e| Error::issuance(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::issuance(format!("Failed to sign server cert: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::issuance("Failed to serialize server key"))?;

    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }

  /// Root certificate in PEM format for client installation
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Root private key in PEM format
  pub fn ca_key_pem(&self) -> String {
    self.issuer.key().serialize_pem()
  }
}

/// Issues leaves as rustls [`CertifiedKey`]s, optionally caching them per host.
pub struct CertificateManager {
  ca: Arc<CertificateAuthority>,
  cert_cache: Option<Cache<String, Arc<CertifiedKey>>>,
}

impl CertificateManager {
  /// `cache_capacity == 0` disables caching: every call signs a new leaf.
  pub fn new(ca: Arc<CertificateAuthority>, cache_capacity: u64) -> Self {
    let cert_cache = (cache_capacity > 0).then(|| {
      Cache::builder()
        .max_capacity(cache_capacity)
        .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
        .build()
    });
    Self { ca, cert_cache }
  }

  /// Get or generate a server certificate for `hostname`.
  pub fn certified_key(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
    let key = hostname.to_ascii_lowercase();
    if let Some(cached) = self.cert_cache.as_ref().and_then(|c| c.get(&key)) {
      tracing::debug!("Reusing cached certificate for {}", key);
      return Ok(cached);
    }
    let (cert_chain, private_key) = self.ca.issue_leaf(&key)?;
    let signing_key = any_supported_type(&private_key)
      .map_err(|e| Error::issuance(format!("Unsupported leaf key: {}", e)))?;
    let certified = Arc::new(CertifiedKey::new(cert_chain, signing_key));
    if let Some(cache) = &self.cert_cache {
      cache.insert(key, certified.clone());
    }
    Ok(certified)
  }

  /// The root this manager signs with
  pub fn ca(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use x509_parser::certificate::X509Certificate;

  fn parse<'a>(der: &'a CertificateDer<'_>) -> X509Certificate<'a> {
    x509_parser::parse_x509_certificate(der).unwrap().1
  }

  pub(crate) fn common_name(der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_owned)
  }

  #[test]
  fn root_is_a_signing_ca() {
    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, "tapsocks").unwrap();
    assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
    let cert = parse(ca.ca_cert_der());
    assert!(cert.basic_constraints().unwrap().unwrap().value.ca);
    let usage = cert.key_usage().unwrap().unwrap().value;
    assert!(usage.key_cert_sign());
    assert!(usage.crl_sign());
    let validity = cert.validity();
    let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
    assert!(lifetime >= (ROOT_VALIDITY_DAYS - 1) * 24 * 60 * 60);
    assert_eq!(common_name(ca.ca_cert_der()).as_deref(), Some("tapsocks Root CA"));
  }

  #[test]
  fn leaf_matches_hostname() {
    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, "tapsocks").unwrap();
    let (chain, _key) = ca.issue_leaf("example.com").unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(&chain[1], ca.ca_cert_der());
    assert_eq!(common_name(&chain[0]).as_deref(), Some("example.com"));

    let cert = parse(&chain[0]);
    let is_ca = cert
      .basic_constraints()
      .unwrap()
      .is_some_and(|constraints| constraints.value.ca);
    assert!(!is_ca);
    assert!(cert.key_usage().unwrap().unwrap().value.key_encipherment());
    assert!(cert.extended_key_usage().unwrap().unwrap().value.server_auth);
    let lifetime = cert.validity().not_after.timestamp() - OffsetDateTime::now_utc().unix_timestamp();
    assert!(lifetime <= LEAF_TTL_SECS);
    assert!(lifetime > 23 * 60 * 60);
  }

  #[test]
  fn ip_leaf_and_other_algorithms() {
    for algorithm in [KeyAlgorithm::EcdsaP384, KeyAlgorithm::Ed25519] {
      let ca = CertificateAuthority::generate(algorithm, "tapsocks").unwrap();
      let (chain, _) = ca.issue_leaf("127.0.0.1").unwrap();
      assert_eq!(common_name(&chain[0]).as_deref(), Some("127.0.0.1"));
    }
  }

  #[test]
  fn reload_from_pem_keeps_identity() {
    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, "tapsocks").unwrap();
    let again = CertificateAuthority::from_pem(ca.ca_cert_pem(), &ca.ca_key_pem()).unwrap();
    assert_eq!(ca.ca_cert_der(), again.ca_cert_der());
    let (chain, _) = again.issue_leaf("reloaded.test").unwrap();
    assert_eq!(&chain[1], ca.ca_cert_der());
  }

  #[test]
  fn every_call_reissues_without_cache() {
    let ca = Arc::new(CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, "tapsocks").unwrap());
    let manager = CertificateManager::new(ca, 0);
    let a = manager.certified_key("example.com").unwrap();
    let b = manager.certified_key("example.com").unwrap();
    assert_ne!(a.cert[0], b.cert[0]);
  }

  #[test]
  fn cache_reuses_leaf_per_host() {
    let ca = Arc::new(CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, "tapsocks").unwrap());
    let manager = CertificateManager::new(ca, 16);
    let a = manager.certified_key("Example.com").unwrap();
    let b = manager.certified_key("example.com").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    let c = manager.certified_key("other.example.com").unwrap();
    assert_ne!(a.cert[0], c.cert[0]);
  }

  #[test]
  fn mismatched_key_is_rejected() {
    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, "tapsocks").unwrap();
    let other = issue_root_key(KeyAlgorithm::EcdsaP256).unwrap();
    assert!(CertificateAuthority::from_pem(ca.ca_cert_pem(), &other.serialize_pem()).is_err());
  }
}
