//! Certificate Authority (CA) management and host impersonation
//!
//! [`CertificateAuthority`] owns the root key pair and signs leaf
//! certificates. [`CertificateManager`] forges one leaf per hostname and
//! keeps it in a bounded cache with an inactivity expiry; concurrent
//! requests for the same unseen hostname share a single generation.
//!
use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::RngCore;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, SignatureAlgorithm,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// File name of the persisted root certificate.
pub const CA_CERT_FILE: &str = "ca_cert.pem";
/// File name of the persisted root private key.
pub const CA_KEY_FILE: &str = "ca_key.pem";
/// Default lifetime of a generated root.
pub const DEFAULT_ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaves without a peer certificate to copy are valid one year.
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Leaves start one day in the past to absorb clock skew.
const LEAF_BACKDATE_DAYS: i64 = 1;

/// Key algorithm for generated keys. The signature digest follows the key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
  /// ECDSA P-256 with SHA-256
  #[default]
  EcdsaP256,
  /// ECDSA P-384 with SHA-384
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

  fn generate(self) -> Result<KeyPair> {
    KeyPair::generate_for(self.signature_algorithm())
      .map_err(|e| Error::certificate_creation(format!("Failed to generate key pair: {}", e)))
  }
}

/// 128 random bits. The leading zero byte keeps the DER integer positive.
fn random_serial() -> SerialNumber {
  let mut serial = [0u8; 17];
  rand::thread_rng().fill_bytes(&mut serial[1..]);
  SerialNumber::from_slice(&serial)
}

/// Validity window of a certificate the real server presented.
fn peer_validity(der: &CertificateDer<'_>) -> Option<(OffsetDateTime, OffsetDateTime)> {
  match x509_parser::parse_x509_certificate(der.as_ref()) {
    Ok((_, cert)) => {
      let validity = cert.validity();
      Some((validity.not_before.to_datetime(), validity.not_after.to_datetime()))
    }
    Err(e) => {
      tracing::debug!("[CA] unreadable peer certificate, using default validity: {}", e);
      None
    }
  }
}

/// Root certificate authority.
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
}

impl fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CertificateAuthority").finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Load the root from `storage_path`, or generate and persist one when
  /// the directory holds none.
  pub async fn load_or_create(
    storage_path: impl AsRef<Path>,
    algorithm: KeyAlgorithm,
    validity: Duration,
  ) -> Result<Self> {
    let storage_path = storage_path.as_ref();
    fs::create_dir_all(storage_path)
      .await
      .map_err(|e| Error::key_store(format!("{}: {}", storage_path.display(), e)))?;

    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);
    let cert_exists = exists(&cert_path).await?;
    let key_exists = exists(&key_path).await?;

    match (cert_exists, key_exists) {
      (true, true) => {
        let cert_pem = read_store(&cert_path).await?;
        let key_pem = read_store(&key_path).await?;
        tracing::debug!("[CA] loading root from {}", storage_path.display());
        Self::from_pem(&cert_pem, &key_pem)
      }
      (false, false) => {
        let ca = Self::generate(algorithm, validity)?;
        ca.export(&cert_path, Some(&key_path))
          .await
          .map_err(|e| Error::key_store(e.to_string()))?;
        tracing::info!("[CA] generated new root in {}", storage_path.display());
        Ok(ca)
      }
      _ => Err(Error::certificate_source(format!(
        "incomplete root in {}: both {} and {} are required",
        storage_path.display(),
        CA_CERT_FILE,
        CA_KEY_FILE
      ))),
    }
  }

  /// Build the root from PEM encoded certificate and private key.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_source(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
      Error::certificate_source(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_source("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_source(format!("Failed to parse PEM: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
    })
  }

  /// Generate a fresh self-signed root.
  pub fn generate(algorithm: KeyAlgorithm, validity: Duration) -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Dragnet Interception CA");
    dn.push(DnType::OrganizationName, "Dragnet");
    dn.push(DnType::OrganizationalUnitName, "Traffic Capture");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(LEAF_BACKDATE_DAYS);
    params.not_after = now + validity;

    let key_pair = algorithm.generate()?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_creation(format!("Failed to generate CA: {}", e)))?;
    let cert_pem = cert.pem();
    let ca_cert_der = cert.der().clone();

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_creation(format!("Failed to create issuer: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem,
    })
  }

  /// Root certificate, DER.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Root certificate, PEM, for installation into client trust stores.
  pub fn cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root private key as unencrypted PKCS#8 PEM.
  pub fn key_pem(&self) -> String {
    self.issuer.key().serialize_pem()
  }

  /// Write the certificate, and optionally the private key, as PEM files.
  pub async fn export(&self, cert_path: impl AsRef<Path>, key_path: Option<&Path>) -> Result<()> {
    let cert_path = cert_path.as_ref();
    fs::write(cert_path, self.ca_cert_pem.as_bytes())
      .await
      .map_err(|e| Error::export(format!("{}: {}", cert_path.display(), e)))?;
    if let Some(key_path) = key_path {
      fs::write(key_path, self.key_pem().as_bytes())
        .await
        .map_err(|e| Error::export(format!("{}: {}", key_path.display(), e)))?;
    }
    Ok(())
  }

  /// Forge a leaf certificate for `hostname`, copying the validity window of
  /// `peer` when it can be parsed.
  pub fn forge(
    &self,
    hostname: &str,
    peer: Option<&CertificateDer<'_>>,
    algorithm: KeyAlgorithm,
  ) -> Result<ImpersonatedIdentity> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate_creation(format!("Invalid domain name: {}", hostname))
      })?)]
    };
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    match peer.and_then(peer_validity) {
      Some((not_before, not_after)) => {
        params.not_before = not_before;
        params.not_after = not_after;
      }
      None => {
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(LEAF_BACKDATE_DAYS);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
      }
    }

    let key_pair = algorithm.generate()?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_creation(format!("Failed to sign server cert: {}", e)))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_creation("Failed to serialize server key"))?;

    Ok(ImpersonatedIdentity {
      hostname: hostname.to_string(),
      chain: vec![cert.der().clone(), self.ca_cert_der.clone()],
      key,
      created_at: OffsetDateTime::now_utc(),
    })
  }
}

async fn exists(path: &Path) -> Result<bool> {
  fs::try_exists(path)
    .await
    .map_err(|e| Error::key_store(format!("{}: {}", path.display(), e)))
}

async fn read_store(path: &Path) -> Result<String> {
  fs::read_to_string(path)
    .await
    .map_err(|e| Error::key_store(format!("{}: {}", path.display(), e)))
}

/// A forged leaf certificate and its key.
pub struct ImpersonatedIdentity {
  hostname: String,
  /// leaf first, then the root
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  created_at: OffsetDateTime,
}

impl fmt::Debug for ImpersonatedIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ImpersonatedIdentity")
      .field("hostname", &self.hostname)
      .field("created_at", &self.created_at)
      .finish_non_exhaustive()
  }
}

impl ImpersonatedIdentity {
  /// Impersonated host.
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// Leaf certificate.
  pub fn leaf(&self) -> &CertificateDer<'static> {
    &self.chain[0]
  }

  /// Certificate chain presented to clients: leaf, then root.
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }

  /// Leaf private key.
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }

  /// When the leaf was forged.
  pub fn created_at(&self) -> OffsetDateTime {
    self.created_at
  }
}

/// Sizing of the impersonation cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
  /// maximum cached identities
  pub capacity: u64,
  /// identities unused for this long are evicted
  pub time_to_idle: std::time::Duration,
  /// key algorithm for forged leaves
  pub leaf_algorithm: KeyAlgorithm,
}

impl Default for CacheOptions {
  fn default() -> Self {
    CacheOptions {
      capacity: 1000,
      time_to_idle: std::time::Duration::from_secs(5 * 60),
      leaf_algorithm: KeyAlgorithm::EcdsaP256,
    }
  }
}

/// Manager for caching generated server certificates
pub struct CertificateManager {
  ca: Arc<CertificateAuthority>,
  leaf_algorithm: KeyAlgorithm,
  cert_cache: Cache<String, Arc<ImpersonatedIdentity>>,
}

impl fmt::Debug for CertificateManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CertificateManager")
      .field("leaf_algorithm", &self.leaf_algorithm)
      .field("cached", &self.cert_cache.entry_count())
      .finish()
  }
}

impl CertificateManager {
  /// Create a certificate manager around a root.
  pub fn new(ca: CertificateAuthority, options: CacheOptions) -> Self {
    let cert_cache = Cache::builder()
      .max_capacity(options.capacity)
      .time_to_idle(options.time_to_idle)
      .build();
    Self {
      ca: Arc::new(ca),
      leaf_algorithm: options.leaf_algorithm,
      cert_cache,
    }
  }

  /// The root authority.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Get or forge the identity for `hostname`.
  ///
  /// `peer` is the certificate the real server presented, if any; it is
  /// only consulted when a new leaf has to be forged.
  pub async fn impersonate(
    &self,
    hostname: &str,
    peer: Option<&CertificateDer<'_>>,
  ) -> Result<Arc<ImpersonatedIdentity>> {
    let key = hostname.trim_end_matches('.').to_ascii_lowercase();
    if key.is_empty() {
      return Err(Error::certificate_creation("empty host name"));
    }
    let ca = self.ca.clone();
    let algorithm = self.leaf_algorithm;
    let host = key.clone();
    let peer = peer.map(|der| der.clone().into_owned());
    self
      .cert_cache
      .try_get_with(key, async move {
        tracing::debug!("[CA] forging certificate for {}", host);
        tokio::task::spawn_blocking(move || ca.forge(&host, peer.as_ref(), algorithm))
          .await
          .map_err(|e| Error::certificate_creation(e.to_string()))?
          .map(Arc::new)
      })
      .await
      .map_err(|e| match e.as_ref() {
        Error::CertificateCreation(msg) => Error::CertificateCreation(msg.clone()),
        other => Error::CertificateCreation(other.to_string()),
      })
  }

  /// Drop the cached identity for `hostname`.
  pub async fn invalidate(&self, hostname: &str) {
    self
      .cert_cache
      .invalidate(&hostname.trim_end_matches('.').to_ascii_lowercase())
      .await;
  }

  /// Number of cached identities after pending maintenance.
  pub async fn cached_identities(&self) -> u64 {
    self.cert_cache.run_pending_tasks().await;
    self.cert_cache.entry_count()
  }

  /// Get the CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.cert_pem()
  }
}

/// Storage location used when none is configured.
pub fn default_storage_path() -> PathBuf {
  PathBuf::from(".dragnet")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dragnet_ca_{}_{}", name, std::process::id()))
  }

  #[tokio::test]
  async fn root_is_persisted_and_reloaded() {
    let dir = temp_dir("persist");
    let _ = fs::remove_dir_all(&dir).await;

    let first = CertificateAuthority::load_or_create(&dir, KeyAlgorithm::EcdsaP256, Duration::days(30))
      .await
      .unwrap();
    let second = CertificateAuthority::load_or_create(&dir, KeyAlgorithm::Ed25519, Duration::days(30))
      .await
      .unwrap();
    assert_eq!(first.cert_der(), second.cert_der());
    assert_eq!(first.key_pem(), second.key_pem());

    let _ = fs::remove_dir_all(&dir).await;
  }

  #[tokio::test]
  async fn half_pair_is_rejected() {
    let dir = temp_dir("half");
    let _ = fs::remove_dir_all(&dir).await;
    fs::create_dir_all(&dir).await.unwrap();
    fs::write(dir.join(CA_CERT_FILE), "x").await.unwrap();
    let result = CertificateAuthority::load_or_create(&dir, KeyAlgorithm::EcdsaP256, Duration::days(1)).await;
    assert!(matches!(result, Err(Error::CertificateSource(_))));
    let _ = fs::remove_dir_all(&dir).await;
  }

  #[test]
  fn malformed_pem_is_a_source_error() {
    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, Duration::days(1)).unwrap();
    let result = CertificateAuthority::from_pem("not a certificate", &ca.key_pem());
    assert!(matches!(result, Err(Error::CertificateSource(_))));
    let result = CertificateAuthority::from_pem(ca.cert_pem(), "garbage");
    assert!(matches!(result, Err(Error::CertificateSource(_))));
    assert!(CertificateAuthority::from_pem(ca.cert_pem(), &ca.key_pem()).is_ok());
  }

  #[test]
  fn every_algorithm_signs() {
    for algorithm in [KeyAlgorithm::EcdsaP256, KeyAlgorithm::EcdsaP384, KeyAlgorithm::Ed25519] {
      let ca = CertificateAuthority::generate(algorithm, Duration::days(1)).unwrap();
      let identity = ca.forge("example.com", None, algorithm).unwrap();
      assert_eq!(identity.chain().len(), 2);
      assert_eq!(&identity.chain()[1], ca.cert_der());
    }
  }

  #[test]
  fn leaf_copies_peer_validity() {
    let not_before = time::macros::datetime!(2021-03-04 05:06:07 UTC);
    let not_after = time::macros::datetime!(2031-03-04 05:06:07 UTC);
    let mut params = CertificateParams::new(vec!["example.com".to_string()]).unwrap();
    params.not_before = not_before;
    params.not_after = not_after;
    let key = KeyPair::generate().unwrap();
    let peer = params.self_signed(&key).unwrap();

    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, Duration::days(1)).unwrap();
    let identity = ca
      .forge("example.com", Some(peer.der()), KeyAlgorithm::EcdsaP256)
      .unwrap();
    let (_, leaf) = x509_parser::parse_x509_certificate(identity.leaf().as_ref()).unwrap();
    assert_eq!(leaf.validity().not_before.to_datetime(), not_before);
    assert_eq!(leaf.validity().not_after.to_datetime(), not_after);

    let garbage = CertificateDer::from(vec![1u8, 2, 3]);
    let identity = ca
      .forge("example.com", Some(&garbage), KeyAlgorithm::EcdsaP256)
      .unwrap();
    let (_, leaf) = x509_parser::parse_x509_certificate(identity.leaf().as_ref()).unwrap();
    let lifetime = leaf.validity().not_after.to_datetime() - leaf.validity().not_before.to_datetime();
    assert_eq!(lifetime, Duration::days(LEAF_VALIDITY_DAYS + LEAF_BACKDATE_DAYS));
  }

  #[test]
  fn serials_are_positive_and_distinct() {
    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, Duration::days(1)).unwrap();
    let serials: Vec<_> = (0..8)
      .map(|_| {
        let identity = ca.forge("example.com", None, KeyAlgorithm::EcdsaP256).unwrap();
        let (_, leaf) = x509_parser::parse_x509_certificate(identity.leaf().as_ref()).unwrap();
        assert!(leaf.tbs_certificate.serial.bits() <= 128);
        leaf.tbs_certificate.serial.clone()
      })
      .collect();
    for (i, serial) in serials.iter().enumerate() {
      assert!(!serials[i + 1..].contains(serial));
    }
  }

  #[test]
  fn non_ascii_host_fails() {
    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, Duration::days(1)).unwrap();
    let result = ca.forge("bücher.example", None, KeyAlgorithm::EcdsaP256);
    assert!(matches!(result, Err(Error::CertificateCreation(_))));
  }
}
