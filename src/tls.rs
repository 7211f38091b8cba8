//! TLS session factory
//!
//! Builds the client-side context used towards real servers and the
//! server-side context presented to intercepted clients. The cipher-suite
//! allow-list and protocol versions are resolved once, when the factory is
//! built.
use crate::ca::ImpersonatedIdentity;
use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, ClientConfig, DigitallySignedStruct, Error as TLSError,
  RootCertStore, ServerConfig, SignatureScheme, SupportedCipherSuite, SupportedProtocolVersion,
};

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// A TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Version {
  /// Version 1.2 of the TLS protocol.
  #[serde(rename = "1.2")]
  Tls1_2,
  /// Version 1.3 of the TLS protocol.
  #[serde(rename = "1.3")]
  Tls1_3,
}

impl Version {
  pub(crate) fn from_tls(version: rustls::ProtocolVersion) -> Option<Self> {
    match version {
      rustls::ProtocolVersion::TLSv1_2 => Some(Version::Tls1_2),
      rustls::ProtocolVersion::TLSv1_3 => Some(Version::Tls1_3),
      _ => None,
    }
  }
}

/// How upstream server certificates are checked.
#[derive(Debug, Clone)]
pub enum TrustPolicy {
  /// Validate against the bundled web PKI roots plus `extra_roots`.
  Validate {
    /// additional trusted roots
    extra_roots: Vec<CertificateDer<'static>>,
  },
  /// Accept any certificate. Insecure.
  TrustAll,
}

impl Default for TrustPolicy {
  fn default() -> Self {
    TrustPolicy::Validate {
      extra_roots: Vec::new(),
    }
  }
}

impl TrustPolicy {
  /// Validate, additionally trusting every certificate in a PEM bundle.
  pub fn with_pem_bundle(pem_bundle: &[u8]) -> Result<Self> {
    Ok(TrustPolicy::Validate {
      extra_roots: parse_pem_certificates(pem_bundle)?,
    })
  }
}

/// Every certificate in a PEM bundle.
pub fn parse_pem_certificates(pem_bundle: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
  let mut reader = pem_bundle;
  let certs = rustls_pemfile::certs(&mut reader)
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::certificate_source(format!("invalid PEM bundle: {}", e)))?;
  if certs.is_empty() {
    return Err(Error::certificate_source("PEM bundle holds no certificate"));
  }
  Ok(certs)
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
  format!("{:?}", suite.suite())
}

/// Produces TLS client and server contexts.
#[derive(Debug, Clone)]
pub struct TlsFactory {
  provider: Arc<CryptoProvider>,
  versions: Vec<&'static SupportedProtocolVersion>,
}

impl TlsFactory {
  /// Resolve the allowed cipher suites and protocol versions.
  ///
  /// Suite names use the IANA form, e.g. `TLS13_AES_128_GCM_SHA256` or
  /// `TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256`. An empty list allows all.
  pub fn new(
    cipher_suites: &[String],
    min_tls_version: Option<Version>,
    max_tls_version: Option<Version>,
  ) -> Result<Self> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !cipher_suites.is_empty() {
      provider.cipher_suites.retain(|suite| {
        let name = suite_name(suite);
        cipher_suites.iter().any(|allowed| allowed.eq_ignore_ascii_case(&name))
      });
      if provider.cipher_suites.is_empty() {
        return Err(Error::tls_initialization(format!(
          "no supported cipher suite in {:?}",
          cipher_suites
        )));
      }
    }

    let mut versions = rustls::ALL_VERSIONS.to_vec();
    if let Some(min_tls_version) = min_tls_version {
      versions.retain(|&supported_version| {
        match Version::from_tls(supported_version.version) {
          Some(version) => version >= min_tls_version,
          None => true,
        }
      });
    }
    if let Some(max_tls_version) = max_tls_version {
      versions.retain(|&supported_version| {
        match Version::from_tls(supported_version.version) {
          Some(version) => version <= max_tls_version,
          None => false,
        }
      });
    }
    if versions.is_empty() {
      return Err(Error::tls_initialization("empty supported tls versions"));
    }
    // every remaining version needs at least one suite
    versions.retain(|v| {
      provider
        .cipher_suites
        .iter()
        .any(|s| s.version() == *v)
    });
    if versions.is_empty() {
      return Err(Error::tls_initialization(
        "cipher suites do not match the allowed tls versions",
      ));
    }

    Ok(TlsFactory {
      provider: Arc::new(provider),
      versions,
    })
  }

  /// Names of the cipher suites in use.
  pub fn cipher_suites(&self) -> Vec<String> {
    self.provider.cipher_suites.iter().map(suite_name).collect()
  }

  /// Client context for connections to real servers.
  pub fn upstream_context(&self, trust: &TrustPolicy) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(self.provider.clone())
      .with_protocol_versions(&self.versions)
      .map_err(|e| Error::tls_initialization(format!("invalid TLS versions: {}", e)))?;
    let mut config = match trust {
      TrustPolicy::TrustAll => {
        tracing::warn!(
          "[TLS] upstream certificate validation is DISABLED: any server certificate is accepted"
        );
        builder
          .dangerous()
          .with_custom_certificate_verifier(Arc::new(NoVerifier))
          .with_no_client_auth()
      }
      TrustPolicy::Validate { extra_roots } => {
        let mut roots = RootCertStore {
          roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for cert in extra_roots {
          roots
            .add(cert.clone())
            .map_err(|e| Error::tls_initialization(format!("invalid trust root: {}", e)))?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
      }
    };
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(Arc::new(config))
  }

  /// Server context presenting `identity` to an intercepted client.
  pub fn downstream_context(&self, identity: &ImpersonatedIdentity) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(self.provider.clone())
      .with_protocol_versions(&self.versions)
      .map_err(|e| Error::tls_initialization(format!("invalid TLS versions: {}", e)))?
      .with_no_client_auth()
      .with_single_cert(identity.chain().to_vec(), identity.private_key())
      .map_err(|e| {
        Error::tls_initialization(format!("certificate for {}: {}", identity.hostname(), e))
      })?;
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(Arc::new(config))
  }
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
