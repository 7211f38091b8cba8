//! Error types for the proxy
use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `dragnet::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the certificate, TLS, capture and lifecycle layers.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// A supplied or persisted root certificate could not be parsed
  #[error("Certificate source error: {0}")]
  CertificateSource(String),

  /// Key generation or certificate signing failed
  #[error("Certificate creation error: {0}")]
  CertificateCreation(String),

  /// A TLS client or server context could not be built
  #[error("TLS initialization error: {0}")]
  TlsInitialization(String),

  /// The certificate storage directory could not be read or written
  #[error("Key store access error: {0}")]
  KeyStoreAccess(String),

  /// Writing the root certificate or a HAR document failed
  #[error("Export error: {0}")]
  Export(String),

  /// Reading a HAR document failed
  #[error("Import error: {0}")]
  Import(String),

  /// The listener could not be bound
  #[error("Proxy start error: {0}")]
  ProxyStart(String),

  /// Rejected configuration value
  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),

  /// Malformed request from a client
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// http::Error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Per-connection failure
  #[error(transparent)]
  Failure(#[from] Failure),
}

/// Failure taxonomy recorded on captured entries.
///
/// The display strings are the messages stored in `response._error`.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
  /// DNS lookup failed
  #[error("Unable to resolve host: {host}:{port}")]
  Resolution {
    /// requested host
    host: String,
    /// requested port
    port: u16,
  },
  /// TCP connect failed or timed out
  #[error("Unable to connect to host")]
  Connection,
  /// Upstream did not answer in time
  #[error("Response timed out")]
  ResponseTimeout,
  /// Connection closed before a response was fully received
  #[error("No response received")]
  NoResponse,
  /// TLS handshake with client or upstream failed
  #[error("TLS handshake failed: {0}")]
  Handshake(String),
  /// Impersonated certificate could not be produced
  #[error("Certificate creation failed: {0}")]
  Certificate(String),
}

impl Failure {
  /// Status line sent to the client when nothing has been relayed yet.
  pub(crate) fn client_status(&self) -> (u16, &'static str) {
    match self {
      Failure::ResponseTimeout => (504, "Gateway Timeout"),
      _ => (502, "Bad Gateway"),
    }
  }
}

impl Error {
  /// Create a certificate source error and log it
  pub fn certificate_source(msg: impl Into<String>) -> Self {
    let error = Error::CertificateSource(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate creation error and log it
  pub fn certificate_creation(msg: impl Into<String>) -> Self {
    let error = Error::CertificateCreation(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS initialization error and log it
  pub fn tls_initialization(msg: impl Into<String>) -> Self {
    let error = Error::TlsInitialization(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a key store error and log it
  pub fn key_store(msg: impl Into<String>) -> Self {
    let error = Error::KeyStoreAccess(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an export error and log it
  pub fn export(msg: impl Into<String>) -> Self {
    let error = Error::Export(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an import error and log it
  pub fn import(msg: impl Into<String>) -> Self {
    let error = Error::Import(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a proxy start error and log it
  pub fn proxy_start(msg: impl Into<String>) -> Self {
    let error = Error::ProxyStart(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid configuration error and log it
  pub fn invalid_config(msg: impl Into<String>) -> Self {
    let error = Error::InvalidConfig(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Whether a socket read or write stalled past its timeout.
  pub(crate) fn is_timeout(&self) -> bool {
    matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::TimedOut)
  }

  /// Create an invalid request error. Logged at debug: clients send garbage.
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(error_kind, msg))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn failure_messages_match_capture_format() {
    let failure = Failure::Resolution {
      host: "nonexistent.invalid".to_string(),
      port: 443,
    };
    assert_eq!(
      failure.to_string(),
      "Unable to resolve host: nonexistent.invalid:443"
    );
    assert_eq!(Failure::Connection.to_string(), "Unable to connect to host");
    assert_eq!(Failure::ResponseTimeout.to_string(), "Response timed out");
    assert_eq!(Failure::NoResponse.to_string(), "No response received");
  }

  #[test]
  fn stalled_io_is_a_timeout() {
    assert!(new_io_error(io::ErrorKind::TimedOut, "read timed out").is_timeout());
    assert!(!new_io_error(io::ErrorKind::UnexpectedEof, "body ended early").is_timeout());
    assert!(!Error::invalid_request("bad").is_timeout());
  }

  #[test]
  fn timeout_maps_to_gateway_timeout() {
    assert_eq!(Failure::ResponseTimeout.client_status().0, 504);
    assert_eq!(Failure::Connection.client_status().0, 502);
  }
}
