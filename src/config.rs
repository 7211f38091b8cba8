//! Proxy configuration

use crate::ca::{default_storage_path, KeyAlgorithm, DEFAULT_ROOT_VALIDITY_DAYS};
use crate::capture::{CaptureTypes, DEFAULT_MAX_BODY_CHARS, DEFAULT_PAGE_SIZE};
use crate::errors::{Error, Result};
use crate::rewrite::RewriteRule;
use crate::tls::Version;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for [`MitmProxy`](crate::MitmProxy).
///
/// Every field has a default, so a JSON document only needs the values it
/// changes. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Address the listener binds
  pub bind_address: IpAddr,
  /// Preferred port; `0` lets the operating system choose
  pub port: u16,
  /// First port tried when `port` is taken
  pub fallback_port_start: u16,
  /// Last port tried when `port` is taken
  pub fallback_port_end: u16,
  /// Directory holding `ca_cert.pem` and `ca_key.pem`
  pub ca_storage_path: PathBuf,
  /// Key algorithm for a newly generated root
  pub ca_key_algorithm: KeyAlgorithm,
  /// Validity of a newly generated root
  pub ca_validity_days: i64,
  /// Key algorithm for forged leaves
  pub leaf_key_algorithm: KeyAlgorithm,
  /// Forged identities kept in memory
  pub identity_cache_capacity: u64,
  /// Unused identities are dropped after this many seconds
  pub identity_idle_secs: u64,
  /// Decrypt CONNECT tunnels; otherwise they are relayed blind
  pub enable_https_interception: bool,
  /// Accept any upstream certificate. Insecure.
  pub trust_all_upstream: bool,
  /// PEM bundle of additional upstream trust roots
  pub extra_trust_roots: Option<PathBuf>,
  /// Allowed cipher suites; empty allows all
  pub cipher_suites: Vec<String>,
  /// Lowest TLS version offered
  pub min_tls_version: Option<Version>,
  /// Highest TLS version offered
  pub max_tls_version: Option<Version>,
  /// Name servers used instead of the system resolver
  pub dns_servers: Vec<SocketAddr>,
  /// Upstream TCP connect timeout
  pub connect_timeout_secs: u64,
  /// Name resolution timeout
  pub resolve_timeout_secs: u64,
  /// TLS handshake timeout, both sides
  pub handshake_timeout_secs: u64,
  /// Wait for an upstream response head
  pub response_timeout_secs: u64,
  /// Idle keep-alive connections are closed after this
  pub idle_timeout_secs: u64,
  /// Time connections get to finish on stop
  pub shutdown_grace_secs: u64,
  /// Host remap table, one `ip hostname` per line
  pub host_remap: String,
  /// Parts of each transaction that are captured
  pub capture_types: CaptureTypes,
  /// Entries per capture page
  pub page_size: usize,
  /// Bodies longer than this many characters are replaced by a marker
  pub max_body_chars: usize,
  /// Apply `rewrite_rules` to responses
  pub rewrite_enabled: bool,
  /// Response rewrite rules, first match wins
  pub rewrite_rules: Vec<RewriteRule>,
  /// Largest response body buffered for rewriting
  pub max_rewrite_buffer: usize,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    ProxyConfig {
      bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
      port: 8080,
      fallback_port_start: 8000,
      fallback_port_end: 9000,
      ca_storage_path: default_storage_path(),
      ca_key_algorithm: KeyAlgorithm::default(),
      ca_validity_days: DEFAULT_ROOT_VALIDITY_DAYS,
      leaf_key_algorithm: KeyAlgorithm::default(),
      identity_cache_capacity: 1000,
      identity_idle_secs: 300,
      enable_https_interception: true,
      trust_all_upstream: false,
      extra_trust_roots: None,
      cipher_suites: Vec::new(),
      min_tls_version: None,
      max_tls_version: None,
      dns_servers: Vec::new(),
      connect_timeout_secs: 10,
      resolve_timeout_secs: 10,
      handshake_timeout_secs: 10,
      response_timeout_secs: 30,
      idle_timeout_secs: 60,
      shutdown_grace_secs: 5,
      host_remap: String::new(),
      capture_types: CaptureTypes::all(),
      page_size: DEFAULT_PAGE_SIZE,
      max_body_chars: DEFAULT_MAX_BODY_CHARS,
      rewrite_enabled: false,
      rewrite_rules: Vec::new(),
      max_rewrite_buffer: 4 * 1024 * 1024,
    }
  }
}

impl ProxyConfig {
  /// Parse a JSON document. Missing fields keep their defaults.
  pub fn from_json(text: &str) -> Result<Self> {
    let config: ProxyConfig = serde_json::from_str(text)
      .map_err(|e| Error::invalid_config(format!("malformed configuration: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  /// Load and validate a JSON file.
  pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
      .await
      .map_err(|e| Error::invalid_config(format!("{}: {}", path.display(), e)))?;
    Self::from_json(&text)
  }

  /// Reject values the proxy cannot run with.
  pub fn validate(&self) -> Result<()> {
    if self.fallback_port_start > self.fallback_port_end {
      return Err(Error::invalid_config(format!(
        "fallback port range {}-{} is empty",
        self.fallback_port_start, self.fallback_port_end
      )));
    }
    if self.ca_validity_days <= 0 {
      return Err(Error::invalid_config("ca_validity_days must be positive"));
    }
    if self.page_size == 0 {
      return Err(Error::invalid_config("page_size must be positive"));
    }
    if self.identity_cache_capacity == 0 {
      return Err(Error::invalid_config("identity_cache_capacity must be positive"));
    }
    for (name, secs) in [
      ("connect_timeout_secs", self.connect_timeout_secs),
      ("resolve_timeout_secs", self.resolve_timeout_secs),
      ("handshake_timeout_secs", self.handshake_timeout_secs),
      ("response_timeout_secs", self.response_timeout_secs),
      ("idle_timeout_secs", self.idle_timeout_secs),
      ("identity_idle_secs", self.identity_idle_secs),
    ] {
      if secs == 0 {
        return Err(Error::invalid_config(format!("{} must be positive", name)));
      }
    }
    if let (Some(min), Some(max)) = (self.min_tls_version, self.max_tls_version) {
      if min > max {
        return Err(Error::invalid_config(format!(
          "min_tls_version {:?} is above max_tls_version {:?}",
          min, max
        )));
      }
    }
    if !self.dns_servers.is_empty() && !cfg!(feature = "dns") {
      return Err(Error::invalid_config(
        "dns_servers requires the `dns` feature",
      ));
    }
    if self.trust_all_upstream && self.extra_trust_roots.is_some() {
      return Err(Error::invalid_config(
        "trust_all_upstream and extra_trust_roots are mutually exclusive",
      ));
    }
    Ok(())
  }

  /// Set the listening address.
  pub fn bind_address(mut self, address: IpAddr) -> Self {
    self.bind_address = address;
    self
  }

  /// Set the preferred port.
  pub fn port(mut self, port: u16) -> Self {
    self.port = port;
    self
  }

  /// Set the fallback port range, inclusive.
  pub fn fallback_ports(mut self, start: u16, end: u16) -> Self {
    self.fallback_port_start = start;
    self.fallback_port_end = end;
    self
  }

  /// Set the root storage directory.
  pub fn ca_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.ca_storage_path = path.into();
    self
  }

  /// Enable or disable HTTPS interception.
  pub fn https_interception(mut self, enabled: bool) -> Self {
    self.enable_https_interception = enabled;
    self
  }

  /// Accept any upstream certificate.
  pub fn trust_all_upstream(mut self, trust_all: bool) -> Self {
    self.trust_all_upstream = trust_all;
    self
  }

  /// Trust the roots in a PEM bundle in addition to the web PKI roots.
  pub fn extra_trust_roots(mut self, path: impl Into<PathBuf>) -> Self {
    self.extra_trust_roots = Some(path.into());
    self
  }

  /// Set the host remap table.
  pub fn host_remap(mut self, table: impl Into<String>) -> Self {
    self.host_remap = table.into();
    self
  }

  /// Set the captured categories.
  pub fn capture_types(mut self, types: CaptureTypes) -> Self {
    self.capture_types = types;
    self
  }

  /// Set the response timeout.
  pub fn response_timeout(mut self, timeout: Duration) -> Self {
    self.response_timeout_secs = timeout.as_secs().max(1);
    self
  }

  /// Set the shutdown grace period.
  pub fn shutdown_grace(mut self, grace: Duration) -> Self {
    self.shutdown_grace_secs = grace.as_secs();
    self
  }

  /// Set the rewrite rules and enable rewriting.
  pub fn rewrite_rules(mut self, rules: Vec<RewriteRule>) -> Self {
    self.rewrite_rules = rules;
    self.rewrite_enabled = true;
    self
  }

  pub(crate) fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  pub(crate) fn resolve_timeout(&self) -> Duration {
    Duration::from_secs(self.resolve_timeout_secs)
  }

  pub(crate) fn handshake_timeout(&self) -> Duration {
    Duration::from_secs(self.handshake_timeout_secs)
  }

  pub(crate) fn response_timeout_duration(&self) -> Duration {
    Duration::from_secs(self.response_timeout_secs)
  }

  pub(crate) fn idle_timeout(&self) -> Duration {
    Duration::from_secs(self.idle_timeout_secs)
  }

  pub(crate) fn shutdown_grace_duration(&self) -> Duration {
    Duration::from_secs(self.shutdown_grace_secs)
  }

  pub(crate) fn identity_idle(&self) -> Duration {
    Duration::from_secs(self.identity_idle_secs)
  }
}
