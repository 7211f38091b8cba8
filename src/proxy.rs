//! Proxy lifecycle: construction, start with port fallback, stop, restart

use crate::ca::{CacheOptions, CertificateAuthority, CertificateManager};
use crate::capture::{CaptureLog, CaptureTypes};
use crate::config::ProxyConfig;
use crate::connector::ConnectorBuilder;
use crate::dns::Resolver;
use crate::errors::{Error, Result};
use crate::hooks::CaptureHook;
use crate::rewrite::{RewriteRule, RewriteRules};
use crate::server::{serve, ProxyContext, Settings};
use crate::tls::{parse_pem_certificates, TlsFactory, TrustPolicy};
use rand::seq::SliceRandom;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

struct RunningServer {
  port: u16,
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

/// An intercepting HTTP/HTTPS proxy.
///
/// The proxy is an explicit object owned by the caller; several can run in
/// one process on different ports.
///
/// ```no_run
/// use dragnet::{MitmProxy, ProxyConfig};
///
/// # async fn run() -> dragnet::Result<()> {
/// let proxy = MitmProxy::new(ProxyConfig::default()).await?;
/// let port = proxy.start().await?;
/// println!("trust this root and point clients at 127.0.0.1:{}", port);
/// println!("{}", proxy.ca_cert_pem());
/// proxy.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct MitmProxy {
  config: ProxyConfig,
  context: Arc<ProxyContext>,
  log: Arc<CaptureLog>,
  server: Mutex<Option<RunningServer>>,
  port: AtomicU16,
}

impl std::fmt::Debug for MitmProxy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MitmProxy")
      .field("port", &self.port())
      .field("log", &self.log)
      .finish_non_exhaustive()
  }
}

#[cfg(feature = "dns")]
fn build_resolver(config: &ProxyConfig) -> Result<Resolver> {
  if config.dns_servers.is_empty() {
    Ok(Resolver::system())
  } else {
    Resolver::with_servers(config.dns_servers.clone())
  }
}

#[cfg(not(feature = "dns"))]
fn build_resolver(_config: &ProxyConfig) -> Result<Resolver> {
  Ok(Resolver::system())
}

async fn trust_policy(config: &ProxyConfig) -> Result<TrustPolicy> {
  if config.trust_all_upstream {
    return Ok(TrustPolicy::TrustAll);
  }
  let Some(path) = &config.extra_trust_roots else {
    return Ok(TrustPolicy::default());
  };
  let pem = tokio::fs::read(path)
    .await
    .map_err(|e| Error::certificate_source(format!("{}: {}", path.display(), e)))?;
  Ok(TrustPolicy::Validate {
    extra_roots: parse_pem_certificates(&pem)?,
  })
}

impl MitmProxy {
  /// Validate `config`, then load the root from `ca_storage_path`, creating
  /// it on first use.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    config.validate()?;
    let ca = CertificateAuthority::load_or_create(
      &config.ca_storage_path,
      config.ca_key_algorithm,
      time::Duration::days(config.ca_validity_days),
    )
    .await?;
    Self::with_authority(config, ca).await
  }

  /// Build a proxy around an existing root; nothing is read from or written
  /// to `ca_storage_path`.
  pub async fn with_authority(config: ProxyConfig, ca: CertificateAuthority) -> Result<Self> {
    config.validate()?;
    let certificates = Arc::new(CertificateManager::new(
      ca,
      CacheOptions {
        capacity: config.identity_cache_capacity,
        time_to_idle: config.identity_idle(),
        leaf_algorithm: config.leaf_key_algorithm,
      },
    ));
    let tls = TlsFactory::new(
      &config.cipher_suites,
      config.min_tls_version,
      config.max_tls_version,
    )?;
    let upstream_tls = tls.upstream_context(&trust_policy(&config).await?)?;

    let resolver = build_resolver(&config)?;
    let remapped = resolver.load_remap_table(&config.host_remap);
    if remapped > 0 {
      tracing::debug!("[PROXY] loaded {} host remap entries", remapped);
    }
    let connector = ConnectorBuilder::default()
      .connect_timeout(config.connect_timeout())
      .resolve_timeout(config.resolve_timeout())
      .handshake_timeout(config.handshake_timeout())
      .build(resolver);

    let log = Arc::new(CaptureLog::new(config.page_size, config.max_body_chars));
    log.set_capture_types(config.capture_types);

    let settings = Settings {
      intercept_https: config.enable_https_interception,
      response_timeout: config.response_timeout_duration(),
      idle_timeout: config.idle_timeout(),
      handshake_timeout: config.handshake_timeout(),
      max_rewrite_buffer: config.max_rewrite_buffer,
    };
    let rewrite = RewriteRules::new(config.rewrite_enabled, config.rewrite_rules.clone());
    let context = Arc::new(ProxyContext::new(
      settings,
      certificates,
      tls,
      upstream_tls,
      connector,
      log.clone(),
      rewrite,
    ));
    Ok(MitmProxy {
      config,
      context,
      log,
      server: Mutex::new(None),
      port: AtomicU16::new(0),
    })
  }

  /// Configuration the proxy was built with.
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Start on the configured port.
  pub async fn start(&self) -> Result<u16> {
    self.start_on(self.config.port).await
  }

  /// Start listening on `preferred_port`, falling back to a random free
  /// port of the configured range. Returns the bound port.
  pub async fn start_on(&self, preferred_port: u16) -> Result<u16> {
    let mut server = self.server.lock().await;
    if let Some(running) = server.as_ref() {
      return Err(Error::proxy_start(format!(
        "already running on port {}",
        running.port
      )));
    }
    let listener = self.bind(preferred_port).await?;
    let port = listener
      .local_addr()
      .map_err(|e| Error::proxy_start(e.to_string()))?
      .port();
    let (shutdown, signal) = watch::channel(false);
    let task = tokio::spawn(serve(
      listener,
      self.context.clone(),
      signal,
      self.config.shutdown_grace_duration(),
    ));
    *server = Some(RunningServer {
      port,
      shutdown,
      task,
    });
    self.port.store(port, Ordering::SeqCst);
    tracing::info!("[PROXY] listening on {}:{}", self.config.bind_address, port);
    Ok(port)
  }

  async fn bind(&self, preferred_port: u16) -> Result<TcpListener> {
    let address: IpAddr = self.config.bind_address;
    match TcpListener::bind((address, preferred_port)).await {
      Ok(listener) => return Ok(listener),
      Err(e) => tracing::warn!("[PROXY] port {} unavailable: {}", preferred_port, e),
    }
    let (start, end) = (self.config.fallback_port_start, self.config.fallback_port_end);
    let mut candidates: Vec<u16> = (start..=end).filter(|p| *p != preferred_port).collect();
    candidates.shuffle(&mut rand::thread_rng());
    for port in candidates {
      if let Ok(listener) = TcpListener::bind((address, port)).await {
        tracing::info!("[PROXY] falling back to port {}", port);
        return Ok(listener);
      }
    }
    Err(Error::proxy_start(format!(
      "port {} and every port in {}-{} are unavailable",
      preferred_port, start, end
    )))
  }

  /// Stop accepting, let connections finish within the grace period, then
  /// abort the rest. Does nothing when not running.
  pub async fn stop(&self) {
    let Some(running) = self.server.lock().await.take() else {
      return;
    };
    self.port.store(0, Ordering::SeqCst);
    let _ = running.shutdown.send(true);
    if let Err(e) = running.task.await {
      if !e.is_cancelled() {
        tracing::error!("[PROXY] server task failed: {}", e);
      }
    }
    tracing::info!("[PROXY] stopped listening on port {}", running.port);
  }

  /// Stop, then start again on the previous port when it is still free.
  pub async fn restart(&self) -> Result<u16> {
    let previous = self.port().unwrap_or(self.config.port);
    self.stop().await;
    self.start_on(previous).await
  }

  /// Bound port while running.
  pub fn port(&self) -> Option<u16> {
    match self.port.load(Ordering::SeqCst) {
      0 => None,
      port => Some(port),
    }
  }

  /// Whether the listener is up.
  pub fn is_running(&self) -> bool {
    self.port().is_some()
  }

  /// Captured transactions.
  pub fn capture_log(&self) -> Arc<CaptureLog> {
    self.log.clone()
  }

  /// Root authority and identity cache.
  pub fn certificates(&self) -> Arc<CertificateManager> {
    self.context.certificates.clone()
  }

  /// Root certificate in PEM format, for installing in client trust stores.
  pub fn ca_cert_pem(&self) -> &str {
    self.context.certificates.ca_cert_pem()
  }

  /// Write the root certificate, and optionally its private key, as PEM.
  pub async fn export_ca(&self, cert_path: impl AsRef<Path>, key_path: Option<&Path>) -> Result<()> {
    self
      .context
      .certificates
      .authority()
      .export(cert_path, key_path)
      .await
  }

  /// Resolve `pattern` (exact name or `*.suffix`) to `ip`.
  pub fn remap_host(&self, pattern: &str, ip: IpAddr) {
    self.context.connector.resolver().remap_host(pattern, ip);
  }

  /// Drop the mapping for `pattern`. Returns whether one existed.
  pub fn remove_host_remap(&self, pattern: &str) -> bool {
    self.context.connector.resolver().remove_host_remap(pattern)
  }

  /// Drop every host mapping.
  pub fn clear_host_remap(&self) {
    self.context.connector.resolver().clear_host_remap();
  }

  /// Load `ip hostname` lines. Returns how many were valid.
  pub fn load_host_remap(&self, table: &str) -> usize {
    self.context.connector.resolver().load_remap_table(table)
  }

  /// Change what is recorded for new transactions.
  pub fn set_capture_types(&self, types: CaptureTypes) {
    self.log.set_capture_types(types);
  }

  /// Replace the rewrite rules.
  pub fn set_rewrite_rules(&self, rules: Vec<RewriteRule>) {
    self.context.with_rewrite(|rewrite| rewrite.rules = rules);
  }

  /// Turn response rewriting on or off.
  pub fn set_rewrite_enabled(&self, enabled: bool) {
    self.context.with_rewrite(|rewrite| rewrite.enabled = enabled);
  }

  /// Register a capture hook; it sees transactions started afterwards.
  pub async fn add_hook(&self, hook: Arc<dyn CaptureHook>) {
    self.context.pipeline.write().await.add_hook(hook);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::KeyAlgorithm;

  async fn proxy(config: ProxyConfig) -> MitmProxy {
    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, time::Duration::days(1)).unwrap();
    MitmProxy::with_authority(config, ca).await.unwrap()
  }

  #[tokio::test]
  async fn start_twice_is_an_error() {
    let proxy = proxy(ProxyConfig::default().port(0)).await;
    let port = proxy.start().await.unwrap();
    assert_ne!(port, 0);
    assert_eq!(proxy.port(), Some(port));
    assert!(matches!(proxy.start().await, Err(Error::ProxyStart(_))));
    proxy.stop().await;
    assert!(!proxy.is_running());
    proxy.stop().await;
  }

  #[tokio::test]
  async fn restart_rebinds() {
    let proxy = proxy(ProxyConfig::default().port(0)).await;
    proxy.start().await.unwrap();
    let port = proxy.restart().await.unwrap();
    assert!(proxy.is_running());
    assert_eq!(proxy.port(), Some(port));
    proxy.stop().await;
  }

  #[tokio::test]
  async fn runtime_settings_apply() {
    let proxy = proxy(ProxyConfig::default().host_remap("10.0.0.1 a.test")).await;
    assert_eq!(proxy.context.connector.resolver().overrides().len(), 1);
    assert_eq!(proxy.load_host_remap("10.0.0.2 b.test\nbad line"), 1);
    assert!(proxy.remove_host_remap("a.test"));
    proxy.clear_host_remap();
    assert!(proxy.context.connector.resolver().overrides().is_empty());

    proxy.set_capture_types(CaptureTypes::none());
    assert_eq!(proxy.capture_log().capture_types(), CaptureTypes::none());

    proxy.set_rewrite_rules(vec![RewriteRule::new(
      "/",
      crate::rewrite::RewriteAction::AppendAtTail {
        text: "x".to_string(),
      },
    )]);
    assert!(proxy.context.rewrite_rule_for("http://a.test/").is_none());
    proxy.set_rewrite_enabled(true);
    assert!(proxy.context.rewrite_rule_for("http://a.test/").is_some());
  }
}
