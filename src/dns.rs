//! Name resolution with host remapping
//!
//! Host overrides are consulted before any DNS lookup. Lookups go to the
//! system resolver, or to custom name servers through hickory-dns when the
//! `dns` feature is enabled.
//!
//! # Example
//!
//! ```rust
//! use dragnet::dns::Resolver;
//!
//! # async fn run() -> Result<(), dragnet::Error> {
//! let resolver = Resolver::system();
//! resolver.load_remap_table("93.184.216.34 example.com");
//! let addrs = resolver.resolve("example.com", 443).await?;
//! assert_eq!(addrs[0].to_string(), "93.184.216.34:443");
//! # Ok(())
//! # }
//! ```
use crate::errors::{new_io_error, Result};
#[cfg(feature = "dns")]
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, ResolverConfig};
#[cfg(feature = "dns")]
use hickory_resolver::name_server::TokioConnectionProvider;
#[cfg(feature = "dns")]
use hickory_resolver::proto::xfer::Protocol;
#[cfg(feature = "dns")]
use hickory_resolver::TokioResolver;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

/// Maps a hostname pattern to a fixed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOverride {
  /// exact host name, or `*.suffix` for any subdomain
  pub pattern: String,
  /// address returned instead of a DNS answer
  pub ip: IpAddr,
}

impl HostOverride {
  /// New override; the pattern is matched case-insensitively.
  pub fn new(pattern: impl Into<String>, ip: IpAddr) -> Self {
    HostOverride {
      pattern: normalize(&pattern.into()),
      ip,
    }
  }

  /// Whether `host` is covered by this override.
  pub fn matches(&self, host: &str) -> bool {
    let host = normalize(host);
    match self.pattern.strip_prefix("*.") {
      Some(suffix) => host.len() > suffix.len() && host.ends_with(suffix) && {
        let cut = host.len() - suffix.len();
        host.as_bytes()[cut - 1] == b'.'
      },
      None => host == self.pattern,
    }
  }
}

fn normalize(host: &str) -> String {
  host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Parse remap lines of the form `ip hostname`.
///
/// Lines that do not have exactly two tokens, or whose first token is not an
/// IP address, are ignored. `#` starts a comment.
pub fn parse_remap_table(text: &str) -> Vec<HostOverride> {
  text
    .lines()
    .map(|line| line.split('#').next().unwrap_or_default())
    .filter_map(|line| {
      let tokens: Vec<&str> = line.split_whitespace().collect();
      match tokens.as_slice() {
        [ip, host] => match ip.parse::<IpAddr>() {
          Ok(ip) => Some(HostOverride::new(*host, ip)),
          Err(_) => {
            tracing::debug!("ignoring remap line with invalid address: {}", line);
            None
          }
        },
        _ => None,
      }
    })
    .collect()
}

#[derive(Clone)]
enum Backend {
  System,
  #[cfg(feature = "dns")]
  Hickory(Arc<TokioResolver>),
}

/// Resolves upstream host names, honoring host overrides.
#[derive(Clone)]
pub struct Resolver {
  overrides: Arc<RwLock<Vec<HostOverride>>>,
  backend: Backend,
}

impl std::fmt::Debug for Resolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Resolver")
      .field("overrides", &self.overrides().len())
      .finish()
  }
}

impl Default for Resolver {
  fn default() -> Self {
    Resolver::system()
  }
}

impl Resolver {
  /// Use the operating system resolver.
  pub fn system() -> Self {
    Resolver {
      overrides: Arc::new(RwLock::new(Vec::new())),
      backend: Backend::System,
    }
  }

  /// Use the given name servers instead of the system configuration.
  #[cfg(feature = "dns")]
  pub fn with_servers(dns_servers: Vec<SocketAddr>) -> Result<Self> {
    if dns_servers.is_empty() {
      return Err(new_io_error(
        ErrorKind::InvalidInput,
        "DNS servers list cannot be empty",
      ));
    }
    let name_servers: Vec<NameServerConfig> = dns_servers
      .into_iter()
      .map(|addr| NameServerConfig::new(addr, Protocol::Udp))
      .collect();
    let config = ResolverConfig::from_parts(None, vec![], NameServerConfigGroup::from(name_servers));
    let resolver =
      TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build();
    Ok(Resolver {
      overrides: Arc::new(RwLock::new(Vec::new())),
      backend: Backend::Hickory(Arc::new(resolver)),
    })
  }

  /// Snapshot of the override table.
  pub fn overrides(&self) -> Vec<HostOverride> {
    self
      .overrides
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  fn with_overrides<T>(&self, f: impl FnOnce(&mut Vec<HostOverride>) -> T) -> T {
    let mut guard = self
      .overrides
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
  }

  /// Map `pattern` to `ip`, replacing an existing mapping for the pattern.
  pub fn remap_host(&self, pattern: &str, ip: IpAddr) {
    let entry = HostOverride::new(pattern, ip);
    self.with_overrides(|table| {
      table.retain(|o| o.pattern != entry.pattern);
      table.push(entry);
    });
  }

  /// Drop the mapping for `pattern`. Returns whether one existed.
  pub fn remove_host_remap(&self, pattern: &str) -> bool {
    let pattern = normalize(pattern);
    self.with_overrides(|table| {
      let before = table.len();
      table.retain(|o| o.pattern != pattern);
      before != table.len()
    })
  }

  /// Drop every mapping.
  pub fn clear_host_remap(&self) {
    self.with_overrides(|table| table.clear());
  }

  /// Add every valid line of a remap table. Returns how many were loaded.
  pub fn load_remap_table(&self, text: &str) -> usize {
    let parsed = parse_remap_table(text);
    let count = parsed.len();
    for entry in parsed {
      self.remap_host(&entry.pattern, entry.ip);
    }
    count
  }

  /// Override for `host`; exact patterns win over wildcards.
  pub fn lookup_override(&self, host: &str) -> Option<IpAddr> {
    let table = self
      .overrides
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    table
      .iter()
      .filter(|o| !o.pattern.starts_with("*."))
      .chain(table.iter().filter(|o| o.pattern.starts_with("*.")))
      .find(|o| o.matches(host))
      .map(|o| o.ip)
  }

  /// Resolve `host` to socket addresses.
  pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
      return Ok(vec![SocketAddr::new(ip, port)]);
    }
    if let Some(ip) = self.lookup_override(host) {
      tracing::debug!("host {} remapped to {}", host, ip);
      return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs: Vec<SocketAddr> = match &self.backend {
      Backend::System => tokio::net::lookup_host((host, port)).await?.collect(),
      #[cfg(feature = "dns")]
      Backend::Hickory(resolver) => resolver
        .lookup_ip(host)
        .await
        .map_err(|e| new_io_error(ErrorKind::Other, &e.to_string()))?
        .iter()
        .map(|ip| SocketAddr::new(ip, port))
        .collect(),
    };
    if addrs.is_empty() {
      return Err(new_io_error(
        ErrorKind::NotFound,
        &format!("no addresses found for host: {}", host),
      ));
    }
    Ok(addrs)
  }
}
