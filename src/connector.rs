//! Upstream connection setup: resolve, connect, optional TLS
use crate::dns::Resolver;
use crate::errors::{new_io_error, Failure, Result};
use crate::socket::MaybeTlsStream;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

/// Time spent establishing an upstream connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectTimings {
  /// name resolution, `None` for IP literals and overrides
  pub dns: Option<Duration>,
  /// TCP connect
  pub connect: Option<Duration>,
  /// TLS handshake, `None` for plain connections
  pub ssl: Option<Duration>,
}

/// A fresh TCP connection to an upstream host.
#[derive(Debug)]
pub(crate) struct Connected {
  pub(crate) stream: TcpStream,
  pub(crate) server_ip: IpAddr,
  pub(crate) timings: ConnectTimings,
}

/// A `ConnectorBuilder` can be used to create a `Connector` with custom configuration.
#[derive(Debug, Clone)]
pub struct ConnectorBuilder {
  connect_timeout: Duration,
  resolve_timeout: Duration,
  handshake_timeout: Duration,
  nodelay: bool,
  keepalive: bool,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    ConnectorBuilder {
      connect_timeout: Duration::from_secs(10),
      resolve_timeout: Duration::from_secs(10),
      handshake_timeout: Duration::from_secs(10),
      nodelay: true,
      keepalive: false,
    }
  }
}

impl ConnectorBuilder {
  /// Bound on a single TCP connect attempt.
  pub fn connect_timeout(mut self, timeout: Duration) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }

  /// Bound on name resolution.
  pub fn resolve_timeout(mut self, timeout: Duration) -> ConnectorBuilder {
    self.resolve_timeout = timeout;
    self
  }

  /// Bound on the upstream TLS handshake.
  pub fn handshake_timeout(mut self, timeout: Duration) -> ConnectorBuilder {
    self.handshake_timeout = timeout;
    self
  }

  /// Set `TCP_NODELAY` on upstream sockets.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }

  /// Set `SO_KEEPALIVE` on upstream sockets.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }

  /// Build with the given resolver.
  pub fn build(self, resolver: Resolver) -> Connector {
    Connector {
      connect_timeout: self.connect_timeout,
      resolve_timeout: self.resolve_timeout,
      handshake_timeout: self.handshake_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      resolver,
    }
  }
}

/// Opens upstream connections.
#[derive(Debug, Clone)]
pub struct Connector {
  connect_timeout: Duration,
  resolve_timeout: Duration,
  handshake_timeout: Duration,
  nodelay: bool,
  keepalive: bool,
  resolver: Resolver,
}

impl Connector {
  /// Resolver used for upstream names.
  pub fn resolver(&self) -> &Resolver {
    &self.resolver
  }

  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let stream = tokio::time::timeout(self.connect_timeout, socket.connect(addr))
      .await
      .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??;
    Ok(stream)
  }

  /// Resolve `host` and connect to the first address that answers.
  pub(crate) async fn connect(&self, host: &str, port: u16) -> std::result::Result<Connected, Failure> {
    let resolution = || Failure::Resolution {
      host: host.to_string(),
      port,
    };
    let started = Instant::now();
    let addrs = match tokio::time::timeout(self.resolve_timeout, self.resolver.resolve(host, port)).await {
      Ok(Ok(addrs)) => addrs,
      Ok(Err(e)) => {
        tracing::debug!("resolving {}:{} failed: {}", host, port, e);
        return Err(resolution());
      }
      Err(_) => {
        tracing::debug!("resolving {}:{} timed out", host, port);
        return Err(resolution());
      }
    };
    let looked_up = host
      .trim_start_matches('[')
      .trim_end_matches(']')
      .parse::<IpAddr>()
      .is_err()
      && self.resolver.lookup_override(host).is_none();
    let dns = looked_up.then(|| started.elapsed());

    for addr in addrs {
      let attempt = Instant::now();
      match self.connect_with_addr(addr).await {
        Ok(stream) => {
          return Ok(Connected {
            stream,
            server_ip: addr.ip(),
            timings: ConnectTimings {
              dns,
              connect: Some(attempt.elapsed()),
              ssl: None,
            },
          });
        }
        Err(e) => tracing::debug!("connect to {} failed: {}", addr, e),
      }
    }
    Err(Failure::Connection)
  }

  /// Run a TLS client handshake over `stream`. Returns the stream and the
  /// handshake duration.
  pub(crate) async fn upgrade_to_tls(
    &self,
    stream: TcpStream,
    server_name: &str,
    config: Arc<ClientConfig>,
  ) -> std::result::Result<(MaybeTlsStream, Duration), Failure> {
    let name = ServerName::try_from(server_name.to_string())
      .map_err(|e| Failure::Handshake(format!("invalid server name {}: {}", server_name, e)))?;
    let started = Instant::now();
    let connector = TlsConnector::from(config);
    match tokio::time::timeout(self.handshake_timeout, connector.connect(name, stream)).await {
      Ok(Ok(tls)) => Ok((MaybeTlsStream::Tls(Box::new(tls)), started.elapsed())),
      Ok(Err(e)) => Err(Failure::Handshake(format!("upstream {}: {}", server_name, e))),
      Err(_) => Err(Failure::Handshake(format!("upstream {}: handshake timed out", server_name))),
    }
  }

  /// Connect to `host:port`, adding TLS when `tls` carries a client config.
  pub(crate) async fn open(
    &self,
    host: &str,
    port: u16,
    tls: Option<Arc<ClientConfig>>,
  ) -> std::result::Result<(MaybeTlsStream, IpAddr, ConnectTimings), Failure> {
    let connected = self.connect(host, port).await?;
    let mut timings = connected.timings;
    let stream = match tls {
      Some(config) => {
        let name = host.trim_start_matches('[').trim_end_matches(']');
        let (stream, ssl) = self.upgrade_to_tls(connected.stream, name, config).await?;
        timings.ssl = Some(ssl);
        stream
      }
      None => MaybeTlsStream::Tcp(connected.stream),
    };
    Ok((stream, connected.server_ip, timings))
  }
}
