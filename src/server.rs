//! Proxy server: accept loop, CONNECT handling and plain forwarding

use crate::ca::CertificateManager;
use crate::capture::CaptureLog;
use crate::connector::Connector;
use crate::errors::{Error, Failure, Result};
use crate::exchange::{abort, begin, exchange, next_request, Outcome};
use crate::hooks::CapturePipeline;
use crate::http::{error_response, RequestHead};
use crate::record::EntryDraft;
use crate::rewrite::{RewriteRule, RewriteRules};
use crate::socket::{tunnel, MaybeTlsStream, Socket, Upstream};
use crate::tls::TlsFactory;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::{HeaderValue, Method, Uri};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::LazyConfigAcceptor;

const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Accepted client connection; stalled reads and writes time out.
type ClientStream = BufReader<Socket<TcpStream>>;

/// Per-connection limits.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
  pub(crate) intercept_https: bool,
  pub(crate) response_timeout: Duration,
  pub(crate) idle_timeout: Duration,
  pub(crate) handshake_timeout: Duration,
  pub(crate) max_rewrite_buffer: usize,
}

/// Everything a connection task needs, shared across the proxy.
pub(crate) struct ProxyContext {
  pub(crate) settings: Settings,
  pub(crate) certificates: Arc<CertificateManager>,
  pub(crate) tls: TlsFactory,
  pub(crate) upstream_tls: Arc<ClientConfig>,
  pub(crate) connector: Connector,
  pub(crate) pipeline: tokio::sync::RwLock<CapturePipeline>,
  pub(crate) rewrite: RwLock<RewriteRules>,
  next_connection: AtomicU64,
}

impl ProxyContext {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    settings: Settings,
    certificates: Arc<CertificateManager>,
    tls: TlsFactory,
    upstream_tls: Arc<ClientConfig>,
    connector: Connector,
    log: Arc<CaptureLog>,
    rewrite: RewriteRules,
  ) -> Self {
    ProxyContext {
      settings,
      certificates,
      tls,
      upstream_tls,
      connector,
      pipeline: tokio::sync::RwLock::new(CapturePipeline::new(log)),
      rewrite: RwLock::new(rewrite),
      next_connection: AtomicU64::new(0),
    }
  }

  fn next_connection_id(&self) -> String {
    (self.next_connection.fetch_add(1, Ordering::Relaxed) + 1).to_string()
  }

  pub(crate) async fn pipeline(&self) -> CapturePipeline {
    self.pipeline.read().await.clone()
  }

  pub(crate) fn with_rewrite<T>(&self, f: impl FnOnce(&mut RewriteRules) -> T) -> T {
    let mut guard = self
      .rewrite
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
  }

  pub(crate) fn rewrite_rule_for(&self, url: &str) -> Option<RewriteRule> {
    self
      .rewrite
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .first_match(url)
      .cloned()
  }
}

/// Accept connections until `shutdown` flips, then drain them within
/// `grace` and abort the rest.
pub(crate) async fn serve(
  listener: TcpListener,
  ctx: Arc<ProxyContext>,
  mut shutdown: watch::Receiver<bool>,
  grace: Duration,
) {
  let mut connections = JoinSet::new();
  let signal = shutdown.clone();
  loop {
    tokio::select! {
      _ = shutdown.changed() => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          let ctx = ctx.clone();
          let signal = signal.clone();
          connections.spawn(async move {
            if let Err(e) = handle_connection(stream, peer, ctx, signal).await {
              tracing::debug!("[PROXY] connection from {} ended: {}", peer, e);
            }
          });
        }
        Err(e) => tracing::error!("[PROXY] failed to accept connection: {}", e),
      },
      Some(_) = connections.join_next(), if !connections.is_empty() => {}
    }
  }
  drop(listener);

  let open = connections.len();
  if open > 0 {
    tracing::debug!("[PROXY] waiting for {} connections", open);
  }
  let drain = async { while connections.join_next().await.is_some() {} };
  if tokio::time::timeout(grace, drain).await.is_err() {
    tracing::warn!(
      "[PROXY] aborting {} connections after the shutdown grace period",
      connections.len()
    );
    connections.abort_all();
    while connections.join_next().await.is_some() {}
  }
}

async fn handle_connection(
  stream: TcpStream,
  peer: SocketAddr,
  ctx: Arc<ProxyContext>,
  mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
  tracing::debug!("[PROXY] connection from {}", peer);
  let idle = Some(ctx.settings.idle_timeout);
  let mut client = BufReader::new(Socket::new(stream, idle, idle));
  let Some(head) = next_request(&mut client, ctx.settings.idle_timeout, &mut shutdown).await? else {
    return Ok(());
  };
  if head.method == Method::CONNECT {
    handle_connect(client, head, &ctx, shutdown).await
  } else {
    forward_plain(client, head, &ctx, shutdown).await
  }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals. The host is
/// returned without brackets.
pub(crate) fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
  let invalid = || Error::invalid_request(format!("invalid authority {:?}", authority));
  let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
    let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
    let port = match tail {
      "" => default_port,
      _ => tail
        .strip_prefix(':')
        .and_then(|p| p.parse().ok())
        .ok_or_else(invalid)?,
    };
    (host, port)
  } else {
    match authority.rsplit_once(':') {
      Some((host, port)) if !host.contains(':') => (host, port.parse().map_err(|_| invalid())?),
      Some(_) => return Err(invalid()),
      None => (authority, default_port),
    }
  };
  if host.is_empty() {
    return Err(invalid());
  }
  Ok((host.to_string(), port))
}

/// `host[:port]` for URLs, omitting `default_port`.
pub(crate) fn display_authority(host: &str, port: u16, default_port: u16) -> String {
  let host = if host.contains(':') {
    format!("[{}]", host)
  } else {
    host.to_string()
  };
  if port == default_port {
    host
  } else {
    format!("{}:{}", host, port)
  }
}

fn entry_url(scheme: &str, authority: &str, target: &str) -> String {
  if target.starts_with('/') {
    format!("{}://{}{}", scheme, authority, target)
  } else if target == "*" {
    format!("{}://{}", scheme, authority)
  } else {
    target.to_string()
  }
}

async fn connect_failed(pipeline: &CapturePipeline, draft: EntryDraft, failure: Failure) {
  tracing::debug!("[PROXY] CONNECT {} failed: {}", draft.url(), failure);
  pipeline.fail(draft.fail(&failure), &failure).await;
}

async fn handle_connect(
  mut client: ClientStream,
  head: RequestHead,
  ctx: &ProxyContext,
  shutdown: watch::Receiver<bool>,
) -> Result<()> {
  let (host, port) = match split_host_port(&head.target, 443) {
    Ok(target) => target,
    Err(e) => {
      client
        .write_all(&error_response(400, "Bad Request", &e.to_string()))
        .await?;
      client.flush().await?;
      return Ok(());
    }
  };
  let pipeline = ctx.pipeline().await;
  let log = pipeline.log();
  let draft = EntryDraft::new(
    &Method::CONNECT,
    format!("https://{}", display_authority(&host, port, 0)),
    head.version,
    log.capture_types(),
    log.max_body_chars(),
  );

  let connected = match ctx.connector.connect(&host, port).await {
    Ok(connected) => connected,
    Err(failure) => {
      let (status, reason) = failure.client_status();
      let response = error_response(status, reason, &failure.to_string());
      if client.write_all(&response).await.is_ok() {
        let _ = client.flush().await;
      }
      connect_failed(&pipeline, draft, failure).await;
      return Ok(());
    }
  };
  client.write_all(CONNECTION_ESTABLISHED).await?;
  client.flush().await?;

  if !ctx.settings.intercept_https {
    return blind_tunnel(client, connected.stream, &host, port, ctx.settings.idle_timeout).await;
  }

  let first = match tokio::time::timeout(ctx.settings.idle_timeout, client.fill_buf()).await {
    Ok(Ok(buf)) => buf.first().copied(),
    Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => None,
    Ok(Err(e)) => return Err(e.into()),
    Err(_) => None,
  };
  let Some(first) = first else {
    return Ok(());
  };
  let id = ctx.next_connection_id();

  if first != TLS_HANDSHAKE_RECORD {
    tracing::debug!("[PROXY] cleartext traffic inside tunnel to {}:{}", host, port);
    let upstream = Upstream::new(
      MaybeTlsStream::Tcp(connected.stream),
      display_authority(&host, port, 80),
      connected.server_ip,
      id,
      connected.timings,
      ctx.settings.idle_timeout,
    );
    return relay_tunnel(client, upstream, "http", ctx, shutdown).await;
  }

  let start = match tokio::time::timeout(
    ctx.settings.handshake_timeout,
    LazyConfigAcceptor::new(Acceptor::default(), client),
  )
  .await
  {
    Ok(Ok(start)) => start,
    Ok(Err(e)) => {
      let failure = Failure::Handshake(format!("client hello: {}", e));
      connect_failed(&pipeline, draft, failure).await;
      return Ok(());
    }
    Err(_) => {
      let failure = Failure::Handshake("client hello timed out".to_string());
      connect_failed(&pipeline, draft, failure).await;
      return Ok(());
    }
  };
  let server_name = start
    .client_hello()
    .server_name()
    .map(|name| name.to_string())
    .unwrap_or_else(|| host.clone());

  let mut timings = connected.timings;
  let upstream_stream = match ctx
    .connector
    .upgrade_to_tls(connected.stream, &server_name, ctx.upstream_tls.clone())
    .await
  {
    Ok((stream, ssl)) => {
      timings.ssl = Some(ssl);
      stream
    }
    Err(failure) => {
      connect_failed(&pipeline, draft, failure).await;
      return Ok(());
    }
  };
  let peer_certificate = upstream_stream.peer_certificate();

  let identity = match ctx
    .certificates
    .impersonate(&server_name, peer_certificate.as_ref())
    .await
  {
    Ok(identity) => identity,
    Err(e) => {
      connect_failed(&pipeline, draft, Failure::Certificate(e.to_string())).await;
      return Ok(());
    }
  };
  let server_config = match ctx.tls.downstream_context(&identity) {
    Ok(config) => config,
    Err(e) => {
      connect_failed(&pipeline, draft, Failure::Certificate(e.to_string())).await;
      return Ok(());
    }
  };
  let tls = match tokio::time::timeout(
    ctx.settings.handshake_timeout,
    start.into_stream(server_config),
  )
  .await
  {
    Ok(Ok(tls)) => tls,
    Ok(Err(e)) => {
      let failure = Failure::Handshake(format!("client {}: {}", server_name, e));
      connect_failed(&pipeline, draft, failure).await;
      return Ok(());
    }
    Err(_) => {
      let failure = Failure::Handshake(format!("client {}: handshake timed out", server_name));
      connect_failed(&pipeline, draft, failure).await;
      return Ok(());
    }
  };
  tracing::debug!("[PROXY] intercepting {}:{} as {}", host, port, server_name);

  let upstream = Upstream::new(
    upstream_stream,
    display_authority(&host, port, 443),
    connected.server_ip,
    id,
    timings,
    ctx.settings.idle_timeout,
  );
  relay_tunnel(BufReader::new(tls), upstream, "https", ctx, shutdown).await
}

async fn blind_tunnel(
  mut client: ClientStream,
  upstream: TcpStream,
  host: &str,
  port: u16,
  idle: Duration,
) -> Result<()> {
  let mut upstream = Socket::new(upstream, Some(idle), Some(idle));
  match tunnel(&mut client, &mut upstream, idle).await {
    Ok((up, down)) => tracing::debug!(
      "[PROXY] tunnel to {}:{} closed ({} up, {} down)",
      host,
      port,
      up,
      down
    ),
    Err(e) => tracing::debug!("[PROXY] tunnel to {}:{}: {}", host, port, e),
  }
  Ok(())
}

/// Serve requests read from a CONNECT tunnel over one upstream connection.
async fn relay_tunnel<C>(
  mut client: C,
  mut upstream: Upstream,
  scheme: &str,
  ctx: &ProxyContext,
  mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
  C: AsyncBufRead + AsyncWrite + Unpin + Send,
{
  while let Some(head) = next_request(&mut client, ctx.settings.idle_timeout, &mut shutdown).await? {
    let pipeline = ctx.pipeline().await;
    let url = entry_url(scheme, &upstream.authority, &head.target);
    let draft = begin(&pipeline, &head, url).await;
    match exchange(&mut client, &mut upstream, head, draft, &pipeline, ctx, false).await? {
      Outcome::KeepAlive => {}
      Outcome::Close | Outcome::Stale(_) => break,
    }
  }
  let _ = client.shutdown().await;
  Ok(())
}

/// Absolute-form target of a plain proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProxyTarget {
  tls: bool,
  host: String,
  port: u16,
  origin_form: String,
}

impl ProxyTarget {
  fn parse(head: &RequestHead) -> Result<Self> {
    let uri: Uri = head
      .target
      .parse()
      .map_err(|_| Error::invalid_request(format!("invalid request target {:?}", head.target)))?;
    let tls = match uri.scheme_str() {
      Some(s) if s.eq_ignore_ascii_case("https") => true,
      Some(s) if s.eq_ignore_ascii_case("http") => false,
      Some(s) => return Err(Error::invalid_request(format!("unsupported scheme {}", s))),
      None => false,
    };
    let default_port = if tls { 443 } else { 80 };
    let (host, port) = match uri.authority() {
      Some(authority) => (
        authority.host().trim_start_matches('[').trim_end_matches(']').to_string(),
        authority.port_u16().unwrap_or(default_port),
      ),
      None => {
        let host = head
          .headers
          .get(HOST)
          .and_then(|v| v.to_str().ok())
          .ok_or_else(|| Error::invalid_request("request without host"))?;
        split_host_port(host, default_port)?
      }
    };
    let origin_form = uri
      .path_and_query()
      .map(|pq| pq.as_str().to_string())
      .filter(|pq| !pq.is_empty())
      .unwrap_or_else(|| "/".to_string());
    Ok(ProxyTarget {
      tls,
      host,
      port,
      origin_form,
    })
  }

  fn scheme(&self) -> &'static str {
    if self.tls {
      "https"
    } else {
      "http"
    }
  }

  fn authority(&self) -> String {
    display_authority(&self.host, self.port, if self.tls { 443 } else { 80 })
  }

  /// Key deciding whether an open upstream connection can be reused.
  fn connection_key(&self) -> String {
    format!("{}://{}", self.scheme(), display_authority(&self.host, self.port, 0))
  }
}

/// Rewrite a proxy request into the form sent to the origin server.
fn to_origin_request(head: &mut RequestHead, target: &ProxyTarget) {
  head.target = target.origin_form.clone();
  head.headers.remove("proxy-connection");
  head.headers.remove(PROXY_AUTHORIZATION);
  if !head.headers.contains_key(HOST) {
    if let Ok(value) = HeaderValue::from_str(&target.authority()) {
      head.headers.insert(HOST, value);
    }
  }
}

/// Standard forward proxying of absolute-form requests.
async fn forward_plain(
  mut client: ClientStream,
  first: RequestHead,
  ctx: &ProxyContext,
  mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
  let mut upstream: Option<(String, Upstream)> = None;
  let mut pending = Some(first);
  'requests: loop {
    let mut head = match pending.take() {
      Some(head) => head,
      None => match next_request(&mut client, ctx.settings.idle_timeout, &mut shutdown).await? {
        Some(head) => head,
        None => break,
      },
    };
    if head.method == Method::CONNECT {
      return handle_connect(client, head, ctx, shutdown).await;
    }
    let target = match ProxyTarget::parse(&head) {
      Ok(target) => target,
      Err(e) => {
        client
          .write_all(&error_response(400, "Bad Request", &e.to_string()))
          .await?;
        client.flush().await?;
        break;
      }
    };
    let pipeline = ctx.pipeline().await;
    let url = format!("{}://{}{}", target.scheme(), target.authority(), target.origin_form);
    to_origin_request(&mut head, &target);
    let mut draft = begin(&pipeline, &head, url).await;

    let key = target.connection_key();
    if upstream.as_ref().is_some_and(|(open, _)| open != &key) {
      upstream = None;
    }
    loop {
      let reused = upstream.is_some();
      if !reused {
        let tls = target.tls.then(|| ctx.upstream_tls.clone());
        match ctx.connector.open(&target.host, target.port, tls).await {
          Ok((stream, server_ip, timings)) => {
            let conn = Upstream::new(
              stream,
              target.authority(),
              server_ip,
              ctx.next_connection_id(),
              timings,
              ctx.settings.idle_timeout,
            );
            upstream = Some((key.clone(), conn));
          }
          Err(failure) => {
            abort(&mut client, draft, failure, &pipeline, true).await;
            break 'requests;
          }
        }
      }
      let Some((_, conn)) = upstream.as_mut() else {
        break 'requests;
      };
      match exchange(&mut client, conn, head, draft, &pipeline, ctx, reused).await? {
        Outcome::KeepAlive => continue 'requests,
        Outcome::Close => break 'requests,
        Outcome::Stale(retry) => {
          tracing::debug!("[PROXY] pooled connection to {} was closed, reconnecting", key);
          upstream = None;
          (head, draft) = *retry;
        }
      }
    }
  }
  let _ = client.shutdown().await;
  Ok(())
}
