//! End-to-end tests against stub upstream servers on loopback

use dragnet::ca::CacheOptions;
use dragnet::{
  CertificateAuthority, CertificateManager, Entry, Error, KeyAlgorithm, MitmProxy, ProxyConfig,
  RewriteAction, RewriteRule, TlsFactory,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::extensions::GeneralName;

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn test_authority() -> CertificateAuthority {
  CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, time::Duration::days(30)).unwrap()
}

fn test_config() -> ProxyConfig {
  let mut config = ProxyConfig::default().port(0);
  config.ca_storage_path = std::env::temp_dir().join("dragnet-tests-unused");
  config
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    if stream.read(&mut byte).await.unwrap() == 0 {
      break;
    }
    head.push(byte[0]);
  }
  String::from_utf8_lossy(&head).into_owned()
}

/// Read until EOF and split into head and body.
async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
  let mut raw = Vec::new();
  stream.read_to_end(&mut raw).await.unwrap();
  let split = raw
    .windows(4)
    .position(|w| w == b"\r\n\r\n")
    .map(|p| p + 4)
    .unwrap_or(raw.len());
  let body = raw.split_off(split);
  (String::from_utf8_lossy(&raw).into_owned(), body)
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
  head.lines().find_map(|line| {
    let (key, value) = line.split_once(':')?;
    key.eq_ignore_ascii_case(name).then(|| value.trim())
  })
}

async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, content_type: &str, body: &[u8]) {
  let head = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    content_type,
    body.len()
  );
  stream.write_all(head.as_bytes()).await.unwrap();
  stream.write_all(body).await.unwrap();
  stream.shutdown().await.ok();
}

/// Plain HTTP server answering every request with a fixed body.
async fn spawn_plain_upstream(body: &'static [u8]) -> SocketAddr {
  let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        read_head(&mut stream).await;
        respond(&mut stream, "text/html", body).await;
      });
    }
  });
  addr
}

/// Plain HTTP server echoing the request head it received as the body.
async fn spawn_echo_upstream() -> SocketAddr {
  let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let head = read_head(&mut stream).await;
        respond(&mut stream, "text/plain", head.as_bytes()).await;
      });
    }
  });
  addr
}

/// TLS server for `example.com` signed by its own root. Returns the address
/// and the path of a PEM file holding that root.
async fn spawn_tls_upstream(name: &str) -> (SocketAddr, std::path::PathBuf) {
  spawn_tls_upstream_as(name, "example.com").await
}

async fn spawn_tls_upstream_as(name: &str, host: &str) -> (SocketAddr, std::path::PathBuf) {
  let upstream_ca = CertificateManager::new(test_authority(), CacheOptions::default());
  let identity = upstream_ca.impersonate(host, None).await.unwrap();
  let factory = TlsFactory::new(&[], None, None).unwrap();
  let acceptor = TlsAcceptor::from(factory.downstream_context(&identity).unwrap());

  let roots = std::env::temp_dir().join(format!("dragnet-{}-{}.pem", name, std::process::id()));
  upstream_ca.authority().export(&roots, None).await.unwrap();

  let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        if let Ok(mut tls) = acceptor.accept(stream).await {
          read_head(&mut tls).await;
          respond(&mut tls, "text/plain", b"hello").await;
        }
      });
    }
  });
  (addr, roots)
}

/// Plain HTTP server that answers one keep-alive response per connection,
/// then closes it. Returns the address and the number of accepted connections.
async fn spawn_closing_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
  let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
  let addr = listener.local_addr().unwrap();
  let accepted = Arc::new(AtomicUsize::new(0));
  let counter = accepted.clone();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      counter.fetch_add(1, Ordering::SeqCst);
      tokio::spawn(async move {
        read_head(&mut stream).await;
        stream
          .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok")
          .await
          .unwrap();
        stream.shutdown().await.ok();
      });
    }
  });
  (addr, accepted)
}

/// Plain HTTP server that reads a request, writes `reply` and then holds the
/// connection open without sending anything more.
async fn spawn_stalling_upstream(reply: &'static [u8]) -> SocketAddr {
  let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        read_head(&mut stream).await;
        stream.write_all(reply).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
      });
    }
  });
  addr
}

/// TCP server copying every byte back until the peer closes.
async fn spawn_byte_echo() -> SocketAddr {
  let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let (mut reader, mut writer) = stream.into_split();
        tokio::io::copy(&mut reader, &mut writer).await.ok();
        writer.shutdown().await.ok();
      });
    }
  });
  addr
}

/// Read one response framed by `Content-Length`.
async fn read_sized_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
  let head = read_head(stream).await;
  let length: usize = header(&head, "content-length")
    .and_then(|v| v.parse().ok())
    .unwrap_or(0);
  let mut body = vec![0u8; length];
  stream.read_exact(&mut body).await.unwrap();
  (head, body)
}

async fn wait_for_entries(proxy: &MitmProxy, count: usize) -> Vec<Arc<Entry>> {
  for _ in 0..100 {
    let entries = proxy.capture_log().entries();
    if entries.len() >= count {
      return entries;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  panic!("expected {} captured entries", count);
}

async fn connect_tunnel(proxy_port: u16, authority: &str) -> (TcpStream, String) {
  let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port))
    .await
    .unwrap();
  let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
  stream.write_all(request.as_bytes()).await.unwrap();
  let reply = read_head(&mut stream).await;
  (stream, reply)
}

#[tokio::test]
async fn test_intercepts_https_and_records_entry() {
  init_tracing();
  let (upstream, roots) = spawn_tls_upstream("intercept").await;
  let config = test_config()
    .extra_trust_roots(&roots)
    .host_remap("127.0.0.1 example.com");
  let ca = test_authority();
  let mut trusted = RootCertStore::empty();
  trusted.add(ca.cert_der().clone()).unwrap();

  let proxy = MitmProxy::with_authority(config, ca).await.unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let authority = format!("example.com:{}", upstream.port());
  let (stream, reply) = connect_tunnel(proxy_port, &authority).await;
  assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);

  let client_config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(trusted)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let mut tls = connector
    .connect(ServerName::try_from("example.com").unwrap(), stream)
    .await
    .unwrap();
  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let (head, body) = read_response(&mut tls).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
  assert_eq!(body, b"hello");

  let entries = wait_for_entries(&proxy, 1).await;
  let entry = &entries[0];
  assert_eq!(
    entry.request.url,
    format!("https://example.com:{}/", upstream.port())
  );
  assert_eq!(entry.request.method, "GET");
  assert_eq!(entry.response.status, 200);
  assert_eq!(entry.response.content.size, 5);
  assert_eq!(entry.response.content.text.as_deref(), Some("hello"));
  assert_eq!(entry.server_ip_address.as_deref(), Some("127.0.0.1"));
  assert!(entry.timings.ssl.is_some());
  assert!((entry.time() - entry.timings.total()).abs() < f64::EPSILON);
  assert!(!entry.is_failure());

  proxy.stop().await;
  std::fs::remove_file(&roots).ok();
}

#[tokio::test]
async fn test_untrusted_upstream_fails_handshake() {
  init_tracing();
  let (upstream, roots) = spawn_tls_upstream("untrusted").await;
  let config = test_config().host_remap("127.0.0.1 example.com");
  let proxy = MitmProxy::with_authority(config, test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let ca_pem = proxy.ca_cert_pem().to_string();
  let mut trusted = RootCertStore::empty();
  for cert in dragnet::tls::parse_pem_certificates(ca_pem.as_bytes()).unwrap() {
    trusted.add(cert).unwrap();
  }

  let authority = format!("example.com:{}", upstream.port());
  let (stream, reply) = connect_tunnel(proxy_port, &authority).await;
  assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);

  let client_config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(trusted)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let result = connector
    .connect(ServerName::try_from("example.com").unwrap(), stream)
    .await;
  assert!(result.is_err());

  let entries = wait_for_entries(&proxy, 1).await;
  assert!(entries[0].is_failure());
  assert_eq!(entries[0].response.status, 0);
  assert!(entries[0]
    .response
    .error
    .as_deref()
    .unwrap_or_default()
    .starts_with("TLS handshake failed"));

  proxy.stop().await;
  std::fs::remove_file(&roots).ok();
}

#[tokio::test]
async fn test_unresolvable_host_is_recorded() {
  init_tracing();
  let mut config = test_config();
  config.resolve_timeout_secs = 3;
  let proxy = MitmProxy::with_authority(config, test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let (_stream, reply) = connect_tunnel(proxy_port, "nonexistent.invalid:443").await;
  assert!(reply.starts_with("HTTP/1.1 502"), "{}", reply);

  let entries = wait_for_entries(&proxy, 1).await;
  assert_eq!(entries.len(), 1);
  let entry = &entries[0];
  assert_eq!(entry.request.method, "CONNECT");
  assert_eq!(entry.response.status, 0);
  assert_eq!(
    entry.response.error.as_deref(),
    Some("Unable to resolve host: nonexistent.invalid:443")
  );
  proxy.stop().await;
}

#[tokio::test]
async fn test_forwards_plain_requests_in_origin_form() {
  init_tracing();
  let upstream = spawn_echo_upstream().await;
  let proxy = MitmProxy::with_authority(test_config(), test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port))
    .await
    .unwrap();
  let request = format!(
    "GET http://{0}/path?x=1 HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\nConnection: close\r\n\r\n",
    upstream
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

  let seen = String::from_utf8(body).unwrap();
  assert!(seen.starts_with("GET /path?x=1 HTTP/1.1\r\n"), "{}", seen);
  assert!(!seen.to_ascii_lowercase().contains("proxy-connection"));
  assert!(!seen.to_ascii_lowercase().contains("proxy-authorization"));

  let entries = wait_for_entries(&proxy, 1).await;
  let entry = &entries[0];
  assert_eq!(entry.request.url, format!("http://{}/path?x=1", upstream));
  assert_eq!(entry.response.status, 200);
  assert!(entry
    .request
    .query_string
    .iter()
    .any(|q| q.name == "x" && q.value == "1"));
  proxy.stop().await;
}

#[tokio::test]
async fn test_rewrites_matching_responses() {
  init_tracing();
  let upstream = spawn_plain_upstream(b"hello").await;
  let config = test_config().rewrite_rules(vec![RewriteRule::new(
    "/page",
    RewriteAction::AppendAtTail {
      text: "<!--x-->".to_string(),
    },
  )]);
  let proxy = MitmProxy::with_authority(config, test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  for (path, expected) in [("/page", &b"hello<!--x-->"[..]), ("/other", &b"hello"[..])] {
    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port))
      .await
      .unwrap();
    let request = format!(
      "GET http://{0}{1} HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
      upstream, path
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut client).await;
    assert_eq!(body, expected);
    assert_eq!(
      header(&head, "content-length"),
      Some(expected.len().to_string().as_str())
    );
  }

  let entries = wait_for_entries(&proxy, 2).await;
  let rewritten = entries
    .iter()
    .find(|e| e.request.url.ends_with("/page"))
    .unwrap();
  assert!(rewritten
    .comment
    .as_deref()
    .unwrap_or_default()
    .contains("rewritten"));
  proxy.stop().await;
}

#[tokio::test]
async fn test_falls_back_when_port_is_taken() {
  init_tracing();
  let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
  let taken = occupied.local_addr().unwrap().port();
  let spare = {
    let free = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    free.local_addr().unwrap().port()
  };

  let config = test_config().port(taken).fallback_ports(spare, spare);
  let proxy = MitmProxy::with_authority(config.clone(), test_authority())
    .await
    .unwrap();
  assert_eq!(proxy.start().await.unwrap(), spare);
  assert_eq!(proxy.port(), Some(spare));

  let other = MitmProxy::with_authority(config, test_authority())
    .await
    .unwrap();
  assert!(matches!(other.start().await, Err(Error::ProxyStart(_))));
  assert!(!other.is_running());

  proxy.stop().await;
  drop(occupied);
}

#[tokio::test]
async fn test_stop_closes_listener() {
  init_tracing();
  let proxy = MitmProxy::with_authority(test_config(), test_authority())
    .await
    .unwrap();
  let port = proxy.start().await.unwrap();
  assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_ok());

  proxy.stop().await;
  assert!(!proxy.is_running());
  assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
  proxy.stop().await;
}

#[tokio::test]
async fn test_stalled_upstream_body_times_out() {
  init_tracing();
  let upstream =
    spawn_stalling_upstream(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 10\r\n\r\nab").await;
  let mut config = test_config();
  config.idle_timeout_secs = 1;
  config.response_timeout_secs = 1;
  let proxy = MitmProxy::with_authority(config, test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port))
    .await
    .unwrap();
  let request = format!("GET http://{0}/slow HTTP/1.1\r\nHost: {0}\r\n\r\n", upstream);
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, body) = tokio::time::timeout(Duration::from_secs(10), read_response(&mut client))
    .await
    .expect("proxy closed the stalled connection");
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
  assert_eq!(body, b"ab");

  wait_for_entries(&proxy, 1).await;
  tokio::time::sleep(Duration::from_millis(300)).await;
  let entries = proxy.capture_log().entries();
  assert_eq!(entries.len(), 1);
  assert!(entries[0].is_failure());
  assert_eq!(entries[0].response.error.as_deref(), Some("Response timed out"));
  proxy.stop().await;
}

#[tokio::test]
async fn test_silent_upstream_gets_gateway_timeout() {
  init_tracing();
  let upstream = spawn_stalling_upstream(b"").await;
  let config = test_config().response_timeout(Duration::from_secs(1));
  let proxy = MitmProxy::with_authority(config, test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port))
    .await
    .unwrap();
  let request = format!(
    "GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
    upstream
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, _) = tokio::time::timeout(Duration::from_secs(10), read_response(&mut client))
    .await
    .unwrap();
  assert!(head.starts_with("HTTP/1.1 504"), "{}", head);

  let entries = wait_for_entries(&proxy, 1).await;
  assert_eq!(entries[0].response.status, 0);
  assert_eq!(entries[0].response.error.as_deref(), Some("Response timed out"));
  proxy.stop().await;
}

#[tokio::test]
async fn test_reconnects_when_pooled_upstream_was_closed() {
  init_tracing();
  let (upstream, accepted) = spawn_closing_upstream().await;
  let proxy = MitmProxy::with_authority(test_config(), test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port))
    .await
    .unwrap();
  for path in ["/first", "/second"] {
    let request = format!("GET http://{0}{1} HTTP/1.1\r\nHost: {0}\r\n\r\n", upstream, path);
    client.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = read_sized_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{} {}", path, head);
    assert_eq!(body, b"ok");
    // let the upstream close its side before the next request
    tokio::time::sleep(Duration::from_millis(200)).await;
  }
  assert_eq!(accepted.load(Ordering::SeqCst), 2);

  let entries = wait_for_entries(&proxy, 2).await;
  assert!(entries.iter().all(|e| e.response.status == 200));
  proxy.stop().await;
}

#[tokio::test]
async fn test_idle_keep_alive_connection_is_closed() {
  init_tracing();
  let (upstream, _) = spawn_closing_upstream().await;
  let mut config = test_config();
  config.idle_timeout_secs = 1;
  let proxy = MitmProxy::with_authority(config, test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port))
    .await
    .unwrap();
  let request = format!("GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\n\r\n", upstream);
  client.write_all(request.as_bytes()).await.unwrap();
  let (head, _) = read_sized_response(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

  let started = Instant::now();
  let mut rest = Vec::new();
  let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
  assert!(matches!(read, Ok(Ok(0))), "connection stayed open: {:?}", read);
  assert!(started.elapsed() >= Duration::from_millis(500));
  proxy.stop().await;
}

#[tokio::test]
async fn test_stop_ends_active_tunnels_after_grace() {
  init_tracing();
  let upstream = spawn_byte_echo().await;
  let config = test_config()
    .https_interception(false)
    .shutdown_grace(Duration::from_secs(1));
  let proxy = MitmProxy::with_authority(config, test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let (mut stream, reply) = connect_tunnel(proxy_port, &upstream.to_string()).await;
  assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);
  stream.write_all(b"ping").await.unwrap();
  let mut echoed = [0u8; 4];
  stream.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"ping");

  let started = Instant::now();
  tokio::time::timeout(Duration::from_secs(5), proxy.stop())
    .await
    .expect("stop waits no longer than the grace period");
  assert!(started.elapsed() < Duration::from_secs(3));
  assert!(!proxy.is_running());

  let mut rest = Vec::new();
  let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest)).await;
  assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "tunnel stayed open: {:?}", read);
}

#[tokio::test]
async fn test_blind_tunnel_passes_bytes_through() {
  init_tracing();
  let upstream = spawn_byte_echo().await;
  let config = test_config().https_interception(false);
  let proxy = MitmProxy::with_authority(config, test_authority())
    .await
    .unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let (mut stream, reply) = connect_tunnel(proxy_port, &upstream.to_string()).await;
  assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);

  // a TLS record header would trigger interception if it were enabled
  let payload = b"\x16\x03\x01\x00\x05hello";
  stream.write_all(payload).await.unwrap();
  let mut echoed = vec![0u8; payload.len()];
  stream.read_exact(&mut echoed).await.unwrap();
  assert_eq!(echoed, payload);

  stream.shutdown().await.unwrap();
  let mut rest = Vec::new();
  tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
    .await
    .unwrap()
    .unwrap();
  assert!(rest.is_empty());
  assert!(proxy.capture_log().is_empty());
  assert_eq!(proxy.certificates().cached_identities().await, 0);
  proxy.stop().await;
}

#[tokio::test]
async fn test_connect_to_bare_ip_forges_ip_san() {
  init_tracing();
  let (upstream, roots) = spawn_tls_upstream_as("bare-ip", "127.0.0.1").await;
  let config = test_config().extra_trust_roots(&roots);
  let ca = test_authority();
  let mut trusted = RootCertStore::empty();
  trusted.add(ca.cert_der().clone()).unwrap();

  let proxy = MitmProxy::with_authority(config, ca).await.unwrap();
  let proxy_port = proxy.start().await.unwrap();

  let (stream, reply) = connect_tunnel(proxy_port, &upstream.to_string()).await;
  assert!(reply.starts_with("HTTP/1.1 200"), "{}", reply);

  let client_config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(trusted)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  // IP server names carry no SNI
  let mut tls = connector
    .connect(ServerName::try_from("127.0.0.1").unwrap(), stream)
    .await
    .unwrap();

  let leaf = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
  let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).unwrap();
  let san = cert.subject_alternative_name().unwrap().unwrap();
  assert!(san
    .value
    .general_names
    .iter()
    .any(|name| matches!(name, GeneralName::IPAddress(&[127, 0, 0, 1]))));

  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let (head, body) = read_response(&mut tls).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
  assert_eq!(body, b"hello");

  let entries = wait_for_entries(&proxy, 1).await;
  assert_eq!(entries[0].request.url, format!("https://{}/", upstream));
  proxy.stop().await;
  std::fs::remove_file(&roots).ok();
}
