use crate::connector::ConnectTimings;
use std::future::Future;
use std::io::{Error, ErrorKind};
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::CertificateDer;

const TUNNEL_BUFFER: usize = 16 * 1024;

/// Stream whose reads and writes fail with `TimedOut` once they stall for
/// longer than the configured timeout.
#[derive(Debug)]
pub(crate) struct Socket<S> {
  inner: S,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> Socket<S> {
  pub(crate) fn new(inner: S, read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
    Socket {
      inner,
      read_timeout,
      write_timeout,
      read_deadline: None,
      write_deadline: None,
    }
  }
}

/// Arms `deadline` on the first pending poll; `Ready` once it expired.
fn poll_expired(
  deadline: &mut Option<Pin<Box<Sleep>>>,
  timeout: Option<Duration>,
  cx: &mut Context<'_>,
  what: &str,
) -> Poll<Error> {
  let Some(timeout) = timeout else {
    return Poll::Pending;
  };
  let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
  match sleep.as_mut().poll(cx) {
    Poll::Ready(()) => {
      *deadline = None;
      Poll::Ready(Error::new(
        ErrorKind::TimedOut,
        format!("{} timed out after {:?}", what, timeout),
      ))
    }
    Poll::Pending => Poll::Pending,
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Socket<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(result) => {
        this.read_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => poll_expired(&mut this.read_deadline, this.read_timeout, cx, "read").map(Err),
    }
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Socket<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_write(cx, buf) {
      Poll::Ready(result) => {
        this.write_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => poll_expired(&mut this.write_deadline, this.write_timeout, cx, "write").map(Err),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_flush(cx) {
      Poll::Ready(result) => {
        this.write_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => poll_expired(&mut this.write_deadline, this.write_timeout, cx, "flush").map(Err),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

enum TunnelEvent {
  Up(std::io::Result<usize>),
  Down(std::io::Result<usize>),
  Idle,
}

/// Copy bytes both ways between `client` and `server` until both sides
/// closed or neither side moved a byte for `idle`. Returns the bytes sent
/// upstream and downstream.
pub(crate) async fn tunnel<A, B>(client: &mut A, server: &mut B, idle: Duration) -> std::io::Result<(u64, u64)>
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let mut up_buf = vec![0u8; TUNNEL_BUFFER];
  let mut down_buf = vec![0u8; TUNNEL_BUFFER];
  let (mut client_open, mut server_open) = (true, true);
  let (mut up, mut down) = (0u64, 0u64);
  let mut last_activity = Instant::now();
  while client_open || server_open {
    let event = tokio::select! {
      read = client.read(&mut up_buf), if client_open => TunnelEvent::Up(read),
      read = server.read(&mut down_buf), if server_open => TunnelEvent::Down(read),
      _ = tokio::time::sleep_until(last_activity + idle) => TunnelEvent::Idle,
    };
    match event {
      TunnelEvent::Idle => break,
      TunnelEvent::Up(Ok(0)) => {
        client_open = false;
        let _ = server.shutdown().await;
      }
      TunnelEvent::Down(Ok(0)) => {
        server_open = false;
        let _ = client.shutdown().await;
      }
      TunnelEvent::Up(Ok(n)) => {
        server.write_all(&up_buf[..n]).await?;
        server.flush().await?;
        up += n as u64;
        last_activity = Instant::now();
      }
      TunnelEvent::Down(Ok(n)) => {
        client.write_all(&down_buf[..n]).await?;
        client.flush().await?;
        down += n as u64;
        last_activity = Instant::now();
      }
      // a quiet side is fine while the other one still moves data
      TunnelEvent::Up(Err(e)) | TunnelEvent::Down(Err(e)) if e.kind() == ErrorKind::TimedOut => {
        if last_activity.elapsed() >= idle {
          break;
        }
      }
      TunnelEvent::Up(Err(e)) | TunnelEvent::Down(Err(e)) => return Err(e),
    }
  }
  Ok((up, down))
}

/// Upstream transport: plain TCP or TLS over TCP.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
  /// Leaf certificate presented by the upstream server.
  pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
    match &self {
      MaybeTlsStream::Tcp(_) => None,
      MaybeTlsStream::Tls(stream) => stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.clone().into_owned()),
    }
  }

  /// Whether the stream is encrypted.
  pub fn is_tls(&self) -> bool {
    matches!(self, MaybeTlsStream::Tls(_))
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

/// An open upstream connection and what it cost to set up.
#[derive(Debug)]
pub(crate) struct Upstream {
  pub(crate) io: BufReader<Socket<MaybeTlsStream>>,
  /// `host[:port]` the connection was opened for
  pub(crate) authority: String,
  pub(crate) server_ip: IpAddr,
  /// connection label recorded on entries
  pub(crate) id: String,
  setup: Option<ConnectTimings>,
}

impl Upstream {
  pub(crate) fn new(
    stream: MaybeTlsStream,
    authority: String,
    server_ip: IpAddr,
    id: String,
    setup: ConnectTimings,
    idle: Duration,
  ) -> Self {
    Upstream {
      io: BufReader::new(Socket::new(stream, Some(idle), Some(idle))),
      authority,
      server_ip,
      id,
      setup: Some(setup),
    }
  }

  /// Setup timings, handed out once: later transactions reuse the connection.
  pub(crate) fn take_setup(&mut self) -> Option<ConnectTimings> {
    self.setup.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn stalled_read_times_out() {
    let (near, mut far) = tokio::io::duplex(64);
    let mut socket = Socket::new(near, Some(Duration::from_millis(100)), None);
    far.write_all(b"ab").await.unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(socket.read(&mut buf).await.unwrap(), 2);

    let started = std::time::Instant::now();
    let err = socket.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(100));

    // the deadline is re-armed for the next read
    far.write_all(b"c").await.unwrap();
    assert_eq!(socket.read(&mut buf).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn stalled_write_times_out() {
    let (near, _far) = tokio::io::duplex(4);
    let mut socket = Socket::new(near, None, Some(Duration::from_millis(100)));
    let err = socket.write_all(b"more than four bytes").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
  }

  #[tokio::test]
  async fn tunnel_copies_both_ways_and_ends_when_idle() {
    let (mut client, mut client_end) = tokio::io::duplex(1024);
    let (mut server, mut server_end) = tokio::io::duplex(1024);
    let relay = tokio::spawn(async move {
      tunnel(&mut client_end, &mut server_end, Duration::from_millis(300)).await
    });

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    server.write_all(b"pong!").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong!");

    let (up, down) = tokio::time::timeout(Duration::from_secs(5), relay)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!((up, down), (4, 5));
  }

  #[tokio::test]
  async fn tunnel_ends_when_both_sides_close() {
    let (mut client, mut client_end) = tokio::io::duplex(1024);
    let (mut server, mut server_end) = tokio::io::duplex(1024);
    let relay = tokio::spawn(async move {
      tunnel(&mut client_end, &mut server_end, Duration::from_secs(30)).await
    });
    client.write_all(b"bye").await.unwrap();
    client.shutdown().await.unwrap();
    let mut seen = Vec::new();
    server.read_to_end(&mut seen).await.unwrap();
    assert_eq!(seen, b"bye");
    server.shutdown().await.unwrap();

    let (up, down) = tokio::time::timeout(Duration::from_secs(5), relay)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!((up, down), (3, 0));
  }
}
