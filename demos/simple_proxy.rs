//! Simple intercepting proxy
//!
//! Starts a proxy with the logging hook, exports the root certificate,
//! records traffic for a while and writes the capture as HAR.
//!
//! To run:
//! ```bash
//! cargo run --example simple_proxy -- 120
//! ```
//!
//! Then point your browser at the proxy on 127.0.0.1:8080 and trust
//! `dragnet-root.pem`.

use dragnet::{LoggingHook, MitmProxy, ProxyConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dragnet=debug")),
    )
    .init();

  let seconds = std::env::args()
    .nth(1)
    .and_then(|arg| arg.parse().ok())
    .unwrap_or(60);

  println!("=== dragnet ===\n");

  let proxy = MitmProxy::new(ProxyConfig::default().port(8080)).await?;
  proxy.add_hook(Arc::new(LoggingHook)).await;

  let port = proxy.start().await?;
  proxy.export_ca("dragnet-root.pem", None).await?;
  println!("Proxy listening on 127.0.0.1:{}", port);
  println!("Root certificate written to dragnet-root.pem");
  println!("Recording for {} seconds\n", seconds);

  tokio::time::sleep(Duration::from_secs(seconds)).await;

  let log = proxy.capture_log();
  log.export_to("capture.har").await?;
  println!("{} entries written to capture.har", log.len());

  proxy.stop().await;
  Ok(())
}
