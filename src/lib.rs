#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # dragnet
//!
//! An intercepting HTTP/HTTPS proxy that records traffic as HAR.
//!
//! Clients send plain requests or `CONNECT host:port` to the proxy. Tunnels
//! carrying TLS are decrypted with a certificate forged for the requested
//! host and signed by a local root, re-encrypted towards the real server,
//! and every transaction is appended to a [`CaptureLog`].
//!
//! - Root authority persisted as PEM, leaves cached per host name
//! - Host remapping (`ip hostname` tables, `*.suffix` wildcards)
//! - Paged capture log with filtering, HAR 1.2 export and import
//! - Response rewriting rules
//! - Port fallback when the preferred port is taken
//!
//! ## Running a proxy
//!
//! ```no_run
//! use dragnet::{LoggingHook, MitmProxy, ProxyConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> dragnet::Result<()> {
//! let config = ProxyConfig::default()
//!   .port(8080)
//!   .host_remap("127.0.0.1 example.com");
//! let proxy = MitmProxy::new(config).await?;
//! proxy.add_hook(Arc::new(LoggingHook)).await;
//! let port = proxy.start().await?;
//! println!("listening on {}", port);
//!
//! // ... later
//! proxy.capture_log().export_to("capture.har").await?;
//! proxy.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Optional Features
//!
//! - **charset**: Decode captured bodies using the charset of their `Content-Type`.
//! - **gzip**: Decode gzip and deflate bodies for capture and rewriting.
//! - **dns**: Resolve through custom name servers with hickory-dns.
//!
/// Root certificate authority and impersonated identities
pub mod ca;
/// Capture log, pages and filtering
pub mod capture;
mod config;
mod connector;
/// Host remapping and name resolution
pub mod dns;
mod errors;
mod exchange;
/// HAR 1.2 document model
pub mod har;
/// Capture hooks
pub mod hooks;
mod http;
mod proxy;
/// Entry drafts filled while a transaction is relayed
pub mod record;
/// Response rewrite rules
pub mod rewrite;
mod server;
mod socket;
/// TLS client and server contexts
pub mod tls;

pub use ca::{CertificateAuthority, CertificateManager, ImpersonatedIdentity, KeyAlgorithm};
pub use capture::{filter_entries, CaptureLog, CaptureType, CaptureTypes};
pub use config::ProxyConfig;
pub use connector::{ConnectTimings, Connector, ConnectorBuilder};
pub use errors::{Error, Failure, Result};
pub use har::{Entry, Har, Page};
pub use hooks::{CaptureHook, CapturePipeline, LoggingHook};
pub use proxy::MitmProxy;
pub use record::EntryDraft;
pub use rewrite::{RewriteAction, RewriteRule};
pub use tls::{TlsFactory, TrustPolicy};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
