#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # tapsocks
//!
//! A local SOCKS5 proxy that intercepts TLS and records the HTTP/1.x traffic
//! it relays.
//!
//! - SOCKS5 `CONNECT` with no authentication
//! - TLS interception with per-host leaves signed by a local root CA
//! - HTTP request/response reconstruction from a tapped copy of the stream
//! - Routing overrides for outbound connections
//!
//! ## Running a proxy
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapsocks::{CertificateStore, Config, Context, Exporter, Server, TracingSink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = Config::default();
//!   let store = CertificateStore::new("/tmp/tapsocks");
//!   let ca = store.load_or_create(config.key_algorithm, &config.organization).await?;
//!   let roots = store.trusted_roots().await?;
//!   let mut exporter = Exporter::default();
//!   exporter.push(Arc::new(TracingSink));
//!   let ctx = Arc::new(Context::new(&config, ca, roots, exporter)?);
//!   let server = Server::bind(ctx, &config.listen, config.listen_alt.as_deref()).await?;
//!   server.run().await;
//!   Ok(())
//! }
//! ```
//!
//! Clients must trust the generated `ca/ca.crt` for interception to succeed.

pub mod buffer;
pub mod ca;
pub mod config;
pub mod conn;
pub mod context;
mod errors;
pub mod export;
pub mod http;
pub mod relay;
pub mod server;
pub mod session;
pub mod sniff;
pub mod socks5;
pub mod store;
pub mod tap;
pub mod tls;
pub mod wiring;

pub use buffer::{Buffer, Reader};
pub use ca::{CertificateAuthority, CertificateManager, KeyAlgorithm};
pub use config::{Config, ConfigWatcher};
pub use conn::Conn;
pub use context::{Context, SessionRegistry};
pub use errors::{Error, Result};
pub use export::{Exporter, HistorySink, HttpRecord, JsonLinesSink, RecordSink, TracingSink};
pub use server::Server;
pub use session::Session;
pub use socks5::{Socks5Server, TargetAddr};
pub use store::CertificateStore;
pub use tap::Tap;
pub use tls::TlsInterceptor;
pub use wiring::{Dialer, Wiring};
