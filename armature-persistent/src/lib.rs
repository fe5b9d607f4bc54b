//! # Armature Persistent
//!
//! A blocking HTTP/1.1 client that keeps connections open between requests.
//!
//! ## Features
//!
//! - **Per-worker connections**: each thread (or explicit [`WorkerId`]) owns its
//!   connections, so a connection is never shared mid-request
//! - **Lazy invalidation**: changing the proxy or TLS settings bumps a
//!   generation counter; stale connections are closed on next use
//! - **Idle expiry**: connections idle past the timeout are reset before reuse
//! - **Safe retries**: idempotent requests are retried once after a reset and
//!   once after a malformed response
//! - **Proxies**: explicit or from `HTTP_PROXY`/`NO_PROXY`, with `CONNECT`
//!   tunnels for `https`
//! - **Pipelining**: several requests on one connection, responses in order
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use armature_persistent::{PersistentPool, ProxySetting, Request};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PersistentPool::new("api", ProxySetting::None)?;
//!
//!     let response = pool.request("http://api.example.com/users", None)?;
//!     println!("Status: {}", response.status());
//!
//!     let order = Request::post("/orders")
//!         .json(&serde_json::json!({"item": "widget", "quantity": 5}))?;
//!     let response = pool.request("http://api.example.com/orders", Some(order))?;
//!     println!("Created: {}", response.text()?);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use armature_persistent::{PersistentPool, PoolConfig, SocketOption};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PoolConfig::builder()
//!         .name("billing")
//!         .idle_timeout(Some(Duration::from_secs(10)))
//!         .read_timeout(Duration::from_secs(30))
//!         .socket_option(SocketOption::KeepAlive(true))
//!         .retry_change_requests(false)
//!         .build();
//!
//!     let pool = PersistentPool::with_config(config)?;
//!     let response = pool.request("https://billing.example.com/health", None)?;
//!     assert!(response.is_success());
//!
//!     // Replace every worker's connections.
//!     pool.shutdown_all();
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod executor;
mod generation;
mod manager;
mod pool;
mod proxy;
mod request;
mod response;
mod shutdown;
mod socket;
mod store;
mod tls;
mod wire;

pub use config::{DEFAULT_IDLE_TIMEOUT, DEFAULT_KEEP_ALIVE, PoolConfig, PoolConfigBuilder};
pub use connection::ConnectionId;
pub use error::{Diagnostics, PoolError, Result};
pub use generation::{Generations, Track};
pub use pool::PersistentPool;
pub use proxy::{BypassRule, ENV_SENTINEL, Proxy, ProxySetting, ResolvedProxy, parse_no_proxy};
pub use request::{IntoUrl, Request, is_idempotent};
pub use response::{Response, ResponseHead};
pub use socket::SocketOption;
pub use store::WorkerId;
pub use tls::{
    TlsSettings, TlsVersion, VerifyCallback, VerifyMode, load_certs, load_private_key,
    parse_certs, parse_private_key,
};

// Re-export common types
pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header};
pub use rustls::RootCertStore;
pub use rustls::pki_types::{CertificateDer, PrivateKeyDer};
pub use url::Url;

/// Prelude for common imports.
///
/// ```
/// use armature_persistent::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{PoolConfig, PoolConfigBuilder};
    pub use crate::error::{PoolError, Result};
    pub use crate::pool::PersistentPool;
    pub use crate::proxy::{Proxy, ProxySetting};
    pub use crate::request::Request;
    pub use crate::response::Response;
    pub use crate::socket::SocketOption;
    pub use crate::store::WorkerId;
    pub use crate::tls::{TlsVersion, VerifyMode};
    pub use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
}
