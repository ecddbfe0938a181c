//! # Passage
//!
//! A local network proxy that multiplexes client traffic through a single
//! authenticated SSH connection.
//!
//! ## Features
//!
//! - **SOCKS5 proxy** (RFC 1928 CONNECT, no-auth) tunneled over SSH
//! - **HTTP proxy** (CONNECT + implicit proxying of plain requests)
//! - **Domain filtering** with a memoized match cache and hot reload
//! - **Self-healing transport**: keep-alive probing, single-flight reconnect
//!   with exponential backoff
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Local Listeners                      │
//! │            (SOCKS5 handler, HTTP handler)            │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunnel Facade                       │
//! │      (routing decision, domain filter + cache)       │
//! ├─────────────────────────────────────────────────────┤
//! │               Connection Manager                     │
//! │   (single shared SSH handle, reconnect, keep-alive)  │
//! ├─────────────────────────────────────────────────────┤
//! │                 SSH Transport                        │
//! │        (public-key auth, known-hosts check)          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod domain;
pub mod proxy;
pub mod task;
pub mod transport;
pub mod tunnel;

pub use config::AppConfig;
pub use tunnel::Tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timeout for dialing destinations directly over the local network
pub const DIRECT_DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Timeout for dialing the remote SSH endpoint
pub const TRANSPORT_DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Domain filter error: {0}")]
    Domain(#[from] domain::DomainError),

    #[error("Configuration error: {0}")]
    Config(String),
}
