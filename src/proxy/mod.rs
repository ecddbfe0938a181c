//! Proxy implementations
//!
//! Provides:
//! - SOCKS5 listener/handler (RFC 1928 CONNECT, no-auth)
//! - HTTP proxy listener/handler (CONNECT + implicit proxying)
//! - the bidirectional byte relay both handlers share

mod http;
mod socks5;

pub use http::HttpProxyServer;
pub use socks5::Socks5Server;

use crate::transport::TransportError;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("IPv6 destinations are not supported")]
    Ipv6Unsupported,

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("proxy authentication failed")]
    AuthenticationFailed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Proxy destination address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 literal and port
    V4(Ipv4Addr, u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Hostname part, without the port
    pub fn host(&self) -> String {
        match self {
            Address::V4(ip, _) => ip.to_string(),
            Address::Domain(name, _) => name.clone(),
        }
    }

    /// Destination port
    pub fn port(&self) -> u16 {
        match self {
            Address::V4(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::V4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// Copy bytes in both directions until both sides have closed.
///
/// A clean EOF on one side only shuts down the peer's write half; the
/// other direction keeps draining, so a client that half-closes after
/// sending its request still receives the full response. Only an I/O
/// error or the governing cancellation token tears the relay down early,
/// and the error is logged once.
pub async fn relay<A, B>(mut client: A, mut dest: B, cancel: &CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut dest) => {
            match result {
                Ok((up, down)) => debug!(up, down, "relay finished"),
                Err(e) => debug!("relay error: {}", e),
            }
        }
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn address_display_and_parts() {
        let v4 = Address::V4(Ipv4Addr::new(93, 184, 216, 34), 80);
        assert_eq!(v4.to_string(), "93.184.216.34:80");
        assert_eq!(v4.host(), "93.184.216.34");
        assert_eq!(v4.port(), 80);

        let dom = Address::Domain("example.com".to_string(), 443);
        assert_eq!(dom.to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn relay_copies_both_directions_and_ends_on_close() {
        let (client_side, client_far) = tokio::io::duplex(1024);
        let (dest_side, dest_far) = tokio::io::duplex(1024);

        let cancel = CancellationToken::new();
        let relay_task = tokio::spawn(async move {
            relay(client_far, dest_far, &cancel).await;
        });

        let (mut client_read, mut client_write) = tokio::io::split(client_side);
        let (mut dest_read, mut dest_write) = tokio::io::split(dest_side);

        client_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        dest_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        dest_write.write_all(b"pong").await.unwrap();
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // The relay ends once both directions have hit EOF
        drop(client_write);
        drop(client_read);
        drop(dest_write);
        drop(dest_read);
        tokio::time::timeout(std::time::Duration::from_secs(2), relay_task)
            .await
            .expect("relay must finish after close")
            .unwrap();
    }

    #[tokio::test]
    async fn half_close_does_not_truncate_the_response() {
        let (client_side, client_far) = tokio::io::duplex(1024);
        let (dest_side, dest_far) = tokio::io::duplex(1024);

        let cancel = CancellationToken::new();
        let relay_task = tokio::spawn(async move {
            relay(client_far, dest_far, &cancel).await;
        });

        let (mut client_read, mut client_write) = tokio::io::split(client_side);
        let (mut dest_read, mut dest_write) = tokio::io::split(dest_side);

        // Client sends its request and closes its write half right away
        client_write.write_all(b"REQ").await.unwrap();
        drop(client_write);

        let mut request = [0u8; 3];
        dest_read.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"REQ");

        // The response arrives well after the client's EOF and must still
        // be relayed in full
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        dest_write.write_all(b"RESPONSE").await.unwrap();
        drop(dest_write);
        drop(dest_read);

        let mut response = Vec::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client_read.read_to_end(&mut response),
        )
        .await
        .expect("response must arrive after client half-close")
        .unwrap();
        assert_eq!(response, b"RESPONSE");

        tokio::time::timeout(std::time::Duration::from_secs(2), relay_task)
            .await
            .expect("relay must finish")
            .unwrap();
    }
}
