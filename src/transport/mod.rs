//! Transport layer
//!
//! Owns the seam between the proxy handlers and the SSH session:
//! - [`Transport`]: one live authenticated connection that can open
//!   per-destination streams and answer liveness probes
//! - [`TransportDialer`]: establishes a fresh connection
//! - [`ConnectionManager`]: holds the single shared handle and runs the
//!   single-flight reconnect sequence
//!
//! Errors are a small closed set of categories so that reconnection triggers
//! never depend on the wording of underlying library errors.

mod manager;
mod ssh;

pub use manager::{ConnectionManager, RetryPolicy};
pub use ssh::SshDialer;

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A byte stream to a destination, either tunneled or direct
pub type TransportStream = Box<dyn AsyncStream>;

/// Object-safe alias for async byte streams
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Establishing the transport connection failed
    #[error("dial failed: {0}")]
    Dial(String),

    /// The remote endpoint rejected our credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Host key verification failed
    #[error("host key rejected: {0}")]
    HostKey(String),

    /// The transport connection itself broke (session/packet level)
    #[error("session error: {0}")]
    Session(String),

    /// The destination could not be reached over a healthy transport
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    /// No transport connection is currently installed
    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("timeout")]
    Timeout,
}

impl TransportError {
    /// True when the error indicates the shared transport connection is
    /// broken and a reconnect should be triggered. Client-side and
    /// destination-side failures do not qualify.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Session(_)
                | TransportError::NotConnected
                | TransportError::Closed
                | TransportError::Timeout
        )
    }
}

/// One live authenticated transport connection.
///
/// Handlers read the shared handle optimistically; it may be closed between
/// check and use. Errors from a stale handle classify as transport failures
/// and are retryable, never fatal.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream to `host:port` through this connection
    async fn open_stream(&self, host: &str, port: u16) -> Result<TransportStream, TransportError>;

    /// Lightweight liveness probe
    async fn probe(&self) -> Result<(), TransportError>;

    /// Resolves when the connection has closed, cleanly or with error
    async fn wait_closed(&self);

    /// Tear the connection down
    async fn close(&self);

    /// True once the connection is no longer usable
    fn is_closed(&self) -> bool;
}

/// Establishes fresh transport connections
#[async_trait]
pub trait TransportDialer: Send + Sync {
    async fn dial(&self) -> Result<std::sync::Arc<dyn Transport>, TransportError>;
}

/// Dial a destination directly over the local network stack
pub async fn dial_direct(
    host_port: &str,
    timeout: Duration,
) -> Result<TransportStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(host_port))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Unreachable(format!("{}: {}", host_port, e)))?;

    stream.set_nodelay(true).ok();
    Ok(Box::new(stream))
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process transport doubles shared by the unit tests

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Transport whose streams loop back through `tokio::io::duplex`
    pub struct MockTransport {
        closed: AtomicBool,
        closed_notify: Notify,
        pub close_count: AtomicUsize,
        pub probe_count: AtomicUsize,
        pub probe_ok: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
                close_count: AtomicUsize::new(0),
                probe_count: AtomicUsize::new(0),
                probe_ok: AtomicBool::new(true),
            })
        }

        pub fn set_probe_ok(&self, ok: bool) {
            self.probe_ok.store(ok, Ordering::SeqCst);
        }

        pub fn force_close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.closed_notify.notify_waiters();
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open_stream(
            &self,
            _host: &str,
            _port: u16,
        ) -> Result<TransportStream, TransportError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            let (client, server) = tokio::io::duplex(4096);
            // Echo whatever the caller writes
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(server);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
            Ok(Box::new(client))
        }

        async fn probe(&self) -> Result<(), TransportError> {
            self.probe_count.fetch_add(1, Ordering::SeqCst);
            if self.probe_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::Timeout)
            }
        }

        async fn wait_closed(&self) {
            while !self.closed.load(Ordering::SeqCst) {
                self.closed_notify.notified().await;
            }
        }

        async fn close(&self) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
            self.force_close();
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    /// Dialer returning fresh [`MockTransport`]s, optionally failing the
    /// first N attempts or delaying each dial
    pub struct MockDialer {
        pub dial_count: AtomicUsize,
        pub fail_first: usize,
        pub delay: Duration,
    }

    impl MockDialer {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                dial_count: AtomicUsize::new(0),
                fail_first: 0,
                delay: Duration::ZERO,
            })
        }

        pub fn failing_first(n: usize) -> Arc<Self> {
            Arc::new(Self {
                dial_count: AtomicUsize::new(0),
                fail_first: n,
                delay: Duration::ZERO,
            })
        }

        pub fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                dial_count: AtomicUsize::new(0),
                fail_first: 0,
                delay,
            })
        }
    }

    #[async_trait]
    impl TransportDialer for MockDialer {
        async fn dial(&self) -> Result<Arc<dyn Transport>, TransportError> {
            let n = self.dial_count.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.fail_first {
                return Err(TransportError::Dial("mock dial refused".to_string()));
            }
            Ok(MockTransport::new())
        }
    }
}
