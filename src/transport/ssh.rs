//! SSH-backed transport
//!
//! Dials the remote endpoint with public-key authentication and a
//! known-hosts check, then opens one direct-tcpip channel per proxied
//! destination. The keep-alive probe opens and immediately drops a session
//! channel, which exercises the full packet path without spawning work on
//! the server.

use super::{Transport, TransportDialer, TransportError, TransportStream};
use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::keys::{check_known_hosts_path, load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Establishes authenticated SSH connections to one configured endpoint
pub struct SshDialer {
    host: String,
    port: u16,
    user: String,
    key: Arc<PrivateKey>,
    known_hosts: PathBuf,
}

impl SshDialer {
    /// Read and validate key material up front; unreadable or malformed
    /// credentials are fatal configuration errors.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        private_key: &Path,
        known_hosts: &Path,
    ) -> Result<Self, crate::Error> {
        let key = load_secret_key(private_key, None).map_err(|e| {
            crate::Error::Config(format!(
                "failed to load private key {}: {}",
                private_key.display(),
                e
            ))
        })?;

        std::fs::metadata(known_hosts).map_err(|e| {
            crate::Error::Config(format!(
                "failed to read known_hosts {}: {}",
                known_hosts.display(),
                e
            ))
        })?;

        Ok(Self {
            host: host.into(),
            port,
            user: user.into(),
            key: Arc::new(key),
            known_hosts: known_hosts.to_path_buf(),
        })
    }
}

#[async_trait]
impl TransportDialer for SshDialer {
    async fn dial(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let config = Arc::new(client::Config::default());
        let verifier = HostKeyVerifier {
            host: self.host.clone(),
            port: self.port,
            known_hosts: self.known_hosts.clone(),
        };

        let mut handle = client::connect(config, (self.host.as_str(), self.port), verifier)
            .await
            .map_err(|e| match e {
                russh::Error::UnknownKey => TransportError::HostKey(format!(
                    "host key for {}:{} not found in known_hosts",
                    self.host, self.port
                )),
                other => TransportError::Dial(other.to_string()),
            })?;

        let auth = handle
            .authenticate_publickey(
                self.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::clone(&self.key), None),
            )
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        match auth {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => {
                return Err(TransportError::Auth(format!(
                    "server rejected public key for user {}",
                    self.user
                )));
            }
        }

        debug!(host = %self.host, port = self.port, "ssh session established");
        Ok(Arc::new(SshTransport {
            handle: Mutex::new(handle),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Verifies the server host key against the configured known_hosts file
struct HostKeyVerifier {
    host: String,
    port: u16,
    known_hosts: PathBuf,
}

impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match check_known_hosts_path(&self.host, self.port, server_public_key, &self.known_hosts) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(
                    host = %self.host,
                    "server host key not present in {}",
                    self.known_hosts.display()
                );
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, "host key verification failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// One live SSH session shared by all proxy handlers
pub struct SshTransport {
    // Channel opens are brief control-plane calls; stream I/O runs on the
    // returned channel and never holds this lock.
    handle: Mutex<Handle<HostKeyVerifier>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_stream(&self, host: &str, port: u16) -> Result<TransportStream, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let handle = self.handle.lock().await;
        match handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
        {
            Ok(channel) => Ok(Box::new(channel.into_stream())),
            Err(e) => {
                // Session breakage and destination refusal arrive as the
                // same library error type; the session state tells them apart.
                if handle.is_closed() {
                    self.closed.store(true, Ordering::SeqCst);
                    Err(TransportError::Session(e.to_string()))
                } else {
                    Err(TransportError::Unreachable(format!("{}:{}: {}", host, port, e)))
                }
            }
        }
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let handle = self.handle.lock().await;
        match handle.channel_open_session().await {
            Ok(channel) => {
                drop(channel);
                Ok(())
            }
            Err(e) => {
                if handle.is_closed() {
                    self.closed.store(true, Ordering::SeqCst);
                }
                Err(TransportError::Session(e.to_string()))
            }
        }
    }

    async fn wait_closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            {
                let handle = self.handle.lock().await;
                if handle.is_closed() {
                    self.closed.store(true, Ordering::SeqCst);
                    return;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "shutting down", "en")
            .await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
