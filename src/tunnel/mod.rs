//! Tunnel facade
//!
//! Ties the pieces together: owns the configuration, the connection
//! manager, and the domain filter, starts the local listeners, and makes
//! the per-destination routing decision for the HTTP proxy. Everything an
//! admin surface would need (current transport, reconnect, domain set,
//! match cache) is exposed here.

pub mod keepalive;

use crate::config::AppConfig;
use crate::domain::{watcher, DomainFilter};
use crate::proxy::{HttpProxyServer, Socks5Server};
use crate::task;
use crate::transport::{
    dial_direct, ConnectionManager, RetryPolicy, SshDialer, Transport, TransportError,
    TransportStream,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The running tunnel: configuration, shared transport, domain filter,
/// and the local proxy listeners.
pub struct Tunnel {
    config: AppConfig,
    manager: Arc<ConnectionManager>,
    filter: Arc<DomainFilter>,
    cancel: CancellationToken,
    socks_addr: OnceLock<SocketAddr>,
    http_addr: OnceLock<SocketAddr>,
}

impl Tunnel {
    /// Assemble a tunnel from parts. Used directly by tests that supply
    /// their own dialer; production code goes through [`Tunnel::load`].
    pub fn new(
        config: AppConfig,
        manager: Arc<ConnectionManager>,
        filter: Arc<DomainFilter>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            filter,
            cancel,
            socks_addr: OnceLock::new(),
            http_addr: OnceLock::new(),
        })
    }

    /// Build the tunnel from configuration and start it.
    ///
    /// Credential problems (unreadable key, missing known_hosts) are fatal
    /// here; an unreachable server is not, it just starts a reconnect burst.
    pub async fn load(config: AppConfig) -> crate::Result<Arc<Self>> {
        let dialer = SshDialer::new(
            config.ssh.host.clone(),
            config.ssh.port,
            config.ssh.user.clone(),
            &config.ssh.private_key,
            &config.ssh.known_hosts,
        )?;

        let cancel = CancellationToken::new();
        let retry = RetryPolicy {
            base: Duration::from_secs(config.retry_interval_secs.max(1)),
            ..RetryPolicy::default()
        };
        let manager =
            ConnectionManager::new(Arc::new(dialer), retry, config.keep_alive, cancel.clone());

        let tunnel = Self::new(config, manager, DomainFilter::new(), cancel);
        tunnel.start().await?;
        Ok(tunnel)
    }

    /// Bind the configured listeners and kick off the background tasks.
    /// Fails only on local bind errors.
    pub async fn start(self: &Arc<Self>) -> crate::Result<()> {
        info!(server = %self.config.server_address(), "starting tunnel");

        // First connection attempt runs the same bounded backoff sequence
        // as any later recovery
        self.trigger_reconnect();

        if self.config.socks5.enabled {
            let server = Socks5Server::bind(&self.config.socks5.listen).await?;
            let _ = self.socks_addr.set(server.local_addr().map_err(crate::Error::Io)?);
            let tunnel = Arc::clone(self);
            let cancel = self.cancel.child_token();
            task::spawn_supervised("socks5-listener", async move {
                server.run(tunnel, cancel).await;
            });
        }

        if self.config.http.enabled {
            let server = HttpProxyServer::bind(&self.config.http.listen).await?;
            let _ = self.http_addr.set(server.local_addr().map_err(crate::Error::Io)?);
            let tunnel = Arc::clone(self);
            let cancel = self.cancel.child_token();
            task::spawn_supervised("http-listener", async move {
                server.run(tunnel, cancel).await;
            });
        }

        if self.config.http.domain_filter {
            if let Some(path) = self.config.http.domain_file.clone() {
                let filter = Arc::clone(&self.filter);
                let cancel = self.cancel.child_token();
                task::spawn_supervised("domain-watcher", async move {
                    if let Err(e) = watcher::watch_domain_file(filter, path, cancel).await {
                        warn!("domain file watcher stopped: {}", e);
                    }
                });
            }
        }

        Ok(())
    }

    /// The configuration this tunnel was started with
    pub fn app_config(&self) -> &AppConfig {
        &self.config
    }

    /// Current transport handle, if connected
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.manager.current()
    }

    /// Re-establish the transport connection, waiting for the outcome
    pub async fn reconnect(&self) -> Option<Arc<dyn Transport>> {
        self.manager.reconnect().await
    }

    /// Start a reconnect in the background; single-flight with any
    /// reconnect already running
    pub fn trigger_reconnect(&self) {
        let manager = Arc::clone(&self.manager);
        task::spawn_supervised("reconnect", async move {
            manager.reconnect().await;
        });
    }

    /// Snapshot of the domain suffix set
    pub fn domains(&self) -> Arc<HashSet<String>> {
        self.filter.domains()
    }

    /// Replace the domain suffix set; the match cache is cleared with it
    pub fn set_domains(&self, domains: impl IntoIterator<Item = String>) {
        self.filter.replace(domains);
    }

    /// Snapshot of the memoized match decisions
    pub fn match_cache(&self) -> HashMap<String, bool> {
        self.filter.match_cache()
    }

    /// Drop all memoized match decisions without touching the suffix set
    pub fn clear_match_cache(&self) {
        self.filter.clear_cache();
    }

    /// Persist the current domain set to the configured filter file
    pub fn flush_domains(&self) -> crate::Result<()> {
        let path = self
            .config
            .http
            .domain_file
            .as_ref()
            .ok_or_else(|| crate::Error::Config("no domain file configured".to_string()))?;
        self.filter.flush(path)?;
        Ok(())
    }

    /// Stop listeners and background tasks and close the transport
    pub async fn shutdown(&self) {
        info!("shutting down tunnel");
        self.cancel.cancel();
        if let Some(transport) = self.manager.current() {
            transport.close().await;
        }
        self.manager.clear();
    }

    /// Address the SOCKS5 listener actually bound, once started
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks_addr.get().copied()
    }

    /// Address the HTTP listener actually bound, once started
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr.get().copied()
    }

    /// Open a stream for a SOCKS5 destination. Always tunneled; on
    /// transport failure the caller triggers an async reconnect.
    pub async fn socks_dest_conn(
        &self,
        host: &str,
        port: u16,
    ) -> Result<TransportStream, TransportError> {
        self.manager.open_stream(host, port).await
    }

    /// Open a stream for an HTTP destination, tunneled or direct per the
    /// routing decision. A transport failure here is retried once after a
    /// synchronous reconnect, so a single broken-handle race stays
    /// invisible to the client.
    pub async fn http_dest_conn(
        self: &Arc<Self>,
        host_port: &str,
    ) -> Result<TransportStream, TransportError> {
        if !self.routes_via_tunnel(host_port) {
            return dial_direct(host_port, crate::DIRECT_DIAL_TIMEOUT).await;
        }

        let (host, port) = split_host_port(host_port)?;
        match self.manager.open_stream(&host, port).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_transport_failure() => {
                self.manager.clear();
                if self.manager.reconnect().await.is_none() {
                    return Err(e);
                }
                self.manager.open_stream(&host, port).await
            }
            Err(e) => Err(e),
        }
    }

    /// Routing decision for an HTTP destination: everything direct unless
    /// tunneling is enabled, then everything tunneled unless the domain
    /// filter narrows it down.
    pub(crate) fn routes_via_tunnel(&self, host_port: &str) -> bool {
        if !self.config.http.over_tunnel {
            return false;
        }
        if !self.config.http.domain_filter {
            return true;
        }
        self.filter.should_tunnel(host_port)
    }
}

fn split_host_port(host_port: &str) -> Result<(String, u16), TransportError> {
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| TransportError::Unreachable(format!("missing port in {:?}", host_port)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TransportError::Unreachable(format!("bad port in {:?}", host_port)))?;
    Ok((host.to_string(), port))
}
