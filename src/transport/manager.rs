//! Ownership and recovery of the single shared transport connection
//!
//! The manager holds at most one live [`Transport`] handle. Reads are
//! optimistic and lock-free on the hot path; every write goes through the
//! single-flight reconnect mutex, so "handle present" always means
//! "believed alive".

use super::{Transport, TransportDialer, TransportError, TransportStream};
use crate::config::KeepAliveConfig;
use crate::task;
use crate::tunnel::keepalive;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reconnect backoff policy: wait = base × 2^attempt, capped
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base wait between attempts
    pub base: Duration,
    /// Cap on the backoff wait
    pub max_wait: Duration,
    /// Attempts before the manager gives up until the next external trigger
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            max_wait: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

/// Manages the lifecycle of the shared transport connection
pub struct ConnectionManager {
    dialer: Arc<dyn TransportDialer>,
    current: RwLock<Option<Arc<dyn Transport>>>,
    reconnect_lock: Mutex<()>,
    retry: RetryPolicy,
    keep_alive: KeepAliveConfig,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        dialer: Arc<dyn TransportDialer>,
        retry: RetryPolicy,
        keep_alive: KeepAliveConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            current: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            retry,
            keep_alive,
            cancel,
        })
    }

    /// Current transport handle, if one is installed.
    ///
    /// The handle may close between this read and its use; callers treat
    /// errors on it as retryable.
    pub fn current(&self) -> Option<Arc<dyn Transport>> {
        self.current.read().expect("transport lock poisoned").clone()
    }

    /// Drop the current handle so the next caller observes "no transport"
    pub fn clear(&self) {
        self.current.write().expect("transport lock poisoned").take();
    }

    /// Drop the handle only if `transport` is still the current one.
    /// Returns true when this call performed the clear.
    pub fn clear_if_current(&self, transport: &Arc<dyn Transport>) -> bool {
        let mut guard = self.current.write().expect("transport lock poisoned");
        match guard.as_ref() {
            Some(cur) if Arc::ptr_eq(cur, transport) => {
                guard.take();
                true
            }
            _ => false,
        }
    }

    /// Open a stream to `host:port` through the current transport
    pub async fn open_stream(
        &self,
        host: &str,
        port: u16,
    ) -> Result<TransportStream, TransportError> {
        let transport = self.current().ok_or(TransportError::NotConnected)?;
        transport.open_stream(host, port).await
    }

    /// Re-establish the transport connection.
    ///
    /// Single-flight: concurrent callers serialize on the reconnect mutex,
    /// and a caller that finds the handle already restored returns it
    /// without dialing. Backoff is exponential and bounded; after
    /// `max_attempts` failures the manager gives up until the next trigger.
    pub async fn reconnect(self: &Arc<Self>) -> Option<Arc<dyn Transport>> {
        let _guard = self.reconnect_lock.lock().await;

        // A previous holder of the lock may have already restored the handle
        if let Some(transport) = self.current() {
            if !transport.is_closed() {
                return Some(transport);
            }
            self.clear();
        }

        if self.cancel.is_cancelled() {
            return None;
        }

        let mut dial_error_logged = false;
        for attempt in 0..self.retry.max_attempts {
            match self.dial_once().await {
                Ok(transport) => {
                    info!(attempt, "transport connected");
                    return Some(transport);
                }
                Err(e) => {
                    // One log line per reconnect burst, not one per retry
                    if !dial_error_logged {
                        warn!("transport dial failed: {}", e);
                        dial_error_logged = true;
                    }
                }
            }

            let factor = 1u32 << attempt.min(16);
            let wait = (self.retry.base * factor).min(self.retry.max_wait);
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        warn!(
            attempts = self.retry.max_attempts,
            "reconnect gave up; will retry on next trigger"
        );
        None
    }

    /// One bounded dial attempt; installs the handle and arms the
    /// keep-alive monitor on success
    async fn dial_once(self: &Arc<Self>) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = tokio::time::timeout(crate::TRANSPORT_DIAL_TIMEOUT, self.dialer.dial())
            .await
            .map_err(|_| TransportError::Timeout)??;

        *self.current.write().expect("transport lock poisoned") = Some(Arc::clone(&transport));

        let manager = Arc::clone(self);
        let monitored = Arc::clone(&transport);
        let keep_alive = self.keep_alive;
        let cancel = self.cancel.child_token();
        task::spawn_supervised("keep-alive", async move {
            keepalive::monitor(manager, monitored, keep_alive, cancel).await;
        });

        Ok(transport)
    }
}
