//! Keep-alive monitoring of the transport connection
//!
//! Armed once per installed transport. Two concurrent waits: a passive wait
//! on the connection's own close signal, and a periodic ticker. Each tick
//! bumps a shared miss counter and fires a probe; a probe response resets
//! the counter. Exhausting `count_max` closes the connection. Either
//! termination path releases the shared handle before returning.

use crate::config::KeepAliveConfig;
use crate::task;
use crate::transport::{ConnectionManager, Transport};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watch one transport connection until it dies or the engine shuts down
pub async fn monitor(
    manager: Arc<ConnectionManager>,
    transport: Arc<dyn Transport>,
    config: KeepAliveConfig,
    cancel: CancellationToken,
) {
    if config.interval_secs == 0 || config.count_max == 0 {
        return;
    }

    // Ticker and probe completions race on this counter
    let misses = Arc::new(AtomicU32::new(0));
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return;
            }
            _ = transport.wait_closed() => {
                // Asynchronous teardown observed before any tick exhausted
                if manager.clear_if_current(&transport) {
                    info!("transport connection closed");
                }
                return;
            }
            _ = ticker.tick() => {
                let count = misses.fetch_add(1, Ordering::SeqCst) + 1;
                if count > config.count_max {
                    warn!(misses = count - 1, "keep-alive exhausted, closing transport");
                    transport.close().await;
                    manager.clear_if_current(&transport);
                    return;
                }

                let probed = Arc::clone(&transport);
                let counter = Arc::clone(&misses);
                task::spawn_supervised("keep-alive-probe", async move {
                    match probed.probe().await {
                        Ok(()) => counter.store(0, Ordering::SeqCst),
                        Err(e) => debug!("keep-alive probe failed: {}", e),
                    }
                });
            }
        }
    }
}
