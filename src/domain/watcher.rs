//! Hot reload of the domain filter file
//!
//! Watches the file's containing directory (editors often replace the file
//! rather than write in place), collapsing bursts of writes into a
//! single-slot "changed" signal so each burst costs one reload.

use super::{DomainError, DomainFilter};
use notify::{recommended_watcher, Event, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Watch `path` and reload `filter` on every change until cancelled.
/// Deleting the file clears the filter; recreating it reloads.
pub async fn watch_domain_file(
    filter: Arc<DomainFilter>,
    path: PathBuf,
    cancel: CancellationToken,
) -> Result<(), DomainError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    // Capacity 1: a burst of writes collapses into one pending reload
    let (changed_tx, mut changed_rx) = mpsc::channel::<()>(1);

    let watched = path.clone();
    let event_tx = changed_tx.clone();
    let mut watcher = recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            if !event.paths.iter().any(|p| p == &watched) {
                return;
            }
            if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() {
                debug!(?event.kind, "domain filter file changed");
                let _ = event_tx.try_send(());
            }
        }
        Err(e) => warn!("domain file watch error: {}", e),
    })
    .map_err(|e| DomainError::Watch(e.to_string()))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| DomainError::Watch(e.to_string()))?;

    // Initial load before any event arrives
    let _ = changed_tx.try_send(());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = changed_rx.recv() => {
                if message.is_none() {
                    return Ok(());
                }
                if let Err(e) = filter.reload_from_file(&path) {
                    warn!("failed to reload domain filter: {}", e);
                }
            }
        }
    }
}
