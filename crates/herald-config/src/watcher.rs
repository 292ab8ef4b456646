//! Hot reload of the endpoint catalog.
//!
//! Watches the catalog's parent directory with a debounced watcher and swaps
//! a freshly parsed catalog into the registry on change. A catalog that fails
//! to parse or validate is logged and ignored.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::new_debouncer;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;
use crate::registry::EndpointRegistry;

/// Reload notifications buffered for [`WatchHandle::next_reload`].
const RELOAD_BUFFER: usize = 16;

/// Configuration for the catalog watcher.
#[derive(Debug, Clone)]
pub struct CatalogWatcherConfig {
    /// Debounce duration for rapid changes.
    pub debounce: Duration,
}

impl Default for CatalogWatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

impl CatalogWatcherConfig {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Handle for a running watcher.
pub struct WatchHandle {
    handle: tokio::task::JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
    reloads: mpsc::Receiver<usize>,
}

impl WatchHandle {
    /// Waits for the next successful reload and returns the new endpoint count.
    pub async fn next_reload(&mut self) -> Option<usize> {
        self.reloads.recv().await
    }

    /// Stops the watcher.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

/// Starts watching the registry's catalog file.
pub fn watch_catalog(
    registry: Arc<EndpointRegistry>,
    config: CatalogWatcherConfig,
) -> Result<WatchHandle, ConfigError> {
    let path = registry.path().ok_or(ConfigError::NoPath)?.to_path_buf();
    let watch_path = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let mut debouncer = new_debouncer(config.debounce, move |res| {
        let _ = notify_tx.send(res);
    })
    .map_err(|e| ConfigError::Watch(e.to_string()))?;
    debouncer
        .watcher()
        .watch(&watch_path, RecursiveMode::NonRecursive)
        .map_err(|e| ConfigError::Watch(e.to_string()))?;

    info!(path = %path.display(), "Watching endpoint catalog");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let (reload_tx, reload_rx) = mpsc::channel(RELOAD_BUFFER);

    let handle = tokio::spawn(async move {
        // keeps the OS watcher alive for the lifetime of the task
        let _debouncer = debouncer;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Endpoint catalog watcher shutting down");
                    break;
                }
                event = notify_rx.recv() => {
                    let Some(result) = event else { break };
                    let events = match result {
                        Ok(events) => events,
                        Err(e) => {
                            error!(error = %e, "Endpoint catalog watcher error");
                            continue;
                        }
                    };
                    if !events.iter().any(|e| e.path.file_name() == path.file_name()) {
                        continue;
                    }
                    match registry.reload() {
                        Ok(count) => notify_reload(&reload_tx, count),
                        Err(e) => {
                            warn!(
                                error = %e,
                                "Endpoint catalog reload failed, keeping previous snapshot"
                            );
                        }
                    }
                }
            }
        }
    });

    Ok(WatchHandle {
        handle,
        shutdown: shutdown_tx,
        reloads: reload_rx,
    })
}

/// Queues a reload notification without waiting on the receiver.
///
/// The registry is already swapped; a full buffer only drops the notice.
fn notify_reload(tx: &mpsc::Sender<usize>, count: usize) {
    match tx.try_send(count) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!(endpoints = count, "Reload notification buffer full, dropping notice");
        }
        Err(TrySendError::Closed(_)) => {}
    }
}
