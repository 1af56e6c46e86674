//! Configuration file watcher for hot reload.
//!
//! Editors usually fire several events per save, so a new configuration is
//! only forwarded when the file loads, validates and differs from the last
//! one delivered.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::EndpointConfig;

/// Loads the watched file and decides whether it holds a new configuration.
pub struct Reloader {
    path: PathBuf,
    last: EndpointConfig,
}

impl Reloader {
    /// `current` is the configuration the process is running with.
    pub fn new(path: &Path, current: EndpointConfig) -> Self {
        Self {
            path: path.to_path_buf(),
            last: current,
        }
    }

    /// Re-read the file. `None` when it is unchanged or invalid.
    pub fn reload(&mut self) -> Option<EndpointConfig> {
        let config = match load_config(&self.path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Failed to reload config; keeping current configuration");
                return None;
            }
        };
        let changed = self.last.changed_sections(&config);
        if changed.is_empty() {
            tracing::debug!(path = ?self.path, "Config file touched without changes");
            return None;
        }
        tracing::info!(path = ?self.path, sections = ?changed, "Config change detected");
        self.last = config.clone();
        Some(config)
    }
}

/// Watches the configuration file and sends changed configurations.
pub struct ConfigWatcher {
    path: PathBuf,
    reloader: Reloader,
    update_tx: mpsc::UnboundedSender<EndpointConfig>,
}

impl ConfigWatcher {
    pub fn new(path: &Path, current: EndpointConfig) -> (Self, mpsc::UnboundedReceiver<EndpointConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            reloader: Reloader::new(path, current),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            reloader,
            update_tx,
        } = self;
        let reloader = Mutex::new(reloader);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let update = reloader.lock().unwrap_or_else(PoisonError::into_inner).reload();
                    if let Some(config) = update {
                        let _ = update_tx.send(config);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}
