//! Configuration hot reload.
//!
//! # Responsibilities
//! - Watch the YAML config file for writes
//! - Coalesce the event bursts editors produce (truncate, write, rename)
//!   into a single reload
//! - Skip reloads whose parsed result is identical to the last applied
//!   config
//!
//! The notify callback does no parsing itself: it only forwards raw change
//! events into a channel. An async pump owns the debounce window and the
//! load/validate/compare pipeline, so a half-written file observed
//! mid-burst never reaches the registry.

use std::path::{Path, PathBuf};
use std::time::Duration;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::GatewayConfig;

/// Quiet period after the last filesystem event before a reload runs.
const DEBOUNCE_QUIET: Duration = Duration::from_millis(250);

/// Start watching `path`. Returns the watcher guard (reloads stop when it
/// is dropped) and the stream of validated, deduplicated config updates.
pub fn watch(
    path: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<GatewayConfig>), notify::Error> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            // Editors replace files via create/rename as often as plain
            // writes; treat any mutation as a change signal.
            Ok(event) if !event.kind.is_access() => {
                let _ = event_tx.send(());
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Watch error: {:?}", e),
        },
        Config::default(),
    )?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;

    let (update_tx, update_rx) = mpsc::unbounded_channel();
    tokio::spawn(reload_pump(path.to_path_buf(), event_rx, update_tx));

    tracing::info!(path = ?path, "Config watcher started");
    Ok((watcher, update_rx))
}

/// Debounce change events and emit each distinct valid config once.
async fn reload_pump(
    path: PathBuf,
    mut events: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<GatewayConfig>,
) {
    let mut last_applied: Option<GatewayConfig> = None;

    while events.recv().await.is_some() {
        let mut closed = false;
        loop {
            match tokio::time::timeout(DEBOUNCE_QUIET, events.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        match load_config(&path) {
            Ok(config) => {
                if last_applied.as_ref() == Some(&config) {
                    tracing::debug!("Config file rewritten without changes, skipping reload");
                } else {
                    tracing::info!("Config file change detected, reloading...");
                    last_applied = Some(config.clone());
                    if updates.send(config).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to reload config: {}. Keeping current configuration.",
                    e
                );
            }
        }

        if closed {
            return;
        }
    }
}
