//! File watcher for configuration documents.
//!
//! Watches the base and app `config/` directories for changes to JSON and
//! YAML documents and emits events through a tokio watch channel. Uses
//! debouncing to coalesce rapid file changes.

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Event types emitted when configuration documents change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChangeEvent {
    /// A document in the base tree changed
    BaseDocument(PathBuf),
    /// A document in the app tree changed
    AppDocument(PathBuf),
    /// Multiple documents changed in quick succession
    BatchChange(Vec<PathBuf>),
    /// Watcher encountered an error
    Error(String),
}

impl ConfigChangeEvent {
    /// Returns true if this event requires a config reload.
    pub fn requires_reload(&self) -> bool {
        !matches!(self, ConfigChangeEvent::Error(_))
    }

    /// Get the affected paths for this event.
    pub fn affected_paths(&self) -> Vec<&Path> {
        match self {
            ConfigChangeEvent::BaseDocument(p) => vec![p.as_path()],
            ConfigChangeEvent::AppDocument(p) => vec![p.as_path()],
            ConfigChangeEvent::BatchChange(paths) => paths.iter().map(|p| p.as_path()).collect(),
            ConfigChangeEvent::Error(_) => vec![],
        }
    }
}

/// Configuration for the file watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for coalescing rapid changes.
    pub debounce_duration: Duration,
    /// Also watch subdirectories (fallback groups live in `config/<env>/`).
    pub recursive: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_duration: Duration::from_millis(500),
            recursive: true,
        }
    }
}

/// `config/` directories to watch.
#[derive(Debug, Clone)]
pub struct WatchPaths {
    pub base_config_dir: Option<PathBuf>,
    pub app_config_dir: Option<PathBuf>,
}

/// Handle to control the config watcher.
pub struct ConfigWatcherHandle {
    /// Receiver for config change events.
    pub events: watch::Receiver<Option<ConfigChangeEvent>>,
    /// Handle to the watcher task (dropping this will stop the watcher).
    _task_handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcherHandle {
    /// Wait for the next config change event.
    pub async fn wait_for_change(&mut self) -> Option<ConfigChangeEvent> {
        // Skip the initial None value
        loop {
            if self.events.changed().await.is_err() {
                return None;
            }
            let event = self.events.borrow().clone();
            if event.is_some() {
                return event;
            }
        }
    }
}

/// Starts the configuration file watcher.
///
/// Directories that do not exist are skipped with a warning.
pub fn start_config_watcher(
    paths: WatchPaths,
    config: WatcherConfig,
) -> Result<ConfigWatcherHandle, notify::Error> {
    let (event_tx, event_rx) = watch::channel(None);
    let (notify_tx, notify_rx) = mpsc::channel();

    let mut debouncer = new_debouncer(config.debounce_duration, notify_tx)?;
    let watcher = debouncer.watcher();
    let mode = if config.recursive {
        notify::RecursiveMode::Recursive
    } else {
        notify::RecursiveMode::NonRecursive
    };

    for dir in [&paths.base_config_dir, &paths.app_config_dir]
        .into_iter()
        .flatten()
    {
        if dir.exists() {
            info!("Watching config directory: {}", dir.display());
            watcher.watch(dir, mode)?;
        } else {
            warn!(
                "Config directory does not exist, skipping watch: {}",
                dir.display()
            );
        }
    }

    let task_handle = tokio::task::spawn_blocking(move || {
        // Keep the debouncer alive
        let _debouncer = debouncer;
        process_notify_events(notify_rx, event_tx, &paths);
    });

    Ok(ConfigWatcherHandle {
        events: event_rx,
        _task_handle: task_handle,
    })
}

/// Process events from the notify debouncer and convert to ConfigChangeEvents.
fn process_notify_events(
    rx: mpsc::Receiver<Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>>,
    tx: watch::Sender<Option<ConfigChangeEvent>>,
    paths: &WatchPaths,
) {
    loop {
        match rx.recv() {
            Ok(Ok(events)) => {
                if let Some(event) = classify_events(events, paths) {
                    debug!("Config change detected: {:?}", event);
                    if tx.send(Some(event)).is_err() {
                        info!("Config watcher receiver dropped, stopping");
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                error!("File watcher error: {}", e);
                let _ = tx.send(Some(ConfigChangeEvent::Error(e.to_string())));
            }
            Err(_) => {
                info!("Config watcher channel closed, stopping");
                return;
            }
        }
    }
}

/// Collapse a debounced batch into at most one event.
fn classify_events(
    events: Vec<notify_debouncer_mini::DebouncedEvent>,
    paths: &WatchPaths,
) -> Option<ConfigChangeEvent> {
    let mut changed: Vec<ConfigChangeEvent> = events
        .into_iter()
        .filter(|event| {
            matches!(
                event.kind,
                DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
            )
        })
        .filter_map(|event| classify_path(&event.path, paths))
        .collect();

    if changed.len() > 1 {
        let paths = changed
            .iter()
            .flat_map(|event| event.affected_paths())
            .map(Path::to_path_buf)
            .collect();
        Some(ConfigChangeEvent::BatchChange(paths))
    } else {
        changed.pop()
    }
}

/// Classify a single path into a ConfigChangeEvent.
fn classify_path(path: &Path, paths: &WatchPaths) -> Option<ConfigChangeEvent> {
    let extension = path.extension().and_then(|e| e.to_str());
    if !matches!(extension, Some("json") | Some("yaml") | Some("yml")) {
        return None;
    }

    // App first: the app tree may live inside the base tree.
    if let Some(ref app_dir) = paths.app_config_dir
        && path.starts_with(app_dir)
    {
        return Some(ConfigChangeEvent::AppDocument(path.to_path_buf()));
    }
    if let Some(ref base_dir) = paths.base_config_dir
        && path.starts_with(base_dir)
    {
        return Some(ConfigChangeEvent::BaseDocument(path.to_path_buf()));
    }

    None
}
