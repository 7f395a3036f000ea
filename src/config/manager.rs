//! Lifecycle controller.
//!
//! Owns the active environment, the application config directory, the
//! current [`ConfigStore`] and the readiness signal. A load cycle runs the
//! base and app source trees concurrently, merges them and swaps in a fresh
//! store; a failed cycle leaves the previous store in place.

use super::loader::{SourceTree, SourceTreeLoader};
use super::merge::merge_layers;
use super::protocols::Resolver;
use super::store::ConfigStore;
use super::types::{
    APP_DIR_VAR, BASE_DIR_VAR, ConfigurationInfo, ConfigurationLayer, DocumentSource, LoadOptions,
    LoadState, LoadStrategy, LoaderOptions, default_environment,
};
use crate::error::{ConfigError, Result};
use arc_swap::ArcSwapOption;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Default)]
struct ManagerState {
    load_state: LoadState,
    /// Environment of the store currently published.
    environment: Option<String>,
    config_dir: Option<PathBuf>,
}

/// Loads, merges and publishes configuration.
///
/// Use [`ConfigManager::global`] for the process-wide instance, or create
/// independent instances (e.g. in tests).
pub struct ConfigManager {
    /// Framework source tree used when a load does not name one.
    base_dir: Option<PathBuf>,
    state: Mutex<ManagerState>,
    store: ArcSwapOption<ConfigStore>,
    info: ArcSwapOption<ConfigurationInfo>,
    ready: watch::Sender<Option<Arc<ConfigStore>>>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("base_dir", &self.base_dir)
            .field("state", &self.state())
            .field("environment", &self.environment())
            .finish()
    }
}

static GLOBAL: OnceLock<ConfigManager> = OnceLock::new();

impl ConfigManager {
    /// Create a manager whose base tree comes from `LAYERCONF_BASE_DIR`, if set.
    pub fn new() -> Self {
        let base_dir = std::env::var_os(BASE_DIR_VAR).map(PathBuf::from);
        Self::with_base_dir(base_dir)
    }

    pub fn with_base_dir(base_dir: Option<PathBuf>) -> Self {
        let (ready, _) = watch::channel(None);
        Self {
            base_dir,
            state: Mutex::new(ManagerState::default()),
            store: ArcSwapOption::empty(),
            info: ArcSwapOption::empty(),
            ready,
        }
    }

    /// The process-wide manager.
    pub fn global() -> &'static ConfigManager {
        GLOBAL.get_or_init(ConfigManager::new)
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> LoadState {
        self.lock().load_state
    }

    /// Environment of the published store.
    pub fn environment(&self) -> Option<String> {
        self.lock().environment.clone()
    }

    pub fn config_directory(&self) -> Option<PathBuf> {
        self.lock().config_dir.clone()
    }

    /// Set the application source tree. Fails if already set, unless `force`.
    pub fn set_config_directory(&self, path: impl Into<PathBuf>, force: bool) -> Result<()> {
        let path = path.into();
        let mut state = self.lock();
        if let Some(current) = &state.config_dir
            && !force
        {
            let err = ConfigError::DirectoryConflict {
                current: current.clone(),
                requested: path,
            };
            error!(error = %err, "config directory already set");
            return Err(err);
        }
        debug!(path = %path.display(), "config directory set");
        state.config_dir = Some(path);
        Ok(())
    }

    /// Currently published store.
    pub fn store(&self) -> Option<Arc<ConfigStore>> {
        self.store.load_full()
    }

    /// Currently published store, or [`ConfigError::NotReady`] before the first
    /// successful load.
    pub fn require_store(&self) -> Result<Arc<ConfigStore>> {
        self.store().ok_or(ConfigError::NotReady)
    }

    /// Diagnostics of the last successful load.
    pub fn info(&self) -> Option<Arc<ConfigurationInfo>> {
        self.info.load_full()
    }

    /// Wait until a store has been published and return the latest one.
    pub async fn when_ready(&self) -> Result<Arc<ConfigStore>> {
        let mut rx = self.ready.subscribe();
        let ready = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ConfigError::NotReady)?;
        ready.clone().ok_or(ConfigError::NotReady)
    }

    /// Look up `key` in the published store (the whole document for `None`).
    ///
    /// `ignore_cache` re-reads the key's fallback file from disk.
    pub fn get_config(&self, key: Option<&str>, ignore_cache: bool) -> Option<Value> {
        let store = match self.require_store() {
            Ok(store) => store,
            Err(err) => {
                error!(
                    error = %err,
                    "wait for load_configuration() or when_ready() before reading configuration"
                );
                return None;
            }
        };

        match key {
            Some(key) if ignore_cache => match store.load_group(key) {
                Ok(Some(value)) => Some(value),
                Ok(None) => store.lookup(key),
                Err(err) => {
                    error!(key, error = %err, "failed to reload configuration group");
                    None
                }
            },
            _ => store.get(key),
        }
    }

    /// Run one load cycle and publish the result.
    ///
    /// `environment` defaults to the active environment, then to `APP_ENV`,
    /// then to `dev`. Switching away from an active environment requires
    /// `options.force`.
    pub async fn load_configuration(
        &self,
        environment: Option<&str>,
        options: LoadOptions,
    ) -> Result<Arc<ConfigStore>> {
        let (environment, app_dir) = {
            let mut state = self.lock();
            let environment = match environment {
                Some(env) => env.to_string(),
                None => state
                    .environment
                    .clone()
                    .unwrap_or_else(default_environment),
            };

            if let Some(active) = &state.environment
                && *active != environment
                && !options.force
            {
                let err = ConfigError::EnvironmentConflict {
                    active: active.clone(),
                    requested: environment,
                };
                error!(error = %err, "environment change without force");
                return Err(err);
            }

            let app_dir = options
                .app_basedir
                .clone()
                .or_else(|| state.config_dir.clone());

            state.load_state = LoadState::Loading;
            (environment, app_dir)
        };
        debug!(environment = %environment, "environment selected");

        match self.run_cycle(&environment, app_dir, options).await {
            Ok((store, info)) => {
                let store = Arc::new(store);
                self.store.store(Some(Arc::clone(&store)));
                self.info.store(Some(Arc::new(info)));
                {
                    let mut state = self.lock();
                    state.environment = Some(environment.clone());
                    state.load_state = LoadState::Ready;
                }
                self.ready.send_replace(Some(Arc::clone(&store)));
                info!(environment = %environment, "configuration loaded");
                Ok(store)
            }
            Err(err) => {
                self.lock().load_state = LoadState::Failed;
                error!(environment = %environment, error = %err, "error loading configuration");
                Err(err)
            }
        }
    }

    async fn run_cycle(
        &self,
        environment: &str,
        app_dir: Option<PathBuf>,
        options: LoadOptions,
    ) -> Result<(ConfigStore, ConfigurationInfo)> {
        let strategy = options.strategy();
        let app_dir = match app_dir.or_else(|| std::env::var_os(APP_DIR_VAR).map(PathBuf::from)) {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|err| ConfigError::io("cannot determine current directory", err))?,
        };
        let base_dir = options.basedir.clone().or_else(|| self.base_dir.clone());

        let app = SourceTreeLoader::new(SourceTree::App, tree_options(&app_dir, &options));
        let base = base_dir
            .as_deref()
            .map(|dir| SourceTreeLoader::new(SourceTree::Base, tree_options(dir, &options)));

        info!(
            strategy = %strategy,
            app = %app_dir.display(),
            base = ?base_dir,
            "loading configuration"
        );

        let (base_layer, app_layer) = match strategy {
            LoadStrategy::File => {
                tokio::try_join!(load_tree(base.as_ref(), environment), app.load(environment))?
            }
            LoadStrategy::Explicit => {
                let base_override = options.base_configuration.unwrap_or_else(empty_object);
                let app_override = options.app_configuration.unwrap_or_else(empty_object);
                tokio::try_join!(
                    provide_tree(base.as_ref(), base_override),
                    app.load_provided(app_override)
                )?
            }
        };
        debug!(
            base_defaults = %base_layer.default_source,
            base_environment = %base_layer.environment_source,
            app_defaults = %app_layer.default_source,
            app_environment = %app_layer.environment_source,
            "source trees loaded"
        );

        let merged = merge_layers(&base_layer, &app_layer, strategy);
        let store = ConfigStore::new(merged.clone(), environment)
            .with_fallback_dir(app.options().fallback_dir(environment));
        let info = ConfigurationInfo {
            environment: environment.to_string(),
            strategy,
            loaded_at: chrono::Utc::now(),
            base: base_layer,
            app: app_layer,
            result: merged,
        };
        Ok((store, info))
    }
}

fn tree_options(dir: &Path, options: &LoadOptions) -> LoaderOptions {
    let tree = LoaderOptions::new(dir);
    match &options.file {
        Some(file) => tree.with_defaults_file(file.clone()),
        None => tree,
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn load_tree(loader: Option<&SourceTreeLoader>, environment: &str) -> Result<ConfigurationLayer> {
    match loader {
        Some(loader) => loader.load(environment).await,
        None => Ok(ConfigurationLayer::default()),
    }
}

async fn provide_tree(loader: Option<&SourceTreeLoader>, provided: Value) -> Result<ConfigurationLayer> {
    match loader {
        Some(loader) => loader.load_provided(provided).await,
        None => {
            let mut layer = ConfigurationLayer {
                environment_source: DocumentSource::Provided,
                ..ConfigurationLayer::default()
            };
            // No tree to resolve against: relative protocol arguments use the cwd.
            let resolver = Resolver::new(".");
            layer.environment.post_processed = resolver.resolve(provided.clone()).await?;
            layer.environment.pre_processed = provided;
            Ok(layer)
        }
    }
}
