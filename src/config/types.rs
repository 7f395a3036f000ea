//! Configuration types and structures.
//!
//! Options for the source tree loader and for a load cycle, plus the
//! diagnostic snapshots retained after every successful load.

use super::protocols::EnvPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Environment variable naming the active environment.
pub const ENVIRONMENT_VAR: &str = "APP_ENV";

/// Environment used when none is requested, recorded or set in [`ENVIRONMENT_VAR`].
pub const DEFAULT_ENVIRONMENT: &str = "dev";

/// Environment variable naming the framework (base) source tree.
pub const BASE_DIR_VAR: &str = "LAYERCONF_BASE_DIR";

/// Environment variable naming the application source tree.
pub const APP_DIR_VAR: &str = "LAYERCONF_APP_DIR";

/// Default name of the environment-agnostic defaults document.
pub const DEFAULT_DEFAULTS_FILE: &str = "app.json";

/// Default name of the per-tree configuration subdirectory.
pub const DEFAULT_CONFIG_DIR: &str = "config";

/// Environment from [`ENVIRONMENT_VAR`], falling back to [`DEFAULT_ENVIRONMENT`].
pub fn default_environment() -> String {
    std::env::var(ENVIRONMENT_VAR)
        .ok()
        .filter(|env| !env.is_empty())
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
}

/// Layout and resolution settings for one source tree.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Root of the source tree.
    pub basedir: PathBuf,
    /// Subdirectory holding the documents (default: `config`).
    pub config_dir: String,
    /// Defaults document name (default: `app.json`).
    pub defaults_file: String,
    /// Extension of environment override documents (default: `json`).
    pub environment_extension: String,
    /// Behaviour of the `env` protocol for unset variables.
    pub env_policy: EnvPolicy,
}

impl LoaderOptions {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
            config_dir: DEFAULT_CONFIG_DIR.to_string(),
            defaults_file: DEFAULT_DEFAULTS_FILE.to_string(),
            environment_extension: "json".to_string(),
            env_policy: EnvPolicy::default(),
        }
    }

    pub fn with_defaults_file(mut self, file: impl Into<String>) -> Self {
        self.defaults_file = file.into();
        self
    }

    pub fn with_config_dir(mut self, dir: impl Into<String>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn with_env_policy(mut self, policy: EnvPolicy) -> Self {
        self.env_policy = policy;
        self
    }

    /// `<basedir>/<config_dir>`; protocol arguments resolve against it.
    pub fn config_path(&self) -> PathBuf {
        self.basedir.join(&self.config_dir)
    }

    pub fn default_source(&self) -> PathBuf {
        self.config_path().join(&self.defaults_file)
    }

    pub fn environment_source(&self, environment: &str) -> PathBuf {
        self.config_path()
            .join(format!("{environment}.{}", self.environment_extension))
    }

    /// Directory holding late-requested configuration groups.
    pub fn fallback_dir(&self, environment: &str) -> PathBuf {
        self.config_path().join(environment)
    }
}

/// Options for a single load cycle.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Allow changing an already active environment.
    pub force: bool,
    /// Application source tree (overrides the configured directory).
    pub app_basedir: Option<PathBuf>,
    /// Framework source tree.
    pub basedir: Option<PathBuf>,
    /// Defaults document name for both trees.
    pub file: Option<String>,
    /// In-memory base override; selects the explicit strategy.
    pub base_configuration: Option<Value>,
    /// In-memory app override; selects the explicit strategy.
    pub app_configuration: Option<Value>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn app_basedir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.app_basedir = Some(dir.into());
        self
    }

    pub fn basedir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.basedir = Some(dir.into());
        self
    }

    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn base_configuration(mut self, value: Value) -> Self {
        self.base_configuration = Some(value);
        self
    }

    pub fn app_configuration(mut self, value: Value) -> Self {
        self.app_configuration = Some(value);
        self
    }

    pub fn strategy(&self) -> LoadStrategy {
        if self.base_configuration.is_some() || self.app_configuration.is_some() {
            LoadStrategy::Explicit
        } else {
            LoadStrategy::File
        }
    }
}

/// How a load cycle obtains its override documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Environment overrides read from `config/<environment>.json`.
    File,
    /// Environment overrides supplied in memory by the caller.
    Explicit,
}

impl std::fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStrategy::File => write!(f, "file"),
            LoadStrategy::Explicit => write!(f, "explicit"),
        }
    }
}

/// Lifecycle state of a [`ConfigManager`](super::ConfigManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Unconfigured,
    Loading,
    Ready,
    Failed,
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadState::Unconfigured => write!(f, "unconfigured"),
            LoadState::Loading => write!(f, "loading"),
            LoadState::Ready => write!(f, "ready"),
            LoadState::Failed => write!(f, "failed"),
        }
    }
}

/// Where a layer document came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DocumentSource {
    /// Read from disk; `found` is false when the file did not exist.
    File { path: PathBuf, found: bool },
    /// Supplied in memory by the caller.
    Provided,
    /// No source tree configured.
    #[default]
    None,
}

impl DocumentSource {
    pub fn file(path: &Path, found: bool) -> Self {
        DocumentSource::File {
            path: path.to_path_buf(),
            found,
        }
    }
}

impl std::fmt::Display for DocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentSource::File { path, found: true } => write!(f, "{}", path.display()),
            DocumentSource::File { path, found: false } => {
                write!(f, "{} (missing)", path.display())
            }
            DocumentSource::Provided => write!(f, "provided"),
            DocumentSource::None => write!(f, "n/a"),
        }
    }
}

/// Raw and resolved forms of one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedDocument {
    pub pre_processed: Value,
    pub post_processed: Value,
}

impl Default for ProcessedDocument {
    fn default() -> Self {
        Self {
            pre_processed: Value::Object(Map::new()),
            post_processed: Value::Object(Map::new()),
        }
    }
}

/// One source tree (base or app) after loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigurationLayer {
    pub default_source: DocumentSource,
    pub environment_source: DocumentSource,
    pub default: ProcessedDocument,
    pub environment: ProcessedDocument,
}

/// Diagnostics retained after a successful load. Not used for lookups.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationInfo {
    pub environment: String,
    pub strategy: LoadStrategy,
    pub loaded_at: DateTime<Utc>,
    pub base: ConfigurationLayer,
    pub app: ConfigurationLayer,
    /// Merged document as published to the store.
    pub result: Value,
}
