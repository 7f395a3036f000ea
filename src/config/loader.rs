//! Source tree loader.
//!
//! Reads a tree's defaults document and its environment override document
//! from `<basedir>/config/` and resolves protocol tokens in both. Both files
//! are read concurrently; the override document is resolved after the
//! defaults so its `resolve` references can reach default values.

use super::protocols::Resolver;
use super::types::{ConfigurationLayer, DocumentSource, LoaderOptions, ProcessedDocument};
use crate::error::{ConfigError, Result};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

/// Which source tree a loader reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTree {
    /// Framework-level tree (lower precedence)
    Base,
    /// Application-level tree (higher precedence)
    App,
}

impl std::fmt::Display for SourceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceTree::Base => write!(f, "base"),
            SourceTree::App => write!(f, "app"),
        }
    }
}

/// Read and parse a JSON document. A missing file yields `None`.
pub async fn read_document(path: &Path) -> Result<Option<Value>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ConfigError::io(
                format!("cannot read {}", path.display()),
                err,
            ));
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| ConfigError::parse(path, err))
}

/// Synchronous counterpart of [`read_document`] for the store's fallback lookups.
pub fn read_document_sync(path: &Path) -> Result<Option<Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ConfigError::io(
                format!("cannot read {}", path.display()),
                err,
            ));
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| ConfigError::parse(path, err))
}

/// Loads one source tree into a [`ConfigurationLayer`].
#[derive(Debug, Clone)]
pub struct SourceTreeLoader {
    tree: SourceTree,
    options: LoaderOptions,
    resolver: Resolver,
}

impl SourceTreeLoader {
    pub fn new(tree: SourceTree, options: LoaderOptions) -> Self {
        let resolver = Resolver::new(options.config_path()).with_env_policy(options.env_policy);
        Self {
            tree,
            options,
            resolver,
        }
    }

    /// Replace the resolver, e.g. to register additional protocols.
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn tree(&self) -> SourceTree {
        self.tree
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Load defaults and the `environment` override document from disk.
    pub async fn load(&self, environment: &str) -> Result<ConfigurationLayer> {
        let default_path = self.options.default_source();
        let environment_path = self.options.environment_source(environment);
        debug!(
            tree = %self.tree,
            defaults = %default_path.display(),
            environment = %environment_path.display(),
            "loading source tree"
        );

        let (default_raw, environment_raw) = tokio::try_join!(
            read_document(&default_path),
            read_document(&environment_path)
        )?;

        let default_source = DocumentSource::file(&default_path, default_raw.is_some());
        let environment_source = DocumentSource::file(&environment_path, environment_raw.is_some());
        let default = match default_raw {
            Some(raw) => self.process(raw, None).await?,
            None => ProcessedDocument::default(),
        };
        let environment = match environment_raw {
            Some(raw) => self.process(raw, Some(&default.post_processed)).await?,
            None => ProcessedDocument::default(),
        };

        Ok(ConfigurationLayer {
            default_source,
            environment_source,
            default,
            environment,
        })
    }

    /// Load defaults from disk and take the override document from memory.
    pub async fn load_provided(&self, provided: Value) -> Result<ConfigurationLayer> {
        let default_path = self.options.default_source();
        debug!(
            tree = %self.tree,
            defaults = %default_path.display(),
            "loading source tree with provided overrides"
        );

        let (default_source, default) = match read_document(&default_path).await? {
            Some(raw) => (
                DocumentSource::file(&default_path, true),
                self.process(raw, None).await?,
            ),
            None => (
                DocumentSource::file(&default_path, false),
                ProcessedDocument::default(),
            ),
        };
        let environment = self.process(provided, Some(&default.post_processed)).await?;

        Ok(ConfigurationLayer {
            default_source,
            environment_source: DocumentSource::Provided,
            default,
            environment,
        })
    }

    /// Resolve `raw`; references of an override document also see `defaults`.
    async fn process(&self, raw: Value, defaults: Option<&Value>) -> Result<ProcessedDocument> {
        let post_processed = match defaults {
            Some(defaults) => self.resolver.resolve_in_scope(raw.clone(), defaults).await?,
            None => self.resolver.resolve(raw.clone()).await?,
        };
        Ok(ProcessedDocument {
            pre_processed: raw,
            post_processed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_config(root: &Path, name: &str, content: &str) {
        let dir = root.join("config");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn test_load_defaults_and_environment() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "app.json", r#"{"port": 9000, "motd": "base64:aGk="}"#);
        write_config(temp.path(), "test.json", r#"{"port": 9100}"#);

        let loader = SourceTreeLoader::new(SourceTree::App, LoaderOptions::new(temp.path()));
        let layer = loader.load("test").await.unwrap();

        assert_eq!(
            layer.default.pre_processed,
            json!({"port": 9000, "motd": "base64:aGk="})
        );
        assert_eq!(layer.default.post_processed, json!({"port": 9000, "motd": "hi"}));
        assert_eq!(layer.environment.post_processed, json!({"port": 9100}));
        assert_eq!(
            layer.environment_source,
            DocumentSource::file(&temp.path().join("config/test.json"), true)
        );
    }

    #[tokio::test]
    async fn test_missing_files_yield_empty_documents() {
        let temp = TempDir::new().unwrap();
        let loader = SourceTreeLoader::new(SourceTree::Base, LoaderOptions::new(temp.path()));
        let layer = loader.load("prod").await.unwrap();

        assert_eq!(layer.default, ProcessedDocument::default());
        assert_eq!(layer.environment, ProcessedDocument::default());
        assert!(matches!(
            layer.default_source,
            DocumentSource::File { found: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_parse_error_tagged_with_path() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "app.json", "{}");
        write_config(temp.path(), "test.json", "{ not json");

        let loader = SourceTreeLoader::new(SourceTree::App, LoaderOptions::new(temp.path()));
        let err = loader.load("test").await.unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => {
                assert_eq!(path, temp.path().join("config/test.json"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_protocol_paths_relative_to_config_dir() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "app.json", r#"{"key": "file:key.pem"}"#);
        write_config(temp.path(), "key.pem", "PEM");

        let loader = SourceTreeLoader::new(SourceTree::App, LoaderOptions::new(temp.path()));
        let layer = loader.load("dev").await.unwrap();
        assert_eq!(layer.default.post_processed, json!({"key": "PEM"}));
    }

    #[tokio::test]
    async fn test_load_provided_skips_environment_file() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "app.json", r#"{"name": "svc"}"#);
        write_config(temp.path(), "dev.json", r#"{"name": "ignored"}"#);

        let loader = SourceTreeLoader::new(SourceTree::App, LoaderOptions::new(temp.path()));
        let layer = loader
            .load_provided(json!({"port": "base64:ODA4MA=="}))
            .await
            .unwrap();

        assert_eq!(layer.environment_source, DocumentSource::Provided);
        assert_eq!(layer.environment.post_processed, json!({"port": "8080"}));
        assert_eq!(layer.default.post_processed, json!({"name": "svc"}));
    }

    #[tokio::test]
    async fn test_environment_references_reach_defaults() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "app.json", r#"{"port": 9000, "name": "base64:c3Zj"}"#);
        write_config(
            temp.path(),
            "test.json",
            r#"{"health_port": "resolve:port", "label": "resolve:name"}"#,
        );

        let loader = SourceTreeLoader::new(SourceTree::App, LoaderOptions::new(temp.path()));
        let layer = loader.load("test").await.unwrap();
        assert_eq!(
            layer.environment.post_processed,
            json!({"health_port": 9000, "label": "svc"})
        );

        let layer = loader
            .load_provided(json!({"admin_port": "resolve:port"}))
            .await
            .unwrap();
        assert_eq!(layer.environment.post_processed, json!({"admin_port": 9000}));
    }
}
