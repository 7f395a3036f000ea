//! Integration tests for the configuration lifecycle.
//!
//! Each test builds its own base and app trees in a temp directory and its
//! own `ConfigManager`, so tests run independently in parallel.

use layerconf::config::{
    ConfigManager, DocumentSource, LoadOptions, LoadState, LoadStrategy, default_environment,
};
use layerconf::error::{ConfigError, ErrorCode};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Temp layout with `base/config/` and `app/config/`.
struct Trees {
    _temp: TempDir,
    base: PathBuf,
    app: PathBuf,
}

impl Trees {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let base = temp.path().join("base");
        let app = temp.path().join("app");
        fs::create_dir_all(base.join("config")).unwrap();
        fs::create_dir_all(app.join("config")).unwrap();
        Self {
            _temp: temp,
            base,
            app,
        }
    }

    fn write(&self, tree: &Path, name: &str, content: &str) {
        let path = tree.join("config").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn manager(&self) -> ConfigManager {
        let manager = ConfigManager::with_base_dir(Some(self.base.clone()));
        manager.set_config_directory(&self.app, false).unwrap();
        manager
    }
}

#[tokio::test]
async fn test_end_to_end_environment_override() {
    let trees = Trees::new();
    trees.write(&trees.base, "app.json", r#"{"port": 8000}"#);
    trees.write(&trees.app, "app.json", r#"{"port": 9000, "name": "svc"}"#);
    trees.write(&trees.app, "test.json", r#"{"port": 9100}"#);

    let manager = trees.manager();
    let store = manager
        .load_configuration(Some("test"), LoadOptions::new())
        .await
        .unwrap();

    assert_eq!(store.snapshot(), json!({"port": 9100, "name": "svc"}));
    assert_eq!(manager.state(), LoadState::Ready);
    assert_eq!(manager.environment().as_deref(), Some("test"));
    assert_eq!(manager.get_config(Some("port"), false), Some(json!(9100)));
}

#[tokio::test]
async fn test_all_file_tiers_and_deep_merge() {
    let trees = Trees::new();
    trees.write(
        &trees.base,
        "app.json",
        r#"{"db": {"host": "base", "pool": 2}, "tier": "base-default", "only_base": true}"#,
    );
    trees.write(&trees.base, "qa.json", r#"{"db": {"pool": 4}, "tier": "base-env"}"#);
    trees.write(&trees.app, "app.json", r#"{"db": {"name": "orders"}, "tier": "app-default"}"#);
    trees.write(&trees.app, "qa.json", r#"{"db": {"host": "qa-db"}, "tier": "app-env"}"#);

    let manager = trees.manager();
    let store = manager
        .load_configuration(Some("qa"), LoadOptions::new())
        .await
        .unwrap();

    assert_eq!(
        store.snapshot(),
        json!({
            "db": {"host": "qa-db", "pool": 4, "name": "orders"},
            "tier": "app-env",
            "only_base": true
        })
    );
}

#[tokio::test]
async fn test_explicit_overrides_beat_files() {
    let trees = Trees::new();
    trees.write(&trees.base, "app.json", r#"{"port": 8000, "mail": {"from": "base@x"}}"#);
    trees.write(&trees.app, "app.json", r#"{"port": 9000, "name": "svc"}"#);
    trees.write(&trees.app, "dev.json", r#"{"name": "from-env-file"}"#);

    let manager = trees.manager();
    let store = manager
        .load_configuration(
            Some("dev"),
            LoadOptions::new()
                .base_configuration(json!({"port": 1, "mail": {"host": "smtp"}}))
                .app_configuration(json!({"port": 2601})),
        )
        .await
        .unwrap();

    assert_eq!(store.get(Some("port")), Some(json!(2601)));
    // Environment files are not read in explicit mode.
    assert_eq!(store.get(Some("name")), Some(json!("svc")));
    assert_eq!(store.get(Some("mail")), Some(json!({"from": "base@x", "host": "smtp"})));

    let info = manager.info().unwrap();
    assert_eq!(info.strategy, LoadStrategy::Explicit);
    assert_eq!(info.app.environment_source, DocumentSource::Provided);
    assert_eq!(info.app.environment.pre_processed, json!({"port": 2601}));
}

#[tokio::test]
async fn test_protocol_tokens_resolved_per_tree() {
    let trees = Trees::new();
    trees.write(&trees.base, "banner.txt", "framework");
    trees.write(&trees.app, "banner.txt", "application");
    trees.write(&trees.base, "app.json", r#"{"base_banner": "file:banner.txt"}"#);
    trees.write(
        &trees.app,
        "app.json",
        r#"{"app_banner": "file:banner.txt", "copy": "resolve:app_banner"}"#,
    );

    let manager = trees.manager();
    manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap();

    assert_eq!(manager.get_config(Some("base_banner"), false), Some(json!("framework")));
    assert_eq!(manager.get_config(Some("app_banner"), false), Some(json!("application")));
    assert_eq!(manager.get_config(Some("copy"), false), Some(json!("application")));

    let info = manager.info().unwrap();
    assert_eq!(
        info.app.default.pre_processed["app_banner"],
        json!("file:banner.txt")
    );
    assert_eq!(info.result["app_banner"], json!("application"));
}

#[tokio::test]
async fn test_fallback_lookup_reads_and_caches() {
    let trees = Trees::new();
    trees.write(&trees.app, "app.json", r#"{"port": 9000}"#);
    trees.write(&trees.app, "dev/missing-group.json", r#"{"enabled": true}"#);

    let manager = trees.manager();
    manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap();

    let first = manager.get_config(Some("missing-group"), false);
    assert_eq!(first, Some(json!({"enabled": true})));

    fs::remove_file(trees.app.join("config/dev/missing-group.json")).unwrap();
    let second = manager.get_config(Some("missing-group"), false);
    assert_eq!(second, first);

    assert_eq!(manager.get_config(Some("never-there"), false), None);
}

#[tokio::test]
async fn test_ignore_cache_rereads_group() {
    let trees = Trees::new();
    trees.write(&trees.app, "dev/flags.json", r#"{"beta": false}"#);

    let manager = trees.manager();
    manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap();
    assert_eq!(manager.get_config(Some("flags.beta"), false), None);
    assert_eq!(manager.get_config(Some("flags"), false), Some(json!({"beta": false})));

    trees.write(&trees.app, "dev/flags.json", r#"{"beta": true}"#);
    assert_eq!(manager.get_config(Some("flags"), false), Some(json!({"beta": false})));
    assert_eq!(manager.get_config(Some("flags"), true), Some(json!({"beta": true})));
    assert_eq!(manager.get_config(Some("flags.beta"), false), Some(json!(true)));
}

#[tokio::test]
async fn test_set_is_visible_to_later_gets() {
    let trees = Trees::new();
    trees.write(&trees.app, "app.json", r#"{"port": 9000}"#);

    let manager = trees.manager();
    let store = manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap();

    store.set("feature.flag", json!(true));
    assert_eq!(manager.get_config(Some("feature.flag"), false), Some(json!(true)));
    assert_eq!(
        manager.get_config(None, false),
        Some(json!({"port": 9000, "feature": {"flag": true}}))
    );
}

#[test]
fn test_config_directory_conflict_guard() {
    let manager = ConfigManager::with_base_dir(None);
    manager.set_config_directory("/srv/one", false).unwrap();

    let err = manager.set_config_directory("/srv/two", false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DirectoryConflict);

    manager.set_config_directory("/srv/two", true).unwrap();
    assert_eq!(manager.config_directory(), Some(PathBuf::from("/srv/two")));
}

#[tokio::test]
async fn test_environment_change_requires_force() {
    let trees = Trees::new();
    trees.write(&trees.app, "app.json", r#"{"port": 9000}"#);
    trees.write(&trees.app, "prod.json", r#"{"port": 80}"#);

    let manager = trees.manager();
    manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap();

    let err = manager
        .load_configuration(Some("prod"), LoadOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::EnvironmentConflict { .. }));
    // Conflicts fail before any loading begins.
    assert_eq!(manager.state(), LoadState::Ready);
    assert_eq!(manager.environment().as_deref(), Some("dev"));

    // Reloading the active environment is not a change.
    manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap();
    manager
        .load_configuration(None, LoadOptions::new())
        .await
        .unwrap();

    let store = manager
        .load_configuration(Some("prod"), LoadOptions::new().force(true))
        .await
        .unwrap();
    assert_eq!(store.get(Some("port")), Some(json!(80)));
    assert_eq!(manager.environment().as_deref(), Some("prod"));
}

#[tokio::test]
async fn test_default_environment_used_when_none_given() {
    let trees = Trees::new();
    let manager = trees.manager();
    let store = manager
        .load_configuration(None, LoadOptions::new())
        .await
        .unwrap();
    assert_eq!(store.environment(), default_environment());
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_store() {
    let trees = Trees::new();
    trees.write(&trees.app, "app.json", r#"{"port": 9000}"#);

    let manager = trees.manager();
    let first = manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap();

    trees.write(&trees.app, "staging.json", "{ definitely not json");
    let err = manager
        .load_configuration(Some("staging"), LoadOptions::new().force(true))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ParseError);
    assert_eq!(manager.state(), LoadState::Failed);
    assert_eq!(manager.environment().as_deref(), Some("dev"));
    assert_eq!(manager.get_config(Some("port"), false), Some(json!(9000)));
    assert!(Arc::ptr_eq(&manager.store().unwrap(), &first));
}

#[tokio::test]
async fn test_initial_failure_publishes_nothing() {
    let trees = Trees::new();
    trees.write(
        &trees.app,
        "app.json",
        r#"{"secret": "env:LAYERCONF_TEST_DEFINITELY_UNSET"}"#,
    );

    let manager = trees.manager();
    let err = manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap_err();

    match err {
        ConfigError::Resolution { ref key_path, .. } => assert_eq!(key_path, "secret"),
        ref other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.state(), LoadState::Failed);
    assert!(manager.store().is_none());
    assert!(manager.info().is_none());
}

#[tokio::test]
async fn test_when_ready_resolves_for_early_and_late_waiters() {
    let trees = Trees::new();
    trees.write(&trees.app, "app.json", r#"{"name": "svc"}"#);
    let manager = Arc::new(trees.manager());

    let early = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.when_ready().await })
    };

    manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap();

    let store = early.await.unwrap().unwrap();
    assert_eq!(store.get(Some("name")), Some(json!("svc")));

    let late = manager.when_ready().await.unwrap();
    assert!(Arc::ptr_eq(&store, &late));

    // A forced reload replaces what later waiters see.
    trees.write(&trees.app, "app.json", r#"{"name": "svc2"}"#);
    manager
        .load_configuration(None, LoadOptions::new().force(true))
        .await
        .unwrap();
    let reloaded = manager.when_ready().await.unwrap();
    assert_eq!(reloaded.get(Some("name")), Some(json!("svc2")));
    // The old store is discarded, not mutated.
    assert_eq!(store.get(Some("name")), Some(json!("svc")));
}

#[tokio::test]
async fn test_options_override_directories_and_file() {
    let trees = Trees::new();
    trees.write(&trees.base, "defaults.json", r#"{"from": "base"}"#);
    trees.write(&trees.app, "defaults.json", r#"{"name": "custom"}"#);
    trees.write(&trees.app, "app.json", r#"{"name": "ignored"}"#);

    let manager = ConfigManager::with_base_dir(None);
    let store = manager
        .load_configuration(
            Some("dev"),
            LoadOptions::new()
                .basedir(&trees.base)
                .app_basedir(&trees.app)
                .file("defaults.json"),
        )
        .await
        .unwrap();

    assert_eq!(store.snapshot(), json!({"from": "base", "name": "custom"}));
    let info = manager.info().unwrap();
    assert_eq!(
        info.base.default_source,
        DocumentSource::File {
            path: trees.base.join("config/defaults.json"),
            found: true
        }
    );
}

#[tokio::test]
async fn test_info_serializes() {
    let trees = Trees::new();
    trees.write(&trees.app, "app.json", r#"{"port": 1}"#);
    let manager = trees.manager();
    manager
        .load_configuration(Some("dev"), LoadOptions::new())
        .await
        .unwrap();

    let info = serde_json::to_value(&*manager.info().unwrap()).unwrap();
    assert_eq!(info["environment"], json!("dev"));
    assert_eq!(info["strategy"], json!("file"));
    assert_eq!(info["result"], json!({"port": 1}));
    assert_eq!(info["app"]["environment_source"]["found"], json!(false));
}

#[tokio::test]
async fn test_environment_document_references_tree_defaults() {
    let trees = Trees::new();
    trees.write(&trees.app, "app.json", r#"{"port": 9000}"#);
    trees.write(&trees.app, "test.json", r#"{"health_port": "resolve:port"}"#);

    let manager = trees.manager();
    let store = manager
        .load_configuration(Some("test"), LoadOptions::new())
        .await
        .unwrap();

    assert_eq!(store.get(Some("health_port")), Some(json!(9000)));
    assert_eq!(store.get(Some("port")), Some(json!(9000)));
}
