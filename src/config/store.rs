//! Merged configuration store with dotted-path lookups.

use super::loader::read_document_sync;
use super::protocols::lookup_path;
use crate::error::{ConfigError, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

/// The authoritative merged configuration of one load cycle.
///
/// Writes through [`set`](ConfigStore::set) are visible to every holder of the
/// store; concurrent writers are last-write-wins.
#[derive(Debug)]
pub struct ConfigStore {
    data: RwLock<Value>,
    environment: String,
    /// Directory holding `<group>.json` files for late lookups.
    fallback_dir: Option<PathBuf>,
}

impl ConfigStore {
    /// Create a store. Non-object documents are replaced by an empty object.
    pub fn new(data: Value, environment: impl Into<String>) -> Self {
        let data = match data {
            Value::Object(_) => data,
            _ => Value::Object(Map::new()),
        };
        Self {
            data: RwLock::new(data),
            environment: environment.into(),
            fallback_dir: None,
        }
    }

    pub fn with_fallback_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fallback_dir = Some(dir.into());
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn fallback_dir(&self) -> Option<&Path> {
        self.fallback_dir.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, Value> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Value> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the whole merged document.
    pub fn snapshot(&self) -> Value {
        self.read().clone()
    }

    /// Value at a dotted path, without touching disk.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        let data = self.read();
        match lookup_path(&data, key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.clone()),
        }
    }

    /// Value at `key`, or the whole document when `key` is `None`.
    ///
    /// A key missing from the store is looked up in `<fallback_dir>/<key>.json`;
    /// a hit is cached into the store. Misses are not cached, so a file created
    /// later is still picked up.
    pub fn get(&self, key: Option<&str>) -> Option<Value> {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return Some(self.snapshot());
        };
        if let Some(value) = self.lookup(key) {
            return Some(value);
        }

        match self.load_group(key) {
            Ok(value) => value,
            Err(err) => {
                error!(key, error = %err, "failed to load configuration group");
                None
            }
        }
    }

    /// Re-read `<key>.json` from the fallback directory, bypassing the store.
    ///
    /// The store is refreshed when the file exists. Keys that would leave the
    /// fallback directory are rejected.
    pub fn load_group(&self, key: &str) -> Result<Option<Value>> {
        let Some(dir) = self.fallback_dir.as_deref() else {
            return Ok(None);
        };
        if !is_group_name(key) {
            return Err(ConfigError::InvalidKey {
                key: key.to_string(),
            });
        }
        let path = dir.join(format!("{key}.json"));
        let value = read_document_sync(&path)?;
        if let Some(ref value) = value {
            debug!(key, path = %path.display(), "caching configuration group");
            self.set(key, value.clone());
        }
        Ok(value)
    }

    /// Write `value` at a dotted path, creating intermediate objects.
    ///
    /// Non-object values along the path are replaced by objects.
    pub fn set(&self, key: &str, value: Value) {
        let mut data = self.write();
        if key.is_empty() {
            *data = value;
            return;
        }

        let segments: Vec<&str> = key.split('.').collect();
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return,
        };

        let mut node = &mut *data;
        for segment in parents {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => unreachable!("node was just made an object"),
            };
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Value::Object(map) = node {
            map.insert(last.to_string(), value);
        }
    }
}

/// A key usable as a file name inside the fallback directory.
fn is_group_name(key: &str) -> bool {
    !key.is_empty() && !key.starts_with('.') && !key.contains(['/', '\\']) && !key.contains("..")
}
