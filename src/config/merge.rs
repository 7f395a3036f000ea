//! Deep merge of resolved configuration documents.
//!
//! Implements field-by-field merging where higher tier values override lower tier values.
//! Arrays are replaced entirely, not concatenated.

use super::types::{ConfigurationLayer, LoadStrategy};
use serde_json::{Map, Value};

/// Precedence tier of a merged source (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrecedenceTier {
    /// Base tree `config/<defaults>` (lowest priority)
    BaseDefault = 0,
    /// Base tree `config/<environment>.json`
    BaseEnvironment = 1,
    /// App tree `config/<defaults>`
    AppDefault = 2,
    /// App tree `config/<environment>.json`
    AppEnvironment = 3,
    /// Caller-supplied base override object
    ExplicitBase = 4,
    /// Caller-supplied app override object (highest priority)
    ExplicitApp = 5,
}

impl PrecedenceTier {
    /// All tiers, lowest priority first.
    pub const ALL: [PrecedenceTier; 6] = [
        PrecedenceTier::BaseDefault,
        PrecedenceTier::BaseEnvironment,
        PrecedenceTier::AppDefault,
        PrecedenceTier::AppEnvironment,
        PrecedenceTier::ExplicitBase,
        PrecedenceTier::ExplicitApp,
    ];
}

impl std::fmt::Display for PrecedenceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrecedenceTier::BaseDefault => write!(f, "base defaults"),
            PrecedenceTier::BaseEnvironment => write!(f, "base environment"),
            PrecedenceTier::AppDefault => write!(f, "app defaults"),
            PrecedenceTier::AppEnvironment => write!(f, "app environment"),
            PrecedenceTier::ExplicitBase => write!(f, "explicit base"),
            PrecedenceTier::ExplicitApp => write!(f, "explicit app"),
        }
    }
}

/// Deep merge two JSON values, with `overlay` taking precedence over `base`.
///
/// - Objects are merged recursively: keys in overlay override keys in base
/// - Arrays, strings, numbers, booleans are replaced entirely
/// - If overlay is null, the base value is preserved (null means "not specified")
///
/// # Example
/// ```
/// use serde_json::json;
/// use layerconf::config::deep_merge;
///
/// let base = json!({
///     "server": { "port": 8080, "host": "localhost" },
///     "features": ["a", "b"]
/// });
/// let overlay = json!({
///     "server": { "port": 9000 },
///     "features": ["c"]
/// });
/// let result = deep_merge(base, overlay);
/// assert_eq!(result, json!({
///     "server": { "port": 9000, "host": "localhost" },
///     "features": ["c"]
/// }));
/// ```
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged_value = if let Some(base_value) = base_map.remove(&key) {
                    deep_merge(base_value, overlay_value)
                } else {
                    overlay_value
                };
                base_map.insert(key, merged_value);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Merge multiple values in order, with later values taking precedence.
///
/// Equivalent to folding `deep_merge` over the list.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}

/// Merge tiered sources into one document.
///
/// Sources may arrive in any order; they are applied lowest tier first, so the
/// result depends only on the tier assignment. The result is always an object.
pub fn merge_tiers(sources: impl IntoIterator<Item = (PrecedenceTier, Value)>) -> Value {
    let mut sources: Vec<_> = sources.into_iter().collect();
    // Stable: two sources on the same tier keep their relative order.
    sources.sort_by_key(|(tier, _)| *tier);

    let merged = deep_merge_all(
        std::iter::once(Value::Object(Map::new())).chain(sources.into_iter().map(|(_, value)| value)),
    );

    match merged {
        Value::Object(_) => merged,
        _ => Value::Object(Map::new()),
    }
}

/// Merge a base and an app layer into the document published to the store.
///
/// With the explicit strategy the layers' environment documents are the
/// caller-supplied overrides and rank above every file-derived tier.
pub fn merge_layers(
    base: &ConfigurationLayer,
    app: &ConfigurationLayer,
    strategy: LoadStrategy,
) -> Value {
    let (base_env_tier, app_env_tier) = match strategy {
        LoadStrategy::File => (PrecedenceTier::BaseEnvironment, PrecedenceTier::AppEnvironment),
        LoadStrategy::Explicit => (PrecedenceTier::ExplicitBase, PrecedenceTier::ExplicitApp),
    };

    merge_tiers([
        (PrecedenceTier::BaseDefault, base.default.post_processed.clone()),
        (base_env_tier, base.environment.post_processed.clone()),
        (PrecedenceTier::AppDefault, app.default.post_processed.clone()),
        (app_env_tier, app.environment.post_processed.clone()),
    ])
}
