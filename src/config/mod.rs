//! Layered configuration engine.
//!
//! Merges two source trees, each with a `config/` directory:
//! 1. **Base** - framework-level defaults (`LAYERCONF_BASE_DIR`)
//! 2. **App** - application-level settings (config directory, `LAYERCONF_APP_DIR` or `$CWD`)
//!
//! Each tree provides `config/app.json` (defaults) and `config/<environment>.json`
//! (overrides). String values such as `env:DB_PASSWORD` or `file:key.pem` are
//! protocol tokens, resolved before merging.
//!
//! ## Precedence (highest first)
//! 1. Explicit app override object
//! 2. Explicit base override object
//! 3. App environment document
//! 4. App defaults
//! 5. Base environment document
//! 6. Base defaults
//!
//! ## Environment Variables
//! - `APP_ENV` - Active environment (default: `dev`)
//! - `LAYERCONF_BASE_DIR` - Base source tree
//! - `LAYERCONF_APP_DIR` - App source tree (default: current directory)

mod loader;
mod manager;
mod merge;
mod protocols;
mod store;
mod types;
pub mod watcher;

pub use loader::{SourceTree, SourceTreeLoader, read_document};
pub use manager::ConfigManager;
pub use merge::{PrecedenceTier, deep_merge, deep_merge_all, merge_layers, merge_tiers};
pub use protocols::{EnvPolicy, Protocol, ProtocolHandler, ResolveContext, Resolver, lookup_path};
pub use store::ConfigStore;
pub use types::*;
