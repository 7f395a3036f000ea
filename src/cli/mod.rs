//! CLI command definitions for layerconf
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

use crate::config::LoadOptions;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Layered configuration loader
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Environment to load (default: $APP_ENV or "dev")
    #[arg(short, long, global = true)]
    pub env: Option<String>,

    /// Application source tree (default: $LAYERCONF_APP_DIR or current directory)
    #[arg(short, long, global = true)]
    pub app_dir: Option<PathBuf>,

    /// Framework source tree (default: $LAYERCONF_BASE_DIR)
    #[arg(short, long, global = true)]
    pub base_dir: Option<PathBuf>,

    /// Defaults document name in each tree's config/ directory
    #[arg(short, long, global = true)]
    pub file: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the value at a dotted key, or the whole configuration
    Get {
        /// Dotted key, e.g. `db.host`
        key: Option<String>,

        /// Re-read the key's group file from disk
        #[arg(long)]
        ignore_cache: bool,
    },

    /// Print load diagnostics (sources, raw and resolved documents)
    Info,

    /// Load, then reload on every change to a config/ directory
    Watch,
}

impl Cli {
    /// Load options for the first load cycle.
    pub fn load_options(&self) -> LoadOptions {
        let mut options = LoadOptions::new();
        options.basedir = self.base_dir.clone();
        options.file = self.file.clone();
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_with_globals() {
        let cli = Cli::parse_from([
            "layerconf",
            "--env",
            "test",
            "--base-dir",
            "/opt/framework",
            "get",
            "db.host",
            "--ignore-cache",
        ]);
        assert_eq!(cli.env.as_deref(), Some("test"));
        match cli.command {
            Command::Get {
                ref key,
                ignore_cache,
            } => {
                assert_eq!(key.as_deref(), Some("db.host"));
                assert!(ignore_cache);
            }
            ref other => panic!("unexpected command: {other:?}"),
        }

        let options = cli.load_options();
        assert_eq!(options.basedir, Some(PathBuf::from("/opt/framework")));
        assert!(!options.force);
    }

    #[test]
    fn test_log_default() {
        let cli = Cli::parse_from(["layerconf", "info"]);
        assert_eq!(cli.log, "2");
        assert!(matches!(cli.command, Command::Info));
    }
}
