//! layerconf
//!
//! Loads the base and app configuration trees for an environment and prints
//! values or diagnostics, optionally reloading when documents change.

use anyhow::{Context, Result, bail};
use clap::Parser;
use layerconf::cli::{Cli, Command};
use layerconf::config::{
    APP_DIR_VAR, BASE_DIR_VAR, ConfigManager, LoaderOptions,
    watcher::{WatchPaths, WatcherConfig, start_config_watcher},
};
use layerconf::logging::{self, LogTarget};
use serde_json::Value;
use tracing::{info, warn};

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogTarget::parse(&cli.log), cli.verbose)?;

    let manager = ConfigManager::global();
    if let Some(ref dir) = cli.app_dir {
        manager.set_config_directory(dir, false)?;
    }

    manager
        .load_configuration(cli.env.as_deref(), cli.load_options())
        .await
        .context("failed to load configuration")?;

    match cli.command {
        Command::Get {
            ref key,
            ignore_cache,
        } => match manager.get_config(key.as_deref(), ignore_cache) {
            Some(value) => print_json(&value)?,
            None => bail!("no value for `{}`", key.as_deref().unwrap_or_default()),
        },
        Command::Info => {
            let info = manager.info().context("no configuration info recorded")?;
            print_json(&serde_json::to_value(&*info)?)?;
        }
        Command::Watch => watch(manager, &cli).await?,
    }

    Ok(())
}

/// Reload on every change until the watcher stops.
async fn watch(manager: &ConfigManager, cli: &Cli) -> Result<()> {
    let info = manager.info().context("no configuration info recorded")?;
    let app_dir = match manager
        .config_directory()
        .or_else(|| std::env::var_os(APP_DIR_VAR).map(Into::into))
    {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let base_dir = cli
        .base_dir
        .clone()
        .or_else(|| std::env::var_os(BASE_DIR_VAR).map(Into::into));

    let paths = WatchPaths {
        base_config_dir: base_dir.map(|dir| LoaderOptions::new(dir).config_path()),
        app_config_dir: Some(LoaderOptions::new(app_dir).config_path()),
    };
    let mut handle = start_config_watcher(paths, WatcherConfig::default())?;
    print_json(&info.result)?;

    while let Some(event) = handle.wait_for_change().await {
        if !event.requires_reload() {
            warn!(?event, "config watcher error");
            continue;
        }
        info!(paths = ?event.affected_paths(), "reloading configuration");

        match manager
            .load_configuration(None, cli.load_options().force(true))
            .await
        {
            Ok(store) => print_json(&store.snapshot())?,
            // The previous configuration stays active.
            Err(err) => warn!(error = %err, "reload failed"),
        }
    }

    Ok(())
}
