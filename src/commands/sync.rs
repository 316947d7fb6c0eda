//! # Sync Command
//!
//! Runs the dependency-driven fixpoint synchronization: loads the
//! configuration and the persisted state, syncs from the requested (or
//! configured) roots, and persists the accumulated state back.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use modsync::config::{Config, DEFAULT_CONFIG_FILE};
use modsync::store::Store;

/// Synchronize repositories and modules
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = DEFAULT_CONFIG_FILE,
        env = "MODSYNC_CONFIG"
    )]
    pub config: PathBuf,

    /// Root repositories to start from; the configured roots apply when
    /// omitted.
    pub roots: Vec<String>,
}

pub fn execute(args: SyncArgs) -> Result<()> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let mut store = Store::load(&config.state_file)?;
    store.sync(&config, &args.roots)?;
    store.save()?;

    let loaded: Vec<&str> = store
        .repositories
        .names()
        .filter(|n| store.is_loaded(n))
        .collect();
    println!(
        "Synchronized {} repositories: {}",
        loaded.len(),
        loaded.join(", ")
    );
    println!(
        "{} modules known, {} seen this pass",
        store.modules.len(),
        store.new_modules.len()
    );
    Ok(())
}
