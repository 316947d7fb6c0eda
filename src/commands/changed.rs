//! Show a module's files changed since a revision.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Args;

use modsync::config::{Config, DEFAULT_CONFIG_FILE};
use modsync::store::Store;

/// Show changed and deleted files of a module
#[derive(Args, Debug)]
pub struct ChangedArgs {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = DEFAULT_CONFIG_FILE,
        env = "MODSYNC_CONFIG"
    )]
    pub config: PathBuf,

    /// Module to inspect.
    pub module: String,

    /// Revision to diff against.
    #[arg(long, value_name = "REV")]
    pub since: String,
}

pub fn execute(args: ChangedArgs) -> Result<()> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let mut store = Store::load(&config.state_file)?;

    let repositories = &store.repositories;
    let module = store
        .modules
        .get_mut(&args.module)
        .ok_or_else(|| anyhow!("unknown module: {}", args.module))?;

    let files = module.changed_files(repositories, &args.since)?;
    for path in &files.changed {
        println!("M {}", path.display());
    }
    for path in &files.deleted {
        println!("D {}", path.display());
    }
    Ok(())
}
