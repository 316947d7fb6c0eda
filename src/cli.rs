//! CLI argument parsing and command dispatch

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;

/// modsync - synchronize a federation of module repositories
#[derive(Parser, Debug)]
#[command(name = "modsync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dependency-driven synchronization to a fixpoint
    Sync(commands::sync::SyncArgs),
    /// List known modules and their dependencies
    Ls(commands::ls::LsArgs),
    /// Show a module's files changed since a revision
    Changed(commands::changed::ChangedArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.log_level.as_str()),
        )
        .init();

        match self.command {
            Commands::Sync(args) => commands::sync::execute(args),
            Commands::Ls(args) => commands::ls::execute(args),
            Commands::Changed(args) => commands::changed::execute(args),
        }
    }
}
