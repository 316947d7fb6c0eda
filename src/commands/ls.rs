//! List known modules from the persisted state.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use modsync::config::{Config, DEFAULT_CONFIG_FILE};
use modsync::module::ModuleKind;
use modsync::store::Store;

/// List modules and their dependencies
#[derive(Args, Debug)]
pub struct LsArgs {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = DEFAULT_CONFIG_FILE,
        env = "MODSYNC_CONFIG"
    )]
    pub config: PathBuf,

    /// Restrict to one variant (ui, test, demo).
    #[arg(long, value_name = "KIND")]
    pub kind: Option<String>,

    /// Module names to show; all when omitted.
    pub names: Vec<String>,
}

pub fn execute(args: LsArgs) -> Result<()> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let store = Store::load(&config.state_file)?;

    let kind = match args.kind.as_deref() {
        None => None,
        Some("ui") => Some(ModuleKind::Ui),
        Some("test") => Some(ModuleKind::Test),
        Some("demo") => Some(ModuleKind::Demo),
        Some(other) => bail!("unknown module kind: {other}"),
    };
    let names = if args.names.is_empty() {
        None
    } else {
        Some(args.names.as_slice())
    };

    for module in store.modules.modules(names, kind) {
        let repository = module.repository.as_deref().unwrap_or("?");
        if module.depends.is_empty() {
            println!("{} [{}]", module.name, repository);
        } else {
            println!(
                "{} [{}] <- {}",
                module.name,
                repository,
                module.depends.join(", ")
            );
        }
    }
    Ok(())
}
