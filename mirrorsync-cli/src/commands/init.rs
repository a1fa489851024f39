//! `mirrorsync init`

use std::fs;

use anyhow::{Context, Result};
use clap::Args;

use mirrorsync_core::{config, registry, EngineConfig};

/// Create the registry directories and a default config.yaml.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config.yaml with defaults.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        for dir in [
            registry::targets_dir_at(&home),
            registry::pairs_dir_at(&home),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let config_path = config::config_path_at(&home);
        if config_path.exists() && !self.force {
            println!("✓ Already initialized: {}", registry::root_at(&home).display());
            return Ok(());
        }
        config::save_at(&home, &EngineConfig::default())
            .context("failed to write default config.yaml")?;

        println!("✓ Initialized {}", registry::root_at(&home).display());
        println!("  Next: mirrorsync target add <id> --url <base-url> --token-env <VAR>");
        Ok(())
    }
}
