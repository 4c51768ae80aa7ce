//! Init Command Implementation

use anyhow::{bail, Result};
use std::path::PathBuf;

use fl_core::FedConfig;

pub fn run(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(FedConfig::default_config_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    FedConfig::default().save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
