//! Configuration view: `riskflow config`.

use anyhow::Result;
use std::path::Path;

use riskflow::config::RiskflowConfig;

pub fn cmd_config(path: &Path, config: &RiskflowConfig, validate_only: bool) -> Result<()> {
    // Loading already validated; reaching here means the file is usable.
    if validate_only {
        println!("Configuration is valid.");
        return Ok(());
    }

    if path.exists() {
        println!("# Config file: {}", path.display());
    } else {
        println!("# No config file at {}; showing defaults", path.display());
    }
    println!("{}", config.to_toml()?);
    Ok(())
}
