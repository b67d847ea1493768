//! Server commands: `riskflow serve` and `riskflow init-db`.

use anyhow::Result;
use std::path::PathBuf;

use riskflow::config::RiskflowConfig;
use riskflow::workflow::server::{self, ServerConfig};

pub async fn cmd_serve(
    config: &mut RiskflowConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    if dev {
        config.server.host = "0.0.0.0".to_string();
        config.server.cors_permissive = true;
    }

    server::start_server(ServerConfig::from_config(config), config).await
}

pub fn cmd_init_db(config: &RiskflowConfig, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
    server::open_db(&db_path)?;
    println!("Database initialized at {}", db_path.display());
    Ok(())
}
