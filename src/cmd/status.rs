//! Execution lookup: `riskflow status <run_id>`.

use anyhow::{Result, bail};
use std::path::PathBuf;

use riskflow::config::RiskflowConfig;
use riskflow::workflow::models::StatusSnapshot;
use riskflow::workflow::server;

pub async fn cmd_status(
    config: &RiskflowConfig,
    run_id: &str,
    db_path: Option<PathBuf>,
) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
    if !db_path.exists() {
        bail!("No database at {}", db_path.display());
    }
    let db = server::open_db(&db_path)?;
    let id = run_id.to_string();
    let Some(execution) = db.call(move |db| db.get_execution(&id)).await? else {
        bail!("Execution not found: {}", run_id);
    };

    let snapshot = StatusSnapshot::from_execution(&execution, chrono::Utc::now());
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
