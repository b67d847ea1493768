//! One-off retry sweep: `riskflow sweep`.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use riskflow::config::RiskflowConfig;
use riskflow::workflow::orchestrator::Orchestrator;
use riskflow::workflow::runner::WorkflowRunner;
use riskflow::workflow::server;
use riskflow::workflow::sweeper::RetrySweeper;

pub async fn cmd_sweep(config: &RiskflowConfig, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
    let db = server::open_db(&db_path)?;
    let ctx = server::build_context(config, db)?;
    let runner = Arc::new(WorkflowRunner::new(Arc::new(Orchestrator::new(ctx))));
    let sweeper = RetrySweeper::new(
        runner.clone(),
        &config.notifications.admin_contact,
        config.workflow.sweep_interval(),
    );

    let report = sweeper.sweep_once().await?;
    // Restarted runs finish in this process before it exits.
    runner.drain().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
