use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use riskflow::config::{DEFAULT_CONFIG_FILE, RiskflowConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "riskflow")]
#[command(version, about = "Risk-assessment workflow orchestrator")]
pub struct Cli {
    /// Path to riskflow.toml
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and the background retry sweeper
    Serve {
        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides server.db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (bind all interfaces, CORS permissive)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database schema and exit
    InitDb {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Run a single retry sweep and print what it did
    Sweep {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        /// Only check the configuration for errors
        #[arg(long)]
        validate: bool,
    },
    /// Print one execution's status as JSON
    Status {
        run_id: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

fn load_config(cli: &Cli) -> Result<RiskflowConfig> {
    let mut config = RiskflowConfig::load_or_default(&cli.config)?;
    config
        .apply_env()
        .context("Failed to apply environment overrides")?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    let _log_guard = riskflow::telemetry::init_logging(
        config.logging.format,
        config.logging.directory.as_deref(),
        cli.verbose,
    );

    match &cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(&mut config, *port, db_path.clone(), *dev).await?;
        }
        Commands::InitDb { db_path } => {
            cmd::cmd_init_db(&config, db_path.clone())?;
        }
        Commands::Sweep { db_path } => {
            cmd::cmd_sweep(&config, db_path.clone()).await?;
        }
        Commands::Config { validate } => cmd::cmd_config(&cli.config, &config, *validate)?,
        Commands::Status { run_id, db_path } => {
            cmd::cmd_status(&config, run_id, db_path.clone()).await?;
        }
    }

    Ok(())
}
