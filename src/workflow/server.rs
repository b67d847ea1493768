use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::bridge::EventBridge;
use super::clock::SystemClock;
use super::db::{DbHandle, ExecutionDb};
use super::events::EventPublisher;
use super::executors::{StageServiceClient, StageSet};
use super::notify::{LogNotifier, Notifier, WebhookNotifier};
use super::orchestrator::{Orchestrator, WorkflowContext};
use super::research::DbKnowledgeStore;
use super::runner::WorkflowRunner;
use super::service::WorkflowService;
use super::sweeper::RetrySweeper;
use crate::config::RiskflowConfig;

const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3150,
            db_path: PathBuf::from(".riskflow/riskflow.db"),
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &RiskflowConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.cors_permissive,
        }
    }
}

/// Open (creating if needed) the SQLite store at `path`.
pub fn open_db(path: &Path) -> Result<DbHandle> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = ExecutionDb::new(path).context("Failed to initialize execution database")?;
    Ok(DbHandle::new(db))
}

/// Wire the production collaborators around `db`.
pub fn build_context(config: &RiskflowConfig, db: DbHandle) -> Result<WorkflowContext> {
    let Some(url) = config.stages.service_url.as_deref() else {
        bail!("stages.service_url is not configured (set RISKFLOW_STAGE_SERVICE_URL)");
    };
    let client = Arc::new(StageServiceClient::new(
        url,
        Duration::from_secs(config.stages.timeout_secs),
    )?);
    let research = client
        .research_fan_out()
        .with_knowledge_store(Arc::new(DbKnowledgeStore::new(db.clone())));

    let notifier: Arc<dyn Notifier> = match config.notifications.webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(url, NOTIFICATION_TIMEOUT)?),
        None => Arc::new(LogNotifier),
    };

    Ok(WorkflowContext {
        db,
        stages: StageSet::from_shared(client, research),
        publisher: Arc::new(EventPublisher::default()),
        notifier,
        clock: Arc::new(SystemClock),
        policy: config.workflow.policy(),
    })
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the server and the retry sweeper; returns after Ctrl-C.
pub async fn start_server(server: ServerConfig, config: &RiskflowConfig) -> Result<()> {
    let db = open_db(&server.db_path)?;
    let ctx = build_context(config, db)?;
    let bridge = EventBridge::new(ctx.clone(), config.workflow.event_heartbeat());
    let runner = Arc::new(WorkflowRunner::new(Arc::new(Orchestrator::new(ctx))));

    let sweeper = RetrySweeper::new(
        runner.clone(),
        &config.notifications.admin_contact,
        config.workflow.sweep_interval(),
    );
    let cancel = CancellationToken::new();
    let sweeper_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { sweeper.run(cancel).await }
    });

    let state = Arc::new(AppState {
        service: WorkflowService::new(runner.clone(), bridge),
    });
    let mut app = build_router(state);

    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, db_path = %server.db_path.display(), "riskflow listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    cancel.cancel();
    if let Err(e) = sweeper_task.await {
        tracing::warn!(error = %e, "sweeper task ended abnormally");
    }
    runner.shutdown().await;
    tracing::info!("server shut down gracefully");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
