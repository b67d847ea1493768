//! Runtime configuration loaded from `riskflow.toml`.
//!
//! Values are layered: built-in defaults, then the TOML file, then
//! environment variables, then CLI flags.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3150
//! db_path = ".riskflow/riskflow.db"
//! cors_permissive = false
//!
//! [workflow]
//! small_value_threshold = 1000.0
//! max_retries = 3
//! sweep_interval_secs = 300
//! stale_lease_secs = 300
//! lease_renewal_secs = 60
//! event_heartbeat_secs = 25
//!
//! [stages]
//! service_url = "http://127.0.0.1:8700"
//! timeout_secs = 120
//!
//! [notifications]
//! webhook_url = "http://127.0.0.1:8800/notify"
//! admin_contact = "risk-ops@example.com"
//!
//! [logging]
//! format = "json"
//! directory = "/var/log/riskflow"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::telemetry::LogFormat;
use crate::workflow::orchestrator::WorkflowPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "riskflow.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskflowConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub stages: StagesSection,
    #[serde(default)]
    pub notifications: NotificationsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

// ── Sections ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Allow any origin. Meant for local front-end development.
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3150
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".riskflow/riskflow.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSection {
    /// Insured values below this take the combined analyze+report track (EUR).
    #[serde(default = "default_small_value_threshold")]
    pub small_value_threshold: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stale_lease_secs")]
    pub stale_lease_secs: u64,
    #[serde(default = "default_lease_renewal_secs")]
    pub lease_renewal_secs: u64,
    #[serde(default = "default_event_heartbeat_secs")]
    pub event_heartbeat_secs: u64,
}

fn default_small_value_threshold() -> f64 {
    1000.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_stale_lease_secs() -> u64 {
    300
}

fn default_lease_renewal_secs() -> u64 {
    60
}

fn default_event_heartbeat_secs() -> u64 {
    25
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            small_value_threshold: default_small_value_threshold(),
            max_retries: default_max_retries(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_lease_secs: default_stale_lease_secs(),
            lease_renewal_secs: default_lease_renewal_secs(),
            event_heartbeat_secs: default_event_heartbeat_secs(),
        }
    }
}

impl WorkflowSection {
    pub fn policy(&self) -> WorkflowPolicy {
        WorkflowPolicy {
            small_value_threshold: self.small_value_threshold,
            max_retries: self.max_retries,
            stale_lease: Duration::from_secs(self.stale_lease_secs),
            lease_renewal: Duration::from_secs(self.lease_renewal_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn event_heartbeat(&self) -> Duration {
        Duration::from_secs(self.event_heartbeat_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagesSection {
    /// Base URL of the reasoning service. Unset means the server refuses to start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default = "default_stage_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_stage_timeout_secs() -> u64 {
    120
}

impl Default for StagesSection {
    fn default() -> Self {
        Self {
            service_url: None,
            timeout_secs: default_stage_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationsSection {
    /// Without a webhook, notifications are only logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default = "default_admin_contact")]
    pub admin_contact: String,
}

fn default_admin_contact() -> String {
    "risk-admin@localhost".to_string()
}

impl Default for NotificationsSection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            admin_contact: default_admin_contact(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

// ── Loading ───────────────────────────────────────────────────────────

impl RiskflowConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse riskflow.toml")
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize riskflow.toml")
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("RISKFLOW_PORT") {
            self.server.port = parse_env("RISKFLOW_PORT", &port)?;
        }
        if let Some(path) = lookup("RISKFLOW_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("RISKFLOW_STAGE_SERVICE_URL") {
            self.stages.service_url = Some(url);
        }
        if let Some(url) = lookup("RISKFLOW_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(url);
        }
        if let Some(contact) = lookup("RISKFLOW_ADMIN_CONTACT") {
            self.notifications.admin_contact = contact;
        }
        if let Some(format) = lookup("RISKFLOW_LOG_FORMAT") {
            self.logging.format = format.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(secs) = lookup("RETRY_CHECK_INTERVAL") {
            self.workflow.sweep_interval_secs = parse_env("RETRY_CHECK_INTERVAL", &secs)?;
        }
        if let Some(max) = lookup("RETRY_MAX_ATTEMPTS") {
            self.workflow.max_retries = parse_env("RETRY_MAX_ATTEMPTS", &max)?;
        }
        if let Some(threshold) = lookup("SMALL_RISK_THRESHOLD_EUR") {
            self.workflow.small_value_threshold = parse_env("SMALL_RISK_THRESHOLD_EUR", &threshold)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let wf = &self.workflow;
        if wf.small_value_threshold < 0.0 || !wf.small_value_threshold.is_finite() {
            bail!(
                "workflow.small_value_threshold must be a non-negative number, got {}",
                wf.small_value_threshold
            );
        }
        if wf.sweep_interval_secs == 0 {
            bail!("workflow.sweep_interval_secs must be greater than zero");
        }
        if wf.stale_lease_secs == 0 || wf.lease_renewal_secs == 0 {
            bail!("workflow lease intervals must be greater than zero");
        }
        if wf.lease_renewal_secs >= wf.stale_lease_secs {
            bail!(
                "workflow.lease_renewal_secs ({}) must be shorter than workflow.stale_lease_secs ({})",
                wf.lease_renewal_secs,
                wf.stale_lease_secs
            );
        }
        if wf.event_heartbeat_secs == 0 {
            bail!("workflow.event_heartbeat_secs must be greater than zero");
        }
        if self.stages.timeout_secs == 0 {
            bail!("stages.timeout_secs must be greater than zero");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, value, e))
}
