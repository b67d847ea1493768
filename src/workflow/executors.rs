//! Stage executor seams.
//!
//! Each pipeline stage is a trait so the orchestrator can be driven by the
//! HTTP-backed [`StageServiceClient`] in production and by scripted doubles
//! in tests. Every executor returns a typed result or a [`StageError`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::models::Execution;
use super::research::{ResearchFanOut, ResearchKind, ResearchLookup};
use crate::errors::StageError;

/// Outcome of validation. A rejection is a business refusal, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected { reason: String },
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, execution: &Execution) -> Result<Verdict, StageError>;
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, execution: &Execution) -> Result<String, StageError>;
}

#[async_trait]
pub trait Inquirer: Send + Sync {
    /// Clarifying questions. An empty list means none are needed.
    async fn inquire(&self, execution: &Execution) -> Result<Vec<String>, StageError>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, execution: &Execution) -> Result<Value, StageError>;
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, execution: &Execution) -> Result<Value, StageError>;
}

/// Analysis and report in one call, used for small insured values.
#[async_trait]
pub trait CombinedAssessor: Send + Sync {
    async fn analyze_and_report(&self, execution: &Execution)
    -> Result<(Value, Value), StageError>;
}

/// Every executor the orchestrator needs.
#[derive(Clone)]
pub struct StageSet {
    pub validator: Arc<dyn Validator>,
    pub classifier: Arc<dyn Classifier>,
    pub inquirer: Arc<dyn Inquirer>,
    pub research: ResearchFanOut,
    pub analyzer: Arc<dyn Analyzer>,
    pub reporter: Arc<dyn Reporter>,
    pub combined: Arc<dyn CombinedAssessor>,
}

impl StageSet {
    /// Build a set where one object implements every stage.
    pub fn from_shared<T>(executor: Arc<T>, research: ResearchFanOut) -> Self
    where
        T: Validator + Classifier + Inquirer + Analyzer + Reporter + CombinedAssessor + 'static,
    {
        Self {
            validator: executor.clone(),
            classifier: executor.clone(),
            inquirer: executor.clone(),
            research,
            analyzer: executor.clone(),
            reporter: executor.clone(),
            combined: executor,
        }
    }
}

// ── HTTP stage service ───────────────────────────────────────────────

/// Calls an external reasoning service: `POST {base_url}/stages/{stage}`.
#[derive(Clone)]
pub struct StageServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl StageServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build stage service client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn call(&self, stage: &str, execution: &Execution) -> Result<Value, StageError> {
        let url = format!("{}/stages/{}", self.base_url, stage);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "execution": execution }))
            .send()
            .await
            .map_err(|e| classify_transport_error(stage, e))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(StageError::Transient(format!(
                "{} returned HTTP {}",
                stage, status
            )));
        }
        if !status.is_success() {
            return Err(StageError::Permanent(format!(
                "{} returned HTTP {}",
                stage, status
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| StageError::Permanent(format!("{} returned unreadable body: {}", stage, e)))
    }

    fn decode<T: for<'de> Deserialize<'de>>(stage: &str, body: Value) -> Result<T, StageError> {
        serde_json::from_value(body)
            .map_err(|e| StageError::Permanent(format!("{} returned malformed output: {}", stage, e)))
    }

    pub fn research_fan_out(self: &Arc<Self>) -> ResearchFanOut {
        ResearchFanOut::new(
            ResearchKind::ALL
                .iter()
                .map(|kind| {
                    Arc::new(HttpResearchLookup {
                        client: self.clone(),
                        kind: *kind,
                    }) as Arc<dyn ResearchLookup>
                })
                .collect(),
        )
    }
}

fn classify_transport_error(stage: &str, e: reqwest::Error) -> StageError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        StageError::Transient(format!("{} unreachable: {}", stage, e))
    } else {
        StageError::Permanent(format!("{} request failed: {}", stage, e))
    }
}

#[derive(Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    risk_type: String,
}

#[derive(Deserialize)]
struct InquireResponse {
    #[serde(default)]
    questions: Vec<String>,
}

#[derive(Deserialize)]
struct CombinedResponse {
    analysis: Value,
    report: Value,
}

#[async_trait]
impl Validator for StageServiceClient {
    async fn validate(&self, execution: &Execution) -> Result<Verdict, StageError> {
        let body = self.call("validate", execution).await?;
        let parsed: ValidateResponse = Self::decode("validate", body)?;
        Ok(if parsed.valid {
            Verdict::Accepted
        } else {
            Verdict::Rejected {
                reason: parsed
                    .reason
                    .unwrap_or_else(|| "description is not an insurable risk".into()),
            }
        })
    }
}

#[async_trait]
impl Classifier for StageServiceClient {
    async fn classify(&self, execution: &Execution) -> Result<String, StageError> {
        let body = self.call("classify", execution).await?;
        let parsed: ClassifyResponse = Self::decode("classify", body)?;
        Ok(parsed.risk_type)
    }
}

#[async_trait]
impl Inquirer for StageServiceClient {
    async fn inquire(&self, execution: &Execution) -> Result<Vec<String>, StageError> {
        let body = self.call("inquire", execution).await?;
        let parsed: InquireResponse = Self::decode("inquire", body)?;
        Ok(parsed
            .questions
            .into_iter()
            .filter(|q| !q.trim().is_empty())
            .collect())
    }
}

#[async_trait]
impl Analyzer for StageServiceClient {
    async fn analyze(&self, execution: &Execution) -> Result<Value, StageError> {
        self.call("analyze", execution).await
    }
}

#[async_trait]
impl Reporter for StageServiceClient {
    async fn report(&self, execution: &Execution) -> Result<Value, StageError> {
        self.call("report", execution).await
    }
}

#[async_trait]
impl CombinedAssessor for StageServiceClient {
    async fn analyze_and_report(
        &self,
        execution: &Execution,
    ) -> Result<(Value, Value), StageError> {
        let body = self.call("analyze_and_report", execution).await?;
        let parsed: CombinedResponse = Self::decode("analyze_and_report", body)?;
        Ok((parsed.analysis, parsed.report))
    }
}

struct HttpResearchLookup {
    client: Arc<StageServiceClient>,
    kind: ResearchKind,
}

#[async_trait]
impl ResearchLookup for HttpResearchLookup {
    fn kind(&self) -> ResearchKind {
        self.kind
    }

    async fn lookup(&self, execution: &Execution) -> Result<Value, StageError> {
        self.client.call(self.kind.stage_name(), execution).await
    }
}
