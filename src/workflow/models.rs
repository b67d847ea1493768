use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Owner identity used before a caller authenticates.
pub const ANONYMOUS_OWNER: &str = "00000000-0000-4000-0000-000000000000";

pub fn is_anonymous(owner_id: &str) -> bool {
    owner_id.is_empty() || owner_id == ANONYMOUS_OWNER
}

// ── Execution status ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Rejected,
    Validated,
    Classified,
    InquiryAwaitingResponse,
    Inquired,
    Researched,
    Analyzed,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Rejected => "rejected",
            Self::Validated => "validated",
            Self::Classified => "classified",
            Self::InquiryAwaitingResponse => "inquiry_awaiting_response",
            Self::Inquired => "inquired",
            Self::Researched => "researched",
            Self::Analyzed => "analyzed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Statuses past the inquiry that need a registered owner to see or advance.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Inquired | Self::Researched | Self::Analyzed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "rejected" => Ok(Self::Rejected),
            "validated" => Ok(Self::Validated),
            "classified" => Ok(Self::Classified),
            "inquiry_awaiting_response" => Ok(Self::InquiryAwaitingResponse),
            "inquired" => Ok(Self::Inquired),
            "researched" => Ok(Self::Researched),
            "analyzed" => Ok(Self::Analyzed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// Which stage sequence follows Inquire. Decided once when the run enters `inquired`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentTrack {
    /// Research, Analyze and Report as separate stages.
    Full,
    /// Single combined analysis-and-report stage for small insured values.
    Compact,
}

impl AssessmentTrack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Compact => "compact",
        }
    }

    pub fn for_value(insured_value: Option<f64>, small_value_threshold: f64) -> Self {
        match insured_value {
            Some(value) if value <= small_value_threshold => Self::Compact,
            _ => Self::Full,
        }
    }
}

impl FromStr for AssessmentTrack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "compact" => Ok(Self::Compact),
            _ => Err(format!("Invalid assessment track: {}", s)),
        }
    }
}

/// Why a stage failed. Only transient failures are retried by the sweeper.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            _ => Err(format!("Invalid failure kind: {}", s)),
        }
    }
}

// ── Stages ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Classify,
    Inquire,
    Research,
    Analyze,
    Report,
    AnalyzeAndReport,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Classify => "classify",
            Self::Inquire => "inquire",
            Self::Research => "research",
            Self::Analyze => "analyze",
            Self::Report => "report",
            Self::AnalyzeAndReport => "analyze_and_report",
        }
    }

    /// The persisted status a stage may start from.
    pub fn requires(&self) -> ExecutionStatus {
        match self {
            Self::Validate => ExecutionStatus::Created,
            Self::Classify => ExecutionStatus::Validated,
            Self::Inquire => ExecutionStatus::Classified,
            Self::Research | Self::AnalyzeAndReport => ExecutionStatus::Inquired,
            Self::Analyze => ExecutionStatus::Researched,
            Self::Report => ExecutionStatus::Analyzed,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Inquiry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InquiryItem {
    pub question: String,
    #[serde(default)]
    pub response: Option<String>,
}

impl InquiryItem {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            response: None,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.response
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty())
    }
}

pub fn all_answered(inquiry: &[InquiryItem]) -> bool {
    inquiry.iter().all(InquiryItem::is_answered)
}

// ── Execution ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResearchFindings {
    pub current: Option<serde_json::Value>,
    pub historical: Option<serde_json::Value>,
    pub regulatory: Option<serde_json::Value>,
}

impl ResearchFindings {
    pub fn is_complete(&self) -> bool {
        self.current.is_some() && self.historical.is_some() && self.regulatory.is_some()
    }
}

/// One persisted run of the risk-assessment pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub owner_id: String,
    pub description: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub insured_value: Option<f64>,
    pub status: ExecutionStatus,
    /// Last good status; a retry re-enters the pipeline here.
    pub failed_from: Option<ExecutionStatus>,
    pub track: Option<AssessmentTrack>,
    pub rejection_reason: Option<String>,
    pub classification: Option<String>,
    pub inquiry: Vec<InquiryItem>,
    pub research: ResearchFindings,
    pub analysis: Option<serde_json::Value>,
    pub report: Option<serde_json::Value>,
    pub lease_started_at: Option<DateTime<Utc>>,
    pub lease_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub lease_holder: Option<String>,
    pub retry_count: u32,
    pub failed_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub escalated: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Execution {
    pub fn is_anonymous(&self) -> bool {
        is_anonymous(&self.owner_id)
    }

    pub fn lease_age_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.lease_started_at.map(|s| (now - s).num_seconds())
    }
}

/// Fields accepted when a run is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewExecution {
    pub description: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub insured_value: Option<f64>,
}

// ── Events ───────────────────────────────────────────────────────────

/// Status carried by a published event. A superset of [`ExecutionStatus`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Created,
    Rejected,
    Validated,
    Classified,
    InquiryAwaitingResponse,
    Inquired,
    Researched,
    Analyzed,
    Completed,
    Failed,
    /// A stage is mid-flight; the prior persisted status still holds.
    Processing,
    LoginRequired,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Rejected => "rejected",
            Self::Validated => "validated",
            Self::Classified => "classified",
            Self::InquiryAwaitingResponse => "inquiry_awaiting_response",
            Self::Inquired => "inquired",
            Self::Researched => "researched",
            Self::Analyzed => "analyzed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Processing => "processing",
            Self::LoginRequired => "login_required",
        }
    }

    /// Statuses after which a subscriber stream closes.
    pub fn closes_stream(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Inquired | Self::Researched | Self::Analyzed)
    }
}

impl From<ExecutionStatus> for EventStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Created => Self::Created,
            ExecutionStatus::Rejected => Self::Rejected,
            ExecutionStatus::Validated => Self::Validated,
            ExecutionStatus::Classified => Self::Classified,
            ExecutionStatus::InquiryAwaitingResponse => Self::InquiryAwaitingResponse,
            ExecutionStatus::Inquired => Self::Inquired,
            ExecutionStatus::Researched => Self::Researched,
            ExecutionStatus::Analyzed => Self::Analyzed,
            ExecutionStatus::Completed => Self::Completed,
            ExecutionStatus::Failed => Self::Failed,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient notification of a transition. Published and relayed, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ExecutionEvent {
    pub fn new(execution_id: impl Into<String>, status: impl Into<EventStatus>) -> Self {
        Self {
            execution_id: execution_id.into(),
            status: status.into(),
            stage: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Event describing what a subscriber should see for a persisted record.
    /// A failure that has not been escalated is still reported as in progress.
    pub fn snapshot(execution: &Execution) -> Self {
        let status = match execution.status {
            ExecutionStatus::Failed if !execution.escalated => EventStatus::Processing,
            other => other.into(),
        };
        let mut metadata = serde_json::json!({
            "snapshot": true,
            "owner_id": execution.owner_id,
        });
        if execution.status == ExecutionStatus::InquiryAwaitingResponse {
            metadata["inquiry"] = serde_json::json!(execution.inquiry);
        }
        Self::new(execution.id.clone(), status).with_metadata(metadata)
    }
}

// ── API views ────────────────────────────────────────────────────────

/// Read-only status view returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub run_id: String,
    pub owner_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inquiry: Option<Vec<InquiryItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_age_secs: Option<i64>,
    pub retry_count: u32,
    pub escalated: bool,
}

impl StatusSnapshot {
    pub fn from_execution(execution: &Execution, now: DateTime<Utc>) -> Self {
        Self {
            run_id: execution.id.clone(),
            owner_id: execution.owner_id.clone(),
            status: execution.status,
            inquiry: (execution.status == ExecutionStatus::InquiryAwaitingResponse)
                .then(|| execution.inquiry.clone()),
            failure_reason: execution.failed_reason.clone(),
            failure_kind: execution.failure_kind,
            lease_age_secs: execution.lease_age_secs(now),
            retry_count: execution.retry_count,
            escalated: execution.escalated,
        }
    }
}

/// Outputs of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub run_id: String,
    pub status: ExecutionStatus,
    pub classification: Option<String>,
    pub inquiry: Vec<InquiryItem>,
    pub research: ResearchFindings,
    pub analysis: Option<serde_json::Value>,
    pub report: Option<serde_json::Value>,
}

impl From<Execution> for AssessmentResult {
    fn from(execution: Execution) -> Self {
        Self {
            run_id: execution.id,
            status: execution.status,
            classification: execution.classification,
            inquiry: execution.inquiry,
            research: execution.research,
            analysis: execution.analysis,
            report: execution.report,
        }
    }
}
