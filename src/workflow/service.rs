//! Caller-facing operations: start, status, answers, resume, cancel, claim,
//! result and subscribe. Each one checks who is asking before touching a run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::bridge::{BridgeFrame, EventBridge};
use super::clock::Clock;
use super::identity::{ClaimOutcome, IdentityReconciler};
use super::models::*;
use super::orchestrator::{NextStep, next_step};
use super::runner::WorkflowRunner;
use crate::errors::{WorkflowError, WorkflowResult};

/// Identity of whoever is calling. Authentication itself happens upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    owner_id: Option<String>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self { owner_id: None }
    }

    pub fn authenticated(owner_id: &str) -> Self {
        Self::from_header(Some(owner_id))
    }

    /// Blank values and the anonymous sentinel both mean "not logged in".
    pub fn from_header(value: Option<&str>) -> Self {
        let owner_id = value
            .map(str::trim)
            .filter(|v| !is_anonymous(v))
            .map(str::to_string);
        Self { owner_id }
    }

    pub fn is_authenticated(&self) -> bool {
        self.owner_id.is_some()
    }

    /// Owner id recorded on runs this caller starts.
    pub fn owner_id(&self) -> &str {
        self.owner_id.as_deref().unwrap_or(ANONYMOUS_OWNER)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub run_id: String,
    pub owner_id: String,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswersAccepted {
    pub answered: usize,
    pub total: usize,
    /// True once every question has a response and the run was resumed.
    pub resumed: bool,
}

/// What `resume` did, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResumeAction {
    InquiryRequired { inquiry: Vec<InquiryItem> },
    LoginRequired,
    Completed,
    Rejected { reason: Option<String> },
    Failed { reason: Option<String> },
    /// `started` is false when work was already under way.
    Processing { started: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeResponse {
    #[serde(flatten)]
    pub action: ResumeAction,
    pub snapshot: StatusSnapshot,
}

pub struct WorkflowService {
    runner: Arc<WorkflowRunner>,
    reconciler: IdentityReconciler,
    bridge: EventBridge,
}

impl WorkflowService {
    pub fn new(runner: Arc<WorkflowRunner>, bridge: EventBridge) -> Self {
        Self {
            reconciler: IdentityReconciler::new(runner.clone()),
            runner,
            bridge,
        }
    }

    pub fn runner(&self) -> &Arc<WorkflowRunner> {
        &self.runner
    }

    async fn load(&self, run_id: &str) -> WorkflowResult<Execution> {
        self.runner.orchestrator().context().load(run_id).await
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.runner.orchestrator().context().clock.now()
    }

    /// Anonymous runs are open to anyone holding the id. Registered runs need
    /// their owner; another identity is told the run does not exist.
    fn authorize(&self, caller: &Caller, execution: &Execution) -> WorkflowResult<()> {
        if execution.is_anonymous() || caller.owner_id() == execution.owner_id {
            return Ok(());
        }
        if caller.is_authenticated() {
            Err(WorkflowError::Forbidden)
        } else {
            Err(WorkflowError::LoginRequired)
        }
    }

    async fn load_authorized(&self, caller: &Caller, run_id: &str) -> WorkflowResult<Execution> {
        let execution = self.load(run_id).await?;
        self.authorize(caller, &execution)?;
        Ok(execution)
    }

    pub async fn start(&self, caller: &Caller, new: NewExecution) -> WorkflowResult<StartResponse> {
        if new.description.trim().is_empty() {
            return Err(WorkflowError::Rejected {
                reason: "description must not be empty".into(),
            });
        }
        let execution = self.runner.orchestrator().start(caller.owner_id(), new).await?;
        if execution.status == ExecutionStatus::Validated {
            self.runner.spawn_advance(&execution.id).await;
        }
        Ok(StartResponse {
            run_id: execution.id,
            owner_id: execution.owner_id,
            status: execution.status,
        })
    }

    pub async fn get_status(&self, caller: &Caller, run_id: &str) -> WorkflowResult<StatusSnapshot> {
        let execution = self.load_authorized(caller, run_id).await?;
        Ok(StatusSnapshot::from_execution(&execution, self.now()))
    }

    pub async fn submit_answers(
        &self,
        caller: &Caller,
        run_id: &str,
        answers: Vec<String>,
    ) -> WorkflowResult<AnswersAccepted> {
        self.load_authorized(caller, run_id).await?;
        let execution = self
            .runner
            .orchestrator()
            .submit_answers(run_id, answers)
            .await?;
        let answered = execution.inquiry.iter().filter(|i| i.is_answered()).count();
        let total = execution.inquiry.len();
        let resumed = all_answered(&execution.inquiry);
        if resumed {
            self.runner.spawn_advance(run_id).await;
        }
        Ok(AnswersAccepted {
            answered,
            total,
            resumed,
        })
    }

    /// Decide what a returning caller should do next, restarting work when
    /// the run can move. Repeated calls start at most one advance.
    pub async fn resume(&self, caller: &Caller, run_id: &str) -> WorkflowResult<ResumeResponse> {
        let mut execution = self.load(run_id).await?;
        let mut resumed_by_claim = false;
        if execution.is_anonymous() && caller.is_authenticated() {
            let outcome = self.reconciler.claim(run_id, caller.owner_id()).await?;
            resumed_by_claim = outcome == ClaimOutcome::Claimed { resumed: true };
            execution = self.load(run_id).await?;
        }
        self.authorize(caller, &execution)?;

        let threshold = self.runner.orchestrator().context().policy.small_value_threshold;
        let action = match next_step(&execution, threshold) {
            NextStep::Finished(ExecutionStatus::Rejected) => ResumeAction::Rejected {
                reason: execution.rejection_reason.clone(),
            },
            NextStep::Finished(_) => ResumeAction::Completed,
            NextStep::AwaitAnswers => ResumeAction::InquiryRequired {
                inquiry: execution.inquiry.clone(),
            },
            NextStep::Blocked if execution.escalated => ResumeAction::Failed {
                reason: execution.failed_reason.clone(),
            },
            // The sweeper owns retries.
            NextStep::Blocked => ResumeAction::Processing { started: false },
            NextStep::LoginRequired => ResumeAction::LoginRequired,
            NextStep::Run(_) | NextStep::CloseInquiry => ResumeAction::Processing {
                started: resumed_by_claim || self.runner.spawn_advance(run_id).await,
            },
        };
        tracing::info!(run_id, ?action, "resume");

        Ok(ResumeResponse {
            action,
            snapshot: StatusSnapshot::from_execution(&execution, self.now()),
        })
    }

    /// Best-effort stop of in-process work. Persisted status is not changed.
    pub async fn cancel(&self, caller: &Caller, run_id: &str) -> WorkflowResult<bool> {
        self.load_authorized(caller, run_id).await?;
        Ok(self.runner.cancel(run_id).await)
    }

    pub async fn claim(&self, caller: &Caller, run_id: &str) -> WorkflowResult<ClaimOutcome> {
        if !caller.is_authenticated() {
            return Err(WorkflowError::LoginRequired);
        }
        self.reconciler.claim(run_id, caller.owner_id()).await
    }

    pub async fn result(&self, caller: &Caller, run_id: &str) -> WorkflowResult<AssessmentResult> {
        let execution = self.load_authorized(caller, run_id).await?;
        if execution.status != ExecutionStatus::Completed {
            return Err(WorkflowError::Precondition {
                expected: ExecutionStatus::Completed,
                actual: execution.status,
            });
        }
        Ok(execution.into())
    }

    pub async fn subscribe(
        &self,
        caller: &Caller,
        run_id: &str,
    ) -> WorkflowResult<mpsc::Receiver<BridgeFrame>> {
        self.load_authorized(caller, run_id).await?;
        self.bridge.open(run_id, caller.is_authenticated()).await
    }
}
