//! The pipeline state machine.
//!
//! ```text
//! created --validate--> validated --classify--> classified --inquire--> inquiry_awaiting_response
//!    \--reject--> rejected                          \--(no questions)--> inquired <--(all answered)--/
//! inquired --research--> researched --analyze--> analyzed --report--> completed      (full track)
//! inquired --analyze_and_report--> completed                                        (compact track)
//! any in-flight status --(stage error)--> failed   (retry re-enters the status it failed from)
//! ```
//!
//! Anonymous runs stop at `inquired` until an account claims them.
//!
//! [`next_step`] is the only place that maps a persisted status to the work
//! that must happen next. Fresh runs, resumes, retries and identity claims all
//! go through it, so they cannot diverge.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::clock::Clock;
use super::db::{DbHandle, StageCommit};
use super::events::EventPublisher;
use super::executors::{StageSet, Verdict};
use super::models::*;
use super::notify::{NotificationTemplate, Notifier};
use crate::errors::{StageError, WorkflowError, WorkflowResult};

/// Tunables shared by the orchestrator and the sweeper.
#[derive(Debug, Clone)]
pub struct WorkflowPolicy {
    /// Insured values at or below this use the compact track.
    pub small_value_threshold: f64,
    pub max_retries: u32,
    /// A lease whose last heartbeat is older than this is abandoned.
    pub stale_lease: Duration,
    /// Heartbeat period while a stage call is in flight.
    pub lease_renewal: Duration,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        Self {
            small_value_threshold: 1000.0,
            max_retries: 3,
            stale_lease: Duration::from_secs(300),
            lease_renewal: Duration::from_secs(60),
        }
    }
}

impl WorkflowPolicy {
    pub fn stale_before(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        now - chrono::Duration::from_std(self.stale_lease).unwrap_or(chrono::Duration::seconds(300))
    }
}

/// Everything a workflow component needs, passed explicitly.
#[derive(Clone)]
pub struct WorkflowContext {
    pub db: DbHandle,
    pub stages: StageSet,
    pub publisher: Arc<EventPublisher>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub policy: WorkflowPolicy,
}

impl WorkflowContext {
    pub async fn load(&self, run_id: &str) -> WorkflowResult<Execution> {
        let id = run_id.to_string();
        self.db
            .call(move |db| db.get_execution(&id))
            .await?
            .ok_or_else(|| WorkflowError::NotFound {
                run_id: run_id.to_string(),
            })
    }
}

// ── Transition table ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Run(Stage),
    /// Every question has a response; move to `inquired`.
    CloseInquiry,
    AwaitAnswers,
    /// Anonymous run that has reached `inquired`; nothing past it runs without an owner.
    LoginRequired,
    Finished(ExecutionStatus),
    /// Failed runs only move again when the sweeper clears the failure.
    Blocked,
}

pub fn next_step(execution: &Execution, small_value_threshold: f64) -> NextStep {
    if execution.is_anonymous() && execution.status.requires_login() {
        return NextStep::LoginRequired;
    }
    match execution.status {
        ExecutionStatus::Created => NextStep::Run(Stage::Validate),
        ExecutionStatus::Validated => NextStep::Run(Stage::Classify),
        ExecutionStatus::Classified => NextStep::Run(Stage::Inquire),
        ExecutionStatus::InquiryAwaitingResponse => {
            if all_answered(&execution.inquiry) {
                NextStep::CloseInquiry
            } else {
                NextStep::AwaitAnswers
            }
        }
        ExecutionStatus::Inquired => match track_of(execution, small_value_threshold) {
            AssessmentTrack::Full => NextStep::Run(Stage::Research),
            AssessmentTrack::Compact => NextStep::Run(Stage::AnalyzeAndReport),
        },
        ExecutionStatus::Researched => NextStep::Run(Stage::Analyze),
        ExecutionStatus::Analyzed => NextStep::Run(Stage::Report),
        ExecutionStatus::Completed | ExecutionStatus::Rejected => {
            NextStep::Finished(execution.status)
        }
        ExecutionStatus::Failed => NextStep::Blocked,
    }
}

/// The persisted track wins; older records without one fall back to the value.
fn track_of(execution: &Execution, small_value_threshold: f64) -> AssessmentTrack {
    execution
        .track
        .unwrap_or_else(|| AssessmentTrack::for_value(execution.insured_value, small_value_threshold))
}

/// Result of a single step.
#[derive(Debug)]
pub enum StepOutcome {
    Advance(ExecutionStatus),
    Pause(PauseReason),
    Fail(StageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    AwaitingAnswers,
    /// Another worker moved the execution on first.
    Superseded,
}

/// Where a call to [`Orchestrator::advance`] left the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    Rejected,
    AwaitingAnswers,
    /// Anonymous run parked at `inquired` until it is claimed.
    LoginRequired,
    /// Another worker holds a live lease.
    LeaseHeld,
    Superseded,
    /// The execution is failed and waits for the sweeper.
    Blocked,
}

// ── Orchestrator ─────────────────────────────────────────────────────

pub struct Orchestrator {
    ctx: WorkflowContext,
}

impl Orchestrator {
    pub fn new(ctx: WorkflowContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    fn announce(&self, event: ExecutionEvent) {
        self.ctx.publisher.publish(event);
    }

    /// Create an execution and run Validate synchronously.
    ///
    /// A rejection is returned as [`WorkflowError::Rejected`]. A stage failure
    /// is recorded on the execution (the sweeper retries it) and the failed
    /// record is returned.
    pub async fn start(&self, owner_id: &str, new: NewExecution) -> WorkflowResult<Execution> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let owner = owner_id.to_string();
        let now = self.ctx.clock.now();
        let id = run_id.clone();
        let execution = self
            .ctx
            .db
            .call(move |db| db.create_execution(&id, &owner, &new, now))
            .await?;
        tracing::info!(run_id = %run_id, owner_id, "execution created");
        self.announce(ExecutionEvent::new(&run_id, ExecutionStatus::Created));

        let holder = format!("start-{}", run_id);
        if !self.acquire_lease(&run_id, &holder).await? {
            return Ok(execution);
        }
        let outcome = self.run_stage(&execution, Stage::Validate, &holder).await;
        self.release_lease(&run_id, &holder).await;

        match outcome? {
            StepOutcome::Advance(ExecutionStatus::Rejected) => {
                let rejected = self.ctx.load(&run_id).await?;
                Err(WorkflowError::Rejected {
                    reason: rejected.rejection_reason.unwrap_or_default(),
                })
            }
            StepOutcome::Fail(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "validation failed, left for retry");
                self.ctx.load(&run_id).await
            }
            _ => self.ctx.load(&run_id).await,
        }
    }

    /// Drive an execution from its persisted status until it completes, pauses
    /// or fails. Safe to call repeatedly: a finished or already-claimed
    /// execution is left untouched.
    pub async fn advance(&self, run_id: &str, holder: &str) -> WorkflowResult<DriveOutcome> {
        let execution = self.ctx.load(run_id).await?;
        match next_step(&execution, self.ctx.policy.small_value_threshold) {
            NextStep::Finished(ExecutionStatus::Rejected) => return Ok(DriveOutcome::Rejected),
            NextStep::Finished(_) => return Ok(DriveOutcome::Completed),
            NextStep::Blocked => return Ok(DriveOutcome::Blocked),
            NextStep::AwaitAnswers => return Ok(DriveOutcome::AwaitingAnswers),
            NextStep::LoginRequired => return Ok(DriveOutcome::LoginRequired),
            _ => {}
        }

        if !self.acquire_lease(run_id, holder).await? {
            tracing::debug!(run_id, holder, "lease held elsewhere, not advancing");
            return Ok(DriveOutcome::LeaseHeld);
        }
        let result = self.drive(run_id, holder).await;
        self.release_lease(run_id, holder).await;
        result
    }

    async fn drive(&self, run_id: &str, holder: &str) -> WorkflowResult<DriveOutcome> {
        loop {
            let execution = self.ctx.load(run_id).await?;
            let step = match next_step(&execution, self.ctx.policy.small_value_threshold) {
                NextStep::Finished(ExecutionStatus::Rejected) => return Ok(DriveOutcome::Rejected),
                NextStep::Finished(_) => return Ok(DriveOutcome::Completed),
                NextStep::Blocked => return Ok(DriveOutcome::Blocked),
                NextStep::AwaitAnswers => self.pause_for_answers(&execution),
                NextStep::LoginRequired => {
                    self.pause_for_login(&execution);
                    return Ok(DriveOutcome::LoginRequired);
                }
                NextStep::CloseInquiry => self.close_inquiry_for(&execution).await?,
                NextStep::Run(stage) => self.run_stage(&execution, stage, holder).await?,
            };
            match step {
                StepOutcome::Advance(_) => continue,
                StepOutcome::Pause(PauseReason::AwaitingAnswers) => {
                    return Ok(DriveOutcome::AwaitingAnswers);
                }
                StepOutcome::Pause(PauseReason::Superseded) => return Ok(DriveOutcome::Superseded),
                StepOutcome::Fail(e) => return Err(WorkflowError::Stage(e)),
            }
        }
    }

    fn pause_for_answers(&self, execution: &Execution) -> StepOutcome {
        tracing::info!(run_id = %execution.id, "waiting for inquiry answers");
        StepOutcome::Pause(PauseReason::AwaitingAnswers)
    }

    fn pause_for_login(&self, execution: &Execution) {
        tracing::info!(run_id = %execution.id, status = %execution.status, "anonymous run waiting for login");
        self.announce(
            ExecutionEvent::new(&execution.id, EventStatus::LoginRequired)
                .with_metadata(json!({ "login_required": true })),
        );
    }

    /// Move a paused execution whose questions are all answered to `inquired`.
    /// Returns false when answers are still missing.
    pub async fn close_inquiry(&self, run_id: &str) -> WorkflowResult<bool> {
        let execution = self.ctx.load(run_id).await?;
        if execution.status != ExecutionStatus::InquiryAwaitingResponse {
            return Err(WorkflowError::Precondition {
                expected: ExecutionStatus::InquiryAwaitingResponse,
                actual: execution.status,
            });
        }
        if !all_answered(&execution.inquiry) {
            return Ok(false);
        }
        Ok(matches!(
            self.close_inquiry_for(&execution).await?,
            StepOutcome::Advance(_)
        ))
    }

    async fn close_inquiry_for(&self, execution: &Execution) -> WorkflowResult<StepOutcome> {
        let commit = StageCommit::Inquired {
            inquiry: execution.inquiry.clone(),
            track: track_of(execution, self.ctx.policy.small_value_threshold),
        };
        self.persist(execution, Stage::Inquire, commit).await
    }

    /// Run one stage against a snapshot whose status must match the stage's predecessor.
    async fn run_stage(
        &self,
        execution: &Execution,
        stage: Stage,
        holder: &str,
    ) -> WorkflowResult<StepOutcome> {
        if execution.status != stage.requires() {
            return Err(WorkflowError::Precondition {
                expected: stage.requires(),
                actual: execution.status,
            });
        }
        if stage == Stage::Inquire {
            if let Some(index) = execution.inquiry.iter().position(InquiryItem::is_answered) {
                return Err(WorkflowError::AlreadyAnswered { index });
            }
        }

        tracing::info!(run_id = %execution.id, stage = %stage, "stage started");
        self.announce(
            ExecutionEvent::new(&execution.id, EventStatus::Processing)
                .with_stage(stage)
                .with_metadata(json!({ "from": execution.status })),
        );

        let result = self
            .with_lease_renewal(&execution.id, holder, self.execute(execution, stage))
            .await;

        match result {
            Ok(commit) => self.persist(execution, stage, commit).await,
            Err(e) => {
                let (id, from, error, now) = (
                    execution.id.clone(),
                    execution.status,
                    e.clone(),
                    self.ctx.clock.now(),
                );
                self.ctx
                    .db
                    .call(move |db| db.mark_failed(&id, from, &error, now))
                    .await?;
                tracing::warn!(run_id = %execution.id, stage = %stage, transient = e.is_transient(), error = %e, "stage failed");
                self.announce(
                    ExecutionEvent::new(&execution.id, EventStatus::Processing)
                        .with_stage(stage)
                        .with_metadata(json!({ "retry_pending": e.is_transient() })),
                );
                Ok(StepOutcome::Fail(e))
            }
        }
    }

    async fn execute(&self, execution: &Execution, stage: Stage) -> Result<StageCommit, StageError> {
        let stages = &self.ctx.stages;
        Ok(match stage {
            Stage::Validate => match stages.validator.validate(execution).await? {
                Verdict::Accepted => StageCommit::Validated,
                Verdict::Rejected { reason } => StageCommit::Rejected { reason },
            },
            Stage::Classify => StageCommit::Classified {
                classification: stages.classifier.classify(execution).await?,
            },
            Stage::Inquire => {
                let questions = stages.inquirer.inquire(execution).await?;
                let inquiry: Vec<InquiryItem> = questions.into_iter().map(InquiryItem::new).collect();
                if inquiry.is_empty() {
                    StageCommit::Inquired {
                        inquiry,
                        track: track_of(execution, self.ctx.policy.small_value_threshold),
                    }
                } else {
                    StageCommit::InquiryOpened { inquiry }
                }
            }
            Stage::Research => StageCommit::Researched {
                findings: stages.research.run(execution).await?,
            },
            Stage::Analyze => StageCommit::Analyzed {
                analysis: stages.analyzer.analyze(execution).await?,
            },
            Stage::Report => StageCommit::Reported {
                report: stages.reporter.report(execution).await?,
            },
            Stage::AnalyzeAndReport => {
                let (analysis, report) = stages.combined.analyze_and_report(execution).await?;
                StageCommit::AnalyzedAndReported { analysis, report }
            }
        })
    }

    /// Persist first, then announce.
    async fn persist(
        &self,
        execution: &Execution,
        stage: Stage,
        commit: StageCommit,
    ) -> WorkflowResult<StepOutcome> {
        let next = commit.next_status();
        let metadata = event_metadata(&commit);
        let (id, expected, now) = (execution.id.clone(), execution.status, self.ctx.clock.now());
        let to_store = commit.clone();
        let committed = self
            .ctx
            .db
            .call(move |db| db.commit_stage(&id, expected, &to_store, now))
            .await?;
        if !committed {
            tracing::info!(run_id = %execution.id, stage = %stage, "transition already made elsewhere, discarding");
            return Ok(StepOutcome::Pause(PauseReason::Superseded));
        }

        tracing::info!(run_id = %execution.id, stage = %stage, from = %expected, to = %next, "transition");
        self.announce(
            ExecutionEvent::new(&execution.id, next)
                .with_stage(stage)
                .with_metadata(metadata),
        );

        match next {
            ExecutionStatus::InquiryAwaitingResponse => {
                self.notify_owner(execution, NotificationTemplate::InquiryReady).await;
                Ok(StepOutcome::Pause(PauseReason::AwaitingAnswers))
            }
            ExecutionStatus::Completed => {
                self.notify_owner(execution, NotificationTemplate::AssessmentComplete).await;
                Ok(StepOutcome::Advance(next))
            }
            _ => Ok(StepOutcome::Advance(next)),
        }
    }

    async fn notify_owner(&self, execution: &Execution, template: NotificationTemplate) {
        // Ownership may have changed since the snapshot was taken.
        let owner = match self.ctx.load(&execution.id).await {
            Ok(current) => current.owner_id,
            Err(_) => execution.owner_id.clone(),
        };
        if is_anonymous(&owner) {
            return;
        }
        if !self.ctx.notifier.notify(&owner, template, &execution.id).await {
            tracing::warn!(run_id = %execution.id, template = template.as_str(), "owner notification not delivered");
        }
    }

    /// Record answers for a paused execution. All checks run before anything
    /// is written; responses are write-once and blank answers leave a question open.
    pub async fn submit_answers(
        &self,
        run_id: &str,
        answers: Vec<String>,
    ) -> WorkflowResult<Execution> {
        let execution = self.ctx.load(run_id).await?;
        if execution.status != ExecutionStatus::InquiryAwaitingResponse {
            return Err(WorkflowError::Precondition {
                expected: ExecutionStatus::InquiryAwaitingResponse,
                actual: execution.status,
            });
        }
        if answers.len() != execution.inquiry.len() {
            return Err(WorkflowError::AnswerCountMismatch {
                expected: execution.inquiry.len(),
                received: answers.len(),
            });
        }

        let mut inquiry = execution.inquiry.clone();
        for (index, (item, answer)) in inquiry.iter_mut().zip(answers).enumerate() {
            let answer = answer.trim();
            if answer.is_empty() {
                continue;
            }
            match item.response.as_deref() {
                Some(existing) if item.is_answered() => {
                    if existing != answer {
                        return Err(WorkflowError::AlreadyAnswered { index });
                    }
                }
                _ => item.response = Some(answer.to_string()),
            }
        }

        let answered = inquiry.iter().filter(|i| i.is_answered()).count();
        let total = inquiry.len();
        let (id, now) = (run_id.to_string(), self.ctx.clock.now());
        let saved = self
            .ctx
            .db
            .call(move |db| db.save_answers(&id, &inquiry, now))
            .await?;
        if !saved {
            let current = self.ctx.load(run_id).await?;
            return Err(WorkflowError::Precondition {
                expected: ExecutionStatus::InquiryAwaitingResponse,
                actual: current.status,
            });
        }

        tracing::info!(run_id, answered, total, "inquiry answers saved");
        self.announce(
            ExecutionEvent::new(run_id, ExecutionStatus::InquiryAwaitingResponse)
                .with_stage(Stage::Inquire)
                .with_metadata(json!({ "answered": answered, "total": total })),
        );
        self.ctx.load(run_id).await
    }

    // ── Lease helpers ────────────────────────────────────────────────

    async fn acquire_lease(&self, run_id: &str, holder: &str) -> WorkflowResult<bool> {
        let now = self.ctx.clock.now();
        let stale_before = self.ctx.policy.stale_before(now);
        let (id, holder) = (run_id.to_string(), holder.to_string());
        Ok(self
            .ctx
            .db
            .call(move |db| db.acquire_lease(&id, &holder, now, stale_before))
            .await?)
    }

    async fn release_lease(&self, run_id: &str, holder: &str) {
        let (id, h) = (run_id.to_string(), holder.to_string());
        if let Err(e) = self.ctx.db.call(move |db| db.release_lease(&id, &h)).await {
            tracing::warn!(run_id, holder, error = %e, "failed to release lease");
        }
    }

    /// Poll `work` while renewing the lease heartbeat every `lease_renewal`.
    async fn with_lease_renewal<F, T>(&self, run_id: &str, holder: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval(self.ctx.policy.lease_renewal);
        // First tick is immediate; the lease was just taken.
        heartbeat.tick().await;
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = heartbeat.tick() => {
                    let (id, h, now) = (run_id.to_string(), holder.to_string(), self.ctx.clock.now());
                    match self.ctx.db.call(move |db| db.renew_lease(&id, &h, now)).await {
                        Ok(true) => tracing::debug!(run_id, "lease renewed"),
                        Ok(false) => tracing::warn!(run_id, holder, "lease lost during stage"),
                        Err(e) => tracing::warn!(run_id, error = %e, "lease renewal failed"),
                    }
                }
            }
        }
    }
}

fn event_metadata(commit: &StageCommit) -> serde_json::Value {
    match commit {
        StageCommit::Rejected { reason } => json!({ "reason": reason }),
        StageCommit::Classified { classification } => json!({ "classification": classification }),
        StageCommit::InquiryOpened { inquiry } => json!({ "inquiry": inquiry }),
        StageCommit::Inquired { track, .. } => json!({ "track": track }),
        StageCommit::Reported { .. } | StageCommit::AnalyzedAndReported { .. } => {
            json!({ "report_available": true })
        }
        _ => json!({}),
    }
}
