//! Scripted collaborators shared by the workflow test modules.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use super::clock::{Clock, ManualClock, SystemClock};
use super::db::{DbHandle, ExecutionDb};
use super::events::EventPublisher;
use super::executors::*;
use super::models::*;
use super::notify::{NotificationTemplate, Notifier};
use super::orchestrator::{Orchestrator, WorkflowContext, WorkflowPolicy};
use super::research::{ResearchFanOut, ResearchKind, ResearchLookup};
use crate::errors::StageError;

/// An execution in `created` with sensible defaults.
pub fn execution(id: &str, insured_value: Option<f64>) -> Execution {
    let now = Utc::now().to_rfc3339();
    Execution {
        id: id.to_string(),
        owner_id: ANONYMOUS_OWNER.to_string(),
        description: "Open-air concert in the city park".to_string(),
        start_date: Some("2026-07-01".to_string()),
        end_date: Some("2026-07-02".to_string()),
        insured_value,
        status: ExecutionStatus::Created,
        failed_from: None,
        track: None,
        rejection_reason: None,
        classification: None,
        inquiry: Vec::new(),
        research: ResearchFindings::default(),
        analysis: None,
        report: None,
        lease_started_at: None,
        lease_heartbeat_at: None,
        lease_holder: None,
        retry_count: 0,
        failed_at: None,
        failed_reason: None,
        failure_kind: None,
        escalated: false,
        created_at: now.clone(),
        updated_at: now,
    }
}

// ── Research lookups ─────────────────────────────────────────────────

pub struct StaticLookup {
    kind: ResearchKind,
    result: Result<Value, StageError>,
    delay: Option<Duration>,
}

impl StaticLookup {
    pub fn ok(kind: ResearchKind, value: Value) -> Self {
        Self {
            kind,
            result: Ok(value),
            delay: None,
        }
    }

    pub fn failing(kind: ResearchKind, error: StageError) -> Self {
        Self {
            kind,
            result: Err(error),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ResearchLookup for StaticLookup {
    fn kind(&self) -> ResearchKind {
        self.kind
    }

    async fn lookup(&self, _execution: &Execution) -> Result<Value, StageError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}

// ── Scripted stages ──────────────────────────────────────────────────

struct FailurePlan {
    /// `None` fails forever.
    remaining: Option<u32>,
    error: StageError,
}

/// Deterministic stand-in for every stage. Records each call by stage name.
#[derive(Default)]
pub struct ScriptedStages {
    rejection: Option<String>,
    questions: Vec<String>,
    failures: Mutex<HashMap<&'static str, FailurePlan>>,
    delays: HashMap<&'static str, Duration>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedStages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(mut self, reason: &str) -> Self {
        self.rejection = Some(reason.to_string());
        self
    }

    pub fn questions(mut self, questions: &[&str]) -> Self {
        self.questions = questions.iter().map(|q| q.to_string()).collect();
        self
    }

    pub fn fail_always(self, stage: &'static str, error: StageError) -> Self {
        self.plan(stage, None, error)
    }

    pub fn fail_times(self, stage: &'static str, times: u32, error: StageError) -> Self {
        self.plan(stage, Some(times), error)
    }

    fn plan(self, stage: &'static str, remaining: Option<u32>, error: StageError) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(stage, FailurePlan { remaining, error });
        }
        self
    }

    pub fn delay(mut self, stage: &'static str, delay: Duration) -> Self {
        self.delays.insert(stage, delay);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, stage: &str) -> usize {
        self.calls().iter().filter(|c| **c == stage).count()
    }

    async fn enter(&self, stage: &'static str) -> Result<(), StageError> {
        self.calls.lock().unwrap().push(stage);
        if let Some(delay) = self.delays.get(stage) {
            tokio::time::sleep(*delay).await;
        }
        let mut failures = self.failures.lock().unwrap();
        let Some(plan) = failures.get_mut(stage) else {
            return Ok(());
        };
        match plan.remaining {
            None => Err(plan.error.clone()),
            Some(0) => Ok(()),
            Some(n) => {
                plan.remaining = Some(n - 1);
                Err(plan.error.clone())
            }
        }
    }

    /// Wrap into a [`StageSet`] whose research lookups also report here.
    pub fn into_stage_set(self) -> (Arc<Self>, StageSet) {
        let stages = Arc::new(self);
        let lookups = ResearchKind::ALL
            .iter()
            .map(|kind| {
                Arc::new(ScriptedLookup {
                    stages: stages.clone(),
                    kind: *kind,
                }) as Arc<dyn ResearchLookup>
            })
            .collect();
        let set = StageSet::from_shared(stages.clone(), ResearchFanOut::new(lookups));
        (stages, set)
    }
}

#[async_trait]
impl Validator for ScriptedStages {
    async fn validate(&self, _execution: &Execution) -> Result<Verdict, StageError> {
        self.enter("validate").await?;
        Ok(match &self.rejection {
            Some(reason) => Verdict::Rejected {
                reason: reason.clone(),
            },
            None => Verdict::Accepted,
        })
    }
}

#[async_trait]
impl Classifier for ScriptedStages {
    async fn classify(&self, _execution: &Execution) -> Result<String, StageError> {
        self.enter("classify").await?;
        Ok("event".to_string())
    }
}

#[async_trait]
impl Inquirer for ScriptedStages {
    async fn inquire(&self, _execution: &Execution) -> Result<Vec<String>, StageError> {
        self.enter("inquire").await?;
        Ok(self.questions.clone())
    }
}

#[async_trait]
impl Analyzer for ScriptedStages {
    async fn analyze(&self, execution: &Execution) -> Result<Value, StageError> {
        self.enter("analyze").await?;
        Ok(json!({ "risk_score": 0.42, "researched": execution.research.is_complete() }))
    }
}

#[async_trait]
impl Reporter for ScriptedStages {
    async fn report(&self, _execution: &Execution) -> Result<Value, StageError> {
        self.enter("report").await?;
        Ok(json!({ "summary": "moderate risk" }))
    }
}

#[async_trait]
impl CombinedAssessor for ScriptedStages {
    async fn analyze_and_report(
        &self,
        _execution: &Execution,
    ) -> Result<(Value, Value), StageError> {
        self.enter("analyze_and_report").await?;
        Ok((json!({ "risk_score": 0.1 }), json!({ "summary": "low risk" })))
    }
}

struct ScriptedLookup {
    stages: Arc<ScriptedStages>,
    kind: ResearchKind,
}

#[async_trait]
impl ResearchLookup for ScriptedLookup {
    fn kind(&self) -> ResearchKind {
        self.kind
    }

    async fn lookup(&self, _execution: &Execution) -> Result<Value, StageError> {
        self.stages.enter(self.kind.stage_name()).await?;
        Ok(json!({ "source": self.kind.as_str() }))
    }
}

// ── Notifier ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, NotificationTemplate, String)>>,
    refuse: bool,
}

impl RecordingNotifier {
    /// Records every attempt but reports delivery failure.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, NotificationTemplate, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_templates(&self) -> Vec<NotificationTemplate> {
        self.sent().into_iter().map(|(_, t, _)| t).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: &str, template: NotificationTemplate, run_id: &str) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), template, run_id.to_string()));
        !self.refuse
    }
}

// ── Harness ──────────────────────────────────────────────────────────

/// In-memory context plus handles on the doubles behind it.
pub struct Harness {
    pub ctx: WorkflowContext,
    pub stages: Arc<ScriptedStages>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(stages: ScriptedStages) -> Self {
        Self::build(stages, RecordingNotifier::default(), Arc::new(SystemClock))
    }

    pub fn with_clock(stages: ScriptedStages, clock: Arc<ManualClock>) -> Self {
        Self::build(stages, RecordingNotifier::default(), clock)
    }

    pub fn build(
        stages: ScriptedStages,
        notifier: RecordingNotifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (stages, set) = stages.into_stage_set();
        let notifier = Arc::new(notifier);
        let ctx = WorkflowContext {
            db: DbHandle::new(ExecutionDb::new_in_memory().unwrap()),
            stages: set,
            publisher: Arc::new(EventPublisher::default()),
            notifier: notifier.clone(),
            clock,
            policy: WorkflowPolicy {
                small_value_threshold: 1000.0,
                max_retries: 3,
                stale_lease: Duration::from_secs(300),
                lease_renewal: Duration::from_secs(60),
            },
        };
        Self {
            ctx,
            stages,
            notifier,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.ctx.clone())
    }

    /// Insert an execution directly in `status`, bypassing the pipeline.
    pub fn seed(&self, owner_id: &str, status: ExecutionStatus, insured_value: f64) -> Execution {
        let id = uuid::Uuid::new_v4().to_string();
        let db = self.ctx.db.lock_sync().unwrap();
        let new = NewExecution {
            description: "Harbour regatta".into(),
            start_date: None,
            end_date: None,
            insured_value: Some(insured_value),
        };
        db.create_execution(&id, owner_id, &new, self.ctx.clock.now())
            .unwrap();
        db.force_status(&id, status).unwrap();
        db.get_execution(&id).unwrap().unwrap()
    }
}
