use std::sync::Arc;

use serde::Serialize;

use super::clock::Clock;
use super::models::*;
use super::notify::NotificationTemplate;
use super::runner::WorkflowRunner;
use crate::errors::{WorkflowError, WorkflowResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// Ownership moved to the caller; `resumed` tells whether work was restarted.
    Claimed { resumed: bool },
    AlreadyOwned,
}

/// Moves anonymous executions to an authenticated identity.
pub struct IdentityReconciler {
    runner: Arc<WorkflowRunner>,
}

impl IdentityReconciler {
    pub fn new(runner: Arc<WorkflowRunner>) -> Self {
        Self { runner }
    }

    /// Claim `run_id` for `new_owner`.
    ///
    /// Answers that arrived before login close the inquiry as part of the
    /// claim. Any task still advancing the run under the anonymous identity is
    /// cancelled and a fresh advance is started.
    pub async fn claim(&self, run_id: &str, new_owner: &str) -> WorkflowResult<ClaimOutcome> {
        if is_anonymous(new_owner) {
            return Err(WorkflowError::LoginRequired);
        }
        let orchestrator = self.runner.orchestrator();
        let ctx = orchestrator.context();

        let execution = ctx.load(run_id).await?;
        if execution.owner_id == new_owner {
            return Ok(ClaimOutcome::AlreadyOwned);
        }
        if !execution.is_anonymous() {
            return Err(WorkflowError::Forbidden);
        }

        let (id, owner, now) = (run_id.to_string(), new_owner.to_string(), ctx.clock.now());
        if !ctx.db.call(move |db| db.claim_owner(&id, &owner, now)).await? {
            // Lost a race with another claim.
            let current = ctx.load(run_id).await?;
            return if current.owner_id == new_owner {
                Ok(ClaimOutcome::AlreadyOwned)
            } else {
                Err(WorkflowError::Forbidden)
            };
        }
        tracing::info!(run_id, owner_id = new_owner, "anonymous run claimed");

        self.runner.cancel(run_id).await;

        let mut execution = ctx.load(run_id).await?;
        if execution.status == ExecutionStatus::InquiryAwaitingResponse {
            if all_answered(&execution.inquiry) {
                orchestrator.close_inquiry(run_id).await?;
                execution = ctx.load(run_id).await?;
            } else if !ctx
                .notifier
                .notify(new_owner, NotificationTemplate::InquiryReady, run_id)
                .await
            {
                tracing::warn!(run_id, "inquiry notification not delivered");
            }
        }

        let mut event = ExecutionEvent::snapshot(&execution);
        event.metadata["owner_claimed"] = serde_json::Value::Bool(true);
        ctx.publisher.publish(event);

        let resumed = matches!(
            execution.status,
            ExecutionStatus::Created
                | ExecutionStatus::Validated
                | ExecutionStatus::Classified
                | ExecutionStatus::Inquired
                | ExecutionStatus::Researched
                | ExecutionStatus::Analyzed
        ) && self.runner.spawn_advance(run_id).await;

        Ok(ClaimOutcome::Claimed { resumed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::workflow::testing::*;

    fn reconciler_for(harness: &Harness) -> (IdentityReconciler, Arc<WorkflowRunner>) {
        let runner = Arc::new(WorkflowRunner::new(Arc::new(harness.orchestrator())));
        (IdentityReconciler::new(runner.clone()), runner)
    }

    #[tokio::test]
    async fn test_claim_closes_fully_answered_inquiry_and_resumes() {
        let harness = Harness::new(ScriptedStages::new());
        let (reconciler, runner) = reconciler_for(&harness);
        let exec = harness.seed(ANONYMOUS_OWNER, ExecutionStatus::InquiryAwaitingResponse, 50_000.0);
        {
            let db = harness.ctx.db.lock_sync().unwrap();
            let answered = vec![InquiryItem {
                question: "Capacity?".into(),
                response: Some("300".into()),
            }];
            assert!(db.save_answers(&exec.id, &answered, harness.ctx.clock.now()).unwrap());
        }
        let mut rx = harness.ctx.publisher.subscribe(&exec.id);

        let outcome = reconciler.claim(&exec.id, "user-7").await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed { resumed: true });
        runner.wait_idle(&exec.id).await;

        let done = harness.ctx.load(&exec.id).await.unwrap();
        assert_eq!(done.owner_id, "user-7");
        assert_eq!(done.status, ExecutionStatus::Completed);

        let mut saw_claim = false;
        while let Ok(event) = rx.try_recv() {
            if event.metadata.get("owner_claimed").is_some() {
                saw_claim = true;
            }
        }
        assert!(saw_claim);
    }

    #[tokio::test]
    async fn test_claim_with_open_questions_notifies_new_owner() {
        let harness = Harness::new(ScriptedStages::new());
        let (reconciler, _runner) = reconciler_for(&harness);
        let exec = harness.seed(ANONYMOUS_OWNER, ExecutionStatus::InquiryAwaitingResponse, 50_000.0);
        {
            let db = harness.ctx.db.lock_sync().unwrap();
            let open = vec![InquiryItem::new("Capacity?")];
            assert!(db.save_answers(&exec.id, &open, harness.ctx.clock.now()).unwrap());
        }

        let outcome = reconciler.claim(&exec.id, "user-7").await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed { resumed: false });
        assert_eq!(
            harness.ctx.load(&exec.id).await.unwrap().status,
            ExecutionStatus::InquiryAwaitingResponse
        );
        assert_eq!(
            harness.notifier.sent(),
            vec![(
                "user-7".to_string(),
                NotificationTemplate::InquiryReady,
                exec.id.clone()
            )]
        );
    }

    #[tokio::test]
    async fn test_claim_cancels_anonymous_task_and_restarts() {
        let stages = ScriptedStages::new().delay("classify", Duration::from_millis(200));
        let harness = Harness::new(stages);
        let (reconciler, runner) = reconciler_for(&harness);
        let exec = harness.seed(ANONYMOUS_OWNER, ExecutionStatus::Validated, 50_000.0);

        runner.spawn_advance(&exec.id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        reconciler.claim(&exec.id, "user-7").await.unwrap();
        runner.wait_idle(&exec.id).await;

        let done = harness.ctx.load(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        // The cancelled call never committed, so classify ran twice and classified once.
        assert_eq!(harness.stages.call_count("classify"), 2);
        assert_eq!(harness.stages.call_count("inquire"), 1);
    }

    #[tokio::test]
    async fn test_claim_resumes_run_parked_for_login() {
        let harness = Harness::new(ScriptedStages::new());
        let (reconciler, runner) = reconciler_for(&harness);
        let exec = harness.seed(ANONYMOUS_OWNER, ExecutionStatus::Validated, 50_000.0);

        runner.spawn_advance(&exec.id).await;
        runner.wait_idle(&exec.id).await;
        assert_eq!(
            harness.ctx.load(&exec.id).await.unwrap().status,
            ExecutionStatus::Inquired
        );
        assert_eq!(harness.stages.call_count("analyze"), 0);

        let outcome = reconciler.claim(&exec.id, "user-8").await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed { resumed: true });
        runner.wait_idle(&exec.id).await;

        let done = harness.ctx.load(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(harness.stages.call_count("analyze"), 1);
    }

    #[tokio::test]
    async fn test_claim_rules() {
        let harness = Harness::new(ScriptedStages::new());
        let (reconciler, _runner) = reconciler_for(&harness);
        let owned = harness.seed("user-1", ExecutionStatus::Completed, 50_000.0);

        assert_eq!(
            reconciler.claim(&owned.id, "user-1").await.unwrap(),
            ClaimOutcome::AlreadyOwned
        );
        assert!(matches!(
            reconciler.claim(&owned.id, "user-2").await,
            Err(WorkflowError::Forbidden)
        ));
        assert!(matches!(
            reconciler.claim(&owned.id, ANONYMOUS_OWNER).await,
            Err(WorkflowError::LoginRequired)
        ));
        assert!(matches!(
            reconciler.claim("missing", "user-1").await,
            Err(WorkflowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_claiming_terminal_run_does_not_resume() {
        let harness = Harness::new(ScriptedStages::new());
        let (reconciler, _runner) = reconciler_for(&harness);
        let exec = harness.seed(ANONYMOUS_OWNER, ExecutionStatus::Completed, 50_000.0);
        assert_eq!(
            reconciler.claim(&exec.id, "user-3").await.unwrap(),
            ClaimOutcome::Claimed { resumed: false }
        );
        assert!(harness.stages.calls().is_empty());
    }
}
