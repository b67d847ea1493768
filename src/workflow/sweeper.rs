//! Periodic recovery pass over persisted executions.
//!
//! Each sweep, in order:
//! 1. escalates failed runs whose retry budget is spent or whose failure was
//!    permanent (once per run)
//! 2. clears the failure on retryable runs and resumes them from their last good status
//! 3. resumes runs left between stages with no live lease, including `created`
//!    runs whose synchronous validation never finished. Anonymous runs parked
//!    at `inquired` or later wait for a claim instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::clock::Clock;
use super::models::{EventStatus, ExecutionEvent, ExecutionStatus, FailureKind};
use super::notify::NotificationTemplate;
use super::runner::WorkflowRunner;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Statuses a run may sit in between two stages.
const STALLED_STATUSES: [ExecutionStatus; 5] = [
    ExecutionStatus::Validated,
    ExecutionStatus::Classified,
    ExecutionStatus::Inquired,
    ExecutionStatus::Researched,
    ExecutionStatus::Analyzed,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub escalated: Vec<String>,
    pub retried: Vec<String>,
    pub resumed: Vec<String>,
    pub started: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.escalated.is_empty()
            && self.retried.is_empty()
            && self.resumed.is_empty()
            && self.started.is_empty()
    }
}

pub struct RetrySweeper {
    runner: Arc<WorkflowRunner>,
    admin_contact: String,
    interval: Duration,
}

impl RetrySweeper {
    pub fn new(runner: Arc<WorkflowRunner>, admin_contact: &str, interval: Duration) -> Self {
        Self {
            runner,
            admin_contact: admin_contact.to_string(),
            interval,
        }
    }

    /// Sweep now, then every `interval` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "retry sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.sweep_once().await {
                    Ok(report) if !report.is_empty() => tracing::info!(
                        escalated = report.escalated.len(),
                        retried = report.retried.len(),
                        resumed = report.resumed.len(),
                        started = report.started.len(),
                        "sweep finished"
                    ),
                    Ok(_) => tracing::debug!("sweep found nothing to do"),
                    Err(e) => tracing::error!(error = %e, "sweep failed"),
                },
            }
        }
        tracing::info!("retry sweeper stopped");
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.escalate(&mut report).await?;
        self.retry(&mut report).await?;
        self.resume_stalled(&mut report).await?;
        Ok(report)
    }

    async fn escalate(&self, report: &mut SweepReport) -> Result<()> {
        let ctx = self.runner.orchestrator().context();
        let max = ctx.policy.max_retries;
        let due = ctx.db.call(move |db| db.list_escalation_due(max)).await?;

        for execution in due {
            let (id, now) = (execution.id.clone(), ctx.clock.now());
            if !ctx.db.call(move |db| db.mark_escalated(&id, now)).await? {
                continue;
            }
            let permanent = execution.failure_kind == Some(FailureKind::Permanent);
            tracing::warn!(
                run_id = %execution.id,
                retry_count = execution.retry_count,
                permanent,
                reason = execution.failed_reason.as_deref().unwrap_or(""),
                "escalating failed run"
            );
            if !ctx
                .notifier
                .notify(&self.admin_contact, NotificationTemplate::Escalation, &execution.id)
                .await
            {
                tracing::warn!(run_id = %execution.id, "escalation notification not delivered");
            }
            ctx.publisher.publish(
                ExecutionEvent::new(&execution.id, EventStatus::Failed).with_metadata(json!({
                    "escalated": true,
                    "permanent": permanent,
                    "reason": execution.failed_reason,
                    "retry_count": execution.retry_count,
                })),
            );
            report.escalated.push(execution.id);
        }
        Ok(())
    }

    async fn retry(&self, report: &mut SweepReport) -> Result<()> {
        let ctx = self.runner.orchestrator().context();
        let max = ctx.policy.max_retries;
        let retryable = ctx.db.call(move |db| db.list_retryable(max)).await?;

        for execution in retryable {
            let (id, now) = (execution.id.clone(), ctx.clock.now());
            let Some(status) = ctx.db.call(move |db| db.begin_retry(&id, now)).await? else {
                continue;
            };
            let attempt = execution.retry_count + 1;
            tracing::info!(run_id = %execution.id, %status, retry = attempt, max_retries = max, "retrying");
            ctx.publisher.publish(
                ExecutionEvent::new(&execution.id, EventStatus::Processing)
                    .with_metadata(json!({ "retry": attempt, "resumed_from": status })),
            );
            self.runner.spawn_advance(&execution.id).await;
            report.retried.push(execution.id);
        }
        Ok(())
    }

    async fn resume_stalled(&self, report: &mut SweepReport) -> Result<()> {
        let ctx = self.runner.orchestrator().context();
        let stale_before = ctx.policy.stale_before(ctx.clock.now());

        let created = ctx
            .db
            .call(move |db| db.list_claimable(ExecutionStatus::Created, stale_before))
            .await?;
        for execution in created {
            if self.runner.spawn_advance(&execution.id).await {
                tracing::info!(run_id = %execution.id, "starting unvalidated run");
                report.started.push(execution.id);
            }
        }

        for status in STALLED_STATUSES {
            let stalled = ctx
                .db
                .call(move |db| db.list_claimable(status, stale_before))
                .await?;
            for execution in stalled {
                if report.retried.contains(&execution.id)
                    || (execution.is_anonymous() && status.requires_login())
                {
                    continue;
                }
                if self.runner.spawn_advance(&execution.id).await {
                    tracing::info!(run_id = %execution.id, %status, "resuming stalled run");
                    report.resumed.push(execution.id);
                }
            }
        }
        Ok(())
    }
}
