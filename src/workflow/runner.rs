use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::orchestrator::{DriveOutcome, Orchestrator};
use crate::errors::WorkflowError;

/// A background advance of one execution.
pub struct RunHandle {
    /// Lease holder token used by the task.
    token: String,
    task: JoinHandle<()>,
}

/// Tracks background advances so each execution has at most one task in
/// this process, and so tasks can be cancelled.
pub struct WorkflowRunner {
    orchestrator: Arc<Orchestrator>,
    /// Map from run_id to the task currently advancing it.
    running: Arc<tokio::sync::Mutex<HashMap<String, RunHandle>>>,
}

impl WorkflowRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub async fn is_running(&self, run_id: &str) -> bool {
        let running = self.running.lock().await;
        running.get(run_id).is_some_and(|h| !h.task.is_finished())
    }

    /// Start advancing `run_id` in the background. Returns false if a task for
    /// it is already running here.
    pub async fn spawn_advance(&self, run_id: &str) -> bool {
        let mut running = self.running.lock().await;
        if running.get(run_id).is_some_and(|h| !h.task.is_finished()) {
            tracing::debug!(run_id, "advance already in progress");
            return false;
        }

        let token = format!("worker-{}", uuid::Uuid::new_v4());
        let orchestrator = Arc::clone(&self.orchestrator);
        let registry = Arc::clone(&self.running);
        let id = run_id.to_string();
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            match orchestrator.advance(&id, &task_token).await {
                Ok(DriveOutcome::Completed) => tracing::info!(run_id = %id, "run completed"),
                Ok(outcome) => tracing::info!(run_id = %id, ?outcome, "advance stopped"),
                Err(WorkflowError::Stage(e)) => {
                    tracing::warn!(run_id = %id, error = %e, "advance failed, left for retry sweep");
                }
                Err(e) => tracing::error!(run_id = %id, error = %e, "advance aborted"),
            }
            let mut running = registry.lock().await;
            if running.get(&id).is_some_and(|h| h.token == task_token) {
                running.remove(&id);
            }
        });
        running.insert(run_id.to_string(), RunHandle { token, task });
        true
    }

    /// Best-effort stop of the task advancing `run_id`. Persisted status is
    /// left alone; only the task's lease is released.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let handle = self.running.lock().await.remove(run_id);
        let Some(handle) = handle else {
            return false;
        };
        self.stop(run_id, handle).await;
        true
    }

    async fn stop(&self, run_id: &str, handle: RunHandle) {
        handle.task.abort();
        if let Err(e) = handle.task.await
            && !e.is_cancelled()
        {
            tracing::warn!(run_id, error = %e, "cancelled task had panicked");
        }
        let (id, token) = (run_id.to_string(), handle.token);
        if let Err(e) = self
            .orchestrator
            .context()
            .db
            .call(move |db| db.release_lease(&id, &token))
            .await
        {
            tracing::warn!(run_id, error = %e, "failed to release lease of cancelled task");
        }
        tracing::info!(run_id, "advance cancelled");
    }

    /// Cancel every task on shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, RunHandle)> = self.running.lock().await.drain().collect();
        for (run_id, handle) in handles {
            self.stop(&run_id, handle).await;
        }
    }

    /// Wait for every background advance to finish on its own.
    pub async fn drain(&self) {
        loop {
            let busy = {
                let running = self.running.lock().await;
                running.values().any(|h| !h.task.is_finished())
            };
            if !busy {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Wait until no task is advancing `run_id`.
    #[cfg(test)]
    pub async fn wait_idle(&self, run_id: &str) {
        loop {
            let finished = {
                let running = self.running.lock().await;
                running.get(run_id).is_none_or(|h| h.task.is_finished())
            };
            if finished {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::models::{ExecutionStatus, NewExecution};
    use crate::workflow::testing::*;
    use std::time::Duration;

    async fn started(harness: &Harness) -> (Arc<WorkflowRunner>, String) {
        let orchestrator = Arc::new(harness.orchestrator());
        let exec = orchestrator
            .start(
                "user-1",
                NewExecution {
                    description: "Marathon".into(),
                    insured_value: Some(20_000.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (Arc::new(WorkflowRunner::new(orchestrator)), exec.id)
    }

    #[tokio::test]
    async fn test_spawn_advance_runs_to_completion_and_deregisters() {
        let harness = Harness::new(ScriptedStages::new());
        let (runner, id) = started(&harness).await;

        assert!(runner.spawn_advance(&id).await);
        runner.wait_idle(&id).await;
        assert!(!runner.is_running(&id).await);
        assert_eq!(
            harness.ctx.load(&id).await.unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_drain_waits_for_every_task() {
        let stages = ScriptedStages::new().delay("classify", Duration::from_millis(50));
        let harness = Harness::new(stages);
        let (runner, first) = started(&harness).await;
        let second = harness.seed("user-2", ExecutionStatus::Validated, 20_000.0);

        runner.spawn_advance(&first).await;
        runner.spawn_advance(&second.id).await;
        runner.drain().await;

        for id in [first.as_str(), second.id.as_str()] {
            assert_eq!(
                harness.ctx.load(id).await.unwrap().status,
                ExecutionStatus::Completed
            );
        }
    }

    #[tokio::test]
    async fn test_second_spawn_is_deduplicated() {
        let stages = ScriptedStages::new().delay("classify", Duration::from_millis(100));
        let harness = Harness::new(stages);
        let (runner, id) = started(&harness).await;

        assert!(runner.spawn_advance(&id).await);
        assert!(!runner.spawn_advance(&id).await);
        runner.wait_idle(&id).await;
        assert_eq!(harness.stages.call_count("classify"), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_task_and_releases_lease_without_touching_status() {
        let stages = ScriptedStages::new().delay("classify", Duration::from_secs(30));
        let harness = Harness::new(stages);
        let (runner, id) = started(&harness).await;

        runner.spawn_advance(&id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.ctx.load(&id).await.unwrap().lease_holder.is_some());

        assert!(runner.cancel(&id).await);
        let after = harness.ctx.load(&id).await.unwrap();
        assert_eq!(after.status, ExecutionStatus::Validated);
        assert!(after.lease_holder.is_none());
        assert!(!runner.is_running(&id).await);
        assert!(!runner.cancel(&id).await);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let stages = ScriptedStages::new().delay("classify", Duration::from_secs(30));
        let harness = Harness::new(stages);
        let (runner, id) = started(&harness).await;
        runner.spawn_advance(&id).await;
        runner.shutdown().await;
        assert!(!runner.is_running(&id).await);
    }
}
