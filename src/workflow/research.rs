//! Research stage: three independent lookups run concurrently, all-or-nothing.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;

use super::db::DbHandle;
use super::models::{Execution, ResearchFindings};
use crate::errors::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchKind {
    Current,
    Historical,
    Regulatory,
}

impl ResearchKind {
    pub const ALL: [ResearchKind; 3] = [Self::Current, Self::Historical, Self::Regulatory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Historical => "historical",
            Self::Regulatory => "regulatory",
        }
    }

    pub fn stage_name(&self) -> &'static str {
        match self {
            Self::Current => "research_current",
            Self::Historical => "research_historical",
            Self::Regulatory => "research_regulatory",
        }
    }
}

#[async_trait]
pub trait ResearchLookup: Send + Sync {
    fn kind(&self) -> ResearchKind;
    async fn lookup(&self, execution: &Execution) -> Result<Value, StageError>;
}

/// Side store that research results are copied into. Writes are best-effort.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn record(&self, execution_id: &str, kind: ResearchKind, content: &Value) -> Result<()>;
}

pub struct NoopKnowledgeStore;

#[async_trait]
impl KnowledgeStore for NoopKnowledgeStore {
    async fn record(&self, _execution_id: &str, _kind: ResearchKind, _content: &Value) -> Result<()> {
        Ok(())
    }
}

/// Knowledge store backed by the `knowledge_entries` table.
pub struct DbKnowledgeStore {
    db: DbHandle,
}

impl DbKnowledgeStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KnowledgeStore for DbKnowledgeStore {
    async fn record(&self, execution_id: &str, kind: ResearchKind, content: &Value) -> Result<()> {
        let execution_id = execution_id.to_string();
        let content = content.clone();
        self.db
            .call(move |db| db.insert_knowledge(&execution_id, kind.as_str(), &content))
            .await
    }
}

#[derive(Clone)]
pub struct ResearchFanOut {
    lookups: Vec<Arc<dyn ResearchLookup>>,
    knowledge: Arc<dyn KnowledgeStore>,
}

impl ResearchFanOut {
    pub fn new(lookups: Vec<Arc<dyn ResearchLookup>>) -> Self {
        Self {
            lookups,
            knowledge: Arc::new(NoopKnowledgeStore),
        }
    }

    pub fn with_knowledge_store(mut self, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Run every lookup on its own task. The first failure aborts the rest
    /// and fails the whole stage; no partial findings are returned.
    pub async fn run(&self, execution: &Execution) -> Result<ResearchFindings, StageError> {
        let snapshot = Arc::new(execution.clone());
        let mut tasks = JoinSet::new();
        for lookup in &self.lookups {
            let lookup = lookup.clone();
            let knowledge = self.knowledge.clone();
            let snapshot = snapshot.clone();
            tasks.spawn(async move {
                let kind = lookup.kind();
                let value = lookup.lookup(&snapshot).await?;
                if let Err(e) = knowledge.record(&snapshot.id, kind, &value).await {
                    tracing::warn!(run_id = %snapshot.id, kind = kind.as_str(), error = %e, "knowledge store write failed");
                }
                Ok::<_, StageError>((kind, value))
            });
        }

        let mut findings = ResearchFindings::default();
        while let Some(joined) = tasks.join_next().await {
            let (kind, value) = match joined {
                Ok(Ok(done)) => done,
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(StageError::Permanent(format!("research lookup panicked: {}", e)));
                }
            };
            match kind {
                ResearchKind::Current => findings.current = Some(value),
                ResearchKind::Historical => findings.historical = Some(value),
                ResearchKind::Regulatory => findings.regulatory = Some(value),
            }
        }

        if !findings.is_complete() {
            return Err(StageError::Permanent(
                "research lookups did not cover current, historical and regulatory context".into(),
            ));
        }
        Ok(findings)
    }
}
