use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::StageError;

/// Async-safe handle to the execution store.
///
/// Wraps `ExecutionDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ExecutionDb>>,
}

impl DbHandle {
    pub fn new(db: ExecutionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ExecutionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// one-shots and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ExecutionDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Result of a stage that completed successfully, ready to persist.
#[derive(Debug, Clone)]
pub enum StageCommit {
    Rejected {
        reason: String,
    },
    Validated,
    Classified {
        classification: String,
    },
    InquiryOpened {
        inquiry: Vec<InquiryItem>,
    },
    Inquired {
        inquiry: Vec<InquiryItem>,
        track: AssessmentTrack,
    },
    Researched {
        findings: ResearchFindings,
    },
    Analyzed {
        analysis: serde_json::Value,
    },
    Reported {
        report: serde_json::Value,
    },
    AnalyzedAndReported {
        analysis: serde_json::Value,
        report: serde_json::Value,
    },
}

impl StageCommit {
    pub fn next_status(&self) -> ExecutionStatus {
        match self {
            Self::Rejected { .. } => ExecutionStatus::Rejected,
            Self::Validated => ExecutionStatus::Validated,
            Self::Classified { .. } => ExecutionStatus::Classified,
            Self::InquiryOpened { .. } => ExecutionStatus::InquiryAwaitingResponse,
            Self::Inquired { .. } => ExecutionStatus::Inquired,
            Self::Researched { .. } => ExecutionStatus::Researched,
            Self::Analyzed { .. } => ExecutionStatus::Analyzed,
            Self::Reported { .. } | Self::AnalyzedAndReported { .. } => ExecutionStatus::Completed,
        }
    }
}

const EXECUTION_COLUMNS: &str = "id, owner_id, description, start_date, end_date, insured_value, \
     status, failed_from, track, rejection_reason, classification, inquiry, \
     research_current, research_historical, research_regulatory, analysis, report, \
     lease_holder, lease_started_at_ms, lease_heartbeat_at_ms, retry_count, \
     failed_at, failed_reason, escalated, created_at, updated_at, failure_kind";

pub struct ExecutionDb {
    conn: Connection,
}

impl ExecutionDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        // In-memory databases answer "memory" here.
        let _mode: String = self
            .conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to set journal mode")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    description TEXT NOT NULL,
                    start_date TEXT,
                    end_date TEXT,
                    insured_value REAL,
                    status TEXT NOT NULL DEFAULT 'created',
                    failed_from TEXT,
                    track TEXT,
                    rejection_reason TEXT,
                    classification TEXT,
                    inquiry TEXT NOT NULL DEFAULT '[]',
                    research_current TEXT,
                    research_historical TEXT,
                    research_regulatory TEXT,
                    analysis TEXT,
                    report TEXT,
                    lease_holder TEXT,
                    lease_started_at_ms INTEGER,
                    lease_heartbeat_at_ms INTEGER,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    failed_at TEXT,
                    failed_reason TEXT,
                    escalated INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    failure_kind TEXT
                );

                CREATE TABLE IF NOT EXISTS knowledge_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
                CREATE INDEX IF NOT EXISTS idx_knowledge_execution ON knowledge_entries(execution_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Execution CRUD ────────────────────────────────────────────────

    pub fn create_execution(
        &self,
        id: &str,
        owner_id: &str,
        new: &NewExecution,
        now: DateTime<Utc>,
    ) -> Result<Execution> {
        let ts = now.to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO executions (id, owner_id, description, start_date, end_date, insured_value, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'created', ?7, ?7)",
                params![
                    id,
                    owner_id,
                    new.description,
                    new.start_date,
                    new.end_date,
                    new.insured_value,
                    ts
                ],
            )
            .context("Failed to insert execution")?;
        self.get_execution(id)?
            .context("Execution not found after insert")
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let sql = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ExecutionRow::from_row)
            .optional()
            .context("Failed to query execution")?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    fn query_executions(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Execution>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare execution query")?;
        let rows = stmt
            .query_map(args, ExecutionRow::from_row)
            .context("Failed to query executions")?;
        let mut executions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read execution row")?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    pub fn list_executions(&self, limit: u32) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions ORDER BY created_at DESC LIMIT ?1",
            EXECUTION_COLUMNS
        );
        self.query_executions(&sql, &[&limit])
    }

    // ── Sweep queries ─────────────────────────────────────────────────

    /// Executions in `status` with no failure and no lease heartbeat newer than `stale_before`.
    pub fn list_claimable(
        &self,
        status: ExecutionStatus,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE status = ?1 AND failed_at IS NULL
               AND (lease_heartbeat_at_ms IS NULL OR lease_heartbeat_at_ms < ?2)
             ORDER BY updated_at",
            EXECUTION_COLUMNS
        );
        let cutoff = stale_before.timestamp_millis();
        self.query_executions(&sql, &[&status.as_str(), &cutoff])
    }

    /// Failed, lease-free executions with retry budget left that are not waiting on a person.
    /// Permanent failures never qualify.
    pub fn list_retryable(&self, max_retries: u32) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE status = 'failed' AND failed_at IS NOT NULL
               AND retry_count < ?1 AND escalated = 0
               AND (failure_kind IS NULL OR failure_kind != 'permanent')
               AND lease_holder IS NULL
               AND (failed_from IS NULL OR failed_from != 'inquiry_awaiting_response')
             ORDER BY failed_at",
            EXECUTION_COLUMNS
        );
        self.query_executions(&sql, &[&max_retries])
    }

    /// Failed executions that are out of retries or failed permanently.
    pub fn list_escalation_due(&self, max_retries: u32) -> Result<Vec<Execution>> {
        let sql = format!(
            "SELECT {} FROM executions
             WHERE status = 'failed' AND escalated = 0
               AND (retry_count >= ?1 OR failure_kind = 'permanent')
             ORDER BY failed_at",
            EXECUTION_COLUMNS
        );
        self.query_executions(&sql, &[&max_retries])
    }

    // ── Lease ─────────────────────────────────────────────────────────

    /// The single lease-acquisition path. Succeeds when the lease is free,
    /// already held by `holder`, or its last heartbeat is older than `stale_before`.
    /// A failed execution can never be leased.
    pub fn acquire_lease(
        &self,
        id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE executions
                 SET lease_holder = ?2,
                     lease_started_at_ms = CASE WHEN lease_holder = ?2 THEN lease_started_at_ms ELSE ?3 END,
                     lease_heartbeat_at_ms = ?3
                 WHERE id = ?1 AND status != 'failed'
                   AND (lease_holder IS NULL OR lease_holder = ?2
                        OR lease_heartbeat_at_ms IS NULL OR lease_heartbeat_at_ms < ?4)",
                params![
                    id,
                    holder,
                    now.timestamp_millis(),
                    stale_before.timestamp_millis()
                ],
            )
            .context("Failed to acquire lease")?;
        Ok(changed == 1)
    }

    pub fn renew_lease(&self, id: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE executions SET lease_heartbeat_at_ms = ?3 WHERE id = ?1 AND lease_holder = ?2",
                params![id, holder, now.timestamp_millis()],
            )
            .context("Failed to renew lease")?;
        Ok(changed == 1)
    }

    pub fn release_lease(&self, id: &str, holder: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE executions
                 SET lease_holder = NULL, lease_started_at_ms = NULL, lease_heartbeat_at_ms = NULL
                 WHERE id = ?1 AND lease_holder = ?2",
                params![id, holder],
            )
            .context("Failed to release lease")?;
        Ok(changed == 1)
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// Persist a stage result if the execution is still in `expected`.
    /// Returns false when another writer already moved it on.
    pub fn commit_stage(
        &self,
        id: &str,
        expected: ExecutionStatus,
        commit: &StageCommit,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let next = commit.next_status().as_str();
        let expected = expected.as_str();
        let ts = now.to_rfc3339();
        const GUARD: &str = "WHERE id = ?1 AND status = ?2 AND failed_at IS NULL";

        let changed = match commit {
            StageCommit::Rejected { reason } => self.conn.execute(
                &format!(
                    "UPDATE executions SET status = ?3, rejection_reason = ?4, updated_at = ?5,
                     lease_holder = NULL, lease_started_at_ms = NULL, lease_heartbeat_at_ms = NULL {}",
                    GUARD
                ),
                params![id, expected, next, reason, ts],
            ),
            StageCommit::Validated => self.conn.execute(
                &format!("UPDATE executions SET status = ?3, updated_at = ?4 {}", GUARD),
                params![id, expected, next, ts],
            ),
            StageCommit::Classified { classification } => self.conn.execute(
                &format!(
                    "UPDATE executions SET status = ?3, classification = ?4, updated_at = ?5 {}",
                    GUARD
                ),
                params![id, expected, next, classification, ts],
            ),
            StageCommit::InquiryOpened { inquiry } => self.conn.execute(
                &format!(
                    "UPDATE executions SET status = ?3, inquiry = ?4, updated_at = ?5 {}",
                    GUARD
                ),
                params![id, expected, next, to_json(inquiry)?, ts],
            ),
            StageCommit::Inquired { inquiry, track } => self.conn.execute(
                &format!(
                    "UPDATE executions SET status = ?3, inquiry = ?4, track = ?5, updated_at = ?6 {}",
                    GUARD
                ),
                params![id, expected, next, to_json(inquiry)?, track.as_str(), ts],
            ),
            StageCommit::Researched { findings } => self.conn.execute(
                &format!(
                    "UPDATE executions SET status = ?3, research_current = ?4,
                     research_historical = ?5, research_regulatory = ?6, updated_at = ?7 {}",
                    GUARD
                ),
                params![
                    id,
                    expected,
                    next,
                    opt_json(&findings.current)?,
                    opt_json(&findings.historical)?,
                    opt_json(&findings.regulatory)?,
                    ts
                ],
            ),
            StageCommit::Analyzed { analysis } => self.conn.execute(
                &format!(
                    "UPDATE executions SET status = ?3, analysis = ?4, updated_at = ?5 {}",
                    GUARD
                ),
                params![id, expected, next, to_json(analysis)?, ts],
            ),
            StageCommit::Reported { report } => self.conn.execute(
                &format!(
                    "UPDATE executions SET status = ?3, report = ?4, updated_at = ?5,
                     retry_count = 0, failed_from = NULL, failed_reason = NULL, escalated = 0,
                     lease_holder = NULL, lease_started_at_ms = NULL, lease_heartbeat_at_ms = NULL {}",
                    GUARD
                ),
                params![id, expected, next, to_json(report)?, ts],
            ),
            StageCommit::AnalyzedAndReported { analysis, report } => self.conn.execute(
                &format!(
                    "UPDATE executions SET status = ?3, analysis = ?4, report = ?5, updated_at = ?6,
                     retry_count = 0, failed_from = NULL, failed_reason = NULL, escalated = 0,
                     lease_holder = NULL, lease_started_at_ms = NULL, lease_heartbeat_at_ms = NULL {}",
                    GUARD
                ),
                params![id, expected, next, to_json(analysis)?, to_json(report)?, ts],
            ),
        }
        .context("Failed to commit stage result")?;
        Ok(changed == 1)
    }

    /// Record a stage failure and its kind. Releases any lease in the same write.
    pub fn mark_failed(
        &self,
        id: &str,
        expected: ExecutionStatus,
        error: &StageError,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let ts = now.to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE executions
                 SET status = 'failed', failed_from = ?2, failed_at = ?3, failed_reason = ?4,
                     failure_kind = ?5, updated_at = ?3,
                     lease_holder = NULL, lease_started_at_ms = NULL, lease_heartbeat_at_ms = NULL
                 WHERE id = ?1 AND status = ?2",
                params![id, expected.as_str(), ts, error.to_string(), error.kind().as_str()],
            )
            .context("Failed to mark execution as failed")?;
        Ok(changed == 1)
    }

    /// Clear a failure and put the execution back into the status it failed from,
    /// counting one retry. Returns the status it re-enters.
    pub fn begin_retry(&self, id: &str, now: DateTime<Utc>) -> Result<Option<ExecutionStatus>> {
        let ts = now.to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE executions
                 SET status = COALESCE(failed_from, 'created'), failed_from = NULL,
                     failed_at = NULL, failed_reason = NULL, failure_kind = NULL,
                     retry_count = retry_count + 1, updated_at = ?2
                 WHERE id = ?1 AND status = 'failed' AND escalated = 0
                   AND (failure_kind IS NULL OR failure_kind != 'permanent')",
                params![id, ts],
            )
            .context("Failed to begin retry")?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(self.get_execution(id)?.map(|e| e.status))
    }

    pub fn mark_escalated(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE executions SET escalated = 1, updated_at = ?2
                 WHERE id = ?1 AND status = 'failed' AND escalated = 0",
                params![id, now.to_rfc3339()],
            )
            .context("Failed to mark execution as escalated")?;
        Ok(changed == 1)
    }

    /// Rewrite the whole inquiry list while the run is waiting for answers.
    pub fn save_answers(
        &self,
        id: &str,
        inquiry: &[InquiryItem],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE executions SET inquiry = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'inquiry_awaiting_response'",
                params![id, to_json(&inquiry)?, now.to_rfc3339()],
            )
            .context("Failed to save inquiry answers")?;
        Ok(changed == 1)
    }

    /// Move an anonymous execution to `owner_id`. Succeeds at most once per execution.
    pub fn claim_owner(&self, id: &str, owner_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE executions SET owner_id = ?2, updated_at = ?4 WHERE id = ?1 AND owner_id = ?3",
                params![id, owner_id, ANONYMOUS_OWNER, now.to_rfc3339()],
            )
            .context("Failed to claim execution owner")?;
        Ok(changed == 1)
    }

    // ── Knowledge entries ─────────────────────────────────────────────

    pub fn insert_knowledge(
        &self,
        execution_id: &str,
        kind: &str,
        content: &serde_json::Value,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO knowledge_entries (execution_id, kind, content) VALUES (?1, ?2, ?3)",
                params![execution_id, kind, to_json(content)?],
            )
            .context("Failed to insert knowledge entry")?;
        Ok(())
    }

    pub fn list_knowledge(&self, execution_id: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT kind, content FROM knowledge_entries WHERE execution_id = ?1 ORDER BY id")
            .context("Failed to prepare list_knowledge")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query knowledge entries")?;
        let mut entries = Vec::new();
        for row in rows {
            let (kind, content) = row.context("Failed to read knowledge row")?;
            let value = serde_json::from_str(&content).context("Failed to parse knowledge content")?;
            entries.push((kind, value));
        }
        Ok(entries)
    }

    /// Jump straight to `status`. Test fixtures only.
    #[cfg(test)]
    pub fn force_status(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .context("Failed to force status")?;
        Ok(())
    }
}

// ── Row conversion ────────────────────────────────────────────────────

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize column value")
}

fn opt_json(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    value.as_ref().map(|v| to_json(v)).transpose()
}

fn parse_json_column(raw: Option<String>, column: &str) -> Result<Option<serde_json::Value>> {
    raw.map(|s| {
        serde_json::from_str(&s).with_context(|| format!("Failed to parse {} column", column))
    })
    .transpose()
}

fn parse_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

struct ExecutionRow {
    id: String,
    owner_id: String,
    description: String,
    start_date: Option<String>,
    end_date: Option<String>,
    insured_value: Option<f64>,
    status: String,
    failed_from: Option<String>,
    track: Option<String>,
    rejection_reason: Option<String>,
    classification: Option<String>,
    inquiry: String,
    research_current: Option<String>,
    research_historical: Option<String>,
    research_regulatory: Option<String>,
    analysis: Option<String>,
    report: Option<String>,
    lease_holder: Option<String>,
    lease_started_at_ms: Option<i64>,
    lease_heartbeat_at_ms: Option<i64>,
    retry_count: u32,
    failed_at: Option<String>,
    failed_reason: Option<String>,
    escalated: bool,
    created_at: String,
    updated_at: String,
    failure_kind: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            description: row.get(2)?,
            start_date: row.get(3)?,
            end_date: row.get(4)?,
            insured_value: row.get(5)?,
            status: row.get(6)?,
            failed_from: row.get(7)?,
            track: row.get(8)?,
            rejection_reason: row.get(9)?,
            classification: row.get(10)?,
            inquiry: row.get(11)?,
            research_current: row.get(12)?,
            research_historical: row.get(13)?,
            research_regulatory: row.get(14)?,
            analysis: row.get(15)?,
            report: row.get(16)?,
            lease_holder: row.get(17)?,
            lease_started_at_ms: row.get(18)?,
            lease_heartbeat_at_ms: row.get(19)?,
            retry_count: row.get(20)?,
            failed_at: row.get(21)?,
            failed_reason: row.get(22)?,
            escalated: row.get(23)?,
            created_at: row.get(24)?,
            updated_at: row.get(25)?,
            failure_kind: row.get(26)?,
        })
    }

    fn into_execution(self) -> Result<Execution> {
        let status = ExecutionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse execution status")?;
        let failed_from = self
            .failed_from
            .as_deref()
            .map(ExecutionStatus::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse failed_from status")?;
        let track = self
            .track
            .as_deref()
            .map(AssessmentTrack::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse assessment track")?;
        let inquiry: Vec<InquiryItem> =
            serde_json::from_str(&self.inquiry).context("Failed to parse inquiry column")?;
        let failed_at = self
            .failed_at
            .as_deref()
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .context("Failed to parse failed_at")?
            .map(|t| t.with_timezone(&Utc));
        let failure_kind = self
            .failure_kind
            .as_deref()
            .map(FailureKind::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse failure kind")?;

        Ok(Execution {
            id: self.id,
            owner_id: self.owner_id,
            description: self.description,
            start_date: self.start_date,
            end_date: self.end_date,
            insured_value: self.insured_value,
            status,
            failed_from,
            track,
            rejection_reason: self.rejection_reason,
            classification: self.classification,
            inquiry,
            research: ResearchFindings {
                current: parse_json_column(self.research_current, "research_current")?,
                historical: parse_json_column(self.research_historical, "research_historical")?,
                regulatory: parse_json_column(self.research_regulatory, "research_regulatory")?,
            },
            analysis: parse_json_column(self.analysis, "analysis")?,
            report: parse_json_column(self.report, "report")?,
            lease_started_at: parse_millis(self.lease_started_at_ms),
            lease_heartbeat_at: parse_millis(self.lease_heartbeat_at_ms),
            lease_holder: self.lease_holder,
            retry_count: self.retry_count,
            failed_at,
            failed_reason: self.failed_reason,
            failure_kind,
            escalated: self.escalated,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn sample() -> NewExecution {
        NewExecution {
            description: "Open-air concert, 2000 visitors".into(),
            start_date: Some("2026-07-01".into()),
            end_date: Some("2026-07-02".into()),
            insured_value: Some(50_000.0),
        }
    }

    fn created(db: &ExecutionDb, id: &str) -> Result<Execution> {
        db.create_execution(id, ANONYMOUS_OWNER, &sample(), Utc::now())
    }

    fn transient() -> StageError {
        StageError::Transient("503".into())
    }

    #[test]
    fn test_create_and_get_execution() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        let exec = created(&db, "run-1")?;
        assert_eq!(exec.status, ExecutionStatus::Created);
        assert_eq!(exec.owner_id, ANONYMOUS_OWNER);
        assert_eq!(exec.insured_value, Some(50_000.0));
        assert!(exec.inquiry.is_empty());
        assert_eq!(exec.retry_count, 0);
        assert!(!exec.escalated);
        assert!(db.get_execution("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_commit_stage_is_compare_and_set() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        let now = Utc::now();
        assert!(db.commit_stage("run-1", ExecutionStatus::Created, &StageCommit::Validated, now)?);
        // Second writer with the stale expectation loses.
        assert!(!db.commit_stage("run-1", ExecutionStatus::Created, &StageCommit::Validated, now)?);
        let commit = StageCommit::Classified {
            classification: "event".into(),
        };
        assert!(db.commit_stage("run-1", ExecutionStatus::Validated, &commit, now)?);
        let exec = db.get_execution("run-1")?.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Classified);
        assert_eq!(exec.classification.as_deref(), Some("event"));
        Ok(())
    }

    #[test]
    fn test_inquiry_is_persisted_whole() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        let now = Utc::now();
        db.commit_stage("run-1", ExecutionStatus::Created, &StageCommit::Validated, now)?;
        db.commit_stage(
            "run-1",
            ExecutionStatus::Validated,
            &StageCommit::Classified {
                classification: "event".into(),
            },
            now,
        )?;
        let inquiry = vec![InquiryItem::new("Q1"), InquiryItem::new("Q2")];
        db.commit_stage(
            "run-1",
            ExecutionStatus::Classified,
            &StageCommit::InquiryOpened { inquiry },
            now,
        )?;

        let mut exec = db.get_execution("run-1")?.unwrap();
        assert_eq!(exec.status, ExecutionStatus::InquiryAwaitingResponse);
        exec.inquiry[1].response = Some("yes".into());
        assert!(db.save_answers("run-1", &exec.inquiry, now)?);

        let exec = db.get_execution("run-1")?.unwrap();
        assert_eq!(exec.inquiry.len(), 2);
        assert_eq!(exec.inquiry[0].response, None);
        assert_eq!(exec.inquiry[1].response.as_deref(), Some("yes"));
        Ok(())
    }

    #[test]
    fn test_save_answers_requires_awaiting_status() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        assert!(!db.save_answers("run-1", &[InquiryItem::new("Q")], Utc::now())?);
        assert!(db.get_execution("run-1")?.unwrap().inquiry.is_empty());
        Ok(())
    }

    #[test]
    fn test_lease_acquire_renew_release() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        let now = Utc::now();
        let stale = now - Duration::seconds(300);

        assert!(db.acquire_lease("run-1", "worker-a", now, stale)?);
        // Re-entrant for the same holder, refused for another.
        assert!(db.acquire_lease("run-1", "worker-a", now, stale)?);
        assert!(!db.acquire_lease("run-1", "worker-b", now, stale)?);

        let later = now + Duration::seconds(60);
        assert!(db.renew_lease("run-1", "worker-a", later)?);
        assert!(!db.renew_lease("run-1", "worker-b", later)?);
        let exec = db.get_execution("run-1")?.unwrap();
        assert_eq!(
            exec.lease_heartbeat_at.map(|t| t.timestamp_millis()),
            Some(later.timestamp_millis())
        );
        assert_eq!(
            exec.lease_started_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );

        assert!(!db.release_lease("run-1", "worker-b")?);
        assert!(db.release_lease("run-1", "worker-a")?);
        assert!(db.get_execution("run-1")?.unwrap().lease_holder.is_none());
        Ok(())
    }

    #[test]
    fn test_stale_lease_can_be_taken_over() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        let t0 = Utc::now();
        assert!(db.acquire_lease("run-1", "worker-a", t0, t0 - Duration::seconds(300))?);

        let t1 = t0 + Duration::seconds(301);
        assert!(db.acquire_lease("run-1", "worker-b", t1, t1 - Duration::seconds(300))?);
        let exec = db.get_execution("run-1")?.unwrap();
        assert_eq!(exec.lease_holder.as_deref(), Some("worker-b"));
        Ok(())
    }

    #[test]
    fn test_mark_failed_releases_lease_and_blocks_new_lease() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        let now = Utc::now();
        let stale = now - Duration::seconds(300);
        db.acquire_lease("run-1", "worker-a", now, stale)?;

        let timeout = StageError::Transient("validator timed out".into());
        assert!(db.mark_failed("run-1", ExecutionStatus::Created, &timeout, now)?);
        let exec = db.get_execution("run-1")?.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.failed_from, Some(ExecutionStatus::Created));
        assert!(exec.failed_at.is_some());
        assert_eq!(
            exec.failed_reason.as_deref(),
            Some("transient stage failure: validator timed out")
        );
        assert_eq!(exec.failure_kind, Some(FailureKind::Transient));
        assert!(exec.lease_holder.is_none());
        assert!(!db.acquire_lease("run-1", "worker-a", now, stale)?);
        Ok(())
    }

    #[test]
    fn test_begin_retry_restores_last_good_status() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        let now = Utc::now();
        db.commit_stage("run-1", ExecutionStatus::Created, &StageCommit::Validated, now)?;
        db.mark_failed("run-1", ExecutionStatus::Validated, &transient(), now)?;

        assert_eq!(db.begin_retry("run-1", now)?, Some(ExecutionStatus::Validated));
        let exec = db.get_execution("run-1")?.unwrap();
        assert_eq!(exec.retry_count, 1);
        assert!(exec.failed_at.is_none());
        assert!(exec.failed_reason.is_none());
        assert!(exec.failure_kind.is_none());
        assert!(exec.failed_from.is_none());
        // Nothing to retry any more.
        assert_eq!(db.begin_retry("run-1", now)?, None);
        Ok(())
    }

    #[test]
    fn test_completion_resets_retry_state() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        let now = Utc::now();
        db.conn.execute(
            "UPDATE executions SET status = 'analyzed', retry_count = 2 WHERE id = 'run-1'",
            [],
        )?;
        let commit = StageCommit::Reported {
            report: json!({"score": 3}),
        };
        assert!(db.commit_stage("run-1", ExecutionStatus::Analyzed, &commit, now)?);
        let exec = db.get_execution("run-1")?.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.retry_count, 0);
        assert_eq!(exec.report, Some(json!({"score": 3})));
        Ok(())
    }

    #[test]
    fn test_sweep_queries() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        let now = Utc::now();
        let stale = now - Duration::seconds(300);
        for id in ["a", "b", "c", "d"] {
            created(&db, id)?;
            db.commit_stage(id, ExecutionStatus::Created, &StageCommit::Validated, now)?;
        }
        // b holds a fresh lease, c failed, d failed and used up its retries.
        db.acquire_lease("b", "worker", now, stale)?;
        db.mark_failed("c", ExecutionStatus::Validated, &transient(), now)?;
        db.mark_failed("d", ExecutionStatus::Validated, &transient(), now)?;
        db.conn
            .execute("UPDATE executions SET retry_count = 3 WHERE id = 'd'", [])?;

        let claimable: Vec<String> = db
            .list_claimable(ExecutionStatus::Validated, stale)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(claimable, vec!["a".to_string()]);

        let retryable: Vec<String> = db.list_retryable(3)?.into_iter().map(|e| e.id).collect();
        assert_eq!(retryable, vec!["c".to_string()]);

        let due: Vec<String> = db
            .list_escalation_due(3)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(due, vec!["d".to_string()]);

        assert!(db.mark_escalated("d", now)?);
        assert!(!db.mark_escalated("d", now)?);
        assert!(db.list_escalation_due(3)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_inquiry_is_not_retryable() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        db.conn.execute(
            "UPDATE executions SET status = 'inquiry_awaiting_response' WHERE id = 'run-1'",
            [],
        )?;
        db.mark_failed(
            "run-1",
            ExecutionStatus::InquiryAwaitingResponse,
            &transient(),
            Utc::now(),
        )?;
        assert!(db.list_retryable(3)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_permanent_failure_skips_retry_and_is_due_for_escalation() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        let now = Utc::now();
        db.commit_stage("run-1", ExecutionStatus::Created, &StageCommit::Validated, now)?;
        let bad_output = StageError::Permanent("unparseable analysis".into());
        assert!(db.mark_failed("run-1", ExecutionStatus::Validated, &bad_output, now)?);

        let exec = db.get_execution("run-1")?.unwrap();
        assert_eq!(exec.failure_kind, Some(FailureKind::Permanent));
        assert_eq!(exec.retry_count, 0);

        assert!(db.list_retryable(3)?.is_empty());
        let due: Vec<String> = db
            .list_escalation_due(3)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(due, vec!["run-1".to_string()]);
        assert_eq!(db.begin_retry("run-1", now)?, None);
        Ok(())
    }

    #[test]
    fn test_claim_owner_only_once() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        created(&db, "run-1")?;
        let now = Utc::now();
        assert!(db.claim_owner("run-1", "user-1", now)?);
        assert!(!db.claim_owner("run-1", "user-2", now)?);
        assert_eq!(db.get_execution("run-1")?.unwrap().owner_id, "user-1");
        Ok(())
    }

    #[test]
    fn test_knowledge_entries() -> Result<()> {
        let db = ExecutionDb::new_in_memory()?;
        db.insert_knowledge("run-1", "regulatory", &json!({"permits": ["noise"]}))?;
        let entries = db.list_knowledge("run-1")?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "regulatory");
        assert!(db.list_knowledge("run-2")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_file_database_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("riskflow.db");
        {
            let db = ExecutionDb::new(&path)?;
            created(&db, "run-1")?;
        }
        let db = ExecutionDb::new(&path)?;
        assert!(db.get_execution("run-1")?.is_some());
        Ok(())
    }
}
