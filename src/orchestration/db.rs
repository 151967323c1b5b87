use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;
use super::provenance::{
    ActivityDescriptor, ActivityOutcome, ActivityRecord, AgentDescriptor, AgentKind, AgentRecord,
    Derivation, EntityDescriptor, EntityRecord, ProvenanceBundle, RecordedActivity, ancestors,
};
use crate::errors::OrchestrationError;

/// Async-safe handle to the orchestration database.
///
/// Wraps `OrchestrationDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<OrchestrationDb>>,
}

impl DbHandle {
    pub fn new(db: OrchestrationDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&OrchestrationDb) -> Result<R> + Send + 'static,
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

    /// Acquire the database mutex synchronously. Only for startup, the CLI
    /// and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, OrchestrationDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct OrchestrationDb {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

const RUN_COLUMNS: &str = "run_id, experiment_id, current_stage, status, progress_percentage, \
     review_choices, started_at, ended_at, error_message";

const ACTIVITY_COLUMNS: &str = "activity_id, run_id, experiment_id, activity_type, stage, \
     agent_id, started_at, ended_at, status, error, metadata";

const ENTITY_COLUMNS: &str =
    "e.entity_id, e.run_id, e.entity_type, e.label, e.activity_id, e.digest, e.value, e.created_at";

/// Raw row for `orchestration_runs`; enum columns are parsed in `into_run`.
struct RunRow {
    run_id: String,
    experiment_id: i64,
    current_stage: String,
    status: String,
    progress_percentage: i64,
    review_choices: bool,
    started_at: String,
    ended_at: Option<String>,
    error_message: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            experiment_id: row.get(1)?,
            current_stage: row.get(2)?,
            status: row.get(3)?,
            progress_percentage: row.get(4)?,
            review_choices: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
            error_message: row.get(8)?,
        })
    }

    fn into_run(self) -> Result<OrchestrationRun> {
        Ok(OrchestrationRun {
            current_stage: RunStage::from_str(&self.current_stage).map_err(|e| anyhow::anyhow!(e))?,
            status: RunStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            progress_percentage: self.progress_percentage.clamp(0, 100) as u8,
            run_id: self.run_id,
            experiment_id: self.experiment_id,
            review_choices: self.review_choices,
            started_at: self.started_at,
            ended_at: self.ended_at,
            error_message: self.error_message,
        })
    }
}

struct ActivityRow {
    activity_id: String,
    run_id: String,
    experiment_id: i64,
    activity_type: String,
    stage: String,
    agent_id: String,
    started_at: String,
    ended_at: String,
    status: String,
    error: Option<String>,
    metadata: String,
}

impl ActivityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            activity_id: row.get(0)?,
            run_id: row.get(1)?,
            experiment_id: row.get(2)?,
            activity_type: row.get(3)?,
            stage: row.get(4)?,
            agent_id: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
            status: row.get(8)?,
            error: row.get(9)?,
            metadata: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<ActivityRecord> {
        Ok(ActivityRecord {
            stage: RunStage::from_str(&self.stage).map_err(|e| anyhow::anyhow!(e))?,
            metadata: serde_json::from_str(&self.metadata)
                .context("Failed to parse activity metadata")?,
            activity_id: self.activity_id,
            run_id: self.run_id,
            experiment_id: self.experiment_id,
            activity_type: self.activity_type,
            agent_id: self.agent_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            status: self.status,
            error: self.error,
        })
    }
}

struct EntityRow {
    entity_id: String,
    run_id: String,
    entity_type: String,
    label: String,
    activity_id: String,
    digest: String,
    value: String,
    created_at: String,
}

impl EntityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            run_id: row.get(1)?,
            entity_type: row.get(2)?,
            label: row.get(3)?,
            activity_id: row.get(4)?,
            digest: row.get(5)?,
            value: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<EntityRecord> {
        Ok(EntityRecord {
            value: serde_json::from_str(&self.value).context("Failed to parse entity value")?,
            entity_id: self.entity_id,
            run_id: self.run_id,
            entity_type: self.entity_type,
            label: self.label,
            activity_id: self.activity_id,
            digest: self.digest,
            created_at: self.created_at,
        })
    }
}

struct InvocationRow {
    run_id: String,
    document_id: i64,
    tool: String,
    status: String,
    artifact: Option<String>,
    error: Option<String>,
    activity_id: Option<String>,
    entity_id: Option<String>,
    completed_at: String,
}

impl InvocationRow {
    fn into_invocation(self) -> Result<ToolInvocation> {
        Ok(ToolInvocation {
            tool: ToolKind::from_str(&self.tool).map_err(|e| anyhow::anyhow!(e))?,
            status: InvocationStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            artifact: match self.artifact {
                Some(raw) => Some(serde_json::from_str(&raw).context("Failed to parse artifact")?),
                None => None,
            },
            run_id: self.run_id,
            document_id: self.document_id,
            error: self.error,
            activity_id: self.activity_id,
            entity_id: self.entity_id,
            completed_at: self.completed_at,
        })
    }
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
    column: &str,
) -> Result<Option<T>> {
    match raw {
        Some(raw) => Ok(Some(
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", column))?,
        )),
        None => Ok(None),
    }
}

impl OrchestrationDb {
    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

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
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS experiments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    goal TEXT NOT NULL DEFAULT '',
                    target_term TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS documents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    experiment_id INTEGER NOT NULL REFERENCES experiments(id),
                    title TEXT NOT NULL,
                    content TEXT NOT NULL,
                    publication_year INTEGER,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS orchestration_runs (
                    run_id TEXT PRIMARY KEY,
                    experiment_id INTEGER NOT NULL REFERENCES experiments(id),
                    current_stage TEXT NOT NULL DEFAULT 'analyzing',
                    status TEXT NOT NULL DEFAULT 'running',
                    progress_percentage INTEGER NOT NULL DEFAULT 0,
                    review_choices INTEGER NOT NULL DEFAULT 1,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    error_message TEXT
                );

                CREATE TABLE IF NOT EXISTS run_checkpoints (
                    run_id TEXT PRIMARY KEY REFERENCES orchestration_runs(run_id),
                    analysis TEXT,
                    analysis_entity TEXT,
                    recommendation TEXT,
                    recommendation_entity TEXT,
                    review TEXT,
                    strategy_entity TEXT,
                    synthesis TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tool_invocations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES orchestration_runs(run_id),
                    document_id INTEGER NOT NULL,
                    tool TEXT NOT NULL,
                    status TEXT NOT NULL,
                    artifact TEXT,
                    error TEXT,
                    activity_id TEXT,
                    entity_id TEXT,
                    completed_at TEXT NOT NULL,
                    UNIQUE(run_id, document_id, tool)
                );

                CREATE TABLE IF NOT EXISTS prov_agents (
                    agent_id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    label TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(kind, label)
                );

                CREATE TABLE IF NOT EXISTS prov_activities (
                    activity_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES orchestration_runs(run_id),
                    experiment_id INTEGER NOT NULL,
                    activity_type TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    agent_id TEXT NOT NULL REFERENCES prov_agents(agent_id),
                    started_at TEXT NOT NULL,
                    ended_at TEXT NOT NULL,
                    status TEXT NOT NULL,
                    error TEXT,
                    metadata TEXT NOT NULL DEFAULT 'null'
                );

                CREATE TABLE IF NOT EXISTS prov_entities (
                    entity_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES orchestration_runs(run_id),
                    entity_type TEXT NOT NULL,
                    label TEXT NOT NULL,
                    activity_id TEXT NOT NULL REFERENCES prov_activities(activity_id),
                    digest TEXT NOT NULL,
                    value TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS prov_derivations (
                    entity_id TEXT NOT NULL REFERENCES prov_entities(entity_id),
                    derived_from TEXT NOT NULL REFERENCES prov_entities(entity_id),
                    PRIMARY KEY (entity_id, derived_from)
                );

                CREATE INDEX IF NOT EXISTS idx_documents_experiment ON documents(experiment_id);
                CREATE INDEX IF NOT EXISTS idx_runs_experiment ON orchestration_runs(experiment_id);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON orchestration_runs(status);
                CREATE INDEX IF NOT EXISTS idx_invocations_run ON tool_invocations(run_id);
                CREATE INDEX IF NOT EXISTS idx_activities_run ON prov_activities(run_id);
                CREATE INDEX IF NOT EXISTS idx_activities_experiment ON prov_activities(experiment_id);
                CREATE INDEX IF NOT EXISTS idx_entities_run ON prov_entities(run_id);
                CREATE INDEX IF NOT EXISTS idx_derivations_source ON prov_derivations(derived_from);
                ",
            )
            .context("Failed to create tables")?;

        // Runs and provenance are never deleted; provenance is never edited.
        self.conn
            .execute_batch(
                "
                CREATE TRIGGER IF NOT EXISTS orchestration_runs_no_delete
                    BEFORE DELETE ON orchestration_runs
                    BEGIN SELECT RAISE(ABORT, 'orchestration runs are never deleted'); END;
                CREATE TRIGGER IF NOT EXISTS prov_agents_no_update
                    BEFORE UPDATE ON prov_agents
                    BEGIN SELECT RAISE(ABORT, 'provenance is append-only'); END;
                CREATE TRIGGER IF NOT EXISTS prov_agents_no_delete
                    BEFORE DELETE ON prov_agents
                    BEGIN SELECT RAISE(ABORT, 'provenance is append-only'); END;
                CREATE TRIGGER IF NOT EXISTS prov_activities_no_update
                    BEFORE UPDATE ON prov_activities
                    BEGIN SELECT RAISE(ABORT, 'provenance is append-only'); END;
                CREATE TRIGGER IF NOT EXISTS prov_activities_no_delete
                    BEFORE DELETE ON prov_activities
                    BEGIN SELECT RAISE(ABORT, 'provenance is append-only'); END;
                CREATE TRIGGER IF NOT EXISTS prov_entities_no_update
                    BEFORE UPDATE ON prov_entities
                    BEGIN SELECT RAISE(ABORT, 'provenance is append-only'); END;
                CREATE TRIGGER IF NOT EXISTS prov_entities_no_delete
                    BEFORE DELETE ON prov_entities
                    BEGIN SELECT RAISE(ABORT, 'provenance is append-only'); END;
                CREATE TRIGGER IF NOT EXISTS prov_derivations_no_update
                    BEFORE UPDATE ON prov_derivations
                    BEGIN SELECT RAISE(ABORT, 'provenance is append-only'); END;
                CREATE TRIGGER IF NOT EXISTS prov_derivations_no_delete
                    BEFORE DELETE ON prov_derivations
                    BEGIN SELECT RAISE(ABORT, 'provenance is append-only'); END;
                ",
            )
            .context("Failed to create append-only triggers")?;

        Ok(())
    }

    // ── Experiments & documents ───────────────────────────────────────

    pub fn create_experiment(
        &self,
        name: &str,
        goal: &str,
        target_term: Option<&str>,
    ) -> Result<Experiment> {
        self.conn
            .execute(
                "INSERT INTO experiments (name, goal, target_term, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, goal, target_term, now()],
            )
            .context("Failed to insert experiment")?;
        let id = self.conn.last_insert_rowid();
        self.get_experiment(id)?
            .context("Experiment not found after insert")
    }

    pub fn get_experiment(&self, id: i64) -> Result<Option<Experiment>> {
        self.conn
            .query_row(
                "SELECT id, name, goal, target_term, created_at FROM experiments WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Experiment {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        goal: row.get(2)?,
                        target_term: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query experiment")
    }

    pub fn add_document(
        &self,
        experiment_id: i64,
        title: &str,
        content: &str,
        publication_year: Option<i32>,
    ) -> Result<Document> {
        if self.get_experiment(experiment_id)?.is_none() {
            return Err(OrchestrationError::ExperimentNotFound { id: experiment_id }.into());
        }
        self.conn
            .execute(
                "INSERT INTO documents (experiment_id, title, content, publication_year, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![experiment_id, title, content, publication_year, now()],
            )
            .context("Failed to insert document")?;
        let id = self.conn.last_insert_rowid();
        let mut docs = self.query_documents("WHERE id = ?1", id)?;
        docs.pop().context("Document not found after insert")
    }

    pub fn list_documents(&self, experiment_id: i64) -> Result<Vec<Document>> {
        self.query_documents("WHERE experiment_id = ?1 ORDER BY id", experiment_id)
    }

    fn query_documents(&self, filter: &str, key: i64) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT id, experiment_id, title, content, publication_year, created_at FROM documents {}",
            filter
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare document query")?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok(Document {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    title: row.get(2)?,
                    content: row.get(3)?,
                    publication_year: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query documents")?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.context("Failed to read document row")?);
        }
        Ok(docs)
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Insert a run in `analyzing` together with its empty checkpoint.
    pub fn create_run(
        &self,
        run_id: &str,
        experiment_id: i64,
        review_choices: bool,
    ) -> Result<OrchestrationRun> {
        if self.get_experiment(experiment_id)?.is_none() {
            return Err(OrchestrationError::ExperimentNotFound { id: experiment_id }.into());
        }
        let started_at = now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO orchestration_runs
                (run_id, experiment_id, current_stage, status, progress_percentage, review_choices, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                experiment_id,
                RunStage::Analyzing.as_str(),
                RunStatus::Running.as_str(),
                RunStage::Analyzing.entry_progress(),
                review_choices,
                started_at
            ],
        )
        .context("Failed to insert run")?;
        tx.execute(
            "INSERT INTO run_checkpoints (run_id, updated_at) VALUES (?1, ?2)",
            params![run_id, started_at],
        )
        .context("Failed to insert checkpoint")?;
        tx.commit().context("Failed to commit run")?;
        self.require_run(run_id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<OrchestrationRun>> {
        let sql = format!("SELECT {} FROM orchestration_runs WHERE run_id = ?1", RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![run_id], RunRow::from_row)
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// Like `get_run`, but a missing run is a typed `RunNotFound`.
    pub fn require_run(&self, run_id: &str) -> Result<OrchestrationRun> {
        self.get_run(run_id)?.ok_or_else(|| {
            OrchestrationError::RunNotFound {
                run_id: run_id.to_string(),
            }
            .into()
        })
    }

    pub fn list_runs_for_experiment(&self, experiment_id: i64) -> Result<Vec<OrchestrationRun>> {
        self.query_runs(
            "WHERE experiment_id = ?1 ORDER BY started_at, run_id",
            rusqlite::types::Value::Integer(experiment_id),
        )
    }

    pub fn list_runs_with_status(&self, status: RunStatus) -> Result<Vec<OrchestrationRun>> {
        self.query_runs(
            "WHERE status = ?1 ORDER BY started_at, run_id",
            rusqlite::types::Value::Text(status.as_str().to_string()),
        )
    }

    fn query_runs(&self, filter: &str, key: rusqlite::types::Value) -> Result<Vec<OrchestrationRun>> {
        let sql = format!("SELECT {} FROM orchestration_runs {}", RUN_COLUMNS, filter);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare run query")?;
        let rows = stmt
            .query_map(params![key], RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// Compare-and-set stage transition. Fails with `StageConflict` when the
    /// run is no longer in `from` (another writer moved it, or it failed).
    pub fn advance_stage(&self, run_id: &str, from: RunStage, to: RunStage) -> Result<OrchestrationRun> {
        if !is_valid_transition(from, to) {
            anyhow::bail!("Invalid stage transition {} -> {}", from, to);
        }
        let status = to.status();
        let ended_at = status.is_terminal().then(now);
        let changed = self
            .conn
            .execute(
                "UPDATE orchestration_runs
                 SET current_stage = ?1,
                     status = ?2,
                     progress_percentage = MAX(progress_percentage, ?3),
                     ended_at = COALESCE(?4, ended_at)
                 WHERE run_id = ?5 AND current_stage = ?6 AND status != 'failed'",
                params![to.as_str(), status.as_str(), to.entry_progress(), ended_at, run_id, from.as_str()],
            )
            .context("Failed to advance run stage")?;
        if changed == 0 {
            let run = self.require_run(run_id)?;
            return Err(OrchestrationError::StageConflict {
                run_id: run_id.to_string(),
                expected: from,
                actual: run.current_stage,
            }
            .into());
        }
        self.require_run(run_id)
    }

    /// Raise progress; lower values are ignored so progress never regresses.
    pub fn update_progress(&self, run_id: &str, progress: u8) -> Result<()> {
        self.conn
            .execute(
                "UPDATE orchestration_runs
                 SET progress_percentage = MAX(progress_percentage, ?1)
                 WHERE run_id = ?2 AND status = 'running'",
                params![progress.min(100), run_id],
            )
            .context("Failed to update run progress")?;
        Ok(())
    }

    /// Mark a non-terminal run failed. `current_stage` keeps the failing stage.
    pub fn fail_run(&self, run_id: &str, message: &str) -> Result<OrchestrationRun> {
        self.conn
            .execute(
                "UPDATE orchestration_runs
                 SET status = 'failed', error_message = ?1, ended_at = ?2
                 WHERE run_id = ?3 AND status NOT IN ('completed', 'failed')",
                params![message, now(), run_id],
            )
            .context("Failed to mark run failed")?;
        self.require_run(run_id)
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    pub fn load_checkpoint(&self, run_id: &str) -> Result<Checkpoint> {
        let raw = self
            .conn
            .query_row(
                "SELECT analysis, analysis_entity, recommendation, recommendation_entity,
                        review, strategy_entity, synthesis
                 FROM run_checkpoints WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query checkpoint")?;
        let Some((analysis, analysis_entity, recommendation, recommendation_entity, review, strategy_entity, synthesis)) =
            raw
        else {
            return Err(OrchestrationError::RunNotFound {
                run_id: run_id.to_string(),
            }
            .into());
        };
        Ok(Checkpoint {
            analysis: parse_json_column(analysis, "analysis")?,
            analysis_entity,
            recommendation: parse_json_column(recommendation, "recommendation")?,
            recommendation_entity,
            review: parse_json_column(review, "review")?,
            strategy_entity,
            synthesis: parse_json_column(synthesis, "synthesis")?,
        })
    }

    fn put_checkpoint_output(
        &self,
        run_id: &str,
        column: &'static str,
        entity_column: Option<&'static str>,
        value: String,
        entity: Option<&str>,
    ) -> Result<()> {
        let sql = match entity_column {
            Some(entity_column) => format!(
                "UPDATE run_checkpoints SET {} = ?1, {} = ?2, updated_at = ?3 WHERE run_id = ?4",
                column, entity_column
            ),
            None => format!(
                "UPDATE run_checkpoints SET {} = ?1, updated_at = ?3 WHERE run_id = ?4",
                column
            ),
        };
        let changed = self
            .conn
            .execute(&sql, params![value, entity, now(), run_id])
            .with_context(|| format!("Failed to store checkpoint {}", column))?;
        if changed == 0 {
            return Err(OrchestrationError::RunNotFound {
                run_id: run_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn save_analysis(
        &self,
        run_id: &str,
        analysis: &AnalysisSummary,
        entity: Option<&str>,
    ) -> Result<()> {
        let value = serde_json::to_string(analysis).context("Failed to serialize analysis")?;
        self.put_checkpoint_output(run_id, "analysis", Some("analysis_entity"), value, entity)
    }

    pub fn save_recommendation(
        &self,
        run_id: &str,
        recommendation: &StrategyRecommendation,
        entity: Option<&str>,
    ) -> Result<()> {
        let value =
            serde_json::to_string(recommendation).context("Failed to serialize recommendation")?;
        self.put_checkpoint_output(
            run_id,
            "recommendation",
            Some("recommendation_entity"),
            value,
            entity,
        )
    }

    pub fn save_synthesis(&self, run_id: &str, synthesis: &SynthesisReport) -> Result<()> {
        let value = serde_json::to_string(synthesis).context("Failed to serialize synthesis")?;
        self.put_checkpoint_output(run_id, "synthesis", None, value, None)
    }

    /// Attach the provenance entity of the approved strategy.
    pub fn set_strategy_entity(&self, run_id: &str, entity_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE run_checkpoints SET strategy_entity = ?1, updated_at = ?2 WHERE run_id = ?3",
                params![entity_id, now(), run_id],
            )
            .context("Failed to store strategy entity")?;
        Ok(())
    }

    /// Record the single review decision of a run.
    ///
    /// Atomic: the run must be in `reviewing` with no recorded decision,
    /// otherwise `ReviewConflict` and nothing changes. An approval also moves
    /// the run to `executing` in the same transaction.
    pub fn apply_review(&self, run_id: &str, record: &ReviewRecord) -> Result<OrchestrationRun> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let run = self.require_run(run_id)?;
        let decided: bool = tx
            .query_row(
                "SELECT review IS NOT NULL FROM run_checkpoints WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to read review state")?;
        if run.current_stage != RunStage::Reviewing || run.status != RunStatus::Reviewing || decided {
            return Err(OrchestrationError::ReviewConflict {
                run_id: run_id.to_string(),
                stage: run.current_stage,
                decided,
            }
            .into());
        }

        let value = serde_json::to_string(record).context("Failed to serialize review")?;
        tx.execute(
            "UPDATE run_checkpoints SET review = ?1, updated_at = ?2 WHERE run_id = ?3 AND review IS NULL",
            params![value, now(), run_id],
        )
        .context("Failed to store review decision")?;

        if record.decision.approved {
            let next = RunStage::Executing;
            tx.execute(
                "UPDATE orchestration_runs
                 SET current_stage = ?1, status = ?2, progress_percentage = MAX(progress_percentage, ?3)
                 WHERE run_id = ?4 AND current_stage = 'reviewing'",
                params![next.as_str(), next.status().as_str(), next.entry_progress(), run_id],
            )
            .context("Failed to advance run after approval")?;
        }

        tx.commit().context("Failed to commit review")?;
        self.require_run(run_id)
    }

    // ── Execute ledger ────────────────────────────────────────────────

    /// Append one invocation outcome. Returns false when the pair was
    /// already recorded; the first record wins.
    pub fn record_invocation(&self, invocation: &ToolInvocation) -> Result<bool> {
        let artifact = invocation
            .artifact
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize artifact")?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO tool_invocations
                    (run_id, document_id, tool, status, artifact, error, activity_id, entity_id, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    invocation.run_id,
                    invocation.document_id,
                    invocation.tool.as_str(),
                    invocation.status.as_str(),
                    artifact,
                    invocation.error,
                    invocation.activity_id,
                    invocation.entity_id,
                    invocation.completed_at
                ],
            )
            .context("Failed to insert tool invocation")?;
        Ok(inserted > 0)
    }

    pub fn list_invocations(&self, run_id: &str) -> Result<Vec<ToolInvocation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, document_id, tool, status, artifact, error, activity_id, entity_id, completed_at
                 FROM tool_invocations WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_invocations")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(InvocationRow {
                    run_id: row.get(0)?,
                    document_id: row.get(1)?,
                    tool: row.get(2)?,
                    status: row.get(3)?,
                    artifact: row.get(4)?,
                    error: row.get(5)?,
                    activity_id: row.get(6)?,
                    entity_id: row.get(7)?,
                    completed_at: row.get(8)?,
                })
            })
            .context("Failed to query tool invocations")?;
        let mut invocations = Vec::new();
        for row in rows {
            invocations.push(row.context("Failed to read invocation row")?.into_invocation()?);
        }
        Ok(invocations)
    }

    // ── Provenance ────────────────────────────────────────────────────

    fn ensure_agent(&self, agent: &AgentDescriptor) -> Result<String> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT agent_id FROM prov_agents WHERE kind = ?1 AND label = ?2",
                params![agent.kind.as_str(), agent.label],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query agent")?;
        if let Some(agent_id) = existing {
            return Ok(agent_id);
        }
        let agent_id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO prov_agents (agent_id, kind, label, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![agent_id, agent.kind.as_str(), agent.label, now()],
            )
            .context("Failed to insert agent")?;
        Ok(agent_id)
    }

    fn upstream_of(&self, entity_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT derived_from FROM prov_derivations WHERE entity_id = ?1")
            .context("Failed to prepare derivation query")?;
        let rows = stmt
            .query_map(params![entity_id], |row| row.get::<_, String>(0))
            .context("Failed to query derivations")?;
        let mut upstream = Vec::new();
        for row in rows {
            upstream.push(row.context("Failed to read derivation row")?);
        }
        Ok(upstream)
    }

    fn entity_exists(&self, entity_id: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM prov_entities WHERE entity_id = ?1)",
                params![entity_id],
                |row| row.get(0),
            )
            .context("Failed to check entity")
    }

    /// Insert a derivation edge unless it would close a cycle.
    fn insert_derivation(&self, entity_id: &str, derived_from: &str) -> Result<()> {
        if entity_id == derived_from
            || ancestors(derived_from, |node| self.upstream_of(node))?.contains(entity_id)
        {
            anyhow::bail!(
                "Derivation {} -> {} would create a cycle",
                entity_id,
                derived_from
            );
        }
        self.conn
            .execute(
                "INSERT OR IGNORE INTO prov_derivations (entity_id, derived_from) VALUES (?1, ?2)",
                params![entity_id, derived_from],
            )
            .context("Failed to insert derivation")?;
        Ok(())
    }

    /// Write one Activity, its Agent association and its generated
    /// Entities in a single transaction.
    pub fn insert_provenance(
        &self,
        agent: &AgentDescriptor,
        activity: &ActivityDescriptor,
        entities: &[EntityDescriptor],
    ) -> Result<RecordedActivity> {
        let (status, error) = match &activity.outcome {
            ActivityOutcome::Succeeded => ("succeeded", None),
            ActivityOutcome::Failed { error } => ("failed", Some(error.as_str())),
        };
        if status == "failed" && !entities.is_empty() {
            anyhow::bail!("A failed activity cannot generate entities");
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let agent_id = self.ensure_agent(agent)?;
        let activity_id = Uuid::new_v4().to_string();
        let metadata =
            serde_json::to_string(&activity.metadata).context("Failed to serialize metadata")?;
        tx.execute(
            "INSERT INTO prov_activities
                (activity_id, run_id, experiment_id, activity_type, stage, agent_id, started_at, ended_at, status, error, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                activity_id,
                activity.run_id,
                activity.experiment_id,
                activity.activity_type,
                activity.stage.as_str(),
                agent_id,
                activity.started_at,
                activity.ended_at,
                status,
                error,
                metadata
            ],
        )
        .context("Failed to insert activity")?;

        let mut entity_ids = Vec::with_capacity(entities.len());
        for entity in entities {
            let entity_id = Uuid::new_v4().to_string();
            let value =
                serde_json::to_string(&entity.value).context("Failed to serialize entity value")?;
            tx.execute(
                "INSERT INTO prov_entities
                    (entity_id, run_id, entity_type, label, activity_id, digest, value, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entity_id,
                    activity.run_id,
                    entity.entity_type,
                    entity.label,
                    activity_id,
                    entity.digest(),
                    value,
                    activity.ended_at
                ],
            )
            .context("Failed to insert entity")?;
            for upstream in &entity.derived_from {
                if !self.entity_exists(upstream)? {
                    anyhow::bail!("Upstream entity {} does not exist", upstream);
                }
                self.insert_derivation(&entity_id, upstream)?;
            }
            entity_ids.push(entity_id);
        }

        tx.commit().context("Failed to commit provenance")?;
        Ok(RecordedActivity {
            activity_id,
            agent_id,
            entity_ids,
        })
    }

    pub fn load_run_provenance(&self, run_id: &str) -> Result<ProvenanceBundle> {
        self.load_provenance(
            "WHERE run_id = ?1",
            rusqlite::types::Value::Text(run_id.to_string()),
        )
    }

    pub fn load_experiment_provenance(&self, experiment_id: i64) -> Result<ProvenanceBundle> {
        self.load_provenance(
            "WHERE experiment_id = ?1",
            rusqlite::types::Value::Integer(experiment_id),
        )
    }

    fn load_provenance(
        &self,
        activity_filter: &str,
        key: rusqlite::types::Value,
    ) -> Result<ProvenanceBundle> {
        let sql = format!(
            "SELECT {} FROM prov_activities {} ORDER BY started_at, rowid",
            ACTIVITY_COLUMNS, activity_filter
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare activity query")?;
        let rows = stmt
            .query_map(params![key], ActivityRow::from_row)
            .context("Failed to query activities")?;
        let mut activities = Vec::new();
        for row in rows {
            activities.push(row.context("Failed to read activity row")?.into_record()?);
        }

        let sql = format!(
            "SELECT {} FROM prov_entities e
             JOIN prov_activities a ON a.activity_id = e.activity_id
             {} ORDER BY e.rowid",
            ENTITY_COLUMNS,
            activity_filter.replace("WHERE ", "WHERE a.")
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare entity query")?;
        let rows = stmt
            .query_map(params![key], EntityRow::from_row)
            .context("Failed to query entities")?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(row.context("Failed to read entity row")?.into_record()?);
        }

        let sql = format!(
            "SELECT d.entity_id, d.derived_from FROM prov_derivations d
             JOIN prov_entities e ON e.entity_id = d.entity_id
             JOIN prov_activities a ON a.activity_id = e.activity_id
             {} ORDER BY d.rowid",
            activity_filter.replace("WHERE ", "WHERE a.")
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare derivation query")?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok(Derivation {
                    entity_id: row.get(0)?,
                    derived_from: row.get(1)?,
                })
            })
            .context("Failed to query derivations")?;
        let mut derivations = Vec::new();
        for row in rows {
            derivations.push(row.context("Failed to read derivation row")?);
        }

        let sql = format!(
            "SELECT DISTINCT g.agent_id, g.kind, g.label FROM prov_agents g
             JOIN prov_activities a ON a.agent_id = g.agent_id
             {} ORDER BY g.label",
            activity_filter.replace("WHERE ", "WHERE a.")
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare agent query")?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query agents")?;
        let mut agents = Vec::new();
        for row in rows {
            let (agent_id, kind, label) = row.context("Failed to read agent row")?;
            agents.push(AgentRecord {
                agent_id,
                kind: AgentKind::from_str(&kind).map_err(|e| anyhow::anyhow!(e))?,
                label,
            });
        }

        Ok(ProvenanceBundle {
            agents,
            activities,
            entities,
            derivations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Result<(OrchestrationDb, i64)> {
        let db = OrchestrationDb::new_in_memory()?;
        let exp = db.create_experiment("agency", "trace 'agent' 1900-2000", Some("agent"))?;
        db.add_document(exp.id, "Doc A", "The agent acts.", Some(1910))?;
        db.add_document(exp.id, "Doc B", "An agent is defined as one who acts.", Some(1990))?;
        Ok((db, exp.id))
    }

    fn review(approved: bool, modified: Option<DocumentPlan>) -> ReviewRecord {
        ReviewRecord {
            decision: ReviewDecision {
                approved,
                modified_strategy: modified,
                review_notes: Some("looks fine".into()),
            },
            decided_at: now(),
            auto_approved: false,
        }
    }

    fn walk_to_reviewing(db: &OrchestrationDb, run_id: &str) -> Result<()> {
        db.advance_stage(run_id, RunStage::Analyzing, RunStage::Recommending)?;
        db.advance_stage(run_id, RunStage::Recommending, RunStage::Reviewing)?;
        Ok(())
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = OrchestrationDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('experiments', 'documents', 'orchestration_runs', 'run_checkpoints',
              'tool_invocations', 'prov_agents', 'prov_activities', 'prov_entities', 'prov_derivations')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 9);

        // Migrations are idempotent.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_experiment_and_documents() -> Result<()> {
        let (db, exp_id) = seeded()?;
        let exp = db.get_experiment(exp_id)?.expect("experiment should exist");
        assert_eq!(exp.target_term.as_deref(), Some("agent"));
        let docs = db.list_documents(exp_id)?;
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].title, "Doc A");
        assert_eq!(docs[1].publication_year, Some(1990));

        let err = db.add_document(999, "x", "y", None).unwrap_err();
        assert!(matches!(
            OrchestrationError::from_db(err),
            OrchestrationError::ExperimentNotFound { id: 999 }
        ));
        Ok(())
    }

    #[test]
    fn test_create_run_starts_analyzing() -> Result<()> {
        let (db, exp_id) = seeded()?;
        let run = db.create_run("run-1", exp_id, true)?;
        assert_eq!(run.current_stage, RunStage::Analyzing);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.progress_percentage, RunStage::Analyzing.entry_progress());
        assert!(run.ended_at.is_none());
        assert_eq!(db.load_checkpoint("run-1")?, Checkpoint::default());
        assert_eq!(db.list_runs_for_experiment(exp_id)?.len(), 1);
        assert_eq!(db.list_runs_with_status(RunStatus::Running)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_advance_stage_is_compare_and_set() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        let run = db.advance_stage("run-1", RunStage::Analyzing, RunStage::Recommending)?;
        assert_eq!(run.current_stage, RunStage::Recommending);

        let err = db
            .advance_stage("run-1", RunStage::Analyzing, RunStage::Recommending)
            .unwrap_err();
        match OrchestrationError::from_db(err) {
            OrchestrationError::StageConflict { actual, .. } => {
                assert_eq!(actual, RunStage::Recommending)
            }
            other => panic!("Expected StageConflict, got {:?}", other),
        }

        assert!(
            db.advance_stage("run-1", RunStage::Recommending, RunStage::Executing)
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_progress_never_decreases() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        db.update_progress("run-1", 30)?;
        db.update_progress("run-1", 10)?;
        assert_eq!(db.require_run("run-1")?.progress_percentage, 30);
        db.advance_stage("run-1", RunStage::Analyzing, RunStage::Recommending)?;
        // Entry progress of recommending (20) is below 30.
        assert_eq!(db.require_run("run-1")?.progress_percentage, 30);
        Ok(())
    }

    #[test]
    fn test_fail_run_keeps_stage_and_sets_end() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        db.advance_stage("run-1", RunStage::Analyzing, RunStage::Recommending)?;
        let run = db.fail_run("run-1", "unparsable response")?;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.current_stage, RunStage::Recommending);
        assert_eq!(run.error_message.as_deref(), Some("unparsable response"));
        assert!(run.ended_at.is_some());

        // A failed run cannot advance.
        assert!(
            db.advance_stage("run-1", RunStage::Recommending, RunStage::Reviewing)
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_checkpoint_round_trip() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        let analysis = AnalysisSummary {
            experiment_id: exp_id,
            experiment_goal: "goal".into(),
            target_term: None,
            documents: vec![],
        };
        db.save_analysis("run-1", &analysis, Some("ent-a"))?;
        let mut plan = DocumentPlan::new();
        plan.insert(1, vec![ToolKind::Segmentation]);
        let rec = StrategyRecommendation {
            documents_to_tools: plan,
            confidence: 0.7,
            reasoning: "short docs".into(),
        };
        db.save_recommendation("run-1", &rec, None)?;

        let cp = db.load_checkpoint("run-1")?;
        assert_eq!(cp.analysis, Some(analysis));
        assert_eq!(cp.analysis_entity.as_deref(), Some("ent-a"));
        assert_eq!(cp.recommendation, Some(rec));
        assert!(cp.recommendation_entity.is_none());
        assert!(cp.review.is_none());
        Ok(())
    }

    #[test]
    fn test_review_accepted_once() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        walk_to_reviewing(&db, "run-1")?;

        let run = db.apply_review("run-1", &review(true, None))?;
        assert_eq!(run.current_stage, RunStage::Executing);
        assert_eq!(run.status, RunStatus::Running);

        let err = db.apply_review("run-1", &review(true, None)).unwrap_err();
        match OrchestrationError::from_db(err) {
            OrchestrationError::ReviewConflict { decided, stage, .. } => {
                assert!(decided);
                assert_eq!(stage, RunStage::Executing);
            }
            other => panic!("Expected ReviewConflict, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_rejection_parks_run_and_blocks_later_reviews() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        walk_to_reviewing(&db, "run-1")?;

        let run = db.apply_review("run-1", &review(false, None))?;
        assert_eq!(run.current_stage, RunStage::Reviewing);
        assert_eq!(run.status, RunStatus::Reviewing);

        assert!(db.apply_review("run-1", &review(true, None)).is_err());
        assert!(!db.load_checkpoint("run-1")?.review.unwrap().decision.approved);
        Ok(())
    }

    #[test]
    fn test_modified_strategy_survives_reload() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        walk_to_reviewing(&db, "run-1")?;

        let modified = DocumentPlan::from([
            (1, vec![ToolKind::Segmentation, ToolKind::EntityExtraction]),
            (2, vec![]),
        ]);
        let record = review(true, Some(modified.clone()));
        db.apply_review("run-1", &record)?;

        let checkpoint = db.load_checkpoint("run-1")?;
        assert_eq!(checkpoint.review.as_ref(), Some(&record));
        assert_eq!(checkpoint.effective_strategy(), Some(&modified));

        let stored: String = db.conn.query_row(
            "SELECT review FROM run_checkpoints WHERE run_id = 'run-1'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(stored, serde_json::to_string(&record)?);
        Ok(())
    }

    #[test]
    fn test_status_view_reports_modified_strategy() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        walk_to_reviewing(&db, "run-1")?;

        let modified = DocumentPlan::from([(2, vec![ToolKind::DefinitionExtraction])]);
        db.apply_review("run-1", &review(true, Some(modified.clone())))?;

        let view = RunStatusView::build(
            db.require_run("run-1")?,
            db.load_checkpoint("run-1")?,
            Utc::now(),
        );
        assert_eq!(view.current_stage, RunStage::Executing);
        assert_eq!(view.modified_strategy, Some(modified));
        Ok(())
    }

    #[test]
    fn test_review_rejected_before_reviewing() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        let err = db.apply_review("run-1", &review(true, None)).unwrap_err();
        assert!(matches!(
            OrchestrationError::from_db(err),
            OrchestrationError::ReviewConflict { decided: false, .. }
        ));
        assert!(db.load_checkpoint("run-1")?.review.is_none());
        Ok(())
    }

    #[test]
    fn test_invocation_ledger_first_record_wins() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        let mut inv = ToolInvocation {
            run_id: "run-1".into(),
            document_id: 1,
            tool: ToolKind::Segmentation,
            status: InvocationStatus::Succeeded,
            artifact: Some(serde_json::json!({"segments": []})),
            error: None,
            activity_id: None,
            entity_id: None,
            completed_at: now(),
        };
        assert!(db.record_invocation(&inv)?);
        inv.status = InvocationStatus::Failed;
        assert!(!db.record_invocation(&inv)?);

        let all = db.list_invocations("run-1")?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, InvocationStatus::Succeeded);
        assert_eq!(all[0].artifact, Some(serde_json::json!({"segments": []})));
        Ok(())
    }

    #[test]
    fn test_provenance_is_append_only() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        let recorded = db.insert_provenance(
            &AgentDescriptor::software("ontextract-analyzer"),
            &ActivityDescriptor::new("run-1", exp_id, "analyze", RunStage::Analyzing, now()),
            &[EntityDescriptor::new("analysis_summary", "summary", serde_json::json!({"n": 2}))],
        )?;
        assert_eq!(recorded.entity_ids.len(), 1);

        assert!(db.conn.execute("DELETE FROM prov_entities", []).is_err());
        assert!(
            db.conn
                .execute("UPDATE prov_activities SET status = 'failed'", [])
                .is_err()
        );
        assert!(db.conn.execute("DELETE FROM orchestration_runs", []).is_err());
        Ok(())
    }

    #[test]
    fn test_agents_are_reused_by_kind_and_label() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        let agent = AgentDescriptor::language_model("model-x");
        let a = db.insert_provenance(
            &agent,
            &ActivityDescriptor::new("run-1", exp_id, "recommend", RunStage::Recommending, now()),
            &[],
        )?;
        let b = db.insert_provenance(
            &agent,
            &ActivityDescriptor::new("run-1", exp_id, "synthesize", RunStage::Synthesizing, now()),
            &[],
        )?;
        assert_eq!(a.agent_id, b.agent_id);
        assert_ne!(a.activity_id, b.activity_id);
        Ok(())
    }

    #[test]
    fn test_failed_activity_cannot_generate_entities() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        let activity = ActivityDescriptor::new(
            "run-1",
            exp_id,
            "tool:segmentation",
            RunStage::Executing,
            now(),
        )
        .failed("boom");
        assert!(
            db.insert_provenance(
                &AgentDescriptor::software("segmentation"),
                &activity,
                &[EntityDescriptor::new("artifact", "x", serde_json::Value::Null)],
            )
            .is_err()
        );
        let recorded =
            db.insert_provenance(&AgentDescriptor::software("segmentation"), &activity, &[])?;
        let bundle = db.load_run_provenance("run-1")?;
        assert_eq!(bundle.activities.len(), 1);
        assert!(bundle.activities[0].failed());
        assert_eq!(bundle.activities[0].activity_id, recorded.activity_id);
        Ok(())
    }

    #[test]
    fn test_derivation_cycle_rejected() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        let first = db.insert_provenance(
            &AgentDescriptor::software("a"),
            &ActivityDescriptor::new("run-1", exp_id, "analyze", RunStage::Analyzing, now()),
            &[EntityDescriptor::new("analysis_summary", "a", serde_json::json!(1))],
        )?;
        let second = db.insert_provenance(
            &AgentDescriptor::software("a"),
            &ActivityDescriptor::new("run-1", exp_id, "recommend", RunStage::Recommending, now()),
            &[EntityDescriptor::new("strategy", "b", serde_json::json!(2))
                .derived_from([first.entity_ids.first().cloned()])],
        )?;
        let a = &first.entity_ids[0];
        let b = &second.entity_ids[0];

        assert!(db.insert_derivation(a, b).is_err());
        assert!(db.insert_derivation(a, a).is_err());

        let bundle = db.load_run_provenance("run-1")?;
        assert!(bundle.is_acyclic());
        assert_eq!(bundle.derivations.len(), 1);
        Ok(())
    }

    #[test]
    fn test_experiment_provenance_spans_runs() -> Result<()> {
        let (db, exp_id) = seeded()?;
        db.create_run("run-1", exp_id, true)?;
        db.create_run("run-2", exp_id, false)?;
        for run in ["run-1", "run-2"] {
            db.insert_provenance(
                &AgentDescriptor::software("ontextract-analyzer"),
                &ActivityDescriptor::new(run, exp_id, "analyze", RunStage::Analyzing, now()),
                &[EntityDescriptor::new("analysis_summary", run, serde_json::json!({}))],
            )?;
        }
        let bundle = db.load_experiment_provenance(exp_id)?;
        assert_eq!(bundle.activities.len(), 2);
        assert_eq!(bundle.entities.len(), 2);
        assert_eq!(bundle.agents.len(), 1);
        assert_eq!(db.load_run_provenance("run-2")?.activities.len(), 1);
        Ok(())
    }
}
