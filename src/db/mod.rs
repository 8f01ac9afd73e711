//! Durable storage for tasks, subtasks, agent runs, reviews, pull requests
//! and notifications. The relational store is the single source of truth;
//! every state-machine transition is a validated read-modify-write keyed by
//! primary id.

pub mod models;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::errors::ConductorError;
use models::*;

/// Current wall-clock time as a fixed-width RFC 3339 string. Fixed width
/// keeps lexicographic ordering consistent with chronological ordering,
/// which the queue's `run_at` comparisons rely on.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Async-safe handle to the conductor database.
///
/// Wraps `ConductorDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ConductorDb>>,
}

impl DbHandle {
    pub fn new(db: ConductorDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ConductorDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialisation
    /// and tests only; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ConductorDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct ConductorDb {
    pub(crate) conn: Connection,
}

impl ConductorDb {
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
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    github_project_item_id TEXT NOT NULL,
                    github_project_id TEXT NOT NULL,
                    repository_full_name TEXT NOT NULL,
                    repository_id INTEGER NOT NULL DEFAULT 0,
                    installation_id INTEGER NOT NULL DEFAULT 0,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    branch_name TEXT,
                    pull_request_number INTEGER,
                    pull_request_url TEXT,
                    error_message TEXT,
                    human_review_question TEXT,
                    human_review_answer TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    is_epic INTEGER NOT NULL DEFAULT 0,
                    parent_task_id TEXT REFERENCES tasks(id) ON DELETE CASCADE,
                    linked_github_issue_number INTEGER,
                    child_dependencies TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS subtasks (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    subproject_path TEXT NOT NULL DEFAULT '.',
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    agent_run_id TEXT,
                    files_modified TEXT NOT NULL DEFAULT '[]',
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS agent_runs (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    subtask_id TEXT REFERENCES subtasks(id) ON DELETE SET NULL,
                    run_type TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'starting',
                    model TEXT,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    total_cost REAL NOT NULL DEFAULT 0,
                    log TEXT NOT NULL DEFAULT '',
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS code_reviews (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    agent_run_id TEXT,
                    result TEXT NOT NULL,
                    iteration INTEGER NOT NULL,
                    summary TEXT NOT NULL DEFAULT '',
                    issues TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pull_requests (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    repository_full_name TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL DEFAULT '',
                    branch_name TEXT NOT NULL,
                    head_sha TEXT,
                    url TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'open',
                    reviews_passed INTEGER NOT NULL DEFAULT 0,
                    check_status TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    notification_type TEXT NOT NULL,
                    channel TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    sent_at TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    queue TEXT NOT NULL,
                    job_id TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'waiting',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL DEFAULT 3,
                    run_at TEXT NOT NULL,
                    last_error TEXT,
                    progress_stage TEXT,
                    progress_message TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT,
                    UNIQUE(queue, job_id)
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_item ON tasks(github_project_item_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_repo ON tasks(repository_full_name);
                CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_epic ON tasks(is_epic);
                CREATE INDEX IF NOT EXISTS idx_subtasks_task ON subtasks(task_id);
                CREATE INDEX IF NOT EXISTS idx_subtasks_status ON subtasks(status);
                CREATE INDEX IF NOT EXISTS idx_agent_runs_task ON agent_runs(task_id);
                CREATE INDEX IF NOT EXISTS idx_agent_runs_subtask ON agent_runs(subtask_id);
                CREATE INDEX IF NOT EXISTS idx_pull_requests_task ON pull_requests(task_id);
                CREATE INDEX IF NOT EXISTS idx_pull_requests_repo ON pull_requests(repository_full_name);
                CREATE INDEX IF NOT EXISTS idx_code_reviews_task ON code_reviews(task_id);
                CREATE INDEX IF NOT EXISTS idx_notifications_task ON notifications(task_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_queue_status ON jobs(queue, status, run_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn insert_task(&self, new: &NewTask) -> Result<Task> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        let deps = serde_json::to_string(&new.child_dependencies)
            .context("Failed to serialize child_dependencies")?;
        self.conn
            .execute(
                "INSERT INTO tasks (id, github_project_item_id, github_project_id,
                    repository_full_name, repository_id, installation_id, title,
                    description, parent_task_id, linked_github_issue_number,
                    child_dependencies, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    id,
                    new.github_project_item_id,
                    new.github_project_id,
                    new.repository_full_name,
                    new.repository_id,
                    new.installation_id,
                    new.title,
                    new.description,
                    new.parent_task_id,
                    new.linked_github_issue_number,
                    deps,
                    ts,
                ],
            )
            .context("Failed to insert task")?;
        self.get_task(&id)?
            .context("Task not found after insert")
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.query_task("WHERE id = ?1", params![id])
    }

    pub fn get_task_by_item_id(&self, item_id: &str) -> Result<Option<Task>> {
        self.query_task(
            "WHERE github_project_item_id = ?1 ORDER BY created_at DESC LIMIT 1",
            params![item_id],
        )
    }

    fn query_task(&self, where_clause: &str, p: impl rusqlite::Params) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks {}", TASK_COLUMNS, where_clause);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare task query")?;
        let mut rows = stmt.query_map(p, task_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read task row")?.into_task()?)),
            None => Ok(None),
        }
    }

    pub fn get_task_by_issue_number(
        &self,
        repository_full_name: &str,
        issue_number: i64,
    ) -> Result<Option<Task>> {
        self.query_task(
            "WHERE repository_full_name = ?1 AND linked_github_issue_number = ?2
             ORDER BY created_at DESC LIMIT 1",
            params![repository_full_name, issue_number],
        )
    }

    pub fn list_child_tasks(&self, parent_id: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE parent_task_id = ?1 ORDER BY created_at",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![parent_id], task_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn list_recent_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks ORDER BY created_at DESC LIMIT ?1",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], task_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    /// Validated task state transition. Stamps `updated_at` always,
    /// `started_at` on first entry to `decomposing`, and `completed_at`
    /// on `done`/`failed`.
    pub fn transition_task(&self, id: &str, next: TaskStatus) -> Result<Task> {
        let task = self
            .get_task(id)?
            .ok_or(ConductorError::TaskNotFound { id: id.to_string() })?;
        if !task.status.can_transition_to(next) {
            return Err(ConductorError::InvalidTransition {
                entity: "task",
                from: task.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        let ts = now();
        let started = match (next, &task.started_at) {
            (TaskStatus::Decomposing, None) => Some(ts.clone()),
            (_, existing) => existing.clone(),
        };
        let completed = if matches!(next, TaskStatus::Done | TaskStatus::Failed) {
            Some(ts.clone())
        } else {
            task.completed_at.clone()
        };
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2, started_at = ?3, completed_at = ?4
                 WHERE id = ?5",
                params![next.as_str(), ts, started, completed, id],
            )
            .context("Failed to transition task")?;
        self.get_task(id)?.context("Task not found after transition")
    }

    pub fn set_task_error(&self, id: &str, error: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET error_message = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, now(), id],
            )
            .context("Failed to set task error")?;
        Ok(())
    }

    pub fn set_task_branch(&self, id: &str, branch: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET branch_name = ?1, updated_at = ?2 WHERE id = ?3",
                params![branch, now(), id],
            )
            .context("Failed to set task branch")?;
        Ok(())
    }

    pub fn set_task_pull_request(&self, id: &str, number: i64, url: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET pull_request_number = ?1, pull_request_url = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![number, url, now(), id],
            )
            .context("Failed to set task pull request")?;
        Ok(())
    }

    pub fn set_task_human_review(
        &self,
        id: &str,
        question: Option<&str>,
        answer: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET human_review_question = ?1, human_review_answer = ?2,
                 updated_at = ?3 WHERE id = ?4",
                params![question, answer, now(), id],
            )
            .context("Failed to set task human review fields")?;
        Ok(())
    }

    pub fn set_task_epic(&self, id: &str, is_epic: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET is_epic = ?1, updated_at = ?2 WHERE id = ?3",
                params![is_epic as i64, now(), id],
            )
            .context("Failed to set task epic flag")?;
        Ok(())
    }

    pub fn increment_task_retry_count(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET retry_count = retry_count + 1, updated_at = ?1 WHERE id = ?2",
                params![now(), id],
            )
            .context("Failed to increment retry count")?;
        Ok(())
    }

    pub fn count_tasks_by_status(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Mean wall-clock duration of finished tasks, in seconds.
    pub fn avg_task_duration_seconds(&self) -> Result<Option<f64>> {
        let avg: Option<f64> = self.conn.query_row(
            "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400.0)
             FROM tasks WHERE started_at IS NOT NULL AND completed_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    // ── Subtasks ──────────────────────────────────────────────────────

    pub fn insert_subtask(
        &self,
        task_id: &str,
        subproject_path: &str,
        title: &str,
        description: &str,
        depends_on: &[String],
    ) -> Result<Subtask> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        let deps = serde_json::to_string(depends_on).context("Failed to serialize depends_on")?;
        self.conn
            .execute(
                "INSERT INTO subtasks (id, task_id, subproject_path, title, description,
                    depends_on, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![id, task_id, subproject_path, title, description, deps, ts],
            )
            .context("Failed to insert subtask")?;
        self.get_subtask(&id)?
            .context("Subtask not found after insert")
    }

    pub fn get_subtask(&self, id: &str) -> Result<Option<Subtask>> {
        let sql = format!("SELECT {} FROM subtasks WHERE id = ?1", SUBTASK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], subtask_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read subtask row")?.into_subtask()?)),
            None => Ok(None),
        }
    }

    pub fn list_subtasks(&self, task_id: &str) -> Result<Vec<Subtask>> {
        let sql = format!(
            "SELECT {} FROM subtasks WHERE task_id = ?1 ORDER BY created_at",
            SUBTASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id], subtask_row)?;
        let mut subtasks = Vec::new();
        for row in rows {
            subtasks.push(row.context("Failed to read subtask row")?.into_subtask()?);
        }
        Ok(subtasks)
    }

    /// Validated subtask transition. Stamps `started_at` on first entry to
    /// `running` and `completed_at` on `completed`/`failed`.
    pub fn transition_subtask(&self, id: &str, next: SubtaskStatus) -> Result<Subtask> {
        let subtask = self
            .get_subtask(id)?
            .ok_or(ConductorError::SubtaskNotFound { id: id.to_string() })?;
        if !subtask.status.can_transition_to(next) {
            return Err(ConductorError::InvalidTransition {
                entity: "subtask",
                from: subtask.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        let ts = now();
        let started = match (next, &subtask.started_at) {
            (SubtaskStatus::Running, None) => Some(ts.clone()),
            (_, existing) => existing.clone(),
        };
        let completed = if matches!(next, SubtaskStatus::Completed | SubtaskStatus::Failed) {
            Some(ts.clone())
        } else {
            subtask.completed_at.clone()
        };
        self.conn
            .execute(
                "UPDATE subtasks SET status = ?1, updated_at = ?2, started_at = ?3,
                 completed_at = ?4 WHERE id = ?5",
                params![next.as_str(), ts, started, completed, id],
            )
            .context("Failed to transition subtask")?;
        self.get_subtask(id)?
            .context("Subtask not found after transition")
    }

    /// Rewrite a subtask's prerequisite list once sibling ids are known.
    pub fn update_subtask_depends_on(&self, id: &str, depends_on: &[String]) -> Result<()> {
        let json = serde_json::to_string(depends_on).context("Failed to serialize depends_on")?;
        self.conn
            .execute(
                "UPDATE subtasks SET depends_on = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now(), id],
            )
            .context("Failed to update subtask depends_on")?;
        Ok(())
    }

    pub fn set_subtask_agent_run(&self, id: &str, agent_run_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE subtasks SET agent_run_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![agent_run_id, now(), id],
            )
            .context("Failed to set subtask agent run")?;
        Ok(())
    }

    pub fn set_subtask_files_modified(&self, id: &str, files: &[String]) -> Result<()> {
        let json = serde_json::to_string(files).context("Failed to serialize files_modified")?;
        self.conn
            .execute(
                "UPDATE subtasks SET files_modified = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now(), id],
            )
            .context("Failed to set subtask files modified")?;
        Ok(())
    }

    pub fn set_subtask_error(&self, id: &str, error: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE subtasks SET error_message = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, now(), id],
            )
            .context("Failed to set subtask error")?;
        Ok(())
    }

    /// True iff the task has at least one subtask and all are `completed`.
    pub fn all_subtasks_complete(&self, task_id: &str) -> Result<bool> {
        let (total, done): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'completed'), 0) FROM subtasks
             WHERE task_id = ?1",
            params![task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(total > 0 && total == done)
    }

    pub fn count_subtasks_by_status(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM subtasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    // ── Agent runs ────────────────────────────────────────────────────

    pub fn insert_agent_run(
        &self,
        task_id: &str,
        subtask_id: Option<&str>,
        run_type: AgentRunType,
        model: Option<&str>,
    ) -> Result<AgentRun> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO agent_runs (id, task_id, subtask_id, run_type, model, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, task_id, subtask_id, run_type.as_str(), model, ts],
            )
            .context("Failed to insert agent run")?;
        self.get_agent_run(&id)?
            .context("Agent run not found after insert")
    }

    pub fn get_agent_run(&self, id: &str) -> Result<Option<AgentRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, subtask_id, run_type, status, model, input_tokens,
                    output_tokens, total_cost, log, started_at, completed_at
             FROM agent_runs WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(AgentRunRow {
                id: row.get(0)?,
                task_id: row.get(1)?,
                subtask_id: row.get(2)?,
                run_type: row.get(3)?,
                status: row.get(4)?,
                model: row.get(5)?,
                input_tokens: row.get(6)?,
                output_tokens: row.get(7)?,
                total_cost: row.get(8)?,
                log: row.get(9)?,
                started_at: row.get(10)?,
                completed_at: row.get(11)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read agent run row")?.into_run()?)),
            None => Ok(None),
        }
    }

    pub fn update_agent_run_status(&self, id: &str, status: AgentRunStatus) -> Result<()> {
        let ts = now();
        let completed = matches!(
            status,
            AgentRunStatus::Completed | AgentRunStatus::Failed | AgentRunStatus::Timeout
        );
        if completed {
            self.conn.execute(
                "UPDATE agent_runs SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts, id],
            )
        } else {
            self.conn.execute(
                "UPDATE agent_runs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
        }
        .context("Failed to update agent run status")?;
        Ok(())
    }

    /// Record final token/cost totals. Totals only grow: the runner's
    /// counters are monotonic over the run's lifetime.
    pub fn record_agent_run_stats(
        &self,
        id: &str,
        input_tokens: i64,
        output_tokens: i64,
        total_cost: f64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE agent_runs SET
                    input_tokens = MAX(input_tokens, ?1),
                    output_tokens = MAX(output_tokens, ?2),
                    total_cost = MAX(total_cost, ?3)
                 WHERE id = ?4",
                params![input_tokens, output_tokens, total_cost, id],
            )
            .context("Failed to record agent run stats")?;
        Ok(())
    }

    pub fn append_agent_run_log(&self, id: &str, text: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE agent_runs SET log = log || ?1 WHERE id = ?2",
                params![text, id],
            )
            .context("Failed to append agent run log")?;
        Ok(())
    }

    pub fn count_agent_runs_by_type(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT run_type, COUNT(*) FROM agent_runs GROUP BY run_type")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Aggregate (input_tokens, output_tokens, total_cost) over all runs.
    pub fn token_totals(&self) -> Result<(i64, i64, f64)> {
        let totals = self.conn.query_row(
            "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(total_cost), 0.0) FROM agent_runs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(totals)
    }

    // ── Code reviews ──────────────────────────────────────────────────

    pub fn insert_code_review(
        &self,
        task_id: &str,
        agent_run_id: Option<&str>,
        result: ReviewResult,
        iteration: i64,
        summary: &str,
        issues: &[ReviewIssue],
    ) -> Result<CodeReview> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        let issues_json = serde_json::to_string(issues).context("Failed to serialize issues")?;
        self.conn
            .execute(
                "INSERT INTO code_reviews (id, task_id, agent_run_id, result, iteration,
                    summary, issues, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![id, task_id, agent_run_id, result.as_str(), iteration, summary, issues_json, ts],
            )
            .context("Failed to insert code review")?;
        self.get_code_review(&id)?
            .context("Code review not found after insert")
    }

    pub fn get_code_review(&self, id: &str) -> Result<Option<CodeReview>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, agent_run_id, result, iteration, summary, issues, created_at
             FROM code_reviews WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], code_review_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read code review row")?.into_review()?)),
            None => Ok(None),
        }
    }

    pub fn list_code_reviews(&self, task_id: &str) -> Result<Vec<CodeReview>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, agent_run_id, result, iteration, summary, issues, created_at
             FROM code_reviews WHERE task_id = ?1 ORDER BY iteration",
        )?;
        let rows = stmt.query_map(params![task_id], code_review_row)?;
        let mut reviews = Vec::new();
        for row in rows {
            reviews.push(row.context("Failed to read code review row")?.into_review()?);
        }
        Ok(reviews)
    }

    pub fn count_code_reviews(&self, task_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM code_reviews WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Pull requests ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn insert_pull_request(
        &self,
        task_id: &str,
        repository_full_name: &str,
        pr_number: i64,
        title: &str,
        body: &str,
        branch_name: &str,
        head_sha: Option<&str>,
        url: &str,
    ) -> Result<PullRequest> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO pull_requests (id, task_id, repository_full_name, pr_number,
                    title, body, branch_name, head_sha, url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![id, task_id, repository_full_name, pr_number, title, body, branch_name, head_sha, url, ts],
            )
            .context("Failed to insert pull request")?;
        self.get_pull_request(&id)?
            .context("Pull request not found after insert")
    }

    pub fn get_pull_request(&self, id: &str) -> Result<Option<PullRequest>> {
        self.query_pull_request("WHERE id = ?1", params![id])
    }

    pub fn get_pull_request_by_number(
        &self,
        repository_full_name: &str,
        pr_number: i64,
    ) -> Result<Option<PullRequest>> {
        self.query_pull_request(
            "WHERE repository_full_name = ?1 AND pr_number = ?2",
            params![repository_full_name, pr_number],
        )
    }

    pub fn get_pull_request_for_task(&self, task_id: &str) -> Result<Option<PullRequest>> {
        self.query_pull_request(
            "WHERE task_id = ?1 ORDER BY created_at DESC LIMIT 1",
            params![task_id],
        )
    }

    fn query_pull_request(
        &self,
        where_clause: &str,
        p: impl rusqlite::Params,
    ) -> Result<Option<PullRequest>> {
        let sql = format!(
            "SELECT id, task_id, repository_full_name, pr_number, title, body, branch_name,
                    head_sha, url, status, reviews_passed, check_status, created_at, updated_at
             FROM pull_requests {}",
            where_clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(p, pull_request_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read pull request row")?.into_pr()?)),
            None => Ok(None),
        }
    }

    pub fn update_pull_request_status(&self, id: &str, status: PullRequestStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pull_requests SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now(), id],
            )
            .context("Failed to update pull request status")?;
        Ok(())
    }

    pub fn update_pull_request_head(&self, id: &str, head_sha: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pull_requests SET head_sha = ?1, updated_at = ?2 WHERE id = ?3",
                params![head_sha, now(), id],
            )
            .context("Failed to update pull request head")?;
        Ok(())
    }

    // ── Notifications ─────────────────────────────────────────────────

    pub fn insert_notification(
        &self,
        task_id: &str,
        notification_type: &str,
        channel: NotificationChannel,
        payload: &serde_json::Value,
    ) -> Result<Notification> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        let payload_json =
            serde_json::to_string(payload).context("Failed to serialize notification payload")?;
        self.conn
            .execute(
                "INSERT INTO notifications (id, task_id, notification_type, channel, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, task_id, notification_type, channel.as_str(), payload_json, ts],
            )
            .context("Failed to insert notification")?;
        self.get_notification(&id)?
            .context("Notification not found after insert")
    }

    pub fn get_notification(&self, id: &str) -> Result<Option<Notification>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, notification_type, channel, payload, sent_at, error, created_at
             FROM notifications WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(NotificationRow {
                id: row.get(0)?,
                task_id: row.get(1)?,
                notification_type: row.get(2)?,
                channel: row.get(3)?,
                payload: row.get(4)?,
                sent_at: row.get(5)?,
                error: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("Failed to read notification row")?.into_notification()?,
            )),
            None => Ok(None),
        }
    }

    pub fn mark_notification_sent(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE notifications SET sent_at = ?1, error = NULL WHERE id = ?2",
                params![now(), id],
            )
            .context("Failed to mark notification sent")?;
        Ok(())
    }

    pub fn mark_notification_failed(&self, id: &str, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE notifications SET error = ?1 WHERE id = ?2",
                params![error, id],
            )
            .context("Failed to mark notification failed")?;
        Ok(())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, github_project_item_id, github_project_id, repository_full_name,
    repository_id, installation_id, title, description, status, branch_name,
    pull_request_number, pull_request_url, error_message, human_review_question,
    human_review_answer, retry_count, is_epic, parent_task_id,
    linked_github_issue_number, child_dependencies, created_at, updated_at,
    started_at, completed_at";

const SUBTASK_COLUMNS: &str = "id, task_id, subproject_path, title, description, status,
    depends_on, agent_run_id, files_modified, error_message, created_at, updated_at,
    started_at, completed_at";

/// Intermediate row struct for reading tasks from SQLite before converting
/// status / JSON columns into typed values.
struct TaskRow {
    id: String,
    github_project_item_id: String,
    github_project_id: String,
    repository_full_name: String,
    repository_id: i64,
    installation_id: i64,
    title: String,
    description: String,
    status: String,
    branch_name: Option<String>,
    pull_request_number: Option<i64>,
    pull_request_url: Option<String>,
    error_message: Option<String>,
    human_review_question: Option<String>,
    human_review_answer: Option<String>,
    retry_count: i64,
    is_epic: i64,
    parent_task_id: Option<String>,
    linked_github_issue_number: Option<i64>,
    child_dependencies: String,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        github_project_item_id: row.get(1)?,
        github_project_id: row.get(2)?,
        repository_full_name: row.get(3)?,
        repository_id: row.get(4)?,
        installation_id: row.get(5)?,
        title: row.get(6)?,
        description: row.get(7)?,
        status: row.get(8)?,
        branch_name: row.get(9)?,
        pull_request_number: row.get(10)?,
        pull_request_url: row.get(11)?,
        error_message: row.get(12)?,
        human_review_question: row.get(13)?,
        human_review_answer: row.get(14)?,
        retry_count: row.get(15)?,
        is_epic: row.get(16)?,
        parent_task_id: row.get(17)?,
        linked_github_issue_number: row.get(18)?,
        child_dependencies: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
        started_at: row.get(22)?,
        completed_at: row.get(23)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let child_dependencies: Vec<String> = serde_json::from_str(&self.child_dependencies)
            .context("Failed to parse child_dependencies JSON")?;
        Ok(Task {
            id: self.id,
            github_project_item_id: self.github_project_item_id,
            github_project_id: self.github_project_id,
            repository_full_name: self.repository_full_name,
            repository_id: self.repository_id,
            installation_id: self.installation_id,
            title: self.title,
            description: self.description,
            status,
            branch_name: self.branch_name,
            pull_request_number: self.pull_request_number,
            pull_request_url: self.pull_request_url,
            error_message: self.error_message,
            human_review_question: self.human_review_question,
            human_review_answer: self.human_review_answer,
            retry_count: self.retry_count,
            is_epic: self.is_epic != 0,
            parent_task_id: self.parent_task_id,
            linked_github_issue_number: self.linked_github_issue_number,
            child_dependencies,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

struct SubtaskRow {
    id: String,
    task_id: String,
    subproject_path: String,
    title: String,
    description: String,
    status: String,
    depends_on: String,
    agent_run_id: Option<String>,
    files_modified: String,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn subtask_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubtaskRow> {
    Ok(SubtaskRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        subproject_path: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status: row.get(5)?,
        depends_on: row.get(6)?,
        agent_run_id: row.get(7)?,
        files_modified: row.get(8)?,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

impl SubtaskRow {
    fn into_subtask(self) -> Result<Subtask> {
        let status = SubtaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse subtask status")?;
        let depends_on: Vec<String> =
            serde_json::from_str(&self.depends_on).context("Failed to parse depends_on JSON")?;
        let files_modified: Vec<String> = serde_json::from_str(&self.files_modified)
            .context("Failed to parse files_modified JSON")?;
        Ok(Subtask {
            id: self.id,
            task_id: self.task_id,
            subproject_path: self.subproject_path,
            title: self.title,
            description: self.description,
            status,
            depends_on,
            agent_run_id: self.agent_run_id,
            files_modified,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

struct AgentRunRow {
    id: String,
    task_id: String,
    subtask_id: Option<String>,
    run_type: String,
    status: String,
    model: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    total_cost: f64,
    log: String,
    started_at: String,
    completed_at: Option<String>,
}

impl AgentRunRow {
    fn into_run(self) -> Result<AgentRun> {
        let run_type = AgentRunType::from_str(&self.run_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse agent run type")?;
        let status = AgentRunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse agent run status")?;
        Ok(AgentRun {
            id: self.id,
            task_id: self.task_id,
            subtask_id: self.subtask_id,
            run_type,
            status,
            model: self.model,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_cost: self.total_cost,
            log: self.log,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

struct CodeReviewRow {
    id: String,
    task_id: String,
    agent_run_id: Option<String>,
    result: String,
    iteration: i64,
    summary: String,
    issues: String,
    created_at: String,
}

fn code_review_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CodeReviewRow> {
    Ok(CodeReviewRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        agent_run_id: row.get(2)?,
        result: row.get(3)?,
        iteration: row.get(4)?,
        summary: row.get(5)?,
        issues: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl CodeReviewRow {
    fn into_review(self) -> Result<CodeReview> {
        let result = ReviewResult::from_str(&self.result)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse review result")?;
        let issues: Vec<ReviewIssue> =
            serde_json::from_str(&self.issues).context("Failed to parse issues JSON")?;
        Ok(CodeReview {
            id: self.id,
            task_id: self.task_id,
            agent_run_id: self.agent_run_id,
            result,
            iteration: self.iteration,
            summary: self.summary,
            issues,
            created_at: self.created_at,
        })
    }
}

struct PullRequestRow {
    id: String,
    task_id: String,
    repository_full_name: String,
    pr_number: i64,
    title: String,
    body: String,
    branch_name: String,
    head_sha: Option<String>,
    url: String,
    status: String,
    reviews_passed: i64,
    check_status: Option<String>,
    created_at: String,
    updated_at: String,
}

fn pull_request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PullRequestRow> {
    Ok(PullRequestRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        repository_full_name: row.get(2)?,
        pr_number: row.get(3)?,
        title: row.get(4)?,
        body: row.get(5)?,
        branch_name: row.get(6)?,
        head_sha: row.get(7)?,
        url: row.get(8)?,
        status: row.get(9)?,
        reviews_passed: row.get(10)?,
        check_status: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl PullRequestRow {
    fn into_pr(self) -> Result<PullRequest> {
        let status = PullRequestStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse pull request status")?;
        Ok(PullRequest {
            id: self.id,
            task_id: self.task_id,
            repository_full_name: self.repository_full_name,
            pr_number: self.pr_number,
            title: self.title,
            body: self.body,
            branch_name: self.branch_name,
            head_sha: self.head_sha,
            url: self.url,
            status,
            reviews_passed: self.reviews_passed != 0,
            check_status: self.check_status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct NotificationRow {
    id: String,
    task_id: String,
    notification_type: String,
    channel: String,
    payload: String,
    sent_at: Option<String>,
    error: Option<String>,
    created_at: String,
}

impl NotificationRow {
    fn into_notification(self) -> Result<Notification> {
        let channel = NotificationChannel::from_str(&self.channel)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse notification channel")?;
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).context("Failed to parse notification payload")?;
        Ok(Notification {
            id: self.id,
            task_id: self.task_id,
            notification_type: self.notification_type,
            channel,
            payload,
            sent_at: self.sent_at,
            error: self.error,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
