//! Durable named job queues backed by the conductor database.
//!
//! Job ids are caller-supplied strings and double as dedup keys: enqueuing
//! over a live (waiting or active) job is a no-op, while finished rows are
//! reset so a later retry of the same logical job can run. Jobs support
//! delayed delivery, bounded-concurrency consumers, and retries with
//! exponential backoff. Completed and failed rows are retained for a fixed
//! window for inspection, then pruned.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::params;
use tokio::sync::{watch, Semaphore};

use crate::db::{now, ConductorDb, DbHandle};
use crate::errors::ConductorError;

pub const QUEUE_TASKS: &str = "tasks";
pub const QUEUE_SUBTASKS: &str = "subtasks";
pub const QUEUE_NOTIFICATIONS: &str = "notifications";
pub const QUEUE_CODE_REVIEW: &str = "code-review";

/// Default retry policy: up to 3 attempts, 5 s base backoff doubling to a
/// 60 s cap.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;
const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 60;

/// How long finished jobs are kept around for inspection.
const RETENTION_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// A claimed job handed to a `JobHandler`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub job_id: String,
    pub payload: serde_json::Value,
    /// Attempts already consumed before this delivery.
    pub attempts: i64,
    pub max_attempts: i64,
}

/// Progress side channel for a running job. Writes are advisory and do not
/// alter queue semantics.
#[derive(Clone)]
pub struct JobContext {
    db: DbHandle,
    row_id: i64,
}

impl JobContext {
    pub fn new(db: DbHandle, row_id: i64) -> Self {
        Self { db, row_id }
    }

    pub async fn update_progress(&self, stage: &str, message: &str) -> Result<()> {
        let row_id = self.row_id;
        let stage = stage.to_string();
        let message = message.to_string();
        self.db
            .call(move |db| db.update_job_progress(row_id, &stage, &message))
            .await
    }
}

/// Consumers implement this seam; the queue drives it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<()>;
}

/// Exponential backoff for the nth failure (1-based).
fn backoff_delay(failed_attempts: i64) -> Duration {
    let exp = failed_attempts.saturating_sub(1).min(10) as u32;
    let secs = BACKOFF_BASE_SECS.saturating_mul(2u64.saturating_pow(exp));
    Duration::from_secs(secs.min(BACKOFF_CAP_SECS))
}

fn rfc3339_in(delay: Duration) -> String {
    (Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── SQL layer ─────────────────────────────────────────────────────────

impl ConductorDb {
    /// Enqueue a job. Returns `false` (no-op) when a live job with the same
    /// `(queue, job_id)` already exists; finished rows are reset instead.
    pub fn enqueue_job(
        &self,
        queue: &str,
        job_id: &str,
        payload: &serde_json::Value,
        run_at: &str,
        max_attempts: i64,
    ) -> Result<bool> {
        let ts = now();
        let payload_json = serde_json::to_string(payload).context("Failed to serialize payload")?;
        let existing: Option<(i64, String)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id, status FROM jobs WHERE queue = ?1 AND job_id = ?2")?;
            let mut rows = stmt.query_map(params![queue, job_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            match rows.next() {
                Some(row) => Some(row.context("Failed to read job row")?),
                None => None,
            }
        };
        match existing {
            Some((_, status))
                if JobStatus::from_str(&status)
                    .map(|s| s.is_live())
                    .unwrap_or(false) =>
            {
                Ok(false)
            }
            Some((row_id, _)) => {
                self.conn
                    .execute(
                        "UPDATE jobs SET payload = ?1, status = 'waiting', attempts = 0,
                            max_attempts = ?2, run_at = ?3, last_error = NULL,
                            progress_stage = NULL, progress_message = NULL,
                            completed_at = NULL, updated_at = ?4
                         WHERE id = ?5",
                        params![payload_json, max_attempts, run_at, ts, row_id],
                    )
                    .context("Failed to reset finished job")?;
                Ok(true)
            }
            None => {
                self.conn
                    .execute(
                        "INSERT INTO jobs (queue, job_id, payload, run_at, max_attempts,
                            created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                        params![queue, job_id, payload_json, run_at, max_attempts, ts],
                    )
                    .context("Failed to insert job")?;
                Ok(true)
            }
        }
    }

    /// Atomically claim up to `limit` due jobs from a queue, marking them
    /// active. The `DbHandle` mutex serialises claimers within the process.
    pub fn claim_jobs(&self, queue: &str, limit: i64) -> Result<Vec<Job>> {
        let ts = now();
        let mut claimed = Vec::new();
        let rows: Vec<(i64, String, String, i64, i64)> = {
            let mut stmt = self.conn.prepare(
                "SELECT id, job_id, payload, attempts, max_attempts FROM jobs
                 WHERE queue = ?1 AND status = 'waiting' AND run_at <= ?2
                 ORDER BY id LIMIT ?3",
            )?;
            let mapped = stmt.query_map(params![queue, ts, limit], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row.context("Failed to read job row")?);
            }
            out
        };
        for (id, job_id, payload_json, attempts, max_attempts) in rows {
            let updated = self.conn.execute(
                "UPDATE jobs SET status = 'active', updated_at = ?1
                 WHERE id = ?2 AND status = 'waiting'",
                params![ts, id],
            )?;
            if updated == 0 {
                continue;
            }
            let payload: serde_json::Value = serde_json::from_str(&payload_json)
                .context("Failed to parse job payload JSON")?;
            claimed.push(Job {
                id,
                queue: queue.to_string(),
                job_id,
                payload,
                attempts,
                max_attempts,
            });
        }
        Ok(claimed)
    }

    pub fn complete_job(&self, row_id: i64) -> Result<()> {
        let ts = now();
        self.conn
            .execute(
                "UPDATE jobs SET status = 'completed', updated_at = ?1, completed_at = ?1
                 WHERE id = ?2",
                params![ts, row_id],
            )
            .context("Failed to complete job")?;
        Ok(())
    }

    /// Record a failed delivery. The job is re-scheduled with backoff until
    /// its attempts are exhausted, then marked failed.
    pub fn record_job_failure(&self, row_id: i64, error: &str) -> Result<JobStatus> {
        let ts = now();
        let (attempts, max_attempts): (i64, i64) = self.conn.query_row(
            "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
            params![row_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let attempts = attempts + 1;
        if attempts >= max_attempts {
            self.conn
                .execute(
                    "UPDATE jobs SET status = 'failed', attempts = ?1, last_error = ?2,
                        updated_at = ?3, completed_at = ?3
                     WHERE id = ?4",
                    params![attempts, error, ts, row_id],
                )
                .context("Failed to mark job failed")?;
            Ok(JobStatus::Failed)
        } else {
            let run_at = rfc3339_in(backoff_delay(attempts));
            self.conn
                .execute(
                    "UPDATE jobs SET status = 'waiting', attempts = ?1, last_error = ?2,
                        run_at = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![attempts, error, run_at, ts, row_id],
                )
                .context("Failed to reschedule job")?;
            Ok(JobStatus::Waiting)
        }
    }

    pub fn update_job_progress(&self, row_id: i64, stage: &str, message: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET progress_stage = ?1, progress_message = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![stage, message, now(), row_id],
            )
            .context("Failed to update job progress")?;
        Ok(())
    }

    /// Make every waiting job immediately due, skipping remaining delay and
    /// backoff. Operational "retry now" lever; the test harness uses it to
    /// step through poll delays.
    pub fn release_waiting_jobs(&self) -> Result<usize> {
        let released = self
            .conn
            .execute(
                "UPDATE jobs SET run_at = '1970-01-01T00:00:00.000Z' WHERE status = 'waiting'",
                [],
            )
            .context("Failed to release waiting jobs")?;
        Ok(released)
    }

    /// Drop finished jobs older than the retention window.
    pub fn prune_finished_jobs(&self) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::hours(RETENTION_WINDOW_HOURS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let pruned = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?1",
                params![cutoff],
            )
            .context("Failed to prune jobs")?;
        Ok(pruned)
    }

    pub fn get_job_status(&self, queue: &str, job_id: &str) -> Result<Option<JobStatus>> {
        let status: Option<String> = {
            let mut stmt = self
                .conn
                .prepare("SELECT status FROM jobs WHERE queue = ?1 AND job_id = ?2")?;
            let mut rows = stmt.query_map(params![queue, job_id], |row| row.get(0))?;
            match rows.next() {
                Some(row) => Some(row.context("Failed to read job status")?),
                None => None,
            }
        };
        match status {
            Some(s) => Ok(Some(JobStatus::from_str(&s).map_err(|e| anyhow::anyhow!(e))?)),
            None => Ok(None),
        }
    }

    pub fn count_jobs(&self, queue: &str, status: JobStatus) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status = ?2",
            params![queue, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ── Queue facade ──────────────────────────────────────────────────────

/// Handle for enqueuing jobs and running queue consumers.
#[derive(Clone)]
pub struct JobQueue {
    db: DbHandle,
    poll_interval: Duration,
}

impl JobQueue {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Shorten the polling interval (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enqueue for immediate delivery. Returns `false` if deduplicated
    /// against a live job with the same id.
    pub async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: serde_json::Value,
    ) -> Result<bool> {
        self.enqueue_delayed(queue, job_id, payload, Duration::ZERO)
            .await
    }

    pub async fn enqueue_delayed(
        &self,
        queue: &str,
        job_id: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<bool> {
        let queue = queue.to_string();
        let job_id = job_id.to_string();
        let run_at = rfc3339_in(delay);
        let enqueued = self
            .db
            .call(move |db| db.enqueue_job(&queue, &job_id, &payload, &run_at, DEFAULT_MAX_ATTEMPTS))
            .await?;
        Ok(enqueued)
    }

    /// Run a consumer loop for one queue until the shutdown signal flips.
    /// At most `concurrency` handlers run at a time; each claimed job is
    /// completed, rescheduled with backoff, or failed according to the
    /// handler outcome. `InvalidTransition` failures skip the retry policy.
    pub async fn run_worker(
        &self,
        queue: &'static str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        loop {
            if *shutdown.borrow() {
                break;
            }
            let available = semaphore.available_permits() as i64;
            let jobs = if available > 0 {
                let db = self.db.clone();
                match db.call(move |db| db.claim_jobs(queue, available)).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        tracing::error!(queue, error = %e, "Failed to claim jobs");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            for job in jobs {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let db = self.db.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let row_id = job.id;
                    let job_id = job.job_id.clone();
                    let ctx = JobContext {
                        db: db.clone(),
                        row_id,
                    };
                    match handler.handle(job, ctx).await {
                        Ok(()) => {
                            if let Err(e) = db.call(move |db| db.complete_job(row_id)).await {
                                tracing::error!(queue, job_id, error = %e, "Failed to mark job completed");
                            }
                        }
                        Err(err) => {
                            let not_retryable = err
                                .downcast_ref::<ConductorError>()
                                .map(|e| !e.is_retryable())
                                .unwrap_or(false);
                            let msg = format!("{:#}", err);
                            tracing::warn!(queue, job_id, error = %msg, "Job handler failed");
                            let outcome = if not_retryable {
                                let msg = msg.clone();
                                db.call(move |db| {
                                    // Burn remaining attempts: programmer errors are not retried.
                                    db.conn.execute(
                                        "UPDATE jobs SET status = 'failed', last_error = ?1,
                                            updated_at = ?2, completed_at = ?2 WHERE id = ?3",
                                        params![msg, now(), row_id],
                                    )?;
                                    Ok(JobStatus::Failed)
                                })
                                .await
                            } else {
                                let msg = msg.clone();
                                db.call(move |db| db.record_job_failure(row_id, &msg)).await
                            };
                            if let Err(e) = outcome {
                                tracing::error!(queue, job_id, error = %e, "Failed to record job failure");
                            }
                        }
                    }
                });
            }
        }
    }

    /// Periodically prune finished jobs past the retention window.
    pub async fn run_pruner(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.db.call(|db| db.prune_finished_jobs()).await {
                        Ok(pruned) if pruned > 0 => {
                            tracing::debug!(pruned, "Pruned finished jobs");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Job pruning failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handle() -> DbHandle {
        DbHandle::new(ConductorDb::new_in_memory().unwrap())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(20));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(5), Duration::from_secs(60));
        assert_eq!(backoff_delay(12), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn enqueue_deduplicates_live_jobs() {
        let db = handle();
        let queue = JobQueue::new(db.clone());
        let first = queue
            .enqueue(QUEUE_TASKS, "decompose-t1", serde_json::json!({"taskId": "t1"}))
            .await
            .unwrap();
        let second = queue
            .enqueue(QUEUE_TASKS, "decompose-t1", serde_json::json!({"taskId": "t1"}))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        let waiting = db
            .call(|db| db.count_jobs(QUEUE_TASKS, JobStatus::Waiting))
            .await
            .unwrap();
        assert_eq!(waiting, 1);
    }

    #[tokio::test]
    async fn finished_job_id_can_be_reused() {
        let db = handle();
        let queue = JobQueue::new(db.clone());
        queue
            .enqueue(QUEUE_TASKS, "decompose-t1", serde_json::json!({}))
            .await
            .unwrap();
        let jobs = db
            .call(|db| db.claim_jobs(QUEUE_TASKS, 10))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        let row_id = jobs[0].id;
        db.call(move |db| db.complete_job(row_id)).await.unwrap();

        // Re-enqueue after completion resets the row
        let again = queue
            .enqueue(QUEUE_TASKS, "decompose-t1", serde_json::json!({}))
            .await
            .unwrap();
        assert!(again);
        let status = db
            .call(|db| db.get_job_status(QUEUE_TASKS, "decompose-t1"))
            .await
            .unwrap();
        assert_eq!(status, Some(JobStatus::Waiting));
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_claimable_early() {
        let db = handle();
        let queue = JobQueue::new(db.clone());
        queue
            .enqueue_delayed(
                QUEUE_TASKS,
                "check-complete-t1",
                serde_json::json!({}),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        let jobs = db.call(|db| db.claim_jobs(QUEUE_TASKS, 10)).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn failure_reschedules_then_fails() {
        let db = handle();
        let queue = JobQueue::new(db.clone());
        queue
            .enqueue(QUEUE_TASKS, "j", serde_json::json!({}))
            .await
            .unwrap();

        for expected in [JobStatus::Waiting, JobStatus::Waiting, JobStatus::Failed] {
            // Force the job due so the claim works regardless of backoff
            db.call(|db| {
                db.conn
                    .execute("UPDATE jobs SET run_at = '1970-01-01T00:00:00.000Z'", [])?;
                Ok(())
            })
            .await
            .unwrap();
            let jobs = db.call(|db| db.claim_jobs(QUEUE_TASKS, 1)).await.unwrap();
            assert_eq!(jobs.len(), 1);
            let row_id = jobs[0].id;
            let outcome = db
                .call(move |db| db.record_job_failure(row_id, "boom"))
                .await
                .unwrap();
            assert_eq!(outcome, expected);
        }
        let failed = db
            .call(|db| db.count_jobs(QUEUE_TASKS, JobStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed, 1);
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: Job, ctx: JobContext) -> Result<()> {
            ctx.update_progress("work", "doing it").await?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_executes_each_job_exactly_once() {
        let db = handle();
        let queue = JobQueue::new(db.clone()).with_poll_interval(Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler { calls: calls.clone() });

        // Concurrent enqueues of the same id collapse to one execution
        queue
            .enqueue(QUEUE_SUBTASKS, "subtask-s1", serde_json::json!({}))
            .await
            .unwrap();
        queue
            .enqueue(QUEUE_SUBTASKS, "subtask-s1", serde_json::json!({}))
            .await
            .unwrap();
        queue
            .enqueue(QUEUE_SUBTASKS, "subtask-s2", serde_json::json!({}))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.run_worker(QUEUE_SUBTASKS, 5, handler, rx).await;
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = db
                    .call(|db| db.count_jobs(QUEUE_SUBTASKS, JobStatus::Completed))
                    .await
                    .unwrap();
                if done == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("jobs did not complete in time");

        tx.send(true).unwrap();
        worker.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_transition_failures_are_not_retried() {
        struct AlwaysInvalid;

        #[async_trait]
        impl JobHandler for AlwaysInvalid {
            async fn handle(&self, _job: Job, _ctx: JobContext) -> Result<()> {
                Err(ConductorError::InvalidTransition {
                    entity: "task",
                    from: "done".into(),
                    to: "pending".into(),
                }
                .into())
            }
        }

        let db = handle();
        let queue = JobQueue::new(db.clone()).with_poll_interval(Duration::from_millis(10));
        queue
            .enqueue(QUEUE_TASKS, "bad", serde_json::json!({}))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.run_worker(QUEUE_TASKS, 1, Arc::new(AlwaysInvalid), rx).await;
            })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let failed = db
                    .call(|db| db.count_jobs(QUEUE_TASKS, JobStatus::Failed))
                    .await
                    .unwrap();
                if failed == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("job did not fail in time");

        tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
