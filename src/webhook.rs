//! Webhook intake: translates board-item changes, pull-request events, and
//! comment commands into tasks and queue jobs.
//!
//! Handlers are idempotent on repeated deliveries: the store is checked for
//! an existing task before inserting, and queue dedup-by-jobId absorbs
//! duplicate enqueues.

use std::sync::Arc;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::db::models::{PullRequestStatus, Task, TaskStatus};
use crate::errors::ConductorError;
use crate::github::SourceForge;
use crate::processor::task::{TaskAction, TaskJobPayload};
use crate::processor::{nonce, ProcessorContext, COLUMN_DONE, COLUMN_REDO, COLUMN_TODO};
use crate::queue::QUEUE_TASKS;

/// Feedback entries collected from a PR on redo are capped here.
const MAX_FEEDBACK_ENTRIES: usize = 10;

type HmacSha256 = Hmac<Sha256>;

/// Verify an `X-Hub-Signature-256` header against the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> Result<()> {
    let hex_digest = signature_header
        .strip_prefix("sha256=")
        .ok_or(ConductorError::InvalidSignature)?;
    let expected = hex::decode(hex_digest).map_err(|_| ConductorError::InvalidSignature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ConductorError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ConductorError::InvalidSignature)?;
    Ok(())
}

pub struct WebhookIntake {
    ctx: Arc<ProcessorContext>,
}

impl WebhookIntake {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    /// Dispatch one delivery. Unknown event families are ignored.
    pub async fn handle_event(&self, event: &str, payload: &Value) -> Result<()> {
        self.ctx
            .metrics
            .increment("conductor_webhooks_total", &[("event", event)]);
        match event {
            "projects_v2_item" => self.handle_board_item(payload).await,
            "pull_request" => self.handle_pull_request(payload).await,
            "issue_comment" => self.handle_comment(payload).await,
            _ => Ok(()),
        }
    }

    // ── Board items ───────────────────────────────────────────────────

    async fn handle_board_item(&self, payload: &Value) -> Result<()> {
        let action = str_at(payload, "/action").unwrap_or_default();
        if action != "created" && action != "edited" {
            return Ok(());
        }
        let item_id = str_at(payload, "/projects_v2_item/node_id")
            .context("Board event missing item node id")?;
        let project_id = str_at(payload, "/projects_v2_item/project_node_id")
            .context("Board event missing project node id")?;
        let installation_id = payload
            .pointer("/installation/id")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let forge = self.ctx.forge_factory.forge_for(installation_id).await?;
        let status = match forge.get_item_status(&project_id, &item_id).await? {
            Some(status) => status,
            None => return Ok(()),
        };
        if status != COLUMN_TODO && status != COLUMN_REDO {
            return Ok(());
        }

        let existing = {
            let item = item_id.clone();
            self.ctx
                .db
                .call(move |db| db.get_task_by_item_id(&item))
                .await?
        };

        match existing {
            None if status == COLUMN_TODO => {
                self.create_task_from_item(forge.as_ref(), &item_id, &project_id, installation_id)
                    .await
            }
            Some(task) if task.status == TaskStatus::HumanReview && status == COLUMN_TODO => {
                self.resume_after_human_review(forge.as_ref(), &task).await
            }
            Some(task) if task.status == TaskStatus::PrCreated && status == COLUMN_REDO => {
                self.redo_after_pr(forge.as_ref(), &task).await
            }
            // Any other combination is a duplicate delivery or an
            // irrelevant move.
            _ => Ok(()),
        }
    }

    async fn create_task_from_item(
        &self,
        forge: &dyn SourceForge,
        item_id: &str,
        project_id: &str,
        installation_id: i64,
    ) -> Result<()> {
        let content = forge.get_item_content(item_id).await?;
        let Some(repository_full_name) = content.repository_full_name else {
            tracing::warn!(
                item_id,
                "{}",
                ConductorError::MissingLink {
                    item_id: item_id.to_string()
                }
            );
            return Ok(());
        };

        let new_task = crate::db::models::NewTask {
            github_project_item_id: item_id.to_string(),
            github_project_id: project_id.to_string(),
            repository_full_name,
            repository_id: content.repository_id.unwrap_or(0),
            installation_id,
            title: content.title,
            description: content.body,
            linked_github_issue_number: content.issue_number,
            ..Default::default()
        };
        let task = self.ctx.db.call(move |db| db.insert_task(&new_task)).await?;
        tracing::info!(task_id = %task.id, title = %task.title, "Task created from board item");

        self.ctx
            .queue
            .enqueue(
                QUEUE_TASKS,
                &format!("decompose-{}", task.id),
                TaskJobPayload::json(&task.id, TaskAction::Decompose),
            )
            .await?;
        Ok(())
    }

    async fn resume_after_human_review(
        &self,
        forge: &dyn SourceForge,
        task: &Task,
    ) -> Result<()> {
        let answer = match task.linked_github_issue_number {
            Some(issue_number) => {
                let comments = forge
                    .list_issue_comments(&task.repository_full_name, issue_number)
                    .await
                    .unwrap_or_default();
                comments
                    .into_iter()
                    .rev()
                    .find(|c| !self.is_bot(&c.author))
                    .map(|c| c.body)
            }
            None => None,
        };

        {
            let task_id = task.id.clone();
            let question = task.human_review_question.clone();
            self.ctx
                .db
                .call(move |db| {
                    db.set_task_human_review(&task_id, question.as_deref(), answer.as_deref())?;
                    db.transition_task(&task_id, TaskStatus::Pending)
                })
                .await?;
        }
        self.ctx
            .queue
            .enqueue(
                QUEUE_TASKS,
                &format!("decompose-{}-{}", task.id, nonce()),
                TaskJobPayload::json(&task.id, TaskAction::Decompose),
            )
            .await?;
        Ok(())
    }

    async fn redo_after_pr(&self, forge: &dyn SourceForge, task: &Task) -> Result<()> {
        let mut feedback: Vec<String> = Vec::new();
        if let Some(pr_number) = task.pull_request_number {
            if let Ok(reviews) = forge
                .list_pr_reviews(&task.repository_full_name, pr_number)
                .await
            {
                for review in reviews {
                    if !self.is_bot(&review.author) && !review.body.trim().is_empty() {
                        feedback.push(review.body);
                    }
                }
            }
            if let Ok(comments) = forge
                .list_issue_comments(&task.repository_full_name, pr_number)
                .await
            {
                for comment in comments {
                    if !self.is_bot(&comment.author) && !comment.body.trim().is_empty() {
                        feedback.push(comment.body);
                    }
                }
            }
        }
        feedback.truncate(MAX_FEEDBACK_ENTRIES);
        let answer = if feedback.is_empty() {
            "The pull request was sent back for rework.".to_string()
        } else {
            feedback.join("\n\n---\n\n")
        };

        {
            let task_id = task.id.clone();
            let question = task.human_review_question.clone();
            self.ctx
                .db
                .call(move |db| {
                    db.set_task_human_review(&task_id, question.as_deref(), Some(&answer))?;
                    db.transition_task(&task_id, TaskStatus::Pending)
                })
                .await?;
        }
        self.ctx
            .queue
            .enqueue(
                QUEUE_TASKS,
                &format!("decompose-{}-{}", task.id, nonce()),
                TaskJobPayload::json(&task.id, TaskAction::Decompose),
            )
            .await?;
        Ok(())
    }

    // ── Pull requests ─────────────────────────────────────────────────

    async fn handle_pull_request(&self, payload: &Value) -> Result<()> {
        let head_ref = str_at(payload, "/pull_request/head/ref").unwrap_or_default();
        if !head_ref.starts_with("conductor/") {
            return Ok(());
        }
        let action = str_at(payload, "/action").unwrap_or_default();
        let repo = str_at(payload, "/repository/full_name").context("PR event missing repo")?;
        let pr_number = payload
            .pointer("/pull_request/number")
            .and_then(|v| v.as_i64())
            .context("PR event missing number")?;

        let row = {
            let repo = repo.clone();
            self.ctx
                .db
                .call(move |db| db.get_pull_request_by_number(&repo, pr_number))
                .await?
        };
        let Some(row) = row else {
            return Ok(());
        };

        match action.as_str() {
            "closed" => {
                let merged = payload
                    .pointer("/pull_request/merged")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if merged {
                    let task = {
                        let row_id = row.id.clone();
                        let task_id = row.task_id.clone();
                        self.ctx
                            .db
                            .call(move |db| {
                                db.update_pull_request_status(&row_id, PullRequestStatus::Merged)?;
                                db.get_task(&task_id)
                            })
                            .await?
                    };
                    let Some(task) = task else { return Ok(()) };
                    // Replays after the task finished are no-ops.
                    if task.status == TaskStatus::PrCreated {
                        let task_id = task.id.clone();
                        self.ctx
                            .db
                            .call(move |db| db.transition_task(&task_id, TaskStatus::Done))
                            .await?;
                        let installation_id = task.installation_id;
                        if let Ok(forge) =
                            self.ctx.forge_factory.forge_for(installation_id).await
                        {
                            self.ctx.move_card(forge.as_ref(), &task, COLUMN_DONE).await;
                        }
                        self.ctx.workspaces.cleanup(&task.id).await;
                        tracing::info!(task_id = %task.id, pr_number, "Task done: PR merged");
                    }
                } else {
                    let row_id = row.id.clone();
                    self.ctx
                        .db
                        .call(move |db| {
                            db.update_pull_request_status(&row_id, PullRequestStatus::Closed)
                        })
                        .await?;
                }
            }
            "synchronize" => {
                if let Some(sha) = str_at(payload, "/pull_request/head/sha") {
                    let row_id = row.id.clone();
                    self.ctx
                        .db
                        .call(move |db| db.update_pull_request_head(&row_id, &sha))
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ── Comment commands ──────────────────────────────────────────────

    async fn handle_comment(&self, payload: &Value) -> Result<()> {
        if str_at(payload, "/action").as_deref() != Some("created") {
            return Ok(());
        }
        let author = str_at(payload, "/comment/user/login").unwrap_or_default();
        if self.is_bot(&author) {
            return Ok(());
        }
        let body = str_at(payload, "/comment/body").unwrap_or_default();
        let Some(command) = parse_command(&body) else {
            return Ok(());
        };
        let repo = str_at(payload, "/repository/full_name").context("Comment missing repo")?;
        let issue_number = payload
            .pointer("/issue/number")
            .and_then(|v| v.as_i64())
            .context("Comment missing issue number")?;
        let installation_id = payload
            .pointer("/installation/id")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let forge = self.ctx.forge_factory.forge_for(installation_id).await?;

        let reply = match command.as_str() {
            "status" => self.status_reply().await?,
            "retry" => self.retry_reply(&repo, issue_number).await?,
            "help" => HELP_TEXT.to_string(),
            other => format!(
                "Unknown command `/conductor {}`. Try `/conductor help`.",
                other
            ),
        };
        forge
            .create_issue_comment(&repo, issue_number, &reply)
            .await?;
        Ok(())
    }

    async fn status_reply(&self) -> Result<String> {
        let tasks = self.ctx.db.call(|db| db.list_recent_tasks(10)).await?;
        if tasks.is_empty() {
            return Ok("No tasks yet.".to_string());
        }
        let mut out = String::from("| Task | Status | PR |\n|---|---|---|\n");
        for task in tasks {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                task.title,
                task.status,
                task.pull_request_url.as_deref().unwrap_or("-"),
            ));
        }
        Ok(out)
    }

    async fn retry_reply(&self, repo: &str, issue_number: i64) -> Result<String> {
        let task = {
            let repo = repo.to_string();
            self.ctx
                .db
                .call(move |db| db.get_task_by_issue_number(&repo, issue_number))
                .await?
        };
        let Some(task) = task else {
            return Ok("No task is linked to this issue.".to_string());
        };
        if task.status != TaskStatus::Failed {
            return Ok(format!(
                "Task is `{}`; only failed tasks can be retried.",
                task.status
            ));
        }
        {
            let task_id = task.id.clone();
            self.ctx
                .db
                .call(move |db| {
                    db.increment_task_retry_count(&task_id)?;
                    db.set_task_error(&task_id, None)?;
                    db.transition_task(&task_id, TaskStatus::Pending)
                })
                .await?;
        }
        self.ctx
            .queue
            .enqueue(
                QUEUE_TASKS,
                &format!("decompose-{}", task.id),
                TaskJobPayload::json(&task.id, TaskAction::Decompose),
            )
            .await?;
        Ok(format!("Retrying **{}**.", task.title))
    }

    fn is_bot(&self, author: &str) -> bool {
        author == self.ctx.settings.bot_login || author.ends_with("[bot]")
    }
}

const HELP_TEXT: &str = "**Conductor commands**\n\
- `/conductor status`: recent tasks and their progress\n\
- `/conductor retry`: retry the failed task linked to this issue\n\
- `/conductor help`: this message";

/// Extract the word following `/conductor`, if any.
fn parse_command(body: &str) -> Option<String> {
    let idx = body.find("/conductor")?;
    let rest = &body[idx + "/conductor".len()..];
    let word = rest.split_whitespace().next().unwrap_or("help");
    Some(word.to_string())
}

fn str_at(payload: &Value, pointer: &str) -> Option<String> {
    payload.pointer(pointer).and_then(|v| v.as_str()).map(String::from)
}
