//! Task processor: drives the task state machine.
//!
//! Consumes `{taskId, action}` jobs from the `tasks` queue. Any exception
//! escaping an action first transitions the task to `failed` with the
//! exception text, then rethrows so the queue records the failure and
//! applies its retry policy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    nonce, ProcessorContext, CHILD_ISSUE_LABELS, COLUMN_DONE, COLUMN_HUMAN_REVIEW,
    COLUMN_IN_PROGRESS, COLUMN_TODO,
};
use crate::config::ConductorConfig;
use crate::db::models::{NewTask, ReviewIssue, ReviewResult, Task, TaskStatus};
use crate::decomposer::{ChildTaskDefinition, Decomposer, DecompositionOutcome};
use crate::errors::ConductorError;
use crate::fixer::{FixParams, Fixer};
use crate::github::SourceForge;
use crate::queue::{Job, JobContext, JobHandler, QUEUE_SUBTASKS, QUEUE_TASKS};
use crate::reviewer::{ReviewParams, Reviewer};
use crate::workspace::{https_remote, PrepareRequest, Workspace};

/// Wall clock for the best-effort local smoke test.
const SMOKE_TEST_CAP: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Decompose,
    Execute,
    Review,
    Fix,
    CreatePr,
    SmokeTest,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskJobPayload {
    pub task_id: String,
    pub action: TaskAction,
}

impl TaskJobPayload {
    pub fn json(task_id: &str, action: TaskAction) -> serde_json::Value {
        serde_json::json!({ "taskId": task_id, "action": action })
    }
}

pub struct TaskProcessor {
    ctx: Arc<ProcessorContext>,
}

impl TaskProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn load_task(&self, task_id: &str) -> Result<Task> {
        let id = task_id.to_string();
        self.ctx
            .db
            .call(move |db| db.get_task(&id))
            .await?
            .ok_or_else(|| {
                ConductorError::TaskNotFound {
                    id: task_id.to_string(),
                }
                .into()
            })
    }

    async fn transition(&self, task_id: &str, next: TaskStatus) -> Result<Task> {
        let id = task_id.to_string();
        self.ctx.db.call(move |db| db.transition_task(&id, next)).await
    }

    // ── decompose ─────────────────────────────────────────────────────

    async fn decompose(&self, task: &Task, job_ctx: &JobContext) -> Result<()> {
        // Redeliveries after a transient failure land here with the
        // transition already made.
        if task.status != TaskStatus::Decomposing {
            self.transition(&task.id, TaskStatus::Decomposing).await?;
        }
        job_ctx.update_progress("decompose", "analysing work item").await?;

        let forge = self.ctx.forge_factory.forge_for(task.installation_id).await?;
        self.ctx.move_card(forge.as_ref(), task, COLUMN_IN_PROGRESS).await;

        let (repo, config) = self
            .ctx
            .load_repo_config(forge.as_ref(), &task.repository_full_name)
            .await?;

        let decomposer = Decomposer::new(
            self.ctx.db.clone(),
            self.ctx.invoker.clone(),
            self.ctx.scratch_dir(),
        );
        // Reload: the transition above stamped timestamps and the human
        // review answer must be current.
        let task = self.load_task(&task.id).await?;
        let outcome = decomposer
            .decompose(&task, forge.as_ref(), &repo, &config)
            .await?;

        match outcome {
            DecompositionOutcome::NeedsHumanReview { question } => {
                self.ctx.move_card(forge.as_ref(), &task, COLUMN_HUMAN_REVIEW).await;
                if let Some(issue_number) = task.linked_github_issue_number {
                    let body = format!(
                        "**Conductor needs your input before continuing:**\n\n{}\n\n\
                         Answer in a comment, then move the card back to {}.",
                        question, COLUMN_TODO
                    );
                    if let Err(e) = forge
                        .create_issue_comment(&task.repository_full_name, issue_number, &body)
                        .await
                    {
                        tracing::warn!(task_id = %task.id, error = %e, "Failed to post question comment");
                    }
                }
                {
                    let task_id = task.id.clone();
                    let question = question.clone();
                    self.ctx
                        .db
                        .call(move |db| {
                            db.set_task_human_review(&task_id, Some(&question), None)?;
                            db.transition_task(&task_id, TaskStatus::HumanReview)
                        })
                        .await?;
                }
                self.ctx
                    .enqueue_notifications(
                        &task,
                        &config,
                        "human_review_needed",
                        serde_json::json!({
                            "taskId": task.id,
                            "title": task.title,
                            "question": question,
                        }),
                    )
                    .await?;
                Ok(())
            }
            DecompositionOutcome::Epic { children, summary } => {
                // A retried decompose must not mint the children twice.
                let existing = {
                    let task_id = task.id.clone();
                    self.ctx
                        .db
                        .call(move |db| db.list_child_tasks(&task_id))
                        .await?
                };
                if existing.is_empty() {
                    self.expand_epic(&task, forge.as_ref(), &children).await?;
                }
                tracing::info!(task_id = %task.id, children = children.len(), %summary, "Epic expanded");
                self.transition(&task.id, TaskStatus::Executing).await?;
                self.ctx
                    .queue
                    .enqueue_delayed(
                        QUEUE_TASKS,
                        &format!("check-complete-{}", task.id),
                        TaskJobPayload::json(&task.id, TaskAction::Execute),
                        self.ctx.settings.poll_delay,
                    )
                    .await?;
                Ok(())
            }
            DecompositionOutcome::Simple {
                subtasks,
                affected_subprojects,
                summary,
            } => {
                tracing::info!(
                    task_id = %task.id,
                    subtasks = subtasks.len(),
                    subprojects = ?affected_subprojects,
                    %summary,
                    "Task decomposed"
                );
                self.transition(&task.id, TaskStatus::Executing).await?;
                for subtask in &subtasks {
                    self.ctx
                        .queue
                        .enqueue(
                            QUEUE_SUBTASKS,
                            &format!("subtask-{}", subtask.id),
                            serde_json::json!({ "subtaskId": subtask.id, "taskId": task.id }),
                        )
                        .await?;
                }
                self.ctx
                    .queue
                    .enqueue_delayed(
                        QUEUE_TASKS,
                        &format!("check-complete-{}", task.id),
                        TaskJobPayload::json(&task.id, TaskAction::Execute),
                        self.ctx.settings.poll_delay,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Create an external issue + board card + child task per definition,
    /// then release the children without prerequisites.
    async fn expand_epic(
        &self,
        task: &Task,
        forge: &dyn SourceForge,
        children: &[ChildTaskDefinition],
    ) -> Result<()> {
        let labels: Vec<String> = CHILD_ISSUE_LABELS.iter().map(|s| s.to_string()).collect();
        for child in children {
            let body = if child.depends_on.is_empty() {
                child.description.clone()
            } else {
                format!(
                    "{}\n\n**Depends on:** {}",
                    child.description,
                    child.depends_on.join(", ")
                )
            };
            let issue = forge
                .create_issue(&task.repository_full_name, &child.title, &body, &labels)
                .await?;

            let item_id = match forge
                .add_item_to_project(&task.github_project_id, &issue.node_id)
                .await
            {
                Ok(item_id) => {
                    if let Err(e) = forge
                        .move_item_to_column(&task.github_project_id, &item_id, COLUMN_TODO)
                        .await
                    {
                        tracing::warn!(error = %e, "Failed to move child card to Todo");
                    }
                    item_id
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to add child issue to project");
                    String::new()
                }
            };

            let new_child = NewTask {
                github_project_item_id: item_id,
                github_project_id: task.github_project_id.clone(),
                repository_full_name: task.repository_full_name.clone(),
                repository_id: task.repository_id,
                installation_id: task.installation_id,
                title: child.title.clone(),
                description: child.description.clone(),
                parent_task_id: Some(task.id.clone()),
                linked_github_issue_number: Some(issue.number),
                child_dependencies: child.depends_on.clone(),
            };
            let inserted = self.ctx.db.call(move |db| db.insert_task(&new_child)).await?;

            if child.depends_on.is_empty() {
                self.ctx
                    .queue
                    .enqueue(
                        QUEUE_TASKS,
                        &format!("decompose-{}", inserted.id),
                        TaskJobPayload::json(&inserted.id, TaskAction::Decompose),
                    )
                    .await?;
            }
        }
        let task_id = task.id.clone();
        self.ctx
            .db
            .call(move |db| db.set_task_epic(&task_id, true))
            .await?;
        Ok(())
    }

    // ── execute ───────────────────────────────────────────────────────

    async fn execute(&self, task: &Task, job_ctx: &JobContext) -> Result<()> {
        if task.is_epic {
            return self.execute_epic(task).await;
        }

        let task_id = task.id.clone();
        let complete = self
            .ctx
            .db
            .call(move |db| db.all_subtasks_complete(&task_id))
            .await?;
        if complete {
            job_ctx.update_progress("execute", "all subtasks complete").await?;
            self.ctx
                .queue
                .enqueue(
                    QUEUE_TASKS,
                    &format!("review-{}-{}", task.id, nonce()),
                    TaskJobPayload::json(&task.id, TaskAction::Review),
                )
                .await?;
        } else {
            job_ctx.update_progress("execute", "waiting for subtasks").await?;
            self.ctx
                .queue
                .enqueue_delayed(
                    QUEUE_TASKS,
                    &format!("check-complete-{}-{}", task.id, nonce()),
                    TaskJobPayload::json(&task.id, TaskAction::Execute),
                    self.ctx.settings.poll_delay,
                )
                .await?;
        }
        Ok(())
    }

    async fn execute_epic(&self, task: &Task) -> Result<()> {
        let task_id = task.id.clone();
        let children = self
            .ctx
            .db
            .call(move |db| db.list_child_tasks(&task_id))
            .await?;

        // Release children whose prerequisite siblings (by title) are done.
        for child in &children {
            if child.status != TaskStatus::Pending {
                continue;
            }
            let ready = child.child_dependencies.iter().all(|dep_title| {
                children
                    .iter()
                    .any(|sibling| sibling.title == *dep_title && sibling.status == TaskStatus::Done)
            });
            if ready {
                self.ctx
                    .queue
                    .enqueue(
                        QUEUE_TASKS,
                        &format!("decompose-{}", child.id),
                        TaskJobPayload::json(&child.id, TaskAction::Decompose),
                    )
                    .await?;
            }
        }

        let all_terminal = !children.is_empty()
            && children
                .iter()
                .all(|c| matches!(c.status, TaskStatus::Done | TaskStatus::Failed));
        if all_terminal {
            let forge = self.ctx.forge_factory.forge_for(task.installation_id).await?;
            let any_failed = children.iter().any(|c| c.status == TaskStatus::Failed);
            if any_failed {
                {
                    let task_id = task.id.clone();
                    self.ctx
                        .db
                        .call(move |db| {
                            db.set_task_error(&task_id, Some("One or more child tasks failed"))?;
                            db.transition_task(&task_id, TaskStatus::Failed)
                        })
                        .await?;
                }
                self.ctx.move_card(forge.as_ref(), task, COLUMN_HUMAN_REVIEW).await;
            } else {
                self.transition(&task.id, TaskStatus::Done).await?;
                self.ctx.move_card(forge.as_ref(), task, COLUMN_DONE).await;
                if let Some(issue_number) = task.linked_github_issue_number {
                    let pr_lines: Vec<String> = children
                        .iter()
                        .filter_map(|c| c.pull_request_url.clone())
                        .map(|url| format!("- {}", url))
                        .collect();
                    let body = format!(
                        "All child tasks are complete.\n\n**Pull requests:**\n{}",
                        if pr_lines.is_empty() {
                            "(none)".to_string()
                        } else {
                            pr_lines.join("\n")
                        }
                    );
                    if let Err(e) = forge
                        .create_issue_comment(&task.repository_full_name, issue_number, &body)
                        .await
                    {
                        tracing::warn!(task_id = %task.id, error = %e, "Failed to post completion comment");
                    }
                }
                if let Ok((_repo, config)) = self
                    .ctx
                    .load_repo_config(forge.as_ref(), &task.repository_full_name)
                    .await
                {
                    self.ctx
                        .enqueue_notifications(
                            task,
                            &config,
                            "task_completed",
                            serde_json::json!({"taskId": task.id, "title": task.title}),
                        )
                        .await?;
                }
            }
        } else {
            self.ctx
                .queue
                .enqueue_delayed(
                    QUEUE_TASKS,
                    &format!("check-complete-{}-{}", task.id, nonce()),
                    TaskJobPayload::json(&task.id, TaskAction::Execute),
                    self.ctx.settings.poll_delay,
                )
                .await?;
        }
        Ok(())
    }

    // ── review / fix ──────────────────────────────────────────────────

    /// Prepare the task's working tree. The returned guard is the per-task
    /// workspace lock; callers hold it across every tree-mutating step.
    async fn prepare_workspace(
        &self,
        task: &Task,
        config: &ConductorConfig,
    ) -> Result<(Workspace, tokio::sync::OwnedMutexGuard<()>)> {
        let forge = self.ctx.forge_factory.forge_for(task.installation_id).await?;
        let repo = forge.get_repository(&task.repository_full_name).await?;
        let token = self
            .ctx
            .tokens
            .installation_token(task.installation_id)
            .await?;
        let req = PrepareRequest {
            task_id: task.id.clone(),
            title: task.title.clone(),
            remote_url: https_remote(&task.repository_full_name, &token),
            default_branch: repo.default_branch,
            branch_pattern: config.workflow.branch_pattern.clone(),
            branch_name: task.branch_name.clone(),
        };
        let guard = self.ctx.workspaces.lock(&task.id).await;
        let ws = self.ctx.workspaces.prepare_locked(&req).await?;
        if task.branch_name.is_none() {
            let task_id = task.id.clone();
            let branch = ws.branch_name.clone();
            self.ctx
                .db
                .call(move |db| db.set_task_branch(&task_id, &branch))
                .await?;
        }
        Ok((ws, guard))
    }

    async fn review(&self, task: &Task, job_ctx: &JobContext) -> Result<()> {
        if task.status != TaskStatus::Review {
            self.transition(&task.id, TaskStatus::Review).await?;
        }
        job_ctx.update_progress("review", "reviewing changes").await?;

        let forge = self.ctx.forge_factory.forge_for(task.installation_id).await?;
        let (_repo, config) = self
            .ctx
            .load_repo_config(forge.as_ref(), &task.repository_full_name)
            .await?;
        let (ws, guard) = self.prepare_workspace(task, &config).await?;

        // Push whatever the subtasks left behind; no new changes is fine.
        if let Err(e) = self
            .ctx
            .workspaces
            .commit_and_push(&ws, &format!("Apply changes for: {}", task.title))
            .await
        {
            tracing::warn!(task_id = %task.id, error = %e, "Pre-review push failed");
        }
        drop(guard);

        let params = ReviewParams {
            model: config.agents.code_review.model.clone(),
            max_turns: config.agents.code_review.max_turns,
            ..Default::default()
        };
        let reviewer = Reviewer::new(self.ctx.db.clone(), self.ctx.invoker.clone());
        let outcome = reviewer
            .review(task, &ws, forge.as_ref(), &params)
            .await?;

        match outcome.result {
            ReviewResult::Approved => {
                if config.workflow.require_smoke_test {
                    self.ctx
                        .queue
                        .enqueue(
                            QUEUE_TASKS,
                            &format!("smoke-test-{}", task.id),
                            TaskJobPayload::json(&task.id, TaskAction::SmokeTest),
                        )
                        .await?;
                } else {
                    self.ctx
                        .queue
                        .enqueue(
                            QUEUE_TASKS,
                            &format!("create-pr-{}", task.id),
                            TaskJobPayload::json(&task.id, TaskAction::CreatePr),
                        )
                        .await?;
                }
            }
            ReviewResult::ChangesRequested if outcome.iteration < params.max_iterations => {
                let issues_json = serde_json::to_string(&outcome.issues)
                    .context("Failed to serialize review issues")?;
                {
                    let task_id = task.id.clone();
                    self.ctx
                        .db
                        .call(move |db| {
                            db.set_task_error(&task_id, Some(&issues_json))?;
                            db.transition_task(&task_id, TaskStatus::Executing)
                        })
                        .await?;
                }
                self.ctx
                    .queue
                    .enqueue(
                        QUEUE_TASKS,
                        &format!("fix-{}-iter-{}", task.id, outcome.iteration),
                        TaskJobPayload::json(&task.id, TaskAction::Fix),
                    )
                    .await?;
            }
            _ => {
                let task_id = task.id.clone();
                self.ctx
                    .db
                    .call(move |db| {
                        db.set_task_error(
                            &task_id,
                            Some("Code review failed after maximum iterations"),
                        )?;
                        db.transition_task(&task_id, TaskStatus::Failed)
                    })
                    .await?;
                self.ctx
                    .enqueue_notifications(
                        task,
                        &config,
                        "task_failed",
                        serde_json::json!({
                            "taskId": task.id,
                            "title": task.title,
                            "error": "Code review failed after maximum iterations",
                        }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn fix(&self, task: &Task, job_ctx: &JobContext) -> Result<()> {
        job_ctx.update_progress("fix", "repairing review findings").await?;
        let issues: Vec<ReviewIssue> = task
            .error_message
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        let forge = self.ctx.forge_factory.forge_for(task.installation_id).await?;
        let (_repo, config) = self
            .ctx
            .load_repo_config(forge.as_ref(), &task.repository_full_name)
            .await?;
        // The fixer's agent mutates the tree: hold the workspace lock for
        // the whole pass.
        let (ws, guard) = self.prepare_workspace(task, &config).await?;

        let params = FixParams {
            model: config.agents.sub_agent.model.clone(),
            max_turns: config.agents.sub_agent.max_turns,
            timeout: Duration::from_secs(config.agents.sub_agent.timeout_minutes * 60),
        };
        let fixer = Fixer::new(self.ctx.db.clone(), self.ctx.invoker.clone());
        let outcome = fixer
            .fix(task, &issues, &ws, self.ctx.workspaces.as_ref(), &params)
            .await?;
        drop(guard);
        tracing::info!(
            task_id = %task.id,
            files = outcome.files_modified.len(),
            success = outcome.success,
            "Fix pass finished"
        );

        {
            let task_id = task.id.clone();
            self.ctx
                .db
                .call(move |db| db.set_task_error(&task_id, None))
                .await?;
        }
        self.ctx
            .queue
            .enqueue(
                QUEUE_TASKS,
                &format!("review-{}-{}", task.id, nonce()),
                TaskJobPayload::json(&task.id, TaskAction::Review),
            )
            .await?;
        Ok(())
    }

    // ── create_pr / smoke_test ────────────────────────────────────────

    async fn create_pr(&self, task: &Task, job_ctx: &JobContext) -> Result<()> {
        // A redelivery after the PR was already opened must not open a
        // second one.
        if task.status == TaskStatus::PrCreated {
            return Ok(());
        }
        job_ctx.update_progress("create_pr", "opening pull request").await?;
        let forge = self.ctx.forge_factory.forge_for(task.installation_id).await?;
        let (_repo, config) = self
            .ctx
            .load_repo_config(forge.as_ref(), &task.repository_full_name)
            .await?;
        let (ws, guard) = self.prepare_workspace(task, &config).await?;

        let head_sha = match self
            .ctx
            .workspaces
            .commit_and_push(&ws, &format!("Final changes for: {}", task.title))
            .await
        {
            Ok(sha) => sha,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Final push failed");
                String::new()
            }
        };
        drop(guard);

        let body = format!(
            "## Summary\n\nAutomated implementation for: **{}**\n\n{}\n\n---\n*Created by Conductor*",
            task.title,
            if task.description.is_empty() {
                "No description provided."
            } else {
                &task.description
            }
        );
        let pr = forge
            .create_pull_request(
                &task.repository_full_name,
                &task.title,
                &body,
                &ws.branch_name,
                &ws.base_branch,
            )
            .await?;

        {
            let task_id = task.id.clone();
            let repo = task.repository_full_name.clone();
            let title = task.title.clone();
            let branch = ws.branch_name.clone();
            let pr = pr.clone();
            let body = body.clone();
            let head = if head_sha.is_empty() {
                pr.head_sha.clone()
            } else {
                Some(head_sha)
            };
            self.ctx
                .db
                .call(move |db| {
                    db.insert_pull_request(
                        &task_id,
                        &repo,
                        pr.number,
                        &title,
                        &body,
                        &branch,
                        head.as_deref(),
                        &pr.url,
                    )?;
                    db.set_task_pull_request(&task_id, pr.number, &pr.url)?;
                    db.transition_task(&task_id, TaskStatus::PrCreated)
                })
                .await?;
        }
        self.ctx.move_card(forge.as_ref(), task, COLUMN_HUMAN_REVIEW).await;
        self.ctx
            .enqueue_notifications(
                task,
                &config,
                "pr_created",
                serde_json::json!({
                    "taskId": task.id,
                    "title": task.title,
                    "url": pr.url,
                    "number": pr.number,
                }),
            )
            .await?;
        Ok(())
    }

    async fn smoke_test(&self, task: &Task, job_ctx: &JobContext) -> Result<()> {
        job_ctx.update_progress("smoke_test", "running smoke test").await?;
        let forge = self.ctx.forge_factory.forge_for(task.installation_id).await?;
        let (_repo, config) = self
            .ctx
            .load_repo_config(forge.as_ref(), &task.repository_full_name)
            .await?;

        let passed = if let Some(url) = &config.workflow.smoke_test_webhook {
            self.webhook_smoke_test(task, url).await
        } else {
            let (ws, _guard) = self.prepare_workspace(task, &config).await?;
            local_smoke_test(&ws.path).await
        };

        if passed {
            self.ctx
                .queue
                .enqueue(
                    QUEUE_TASKS,
                    &format!("create-pr-{}", task.id),
                    TaskJobPayload::json(&task.id, TaskAction::CreatePr),
                )
                .await?;
            Ok(())
        } else {
            let task_id = task.id.clone();
            self.ctx
                .db
                .call(move |db| {
                    db.set_task_error(&task_id, Some("Smoke test failed"))?;
                    db.transition_task(&task_id, TaskStatus::Failed)
                })
                .await?;
            self.ctx
                .enqueue_notifications(
                    task,
                    &config,
                    "task_failed",
                    serde_json::json!({
                        "taskId": task.id,
                        "title": task.title,
                        "error": "Smoke test failed",
                    }),
                )
                .await?;
            Ok(())
        }
    }

    async fn webhook_smoke_test(&self, task: &Task, url: &str) -> bool {
        let client = reqwest::Client::new();
        let payload = serde_json::json!({
            "taskId": task.id,
            "title": task.title,
            "branchName": task.branch_name,
            "repositoryFullName": task.repository_full_name,
        });
        match client.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<serde_json::Value>().await {
                    Ok(body) => body.get("success").and_then(|v| v.as_bool()) != Some(false),
                    Err(_) => true,
                }
            }
            Ok(resp) => {
                tracing::warn!(task_id = %task.id, status = %resp.status(), "Smoke test webhook rejected");
                false
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Smoke test webhook unreachable");
                false
            }
        }
    }
}

/// Best-effort local test run: `npm test` when the tree declares a test
/// script, `cargo test` for Rust trees. Absence of tests is success.
async fn local_smoke_test(path: &std::path::Path) -> bool {
    let command: Option<(&str, Vec<&str>)> = if has_npm_test_script(path).await {
        Some(("npm", vec!["test", "--silent"]))
    } else if path.join("Cargo.toml").exists() {
        Some(("cargo", vec!["test", "--quiet"]))
    } else {
        None
    };
    let Some((program, args)) = command else {
        return true;
    };
    let child = tokio::process::Command::new(program)
        .args(&args)
        .current_dir(path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(SMOKE_TEST_CAP, child).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(_)) => true, // tool not installed: treat as no tests
        Err(_) => false,    // cap exceeded
    }
}

async fn has_npm_test_script(path: &std::path::Path) -> bool {
    match tokio::fs::read_to_string(path.join("package.json")).await {
        Ok(raw) => serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|pkg| pkg.pointer("/scripts/test").cloned())
            .is_some(),
        Err(_) => false,
    }
}

#[async_trait]
impl JobHandler for TaskProcessor {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<()> {
        let payload: TaskJobPayload = serde_json::from_value(job.payload.clone())
            .context("Bad task job payload")?;
        let task = self.load_task(&payload.task_id).await?;
        tracing::info!(task_id = %task.id, action = ?payload.action, status = %task.status, "Task job");

        let result = match payload.action {
            TaskAction::Decompose => self.decompose(&task, &ctx).await,
            TaskAction::Execute => self.execute(&task, &ctx).await,
            TaskAction::Review => self.review(&task, &ctx).await,
            TaskAction::Fix => self.fix(&task, &ctx).await,
            TaskAction::CreatePr => self.create_pr(&task, &ctx).await,
            TaskAction::SmokeTest => self.smoke_test(&task, &ctx).await,
        };

        if let Err(err) = result {
            // Transient failures get the queue's remaining attempts before
            // the task is written off; programmer errors fail immediately.
            let not_retryable = err
                .downcast_ref::<ConductorError>()
                .map(|e| !e.is_retryable())
                .unwrap_or(false);
            let exhausted = job.attempts + 1 >= job.max_attempts;
            if not_retryable || exhausted {
                let message = format!("{:#}", err);
                let task_id = task.id.clone();
                let failed = self
                    .ctx
                    .db
                    .call(move |db| {
                        db.set_task_error(&task_id, Some(&message))?;
                        db.transition_task(&task_id, TaskStatus::Failed)
                    })
                    .await;
                if let Err(e) = failed {
                    tracing::warn!(task_id = %task.id, error = %e, "Could not mark task failed");
                }
            }
            self.ctx
                .metrics
                .increment("conductor_task_failures_total", &[]);
            return Err(err);
        }
        self.ctx.metrics.increment(
            "conductor_task_jobs_total",
            &[("action", action_label(payload.action))],
        );
        Ok(())
    }
}

fn action_label(action: TaskAction) -> &'static str {
    match action {
        TaskAction::Decompose => "decompose",
        TaskAction::Execute => "execute",
        TaskAction::Review => "review",
        TaskAction::Fix => "fix",
        TaskAction::CreatePr => "create_pr",
        TaskAction::SmokeTest => "smoke_test",
    }
}
