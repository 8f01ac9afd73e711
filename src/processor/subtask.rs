//! Subtask processor: prepares the workspace, runs the coding agent, and
//! records the outcome.
//!
//! The subtask holds the per-task workspace lock for the whole agent run,
//! so parallel subtasks of one task never mutate the tree concurrently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ProcessorContext;
use crate::agent::AgentInvocation;
use crate::config::ConductorConfig;
use crate::db::models::{AgentRunStatus, AgentRunType, Subtask, SubtaskStatus, Task, TaskStatus};
use crate::errors::ConductorError;
use crate::queue::{Job, JobContext, JobHandler};
use crate::workspace::{https_remote, PrepareRequest};

const SUB_AGENT_SYSTEM_PROMPT: &str = "You are a coding agent working on one \
scoped piece of a larger task inside a prepared git checkout. Make the \
changes the work item describes, stay inside your assigned subproject, and \
keep the tree compiling. Do not commit or push; the orchestrator handles \
source control.";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskJobPayload {
    pub subtask_id: String,
    pub task_id: String,
}

pub struct SubtaskProcessor {
    ctx: Arc<ProcessorContext>,
}

impl SubtaskProcessor {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self { ctx }
    }

    async fn run(&self, task: &Task, subtask: &Subtask, job_ctx: &JobContext) -> Result<()> {
        // Idempotent redelivery of a finished subtask is a no-op.
        if subtask.status == SubtaskStatus::Completed {
            return Ok(());
        }

        let mut status = subtask.status;
        if status == SubtaskStatus::Failed {
            // Queue-level retry resets the subtask for another attempt.
            status = self
                .transition_subtask(&subtask.id, SubtaskStatus::Pending)
                .await?;
        }
        if status == SubtaskStatus::Pending {
            self.transition_subtask(&subtask.id, SubtaskStatus::Queued)
                .await?;
        }
        // queued -> running, or running -> running on a redelivery (the
        // metadata below is rewritten idempotently).
        self.transition_subtask(&subtask.id, SubtaskStatus::Running)
            .await?;

        let forge = self.ctx.forge_factory.forge_for(task.installation_id).await?;
        let (repo, config) = self
            .ctx
            .load_repo_config(forge.as_ref(), &task.repository_full_name)
            .await?;

        let run = {
            let task_id = task.id.clone();
            let subtask_id = subtask.id.clone();
            let model = config.agents.sub_agent.model.clone();
            self.ctx
                .db
                .call(move |db| {
                    let run = db.insert_agent_run(
                        &task_id,
                        Some(&subtask_id),
                        AgentRunType::SubAgent,
                        model.as_deref(),
                    )?;
                    db.set_subtask_agent_run(&subtask_id, &run.id)?;
                    Ok(run)
                })
                .await?
        };

        job_ctx.update_progress("workspace", "preparing working tree").await?;
        let token = self
            .ctx
            .tokens
            .installation_token(task.installation_id)
            .await?;
        let req = PrepareRequest {
            task_id: task.id.clone(),
            title: task.title.clone(),
            remote_url: https_remote(&task.repository_full_name, &token),
            default_branch: repo.default_branch.clone(),
            branch_pattern: config.workflow.branch_pattern.clone(),
            branch_name: task.branch_name.clone(),
        };

        // Lock held across preparation AND the agent run: one subtask at a
        // time in this task's tree.
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

        {
            let run_id = run.id.clone();
            self.ctx
                .db
                .call(move |db| db.update_agent_run_status(&run_id, AgentRunStatus::Running))
                .await?;
        }

        job_ctx.update_progress("agent", "coding agent running").await?;
        let prompt = build_subtask_prompt(task, subtask);
        let invocation = AgentInvocation::new(ws.path.clone(), prompt)
            .with_model(config.agents.sub_agent.model.clone())
            .with_max_turns(config.agents.sub_agent.max_turns)
            .with_timeout(Duration::from_secs(config.agents.sub_agent.timeout_minutes * 60))
            .with_disallowed_tools(blocked_tool_patterns(&config))
            .with_system_prompt(SUB_AGENT_SYSTEM_PROMPT);
        let output = self.ctx.invoker.invoke(invocation).await;
        drop(guard);

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                self.fail_subtask(&subtask.id, &run.id, &format!("{:#}", err))
                    .await;
                return Err(err);
            }
        };

        {
            let run_id = run.id.clone();
            let stats = (output.input_tokens, output.output_tokens, output.total_cost);
            let log_tail = tail(&output.output, 20_000);
            self.ctx
                .db
                .call(move |db| {
                    db.record_agent_run_stats(&run_id, stats.0, stats.1, stats.2)?;
                    db.append_agent_run_log(&run_id, &log_tail)
                })
                .await?;
        }
        self.ctx.metrics.increment_by(
            "conductor_agent_tokens_total",
            &[("direction", "input")],
            output.input_tokens.max(0) as u64,
        );
        self.ctx.metrics.increment_by(
            "conductor_agent_tokens_total",
            &[("direction", "output")],
            output.output_tokens.max(0) as u64,
        );

        if output.success {
            let run_id = run.id.clone();
            let subtask_id = subtask.id.clone();
            let files = output.files_modified.clone();
            self.ctx
                .db
                .call(move |db| {
                    db.update_agent_run_status(&run_id, AgentRunStatus::Completed)?;
                    db.set_subtask_files_modified(&subtask_id, &files)?;
                    db.transition_subtask(&subtask_id, SubtaskStatus::Completed)
                })
                .await?;
            tracing::info!(
                subtask_id = %subtask.id,
                files = output.files_modified.len(),
                duration_secs = output.duration.as_secs(),
                "Subtask completed"
            );
            Ok(())
        } else if output.timed_out {
            let seconds = config.agents.sub_agent.timeout_minutes * 60;
            let run_id = run.id.clone();
            self.ctx
                .db
                .call(move |db| db.update_agent_run_status(&run_id, AgentRunStatus::Timeout))
                .await?;
            let err = ConductorError::AgentTimeout { seconds };
            self.mark_subtask_failed(&subtask.id, &err.to_string()).await;
            Err(err.into())
        } else {
            let message = format!(
                "Agent exited with code {}: {}",
                output.exit_code,
                tail(&output.stderr, 500)
            );
            self.fail_subtask(&subtask.id, &run.id, &message).await;
            Err(anyhow::anyhow!(message))
        }
    }

    async fn transition_subtask(&self, id: &str, next: SubtaskStatus) -> Result<SubtaskStatus> {
        let id = id.to_string();
        let subtask = self
            .ctx
            .db
            .call(move |db| db.transition_subtask(&id, next))
            .await?;
        Ok(subtask.status)
    }

    async fn fail_subtask(&self, subtask_id: &str, run_id: &str, message: &str) {
        {
            let run_id = run_id.to_string();
            let _ = self
                .ctx
                .db
                .call(move |db| db.update_agent_run_status(&run_id, AgentRunStatus::Failed))
                .await;
        }
        self.mark_subtask_failed(subtask_id, message).await;
    }

    async fn mark_subtask_failed(&self, subtask_id: &str, message: &str) {
        let subtask_id = subtask_id.to_string();
        let message = message.to_string();
        let result = self
            .ctx
            .db
            .call(move |db| {
                db.set_subtask_error(&subtask_id, Some(&message))?;
                db.transition_subtask(&subtask_id, SubtaskStatus::Failed)
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Could not mark subtask failed");
        }
    }
}

fn build_subtask_prompt(task: &Task, subtask: &Subtask) -> String {
    let scope = if subtask.subproject_path == "." {
        "the repository root".to_string()
    } else {
        format!("the `{}` subproject", subtask.subproject_path)
    };
    format!(
        "## Overall task\n{}\n\n{}\n\n## Your subtask ({})\n### {}\n{}",
        task.title, task.description, scope, subtask.title, subtask.description
    )
}

/// Translate blocked path patterns into tool-policy entries denying writes
/// to those paths.
fn blocked_tool_patterns(config: &ConductorConfig) -> Vec<String> {
    let mut denied = Vec::new();
    for pattern in &config.security.blocked_patterns {
        denied.push(format!("Write({})", pattern));
        denied.push(format!("Edit({})", pattern));
    }
    denied
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let start = s.len() - max;
        // Stay on a char boundary.
        let mut start = start;
        while !s.is_char_boundary(start) {
            start += 1;
        }
        s[start..].to_string()
    }
}

#[async_trait]
impl JobHandler for SubtaskProcessor {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<()> {
        let payload: SubtaskJobPayload = serde_json::from_value(job.payload.clone())
            .context("Bad subtask job payload")?;

        let (task, subtask) = {
            let task_id = payload.task_id.clone();
            let subtask_id = payload.subtask_id.clone();
            self.ctx
                .db
                .call(move |db| {
                    let task = db.get_task(&task_id)?.ok_or(ConductorError::TaskNotFound {
                        id: task_id.clone(),
                    })?;
                    let subtask =
                        db.get_subtask(&subtask_id)?
                            .ok_or(ConductorError::SubtaskNotFound {
                                id: subtask_id.clone(),
                            })?;
                    Ok((task, subtask))
                })
                .await?
        };

        // A task pulled out of execution (failed, redone) stops consuming
        // agent capacity.
        if !matches!(task.status, TaskStatus::Executing | TaskStatus::Decomposing) {
            tracing::debug!(
                subtask_id = %subtask.id,
                task_status = %task.status,
                "Skipping subtask; task is not executing"
            );
            return Ok(());
        }

        self.run(&task, &subtask, &ctx).await
    }
}
