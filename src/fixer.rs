//! Repair pass: re-invoke the agent against the workspace with the prior
//! review's issues enumerated, and collect the files it touched.

use std::sync::Arc;

use anyhow::Result;

use crate::agent::{AgentInvocation, AgentInvoker};
use crate::db::models::{AgentRunStatus, AgentRunType, ReviewIssue, Task};
use crate::db::DbHandle;
use crate::workspace::{Workspace, WorkspaceProvider};

const FIX_SYSTEM_PROMPT: &str = "You are a coding agent repairing review \
findings in an existing working tree. Fix every listed issue with the \
smallest change that resolves it. Do not refactor unrelated code. Run the \
project's checks when available.";

#[derive(Debug, Clone)]
pub struct FixParams {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout: std::time::Duration,
}

impl Default for FixParams {
    fn default() -> Self {
        Self {
            model: None,
            max_turns: None,
            timeout: crate::agent::runner::DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub success: bool,
    pub files_modified: Vec<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
}

pub struct Fixer {
    db: DbHandle,
    invoker: Arc<dyn AgentInvoker>,
}

impl Fixer {
    pub fn new(db: DbHandle, invoker: Arc<dyn AgentInvoker>) -> Self {
        Self { db, invoker }
    }

    pub async fn fix(
        &self,
        task: &Task,
        issues: &[ReviewIssue],
        workspace: &Workspace,
        workspaces: &dyn WorkspaceProvider,
        params: &FixParams,
    ) -> Result<FixOutcome> {
        let run = {
            let task_id = task.id.clone();
            let model = params.model.clone();
            self.db
                .call(move |db| {
                    let run = db.insert_agent_run(
                        &task_id,
                        None,
                        AgentRunType::SubAgent,
                        model.as_deref(),
                    )?;
                    db.update_agent_run_status(&run.id, AgentRunStatus::Running)?;
                    Ok(run)
                })
                .await?
        };

        let prompt = format!(
            "The previous code review of this branch found the issues below.\n\
             Fix each one.\n\n## Issues\n{}",
            format_issues(issues)
        );

        let invocation = AgentInvocation::new(workspace.path.clone(), prompt)
            .with_model(params.model.clone())
            .with_max_turns(params.max_turns)
            .with_timeout(params.timeout)
            .with_system_prompt(FIX_SYSTEM_PROMPT);
        let output = self.invoker.invoke(invocation).await?;

        // Union of runner-reported paths and what source control sees.
        let mut files_modified = output.files_modified.clone();
        if let Ok(tree_files) = workspaces.changed_files(workspace).await {
            for file in tree_files {
                if !files_modified.contains(&file) {
                    files_modified.push(file);
                }
            }
        }

        {
            let run_id = run.id.clone();
            let stats = (output.input_tokens, output.output_tokens, output.total_cost);
            let status = if output.success {
                AgentRunStatus::Completed
            } else if output.timed_out {
                AgentRunStatus::Timeout
            } else {
                AgentRunStatus::Failed
            };
            self.db
                .call(move |db| {
                    db.record_agent_run_stats(&run_id, stats.0, stats.1, stats.2)?;
                    db.update_agent_run_status(&run_id, status)
                })
                .await?;
        }

        Ok(FixOutcome {
            success: output.success,
            files_modified,
            input_tokens: output.input_tokens,
            output_tokens: output.output_tokens,
            total_cost: output.total_cost,
        })
    }
}

/// One line per issue: `[severity] file[:line] message (suggestion)`.
pub fn format_issues(issues: &[ReviewIssue]) -> String {
    issues
        .iter()
        .map(|issue| {
            let location = match issue.line {
                Some(line) => format!("{}:{}", issue.file, line),
                None => issue.file.clone(),
            };
            let suggestion = match &issue.suggestion {
                Some(s) => format!(" ({})", s),
                None => String::new(),
            };
            format!(
                "[{}] {} {}{}",
                issue.severity.as_str(),
                location,
                issue.message,
                suggestion
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
