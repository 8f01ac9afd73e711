//! Code review pass over a task's accumulated changes.
//!
//! The reviewer gathers the diff between the base branch and the task
//! branch (falling back to reading full file contents from the workspace),
//! invokes the agent with a review system prompt, and applies the pass
//! threshold before persisting a `CodeReview` row.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agent::{AgentInvocation, AgentInvoker};
use crate::config::{DEFAULT_MAX_REVIEW_ITERATIONS, DEFAULT_REVIEW_PASS_THRESHOLD};
use crate::db::models::{
    AgentRunStatus, AgentRunType, IssueSeverity, ReviewIssue, ReviewResult, Task,
};
use crate::db::DbHandle;
use crate::github::SourceForge;
use crate::workspace::Workspace;

const REVIEW_SYSTEM_PROMPT: &str = "You are a code reviewer for an autonomous \
engineering orchestrator. Review the presented changes for correctness, \
regressions, and missing edge cases. Respond with a single ```json code fence: \
{\"result\": \"approved\" | \"changes_requested\", \"summary\": \"...\", \
\"issues\": [{\"file\": \"...\", \"line\": 1, \"severity\": \"error\" | \
\"warning\" | \"suggestion\", \"message\": \"...\", \"suggestion\": \"...\"}]}. \
Only report issues you are confident about.";

/// How much diff/file content goes into the prompt.
const MAX_DIFF_CHARS: usize = 60_000;

#[derive(Debug, Clone)]
pub struct ReviewParams {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub max_iterations: i64,
    pub pass_threshold: usize,
}

impl Default for ReviewParams {
    fn default() -> Self {
        Self {
            model: None,
            max_turns: None,
            max_iterations: DEFAULT_MAX_REVIEW_ITERATIONS,
            pass_threshold: DEFAULT_REVIEW_PASS_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub result: ReviewResult,
    pub summary: String,
    pub issues: Vec<ReviewIssue>,
    pub iteration: i64,
}

#[derive(Debug, Deserialize)]
struct RawReview {
    result: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    issues: Vec<ReviewIssue>,
}

pub struct Reviewer {
    db: DbHandle,
    invoker: Arc<dyn AgentInvoker>,
}

impl Reviewer {
    pub fn new(db: DbHandle, invoker: Arc<dyn AgentInvoker>) -> Self {
        Self { db, invoker }
    }

    pub async fn review(
        &self,
        task: &Task,
        workspace: &Workspace,
        forge: &dyn SourceForge,
        params: &ReviewParams,
    ) -> Result<ReviewOutcome> {
        let task_id = task.id.clone();
        let existing = self
            .db
            .call(move |db| db.count_code_reviews(&task_id))
            .await?;
        let iteration = existing + 1;

        if iteration > params.max_iterations {
            let summary = "Maximum review iterations reached".to_string();
            let outcome = ReviewOutcome {
                result: ReviewResult::Failed,
                summary: summary.clone(),
                issues: Vec::new(),
                iteration,
            };
            let task_id = task.id.clone();
            self.db
                .call(move |db| {
                    db.insert_code_review(&task_id, None, ReviewResult::Failed, iteration, &summary, &[])
                })
                .await?;
            return Ok(outcome);
        }

        let run = {
            let task_id = task.id.clone();
            let model = params.model.clone();
            self.db
                .call(move |db| {
                    let run = db.insert_agent_run(
                        &task_id,
                        None,
                        AgentRunType::CodeReview,
                        model.as_deref(),
                    )?;
                    db.update_agent_run_status(&run.id, AgentRunStatus::Running)?;
                    Ok(run)
                })
                .await?
        };

        let modified_files = self.modified_files(&task.id).await?;
        let change_context = self
            .gather_change_context(task, workspace, forge, &modified_files)
            .await;

        let prompt = format!(
            "## Work item\n### {}\n{}\n\n## Modified files\n{}\n\n## Changes\n{}",
            task.title,
            task.description,
            if modified_files.is_empty() {
                "(none recorded)".to_string()
            } else {
                modified_files.join("\n")
            },
            change_context,
        );

        let invocation = AgentInvocation::new(workspace.path.clone(), prompt)
            .with_model(params.model.clone())
            .with_max_turns(params.max_turns)
            .with_system_prompt(REVIEW_SYSTEM_PROMPT);
        let output = self.invoker.invoke(invocation).await?;

        let (mut result, summary, issues) = parse_review(&output.output);

        // Pass threshold: reviews whose error count is at or under the
        // threshold are approved regardless of the model's verdict.
        let error_count = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .count();
        if error_count <= params.pass_threshold {
            result = ReviewResult::Approved;
        }

        {
            let task_id = task.id.clone();
            let run_id = run.id.clone();
            let summary = summary.clone();
            let issues = issues.clone();
            let stats = (output.input_tokens, output.output_tokens, output.total_cost);
            let run_status = if output.success {
                AgentRunStatus::Completed
            } else if output.timed_out {
                AgentRunStatus::Timeout
            } else {
                AgentRunStatus::Failed
            };
            self.db
                .call(move |db| {
                    db.record_agent_run_stats(&run_id, stats.0, stats.1, stats.2)?;
                    db.update_agent_run_status(&run_id, run_status)?;
                    db.insert_code_review(&task_id, Some(&run_id), result, iteration, &summary, &issues)
                })
                .await?;
        }

        Ok(ReviewOutcome {
            result,
            summary,
            issues,
            iteration,
        })
    }

    /// Union of files modified across the task's subtasks.
    async fn modified_files(&self, task_id: &str) -> Result<Vec<String>> {
        let task_id = task_id.to_string();
        let subtasks = self.db.call(move |db| db.list_subtasks(&task_id)).await?;
        let mut files = Vec::new();
        for subtask in subtasks {
            for file in subtask.files_modified {
                if !files.contains(&file) {
                    files.push(file);
                }
            }
        }
        Ok(files)
    }

    /// Diffs via the compare endpoint, or full file contents on failure.
    async fn gather_change_context(
        &self,
        task: &Task,
        workspace: &Workspace,
        forge: &dyn SourceForge,
        modified_files: &[String],
    ) -> String {
        match forge
            .compare_commits(
                &task.repository_full_name,
                &workspace.base_branch,
                &workspace.branch_name,
            )
            .await
        {
            Ok(diffs) if !diffs.is_empty() => {
                let mut out = String::new();
                for diff in diffs {
                    out.push_str(&format!("### {} ({})\n", diff.path, diff.status));
                    if let Some(patch) = diff.patch {
                        out.push_str("```diff\n");
                        out.push_str(&patch);
                        out.push_str("\n```\n");
                    }
                    if out.len() > MAX_DIFF_CHARS {
                        out.push_str("\n(truncated)\n");
                        break;
                    }
                }
                out
            }
            _ => {
                let mut out = String::new();
                for file in modified_files {
                    let path = workspace.path.join(file);
                    if let Ok(content) = tokio::fs::read_to_string(&path).await {
                        out.push_str(&format!("### {}\n```\n{}\n```\n", file, content));
                        if out.len() > MAX_DIFF_CHARS {
                            out.push_str("\n(truncated)\n");
                            break;
                        }
                    }
                }
                if out.is_empty() {
                    out.push_str("(no readable changes)");
                }
                out
            }
        }
    }
}

/// Parse the review JSON. Unparseable output becomes a changes-requested
/// review carrying one error-severity issue, so it flows into the fix loop
/// instead of silently passing the threshold.
fn parse_review(output: &str) -> (ReviewResult, String, Vec<ReviewIssue>) {
    let parsed = extract_json_block(output)
        .and_then(|json| serde_json::from_str::<RawReview>(json).ok());
    match parsed {
        Some(raw) => {
            let result = match raw.result.as_str() {
                "approved" => ReviewResult::Approved,
                "failed" => ReviewResult::Failed,
                _ => ReviewResult::ChangesRequested,
            };
            (result, raw.summary, raw.issues)
        }
        None => (
            ReviewResult::ChangesRequested,
            "Review output could not be parsed".to_string(),
            vec![ReviewIssue {
                file: ".".to_string(),
                line: None,
                severity: IssueSeverity::Error,
                message: "Reviewer produced no parseable verdict".to_string(),
                suggestion: None,
            }],
        ),
    }
}

fn extract_json_block(output: &str) -> Option<&str> {
    for fence in ["```json", "```"] {
        if let Some(start) = output.find(fence) {
            let content_start = start + fence.len();
            if let Some(end) = output[content_start..].find("```") {
                let block = output[content_start..content_start + end].trim();
                if block.starts_with('{') {
                    return Some(block);
                }
            }
        }
    }
    None
}
