//! Master decomposition: invoke the agent in analysis mode, validate its
//! JSON plan, and classify the task as *simple* (internal subtasks) or
//! *epic* (child work items).
//!
//! The plan arrives as the first JSON code-fenced block of the agent's
//! output. A plan that fails to parse is replaced by a synthesised
//! single-subtask plan targeting the repository root rather than failing
//! the task.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agent::{AgentInvocation, AgentInvoker};
use crate::config::ConductorConfig;
use crate::db::models::{Subtask, Task};
use crate::db::DbHandle;
use crate::github::SourceForge;
use crate::subproject::{Subproject, SubprojectDetector};

/// Repository paths included in the analysis prompt are capped here.
const MAX_TREE_PATHS: usize = 500;

/// Files pulled into the prompt as repository context when present.
const CONTEXT_FILES: &[&str] = &[
    "README.md",
    "CLAUDE.md",
    "REQUIREMENTS.md",
    "package.json",
    "pnpm-workspace.yaml",
    "turbo.json",
];

const MASTER_SYSTEM_PROMPT: &str = "You are the planning agent of an autonomous \
engineering orchestrator. Analyse the work item against the repository structure \
and produce a JSON plan in a ```json code fence. Use {\"type\": \"simple\", \
\"subtasks\": [...]} for work one coding agent pass per subproject can finish, \
where each subtask has title, description, subprojectPath, and dependsOn (titles \
of prerequisite subtasks). Assign subtasks to disjoint subprojects. Use \
{\"type\": \"epic\", \"children\": [...]} when the item should become separate \
work items, where each child has title, description, and dependsOn (titles of \
prerequisite children). If the item cannot be planned without an answer from a \
human, return {\"needsHumanReview\": true, \"humanReviewQuestion\": \"...\"}. \
Output nothing but the fenced JSON.";

// ── Plan shapes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedSubtask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub subproject_path: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildTaskDefinition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawDecomposition {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    needs_human_review: bool,
    #[serde(default)]
    human_review_question: Option<String>,
    #[serde(default)]
    subtasks: Vec<PlannedSubtask>,
    #[serde(default)]
    children: Vec<ChildTaskDefinition>,
    #[serde(default)]
    summary: Option<String>,
}

/// What the Task Processor acts on after decomposition.
#[derive(Debug)]
pub enum DecompositionOutcome {
    NeedsHumanReview {
        question: String,
    },
    Simple {
        subtasks: Vec<Subtask>,
        affected_subprojects: Vec<String>,
        summary: String,
    },
    Epic {
        children: Vec<ChildTaskDefinition>,
        summary: String,
    },
}

pub struct Decomposer {
    db: DbHandle,
    invoker: Arc<dyn AgentInvoker>,
    /// Directory the analysis-mode agent runs in; it edits nothing.
    scratch_dir: PathBuf,
}

impl Decomposer {
    pub fn new(db: DbHandle, invoker: Arc<dyn AgentInvoker>, scratch_dir: PathBuf) -> Self {
        Self {
            db,
            invoker,
            scratch_dir,
        }
    }

    /// Run the full decomposition procedure for a task. The caller supplies
    /// the repository info and the repo's `.conductor.yml` (or defaults).
    pub async fn decompose(
        &self,
        task: &Task,
        forge: &dyn SourceForge,
        repo: &crate::github::RepoInfo,
        config: &ConductorConfig,
    ) -> Result<DecompositionOutcome> {
        let file_list = forge
            .get_file_list(&task.repository_full_name, &repo.default_branch)
            .await
            .unwrap_or_default();

        let detector = SubprojectDetector::from_config(config);
        let subprojects = detector.detect(&file_list);

        let mut context_sections = String::new();
        for name in CONTEXT_FILES {
            if let Ok(Some(content)) = forge
                .get_file_content(&task.repository_full_name, name, &repo.default_branch)
                .await
            {
                context_sections.push_str(&format!(
                    "\n### {}\n```\n{}\n```\n",
                    name,
                    truncate_chars(&content, 4000)
                ));
            }
        }

        let prompt = build_analysis_prompt(task, &file_list, &subprojects, &context_sections);

        let invocation = AgentInvocation::new(self.scratch_dir.clone(), prompt)
            .with_model(config.agents.master.model.clone())
            .with_max_turns(config.agents.master.max_turns)
            .with_system_prompt(MASTER_SYSTEM_PROMPT);
        let output = self.invoker.invoke(invocation).await?;

        let raw = parse_plan(&output.output).unwrap_or_else(|| {
            tracing::warn!(task_id = %task.id, "Unparseable decomposition; synthesising single-subtask plan");
            RawDecomposition::default()
        });

        if raw.needs_human_review {
            let question = raw
                .human_review_question
                .unwrap_or_else(|| "The planning agent requested clarification.".to_string());
            return Ok(DecompositionOutcome::NeedsHumanReview { question });
        }

        let summary = raw.summary.unwrap_or_default();
        if raw.kind.as_deref() == Some("epic") && !raw.children.is_empty() {
            return Ok(DecompositionOutcome::Epic {
                children: raw.children,
                summary,
            });
        }

        let planned = validate_subtasks(task, raw.subtasks, &detector, &subprojects);
        let subtasks = self.insert_subtasks(task, &planned).await?;
        let affected = subtasks
            .iter()
            .map(|s| s.subproject_path.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        Ok(DecompositionOutcome::Simple {
            subtasks,
            affected_subprojects: affected,
            summary,
        })
    }

    /// Insert the planned subtasks, then resolve dependency titles into the
    /// sibling ids the rows reference. A retried decomposition finds its
    /// still-pending rows by title instead of inserting duplicates.
    async fn insert_subtasks(
        &self,
        task: &Task,
        planned: &[PlannedSubtask],
    ) -> Result<Vec<Subtask>> {
        let task_id = task.id.clone();
        let planned = planned.to_vec();
        self.db
            .call(move |db| {
                use crate::db::models::SubtaskStatus;

                let existing = db.list_subtasks(&task_id)?;
                let mut rows = Vec::new();
                for plan in &planned {
                    if let Some(pending) = existing
                        .iter()
                        .find(|s| s.title == plan.title && s.status == SubtaskStatus::Pending)
                    {
                        rows.push(pending.clone());
                        continue;
                    }
                    let subproject = plan.subproject_path.as_deref().unwrap_or(".");
                    rows.push(db.insert_subtask(
                        &task_id,
                        subproject,
                        &plan.title,
                        &plan.description,
                        &[],
                    )?);
                }
                for (plan, subtask) in planned.iter().zip(rows.iter()) {
                    if plan.depends_on.is_empty() {
                        continue;
                    }
                    let ids: Vec<String> = plan
                        .depends_on
                        .iter()
                        .filter_map(|title| {
                            rows.iter()
                                .find(|s| s.title == *title && s.id != subtask.id)
                                .map(|s| s.id.clone())
                        })
                        .collect();
                    if !ids.is_empty() {
                        db.update_subtask_depends_on(&subtask.id, &ids)?;
                    }
                }
                // Re-read so returned rows carry their resolved dependencies.
                let ids: Vec<String> = rows.iter().map(|s| s.id.clone()).collect();
                Ok(db
                    .list_subtasks(&task_id)?
                    .into_iter()
                    .filter(|s| ids.contains(&s.id))
                    .collect())
            })
            .await
            .context("Failed to insert planned subtasks")
    }
}

/// Drop subtasks with unknown subprojects to `.`, drop unresolvable
/// dependency titles, and synthesise a single root subtask when empty.
fn validate_subtasks(
    task: &Task,
    planned: Vec<PlannedSubtask>,
    detector: &SubprojectDetector,
    subprojects: &[Subproject],
) -> Vec<PlannedSubtask> {
    let titles: Vec<String> = planned.iter().map(|p| p.title.clone()).collect();
    let mut valid: Vec<PlannedSubtask> = planned
        .into_iter()
        .map(|mut plan| {
            let path = plan.subproject_path.take().unwrap_or_else(|| ".".to_string());
            plan.subproject_path = if detector.is_known(subprojects, &path) {
                Some(path)
            } else {
                Some(".".to_string())
            };
            plan.depends_on.retain(|dep| titles.contains(dep));
            plan
        })
        .collect();
    if valid.is_empty() {
        valid.push(PlannedSubtask {
            title: task.title.clone(),
            description: task.description.clone(),
            subproject_path: Some(".".to_string()),
            depends_on: Vec::new(),
        });
    }
    valid
}

fn build_analysis_prompt(
    task: &Task,
    file_list: &[String],
    subprojects: &[Subproject],
    context_sections: &str,
) -> String {
    let tree: Vec<&str> = file_list
        .iter()
        .take(MAX_TREE_PATHS)
        .map(String::as_str)
        .collect();
    let subproject_lines: Vec<String> = subprojects
        .iter()
        .map(|s| format!("- {} ({})", s.path, s.name))
        .collect();
    let human_answer = match &task.human_review_answer {
        Some(answer) => format!("\n## Answer from a human reviewer\n{}\n", answer),
        None => String::new(),
    };
    format!(
        "## Work item\n### {}\n{}\n{}\n## Repository structure ({} paths shown)\n{}\n\n## Subprojects\n{}\n{}",
        task.title,
        task.description,
        human_answer,
        tree.len(),
        tree.join("\n"),
        if subproject_lines.is_empty() {
            "- . (repository root)".to_string()
        } else {
            subproject_lines.join("\n")
        },
        context_sections,
    )
}

/// Extract the first JSON code-fenced block and parse it.
fn parse_plan(output: &str) -> Option<RawDecomposition> {
    let json = extract_json_block(output)?;
    serde_json::from_str(json).ok()
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

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::MockInvoker;
    use crate::agent::AgentOutput;
    use crate::db::models::NewTask;
    use crate::db::ConductorDb;
    use crate::github::mock::MockForge;

    fn db_handle() -> DbHandle {
        DbHandle::new(ConductorDb::new_in_memory().unwrap())
    }

    async fn seed_task(db: &DbHandle) -> Task {
        db.call(|db| {
            db.insert_task(&NewTask {
                github_project_item_id: "PVTI_1".into(),
                github_project_id: "PVT_1".into(),
                repository_full_name: "o/r".into(),
                installation_id: 1,
                title: "Add hello".into(),
                description: "Add hello() to src/index.ts".into(),
                ..Default::default()
            })
        })
        .await
        .unwrap()
    }

    fn fenced(plan: &str) -> AgentOutput {
        MockInvoker::text_response(&format!("Here is the plan:\n```json\n{}\n```\n", plan))
    }

    #[test]
    fn extracts_first_json_fence() {
        let output = "preamble\n```json\n{\"type\": \"simple\"}\n```\ntrailing ```json\n{}\n```";
        assert_eq!(extract_json_block(output), Some("{\"type\": \"simple\"}"));
    }

    #[test]
    fn bare_fence_is_accepted_when_json_shaped() {
        let output = "```\n{\"type\": \"epic\"}\n```";
        assert_eq!(extract_json_block(output), Some("{\"type\": \"epic\"}"));
        assert!(extract_json_block("```\nnot json\n```").is_none());
        assert!(extract_json_block("no fences at all").is_none());
    }

    #[tokio::test]
    async fn simple_plan_inserts_subtasks_with_resolved_deps() {
        let db = db_handle();
        let task = seed_task(&db).await;
        let forge = MockForge {
            file_list: vec![
                "packages/api/src/index.ts".into(),
                "packages/web/app.tsx".into(),
            ],
            ..Default::default()
        };
        let invoker = Arc::new(MockInvoker::with_responses(vec![fenced(
            r#"{"type": "simple", "summary": "two pieces", "subtasks": [
                {"title": "API change", "description": "edit api", "subprojectPath": "packages/api"},
                {"title": "Web change", "description": "edit web", "subprojectPath": "packages/web",
                 "dependsOn": ["API change"]}
            ]}"#,
        )]));
        let decomposer = Decomposer::new(db.clone(), invoker, "/tmp".into());

        let outcome = decomposer.decompose(&task, &forge, &forge.repo.clone(), &ConductorConfig::defaults()).await.unwrap();
        match outcome {
            DecompositionOutcome::Simple {
                subtasks,
                affected_subprojects,
                summary,
            } => {
                assert_eq!(subtasks.len(), 2);
                assert_eq!(summary, "two pieces");
                assert_eq!(affected_subprojects, vec!["packages/api", "packages/web"]);
                let api = subtasks.iter().find(|s| s.title == "API change").unwrap();
                let web = subtasks.iter().find(|s| s.title == "Web change").unwrap();
                assert_eq!(web.depends_on, vec![api.id.clone()]);
                assert!(api.depends_on.is_empty());
            }
            other => panic!("Expected Simple, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_subproject_falls_back_to_root() {
        let db = db_handle();
        let task = seed_task(&db).await;
        let forge = MockForge::new();
        let invoker = Arc::new(MockInvoker::with_responses(vec![fenced(
            r#"{"type": "simple", "subtasks": [
                {"title": "X", "description": "", "subprojectPath": "does/not/exist"}
            ]}"#,
        )]));
        let decomposer = Decomposer::new(db.clone(), invoker, "/tmp".into());
        let outcome = decomposer.decompose(&task, &forge, &forge.repo.clone(), &ConductorConfig::defaults()).await.unwrap();
        match outcome {
            DecompositionOutcome::Simple { subtasks, .. } => {
                assert_eq!(subtasks[0].subproject_path, ".");
            }
            other => panic!("Expected Simple, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_plan_synthesises_single_root_subtask() {
        let db = db_handle();
        let task = seed_task(&db).await;
        let forge = MockForge::new();
        let invoker = Arc::new(MockInvoker::with_responses(vec![MockInvoker::text_response(
            "I could not produce a plan, sorry.",
        )]));
        let decomposer = Decomposer::new(db.clone(), invoker, "/tmp".into());
        let outcome = decomposer.decompose(&task, &forge, &forge.repo.clone(), &ConductorConfig::defaults()).await.unwrap();
        match outcome {
            DecompositionOutcome::Simple { subtasks, .. } => {
                assert_eq!(subtasks.len(), 1);
                assert_eq!(subtasks[0].title, task.title);
                assert_eq!(subtasks[0].subproject_path, ".");
            }
            other => panic!("Expected Simple, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn epic_plan_returns_children_untouched() {
        let db = db_handle();
        let task = seed_task(&db).await;
        let forge = MockForge::new();
        let invoker = Arc::new(MockInvoker::with_responses(vec![fenced(
            r#"{"type": "epic", "summary": "split", "children": [
                {"title": "A", "description": "first"},
                {"title": "B", "description": "second", "dependsOn": ["A"]}
            ]}"#,
        )]));
        let decomposer = Decomposer::new(db.clone(), invoker, "/tmp".into());
        let outcome = decomposer.decompose(&task, &forge, &forge.repo.clone(), &ConductorConfig::defaults()).await.unwrap();
        match outcome {
            DecompositionOutcome::Epic { children, .. } => {
                assert_eq!(children.len(), 2);
                assert_eq!(children[1].depends_on, vec!["A"]);
            }
            other => panic!("Expected Epic, got {:?}", other),
        }
        // Epic decomposition inserts no subtasks.
        let count = db
            .call({
                let task_id = task.id.clone();
                move |db| Ok(db.list_subtasks(&task_id)?.len())
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn human_review_short_circuits() {
        let db = db_handle();
        let task = seed_task(&db).await;
        let forge = MockForge::new();
        let invoker = Arc::new(MockInvoker::with_responses(vec![fenced(
            r#"{"needsHumanReview": true, "humanReviewQuestion": "Which database?"}"#,
        )]));
        let decomposer = Decomposer::new(db.clone(), invoker, "/tmp".into());
        let outcome = decomposer.decompose(&task, &forge, &forge.repo.clone(), &ConductorConfig::defaults()).await.unwrap();
        match outcome {
            DecompositionOutcome::NeedsHumanReview { question } => {
                assert_eq!(question, "Which database?");
            }
            other => panic!("Expected NeedsHumanReview, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn human_answer_is_included_in_prompt() {
        let db = db_handle();
        let mut task = seed_task(&db).await;
        task.human_review_answer = Some("Postgres".to_string());
        let forge = MockForge::new();
        let invoker = Arc::new(MockInvoker::with_responses(vec![fenced(
            r#"{"type": "simple", "subtasks": []}"#,
        )]));
        let decomposer = Decomposer::new(db.clone(), invoker.clone(), "/tmp".into());
        decomposer.decompose(&task, &forge, &forge.repo.clone(), &ConductorConfig::defaults()).await.unwrap();
        let recorded = invoker.invocations();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].prompt.contains("Postgres"));
        assert!(recorded[0].system_prompt.as_deref().unwrap().contains("planning agent"));
    }
}
