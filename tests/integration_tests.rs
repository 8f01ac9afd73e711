//! End-to-end scenarios for the orchestration engine.
//!
//! The harness wires the processors to in-memory doubles (forge, agent,
//! workspaces) and steps the queues deterministically, so whole task
//! lifecycles run without a network, a git remote, or a real agent binary.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use conductor::agent::{AgentInvocation, AgentInvoker, AgentOutput};
use conductor::config::ServerSettings;
use conductor::db::models::{NewTask, ReviewResult, SubtaskStatus, Task, TaskStatus};
use conductor::db::{ConductorDb, DbHandle};
use conductor::github::mock::MockForge;
use conductor::github::{StaticForgeFactory, TokenProvider};
use conductor::metrics::MetricsCollector;
use conductor::processor::subtask::SubtaskProcessor;
use conductor::processor::task::TaskProcessor;
use conductor::processor::ProcessorContext;
use conductor::queue::{
    JobContext, JobHandler, JobQueue, JobStatus, QUEUE_SUBTASKS, QUEUE_TASKS,
};
use conductor::webhook::WebhookIntake;
use conductor::workspace::mock::MockWorkspaces;

// ── Harness ───────────────────────────────────────────────────────────

struct StubTokens;

#[async_trait]
impl TokenProvider for StubTokens {
    async fn installation_token(&self, _installation_id: i64) -> Result<String> {
        Ok("test-token".to_string())
    }
}

/// Routes responses by the kind of invocation (planning / review / coding),
/// with per-title overrides for decomposition plans. Robust against job
/// interleaving, unlike a FIFO script.
#[derive(Default)]
struct RoutedInvoker {
    /// `(needle in prompt, fenced JSON plan)` pairs, first match wins.
    plans: Vec<(String, String)>,
    /// Review verdicts consumed in order; when empty, reviews approve.
    reviews: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl RoutedInvoker {
    fn plan(mut self, needle: &str, plan_json: &str) -> Self {
        self.plans.push((needle.to_string(), plan_json.to_string()));
        self
    }

    fn review(self, verdict_json: &str) -> Self {
        self.reviews.lock().unwrap().push_back(verdict_json.to_string());
        self
    }

    fn fenced(json: &str) -> AgentOutput {
        AgentOutput {
            success: true,
            output: format!("```json\n{}\n```", json),
            input_tokens: 120,
            output_tokens: 40,
            total_cost: 0.002,
            ..Default::default()
        }
    }
}

#[async_trait]
impl AgentInvoker for RoutedInvoker {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentOutput> {
        let system = invocation.system_prompt.as_deref().unwrap_or("");
        if system.contains("planning agent") {
            for (needle, plan) in &self.plans {
                if invocation.prompt.contains(needle) {
                    return Ok(Self::fenced(plan));
                }
            }
            // Unmatched plans fall back to a synthesised single subtask.
            return Ok(AgentOutput {
                success: true,
                output: "no plan".into(),
                ..Default::default()
            });
        }
        if system.contains("code reviewer") {
            let next = self.reviews.lock().unwrap().pop_front();
            let verdict = next.unwrap_or_else(|| {
                r#"{"result": "approved", "summary": "clean", "issues": []}"#.to_string()
            });
            return Ok(Self::fenced(&verdict));
        }
        // Coding / fixing agents report one touched file.
        Ok(AgentOutput {
            success: true,
            output: "done".into(),
            files_modified: vec!["src/index.ts".to_string()],
            input_tokens: 900,
            output_tokens: 250,
            total_cost: 0.01,
            ..Default::default()
        })
    }
}

struct Harness {
    db: DbHandle,
    queue: JobQueue,
    ctx: Arc<ProcessorContext>,
    forge: Arc<MockForge>,
    tasks: TaskProcessor,
    subtasks: SubtaskProcessor,
}

impl Harness {
    fn new(forge: MockForge, invoker: Arc<dyn AgentInvoker>) -> Self {
        let db = DbHandle::new(ConductorDb::new_in_memory().unwrap());
        let queue = JobQueue::new(db.clone());
        let forge = Arc::new(forge);
        let ctx = Arc::new(ProcessorContext {
            db: db.clone(),
            queue: queue.clone(),
            forge_factory: Arc::new(StaticForgeFactory(forge.clone())),
            tokens: Arc::new(StubTokens),
            invoker,
            workspaces: Arc::new(MockWorkspaces::new()),
            metrics: Arc::new(MetricsCollector::new()),
            settings: ServerSettings {
                poll_delay: std::time::Duration::from_millis(1),
                ..Default::default()
            },
        });
        Self {
            db,
            queue: queue.clone(),
            tasks: TaskProcessor::new(ctx.clone()),
            subtasks: SubtaskProcessor::new(ctx.clone()),
            forge,
            ctx,
        }
    }

    async fn seed_task(&self, item_id: &str, title: &str, issue: Option<i64>) -> Task {
        let new_task = NewTask {
            github_project_item_id: item_id.to_string(),
            github_project_id: "PVT_1".to_string(),
            repository_full_name: "o/r".to_string(),
            repository_id: 7,
            installation_id: 1,
            title: title.to_string(),
            description: format!("Description of {}", title),
            linked_github_issue_number: issue,
            ..Default::default()
        };
        self.db.call(move |db| db.insert_task(&new_task)).await.unwrap()
    }

    async fn enqueue_decompose(&self, task: &Task) {
        self.queue
            .enqueue(
                QUEUE_TASKS,
                &format!("decompose-{}", task.id),
                serde_json::json!({"taskId": task.id, "action": "decompose"}),
            )
            .await
            .unwrap();
    }

    /// One deterministic scheduling round: make every waiting job due, then
    /// claim and handle jobs queue by queue. Returns how many jobs ran.
    async fn step(&self) -> usize {
        self.db
            .call(|db| db.release_waiting_jobs())
            .await
            .unwrap();

        let mut ran = 0;
        for queue_name in [QUEUE_TASKS, QUEUE_SUBTASKS] {
            let jobs = self
                .db
                .call(move |db| db.claim_jobs(queue_name, 16))
                .await
                .unwrap();
            for job in jobs {
                ran += 1;
                let row_id = job.id;
                let ctx = JobContext::new(self.db.clone(), row_id);
                let outcome = if queue_name == QUEUE_TASKS {
                    self.tasks.handle(job, ctx).await
                } else {
                    self.subtasks.handle(job, ctx).await
                };
                match outcome {
                    Ok(()) => {
                        self.db
                            .call(move |db| db.complete_job(row_id))
                            .await
                            .unwrap();
                    }
                    Err(err) => {
                        let message = format!("{:#}", err);
                        self.db
                            .call(move |db| {
                                db.record_job_failure(row_id, &message)?;
                                Ok(())
                            })
                            .await
                            .unwrap();
                    }
                }
            }
        }
        ran
    }

    /// Step until the task reaches the wanted status or the round budget
    /// runs out.
    async fn run_until_status(&self, id: &str, want: TaskStatus) {
        self.run_until_status_in(id, &[want]).await;
    }

    async fn run_until_status_in(&self, id: &str, want: &[TaskStatus]) {
        for _ in 0..60 {
            if want.contains(&self.task_status(id).await) {
                return;
            }
            self.step().await;
        }
        panic!(
            "task {} did not reach {:?} (currently {:?})",
            id,
            want,
            self.task_status(id).await
        );
    }

    async fn task(&self, id: &str) -> Task {
        let id = id.to_string();
        self.db
            .call(move |db| db.get_task(&id))
            .await
            .unwrap()
            .unwrap()
    }

    async fn task_status(&self, id: &str) -> TaskStatus {
        self.task(id).await.status
    }
}

fn simple_plan(title: &str) -> String {
    format!(
        r#"{{"type": "simple", "summary": "one piece", "subtasks": [
            {{"title": "Implement {}", "description": "do it", "subprojectPath": "."}}
        ]}}"#,
        title
    )
}

// ── E1: simple task, one subtask, passes review ───────────────────────

#[tokio::test]
async fn simple_task_reaches_pr_created() {
    let invoker = RoutedInvoker::default().plan("Add hello", &simple_plan("hello"));
    let h = Harness::new(MockForge::new(), Arc::new(invoker));

    let task = h.seed_task("PVTI_e1", "Add hello", Some(42)).await;
    h.enqueue_decompose(&task).await;

    h.run_until_status(&task.id, TaskStatus::PrCreated).await;

    let task = h.task(&task.id).await;
    assert!(task.pull_request_url.is_some());
    assert!(task.branch_name.as_deref().unwrap().starts_with("conductor/"));
    assert!(task.error_message.is_none());

    // Exactly one subtask, at the repository root, completed.
    let subtasks = h
        .db
        .call({
            let id = task.id.clone();
            move |db| db.list_subtasks(&id)
        })
        .await
        .unwrap();
    assert_eq!(subtasks.len(), 1);
    assert_eq!(subtasks[0].subproject_path, ".");
    assert_eq!(subtasks[0].status, SubtaskStatus::Completed);
    assert_eq!(subtasks[0].files_modified, vec!["src/index.ts"]);

    // One approved review.
    let reviews = h
        .db
        .call({
            let id = task.id.clone();
            move |db| db.list_code_reviews(&id)
        })
        .await
        .unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].result, ReviewResult::Approved);
    assert_eq!(reviews[0].iteration, 1);

    // Board card went In Progress, then Human Review for the PR.
    let moves = h.forge.moves_for("PVTI_e1");
    assert_eq!(moves.first().map(String::as_str), Some("In Progress"));
    assert_eq!(moves.last().map(String::as_str), Some("Human Review"));

    // A PR row exists and is open.
    let pr = h
        .db
        .call({
            let id = task.id.clone();
            move |db| db.get_pull_request_for_task(&id)
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pr.status, conductor::db::models::PullRequestStatus::Open);
}

// ── E2: review/fix loop, approved on the second try ───────────────────

#[tokio::test]
async fn review_fix_loop_approves_on_second_iteration() {
    let invoker = RoutedInvoker::default()
        .plan("Add hello", &simple_plan("hello"))
        .review(
            r#"{"result": "changes_requested", "summary": "broken",
                "issues": [{"file": "src/index.ts", "line": 3, "severity": "error",
                            "message": "missing null check"}]}"#,
        )
        .review(r#"{"result": "approved", "summary": "fixed", "issues": []}"#);
    let h = Harness::new(MockForge::new(), Arc::new(invoker));

    let task = h.seed_task("PVTI_e2", "Add hello", None).await;
    h.enqueue_decompose(&task).await;

    h.run_until_status(&task.id, TaskStatus::PrCreated).await;

    let reviews = h
        .db
        .call({
            let id = task.id.clone();
            move |db| db.list_code_reviews(&id)
        })
        .await
        .unwrap();
    assert_eq!(reviews.len(), 2);
    assert_eq!(reviews[0].iteration, 1);
    assert_eq!(reviews[0].result, ReviewResult::ChangesRequested);
    assert_eq!(reviews[1].iteration, 2);
    assert_eq!(reviews[1].result, ReviewResult::Approved);

    // The stored issues were cleared when the fix ran.
    assert!(h.task(&task.id).await.error_message.is_none());
}

// ── Review cap: the final changes_requested fails the task ────────────

#[tokio::test]
async fn max_iterations_fails_the_task_without_another_fix() {
    let changes = r#"{"result": "changes_requested", "summary": "still broken",
        "issues": [{"file": "src/index.ts", "severity": "error", "message": "nope"}]}"#;
    let invoker = RoutedInvoker::default()
        .plan("Add hello", &simple_plan("hello"))
        .review(changes)
        .review(changes)
        .review(changes);
    let h = Harness::new(MockForge::new(), Arc::new(invoker));

    let task = h.seed_task("PVTI_cap", "Add hello", None).await;
    h.enqueue_decompose(&task).await;

    h.run_until_status(&task.id, TaskStatus::Failed).await;

    let task = h.task(&task.id).await;
    assert_eq!(
        task.error_message.as_deref(),
        Some("Code review failed after maximum iterations")
    );

    let reviews = h
        .db
        .call({
            let id = task.id.clone();
            move |db| db.list_code_reviews(&id)
        })
        .await
        .unwrap();
    // Three reviews ran; no fix was enqueued after the third.
    assert_eq!(reviews.len(), 3);
    let fix_jobs = h
        .db
        .call(|db| db.count_jobs(QUEUE_TASKS, JobStatus::Waiting))
        .await
        .unwrap();
    assert_eq!(fix_jobs, 0);
}

// ── E3 + E5: epic with a dependent child, closed by PR merges ─────────

#[tokio::test]
async fn epic_children_run_in_dependency_order_and_parent_completes() {
    let invoker = RoutedInvoker::default()
        .plan(
            "Build platform",
            r#"{"type": "epic", "summary": "split", "children": [
                {"title": "Child A", "description": "first half"},
                {"title": "Child B", "description": "second half", "dependsOn": ["Child A"]}
            ]}"#,
        )
        .plan("Child A", &simple_plan("A"))
        .plan("Child B", &simple_plan("B"));
    let h = Harness::new(MockForge::new(), Arc::new(invoker));
    let intake = WebhookIntake::new(h.ctx.clone());

    let parent = h.seed_task("PVTI_epic", "Build platform", Some(7)).await;
    h.enqueue_decompose(&parent).await;
    h.step().await;

    // Expansion: two issues, two child tasks, only A released.
    let issues = h.forge.issues.lock().unwrap().clone();
    assert_eq!(issues.len(), 2);
    assert!(issues.iter().all(|i| i.labels == vec!["conductor", "automated"]));
    assert!(issues[1].body.contains("Depends on:"));

    let children = h
        .db
        .call({
            let id = parent.id.clone();
            move |db| db.list_child_tasks(&id)
        })
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.parent_task_id.as_deref() == Some(parent.id.as_str())));
    let child_a = children.iter().find(|c| c.title == "Child A").unwrap().clone();
    let child_b = children.iter().find(|c| c.title == "Child B").unwrap().clone();
    assert_eq!(child_b.child_dependencies, vec!["Child A"]);

    assert_eq!(h.task_status(&parent.id).await, TaskStatus::Executing);
    assert!(h.task(&parent.id).await.is_epic);
    let a_job = h
        .db
        .call({
            let id = child_a.id.clone();
            move |db| db.get_job_status(QUEUE_TASKS, &format!("decompose-{}", id))
        })
        .await
        .unwrap();
    assert!(a_job.is_some());
    let b_job = h
        .db
        .call({
            let id = child_b.id.clone();
            move |db| db.get_job_status(QUEUE_TASKS, &format!("decompose-{}", id))
        })
        .await
        .unwrap();
    assert!(b_job.is_none(), "Child B must wait for Child A");

    // Drive child A to its pull request.
    h.run_until_status(&child_a.id, TaskStatus::PrCreated).await;

    // Merge A's PR (E5): the child transitions to done.
    let a_pr = h.task(&child_a.id).await.pull_request_number.unwrap();
    let a_branch = h.task(&child_a.id).await.branch_name.unwrap();
    intake
        .handle_event(
            "pull_request",
            &serde_json::json!({
                "action": "closed",
                "repository": {"full_name": "o/r"},
                "installation": {"id": 1},
                "pull_request": {
                    "number": a_pr,
                    "merged": true,
                    "head": {"ref": a_branch, "sha": "feedc0de"}
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(h.task_status(&child_a.id).await, TaskStatus::Done);

    // Parent polling now releases B; drive it to its PR and merge it.
    h.run_until_status(&child_b.id, TaskStatus::PrCreated).await;
    let b_pr = h.task(&child_b.id).await.pull_request_number.unwrap();
    let b_branch = h.task(&child_b.id).await.branch_name.unwrap();
    intake
        .handle_event(
            "pull_request",
            &serde_json::json!({
                "action": "closed",
                "repository": {"full_name": "o/r"},
                "installation": {"id": 1},
                "pull_request": {
                    "number": b_pr,
                    "merged": true,
                    "head": {"ref": b_branch, "sha": "feedc0df"}
                }
            }),
        )
        .await
        .unwrap();

    h.run_until_status(&parent.id, TaskStatus::Done).await;

    // Completion comment lists both child PR URLs.
    let comments = h.forge.posted_comments.lock().unwrap().clone();
    let completion = comments
        .iter()
        .find(|(number, body)| *number == 7 && body.contains("Pull requests"))
        .expect("completion comment");
    assert!(completion.1.contains("/pr/"));
    assert_eq!(h.forge.moves_for("PVTI_epic").last().map(String::as_str), Some("Done"));

    // Replaying the merge webhook after completion is a no-op.
    intake
        .handle_event(
            "pull_request",
            &serde_json::json!({
                "action": "closed",
                "repository": {"full_name": "o/r"},
                "installation": {"id": 1},
                "pull_request": {
                    "number": b_pr,
                    "merged": true,
                    "head": {"ref": h.task(&child_b.id).await.branch_name.unwrap(), "sha": "feedc0df"}
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(h.task_status(&child_b.id).await, TaskStatus::Done);
}

// ── E4: human review round-trip ───────────────────────────────────────

#[tokio::test]
async fn human_review_round_trip_records_answer() {
    // Order matters: the resumed decomposition carries the human answer in
    // its prompt, so the "Postgres" route must win over the title route.
    let invoker = RoutedInvoker::default()
        .plan("Postgres", &simple_plan("db"))
        .plan(
            "Pick a database",
            r#"{"needsHumanReview": true, "humanReviewQuestion": "Which database?"}"#,
        );
    let h = Harness::new(MockForge::new(), Arc::new(invoker));
    let intake = WebhookIntake::new(h.ctx.clone());

    let task = h.seed_task("PVTI_e4", "Pick a database", Some(9)).await;
    h.enqueue_decompose(&task).await;
    h.step().await;

    let current = h.task(&task.id).await;
    assert_eq!(current.status, TaskStatus::HumanReview);
    assert_eq!(current.human_review_question.as_deref(), Some("Which database?"));
    assert_eq!(
        h.forge.moves_for("PVTI_e4").last().map(String::as_str),
        Some("Human Review")
    );
    let comments = h.forge.posted_comments.lock().unwrap().clone();
    assert!(comments.iter().any(|(n, body)| *n == 9 && body.contains("Which database?")));

    // The human answers on the issue and moves the card back to Todo.
    h.forge.issue_comments.lock().unwrap().insert(
        9,
        vec![
            conductor::github::CommentInfo {
                author: "conductor[bot]".into(),
                body: "**Conductor needs your input**".into(),
                created_at: "2026-08-01T10:00:00Z".into(),
            },
            conductor::github::CommentInfo {
                author: "alice".into(),
                body: "Postgres".into(),
                created_at: "2026-08-01T11:00:00Z".into(),
            },
        ],
    );
    h.forge
        .item_statuses
        .lock()
        .unwrap()
        .insert("PVTI_e4".into(), "Todo".into());

    intake
        .handle_event(
            "projects_v2_item",
            &serde_json::json!({
                "action": "edited",
                "installation": {"id": 1},
                "projects_v2_item": {"node_id": "PVTI_e4", "project_node_id": "PVT_1"}
            }),
        )
        .await
        .unwrap();

    let resumed = h.task(&task.id).await;
    assert_eq!(resumed.status, TaskStatus::Pending);
    assert_eq!(resumed.human_review_answer.as_deref(), Some("Postgres"));

    // A fresh decompose job is queued; the answer reaches the planner.
    h.run_until_status_in(
        &task.id,
        &[TaskStatus::Executing, TaskStatus::Review, TaskStatus::PrCreated],
    )
    .await;
}

// ── E6: redo after PR collects reviewer feedback ──────────────────────

#[tokio::test]
async fn redo_after_pr_collects_feedback_and_requeues() {
    let invoker = RoutedInvoker::default().plan("Add hello", &simple_plan("hello"));
    let h = Harness::new(MockForge::new(), Arc::new(invoker));
    let intake = WebhookIntake::new(h.ctx.clone());

    let task = h.seed_task("PVTI_e6", "Add hello", Some(11)).await;
    h.enqueue_decompose(&task).await;
    h.run_until_status(&task.id, TaskStatus::PrCreated).await;

    let pr_number = h.task(&task.id).await.pull_request_number.unwrap();
    h.forge.pr_reviews.lock().unwrap().insert(
        pr_number,
        vec![
            conductor::github::PrReviewInfo {
                author: "alice".into(),
                body: "Please rename the function".into(),
            },
            conductor::github::PrReviewInfo {
                author: "bob".into(),
                body: "And add a test".into(),
            },
        ],
    );
    h.forge
        .item_statuses
        .lock()
        .unwrap()
        .insert("PVTI_e6".into(), "Redo".into());

    intake
        .handle_event(
            "projects_v2_item",
            &serde_json::json!({
                "action": "edited",
                "installation": {"id": 1},
                "projects_v2_item": {"node_id": "PVTI_e6", "project_node_id": "PVT_1"}
            }),
        )
        .await
        .unwrap();

    let redone = h.task(&task.id).await;
    assert_eq!(redone.status, TaskStatus::Pending);
    let answer = redone.human_review_answer.unwrap();
    assert!(answer.contains("Please rename the function"));
    assert!(answer.contains("And add a test"));

    // A salted decompose job was enqueued.
    let waiting = h
        .db
        .call(|db| db.count_jobs(QUEUE_TASKS, JobStatus::Waiting))
        .await
        .unwrap();
    assert!(waiting >= 1);
}

// ── Webhook idempotence ───────────────────────────────────────────────

#[tokio::test]
async fn duplicate_board_deliveries_create_one_task() {
    let invoker = RoutedInvoker::default();
    let h = Harness::new(MockForge::new(), Arc::new(invoker));
    let intake = WebhookIntake::new(h.ctx.clone());

    h.forge
        .item_statuses
        .lock()
        .unwrap()
        .insert("PVTI_dup".into(), "Todo".into());
    h.forge.item_contents.lock().unwrap().insert(
        "PVTI_dup".into(),
        conductor::github::BoardItemContent {
            title: "Add hello".into(),
            body: "body".into(),
            issue_number: Some(3),
            repository_full_name: Some("o/r".into()),
            repository_id: Some(7),
        },
    );

    let payload = serde_json::json!({
        "action": "created",
        "installation": {"id": 1},
        "projects_v2_item": {"node_id": "PVTI_dup", "project_node_id": "PVT_1"}
    });
    intake.handle_event("projects_v2_item", &payload).await.unwrap();
    intake.handle_event("projects_v2_item", &payload).await.unwrap();

    let count = h
        .db
        .call(|db| Ok(db.list_recent_tasks(50)?.len()))
        .await
        .unwrap();
    assert_eq!(count, 1);

    let waiting = h
        .db
        .call(|db| db.count_jobs(QUEUE_TASKS, JobStatus::Waiting))
        .await
        .unwrap();
    assert_eq!(waiting, 1);
}

#[tokio::test]
async fn board_item_without_repository_creates_no_task() {
    let h = Harness::new(MockForge::new(), Arc::new(RoutedInvoker::default()));
    let intake = WebhookIntake::new(h.ctx.clone());

    h.forge
        .item_statuses
        .lock()
        .unwrap()
        .insert("PVTI_orphan".into(), "Todo".into());
    h.forge.item_contents.lock().unwrap().insert(
        "PVTI_orphan".into(),
        conductor::github::BoardItemContent {
            title: "Draft note".into(),
            ..Default::default()
        },
    );

    intake
        .handle_event(
            "projects_v2_item",
            &serde_json::json!({
                "action": "created",
                "installation": {"id": 1},
                "projects_v2_item": {"node_id": "PVTI_orphan", "project_node_id": "PVT_1"}
            }),
        )
        .await
        .unwrap();

    let count = h
        .db
        .call(|db| Ok(db.list_recent_tasks(50)?.len()))
        .await
        .unwrap();
    assert_eq!(count, 0);
}

// ── Comment commands ──────────────────────────────────────────────────

#[tokio::test]
async fn conductor_retry_resets_a_failed_task() {
    let h = Harness::new(MockForge::new(), Arc::new(RoutedInvoker::default()));
    let intake = WebhookIntake::new(h.ctx.clone());

    let task = h.seed_task("PVTI_retry", "Add hello", Some(21)).await;
    h.db
        .call({
            let id = task.id.clone();
            move |db| {
                db.set_task_error(&id, Some("boom"))?;
                db.transition_task(&id, TaskStatus::Failed)
            }
        })
        .await
        .unwrap();

    intake
        .handle_event(
            "issue_comment",
            &serde_json::json!({
                "action": "created",
                "installation": {"id": 1},
                "repository": {"full_name": "o/r"},
                "issue": {"number": 21},
                "comment": {"body": "/conductor retry", "user": {"login": "alice"}}
            }),
        )
        .await
        .unwrap();

    let task = h.task(&task.id).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert!(task.error_message.is_none());

    let replies = h.forge.posted_comments.lock().unwrap().clone();
    assert!(replies.iter().any(|(n, body)| *n == 21 && body.contains("Retrying")));
}

#[tokio::test]
async fn conductor_help_and_unknown_commands_reply() {
    let h = Harness::new(MockForge::new(), Arc::new(RoutedInvoker::default()));
    let intake = WebhookIntake::new(h.ctx.clone());

    for (command, expect) in [("help", "Conductor commands"), ("dance", "Unknown command")] {
        intake
            .handle_event(
                "issue_comment",
                &serde_json::json!({
                    "action": "created",
                    "installation": {"id": 1},
                    "repository": {"full_name": "o/r"},
                    "issue": {"number": 5},
                    "comment": {"body": format!("/conductor {}", command), "user": {"login": "alice"}}
                }),
            )
            .await
            .unwrap();
        let replies = h.forge.posted_comments.lock().unwrap().clone();
        assert!(replies.iter().any(|(n, body)| *n == 5 && body.contains(expect)));
    }
}
