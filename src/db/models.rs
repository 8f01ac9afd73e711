use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Task ──────────────────────────────────────────────────────────────

/// Lifecycle states of a task. Transitions are validated against
/// `can_transition_to`; anything else is a programmer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Decomposing,
    Executing,
    Review,
    HumanReview,
    PrCreated,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Decomposing => "decomposing",
            Self::Executing => "executing",
            Self::Review => "review",
            Self::HumanReview => "human_review",
            Self::PrCreated => "pr_created",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// The task state graph.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Decomposing)
                | (Pending, Failed)
                | (Decomposing, Executing)
                | (Decomposing, HumanReview)
                | (Decomposing, Failed)
                | (Executing, Review)
                | (Executing, HumanReview)
                | (Executing, Failed)
                // Epic parents complete straight from executing once every
                // child is done.
                | (Executing, Done)
                | (Review, PrCreated)
                | (Review, Executing)
                | (Review, HumanReview)
                | (Review, Failed)
                | (HumanReview, Decomposing)
                | (HumanReview, Executing)
                | (HumanReview, Failed)
                | (HumanReview, Pending)
                | (PrCreated, Done)
                | (PrCreated, HumanReview)
                | (PrCreated, Failed)
                | (PrCreated, Pending)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "decomposing" => Ok(Self::Decomposing),
            "executing" => Ok(Self::Executing),
            "review" => Ok(Self::Review),
            "human_review" => Ok(Self::HumanReview),
            "pr_created" => Ok(Self::PrCreated),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// A unit of human intent tracked on the project board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub github_project_item_id: String,
    pub github_project_id: String,
    pub repository_full_name: String,
    pub repository_id: i64,
    pub installation_id: i64,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub branch_name: Option<String>,
    pub pull_request_number: Option<i64>,
    pub pull_request_url: Option<String>,
    /// May transiently hold a serialised list of review issues between
    /// the review and fix stages.
    pub error_message: Option<String>,
    pub human_review_question: Option<String>,
    pub human_review_answer: Option<String>,
    pub retry_count: i64,
    pub is_epic: bool,
    pub parent_task_id: Option<String>,
    pub linked_github_issue_number: Option<i64>,
    /// Titles of prerequisite sibling tasks (epic children only).
    pub child_dependencies: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Fields needed to insert a new task; the rest is defaulted by the store.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub github_project_item_id: String,
    pub github_project_id: String,
    pub repository_full_name: String,
    pub repository_id: i64,
    pub installation_id: i64,
    pub title: String,
    pub description: String,
    pub parent_task_id: Option<String>,
    pub linked_github_issue_number: Option<i64>,
    pub child_dependencies: Vec<String>,
}

// ── Subtask ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// The subtask state graph. `running -> running` is permitted for
    /// idempotent metadata updates after queue retries.
    pub fn can_transition_to(&self, next: SubtaskStatus) -> bool {
        use SubtaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Running)
                | (Pending, Failed)
                | (Queued, Running)
                | (Queued, Failed)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid subtask status: {}", s)),
        }
    }
}

/// A unit of agent work within one task, scoped to a subproject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub task_id: String,
    pub subproject_path: String,
    pub title: String,
    pub description: String,
    pub status: SubtaskStatus,
    /// Ids of prerequisite sibling subtasks.
    pub depends_on: Vec<String>,
    pub agent_run_id: Option<String>,
    pub files_modified: Vec<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

// ── Agent runs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunType {
    Master,
    SubAgent,
    CodeReview,
}

impl AgentRunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::SubAgent => "sub_agent",
            Self::CodeReview => "code_review",
        }
    }
}

impl FromStr for AgentRunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Self::Master),
            "sub_agent" => Ok(Self::SubAgent),
            "code_review" => Ok(Self::CodeReview),
            _ => Err(format!("Invalid agent run type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl FromStr for AgentRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid agent run status: {}", s)),
        }
    }
}

/// One invocation of the external coding agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub task_id: String,
    pub subtask_id: Option<String>,
    pub run_type: AgentRunType,
    pub status: AgentRunStatus,
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    /// Append-only log text.
    pub log: String,
    pub started_at: String,
    pub completed_at: Option<String>,
}

// ── Pull requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestStatus {
    Open,
    Merged,
    Closed,
}

impl PullRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for PullRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid pull request status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
    pub task_id: String,
    pub repository_full_name: String,
    pub pr_number: i64,
    pub title: String,
    pub body: String,
    pub branch_name: String,
    pub head_sha: Option<String>,
    pub url: String,
    pub status: PullRequestStatus,
    pub reviews_passed: bool,
    pub check_status: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ── Code reviews ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewResult {
    Approved,
    ChangesRequested,
    Failed,
}

impl ReviewResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ReviewResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "changes_requested" => Ok(Self::ChangesRequested),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid review result: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
    Suggestion,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Suggestion => "suggestion",
        }
    }
}

/// A single finding from a review pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Outcome of one review pass. Iterations are 1-based and strictly
/// monotonic per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeReview {
    pub id: String,
    pub task_id: String,
    pub agent_run_id: Option<String>,
    pub result: ReviewResult,
    pub iteration: i64,
    pub summary: String,
    pub issues: Vec<ReviewIssue>,
    pub created_at: String,
}

// ── Notifications ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Telegram,
    Slack,
    Webhook,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Webhook => "webhook",
        }
    }
}

impl FromStr for NotificationChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Self::Telegram),
            "slack" => Ok(Self::Slack),
            "webhook" => Ok(Self::Webhook),
            _ => Err(format!("Invalid notification channel: {}", s)),
        }
    }
}

/// One outbound message queued for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub task_id: String,
    pub notification_type: String,
    pub channel: NotificationChannel,
    pub payload: serde_json::Value,
    pub sent_at: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Decomposing,
            TaskStatus::Executing,
            TaskStatus::Review,
            TaskStatus::HumanReview,
            TaskStatus::PrCreated,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()).unwrap(), s);
        }
        assert!(TaskStatus::from_str("bogus").is_err());
    }

    #[test]
    fn task_graph_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Decomposing));
        assert!(Decomposing.can_transition_to(HumanReview));
        assert!(Review.can_transition_to(Executing));
        assert!(Review.can_transition_to(PrCreated));
        assert!(PrCreated.can_transition_to(Done));
        assert!(Failed.can_transition_to(Pending));
        // Epic completion and board-driven returns to pending
        assert!(Executing.can_transition_to(Done));
        assert!(HumanReview.can_transition_to(Pending));
        assert!(PrCreated.can_transition_to(Pending));

        // Not in the table
        assert!(!Done.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Review));
        assert!(!Executing.can_transition_to(PrCreated));
        assert!(!Review.can_transition_to(Review));
    }

    #[test]
    fn subtask_graph_edges() {
        use SubtaskStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Pending));
    }

    #[test]
    fn review_issue_deserialises_with_optional_fields() {
        let json = r#"{"file":"src/lib.rs","severity":"error","message":"missing check"}"#;
        let issue: ReviewIssue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.file, "src/lib.rs");
        assert_eq!(issue.severity, IssueSeverity::Error);
        assert!(issue.line.is_none());
        assert!(issue.suggestion.is_none());
    }

    #[test]
    fn done_is_the_only_terminal_task_status() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal()); // failed -> pending retry edge
    }
}
