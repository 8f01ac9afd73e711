//! In-memory source forge for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{
    BoardItemContent, CommentInfo, CreatedPr, FileDiff, IssueInfo, PrReviewInfo, RepoInfo,
    SourceForge,
};

#[derive(Debug, Clone)]
pub struct RecordedIssue {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// A forge whose whole state lives in memory. Every mutation is recorded so
/// tests can assert on the side effects the processors produce.
pub struct MockForge {
    pub repo: RepoInfo,
    pub file_list: Vec<String>,
    pub files: Mutex<HashMap<String, String>>,
    pub issues: Mutex<Vec<RecordedIssue>>,
    pub posted_comments: Mutex<Vec<(i64, String)>>,
    pub issue_comments: Mutex<HashMap<i64, Vec<CommentInfo>>>,
    pub pr_reviews: Mutex<HashMap<i64, Vec<PrReviewInfo>>>,
    pub diffs: Mutex<Vec<FileDiff>>,
    pub created_prs: Mutex<Vec<CreatedPr>>,
    pub item_statuses: Mutex<HashMap<String, String>>,
    pub item_contents: Mutex<HashMap<String, BoardItemContent>>,
    pub moves: Mutex<Vec<(String, String)>>,
    pub added_items: Mutex<Vec<String>>,
    pub next_issue_number: AtomicI64,
    pub next_pr_number: AtomicI64,
}

impl Default for MockForge {
    fn default() -> Self {
        Self {
            repo: RepoInfo {
                id: 7,
                full_name: "o/r".to_string(),
                default_branch: "main".to_string(),
            },
            file_list: vec!["src/index.ts".to_string(), "README.md".to_string()],
            files: Mutex::new(HashMap::new()),
            issues: Mutex::new(Vec::new()),
            posted_comments: Mutex::new(Vec::new()),
            issue_comments: Mutex::new(HashMap::new()),
            pr_reviews: Mutex::new(HashMap::new()),
            diffs: Mutex::new(Vec::new()),
            created_prs: Mutex::new(Vec::new()),
            item_statuses: Mutex::new(HashMap::new()),
            item_contents: Mutex::new(HashMap::new()),
            moves: Mutex::new(Vec::new()),
            added_items: Mutex::new(Vec::new()),
            next_issue_number: AtomicI64::new(100),
            next_pr_number: AtomicI64::new(500),
        }
    }
}

impl MockForge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        self
    }

    /// Columns a card moved through, oldest first.
    pub fn moves_for(&self, item_id: &str) -> Vec<String> {
        self.moves
            .lock()
            .unwrap()
            .iter()
            .filter(|(item, _)| item == item_id)
            .map(|(_, column)| column.clone())
            .collect()
    }
}

#[async_trait]
impl SourceForge for MockForge {
    async fn get_repository(&self, _full_name: &str) -> Result<RepoInfo> {
        Ok(self.repo.clone())
    }

    async fn get_file_list(&self, _full_name: &str, _git_ref: &str) -> Result<Vec<String>> {
        Ok(self.file_list.clone())
    }

    async fn get_file_content(
        &self,
        _full_name: &str,
        path: &str,
        _git_ref: &str,
    ) -> Result<Option<String>> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn create_issue(
        &self,
        _full_name: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<IssueInfo> {
        let number = self.next_issue_number.fetch_add(1, Ordering::SeqCst);
        self.issues.lock().unwrap().push(RecordedIssue {
            number,
            title: title.to_string(),
            body: body.to_string(),
            labels: labels.to_vec(),
        });
        Ok(IssueInfo {
            number,
            node_id: format!("I_node{}", number),
            url: format!("https://example.com/issues/{}", number),
        })
    }

    async fn create_issue_comment(
        &self,
        _full_name: &str,
        issue_number: i64,
        body: &str,
    ) -> Result<()> {
        self.posted_comments
            .lock()
            .unwrap()
            .push((issue_number, body.to_string()));
        Ok(())
    }

    async fn list_issue_comments(
        &self,
        _full_name: &str,
        issue_number: i64,
    ) -> Result<Vec<CommentInfo>> {
        Ok(self
            .issue_comments
            .lock()
            .unwrap()
            .get(&issue_number)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_pr_reviews(
        &self,
        _full_name: &str,
        pr_number: i64,
    ) -> Result<Vec<PrReviewInfo>> {
        Ok(self
            .pr_reviews
            .lock()
            .unwrap()
            .get(&pr_number)
            .cloned()
            .unwrap_or_default())
    }

    async fn compare_commits(
        &self,
        _full_name: &str,
        _base: &str,
        _head: &str,
    ) -> Result<Vec<FileDiff>> {
        Ok(self.diffs.lock().unwrap().clone())
    }

    async fn create_pull_request(
        &self,
        _full_name: &str,
        _title: &str,
        _body: &str,
        _head: &str,
        _base: &str,
    ) -> Result<CreatedPr> {
        let number = self.next_pr_number.fetch_add(1, Ordering::SeqCst);
        let pr = CreatedPr {
            number,
            url: format!("https://example.com/pr/{}", number),
            head_sha: Some("feedc0de".to_string()),
        };
        self.created_prs.lock().unwrap().push(pr.clone());
        Ok(pr)
    }

    async fn add_item_to_project(
        &self,
        _project_id: &str,
        content_node_id: &str,
    ) -> Result<String> {
        let item_id = format!("PVTI_for_{}", content_node_id);
        self.added_items.lock().unwrap().push(item_id.clone());
        Ok(item_id)
    }

    async fn move_item_to_column(
        &self,
        _project_id: &str,
        item_id: &str,
        column: &str,
    ) -> Result<()> {
        self.item_statuses
            .lock()
            .unwrap()
            .insert(item_id.to_string(), column.to_string());
        self.moves
            .lock()
            .unwrap()
            .push((item_id.to_string(), column.to_string()));
        Ok(())
    }

    async fn get_item_status(&self, _project_id: &str, item_id: &str) -> Result<Option<String>> {
        Ok(self.item_statuses.lock().unwrap().get(item_id).cloned())
    }

    async fn get_item_content(&self, item_id: &str) -> Result<BoardItemContent> {
        Ok(self
            .item_contents
            .lock()
            .unwrap()
            .get(item_id)
            .cloned()
            .unwrap_or_default())
    }
}
