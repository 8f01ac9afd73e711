//! Source-forge client: REST for issues, comments, pulls, comparisons and
//! contents; GraphQL for project-board card moves.
//!
//! The orchestration core depends on the `SourceForge` trait; `GithubClient`
//! is the production implementation. Installation tokens come from a
//! `TokenProvider` and are fetched just-in-time, never persisted.

pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::errors::ConductorError;

const API_ROOT: &str = "https://api.github.com";
const GRAPHQL_URL: &str = "https://api.github.com/graphql";
const USER_AGENT: &str = "conductor-orchestrator";

/// Installation-scoped credential source. The production implementation is
/// an external credential service; `EnvTokenProvider` covers development.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn installation_token(&self, installation_id: i64) -> Result<String>;
}

/// Reads a static token from `CONDUCTOR_GITHUB_TOKEN`.
pub struct EnvTokenProvider;

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn installation_token(&self, _installation_id: i64) -> Result<String> {
        std::env::var("CONDUCTOR_GITHUB_TOKEN")
            .context("CONDUCTOR_GITHUB_TOKEN is not set")
    }
}

// ── Data shapes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    pub id: i64,
    pub full_name: String,
    pub default_branch: String,
}

#[derive(Debug, Clone)]
pub struct IssueInfo {
    pub number: i64,
    pub node_id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct CommentInfo {
    pub author: String,
    pub body: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct PrReviewInfo {
    pub author: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct FileDiff {
    pub path: String,
    pub status: String,
    pub patch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedPr {
    pub number: i64,
    pub url: String,
    pub head_sha: Option<String>,
}

/// Content of a board item, resolved through its linked issue.
#[derive(Debug, Clone, Default)]
pub struct BoardItemContent {
    pub title: String,
    pub body: String,
    pub issue_number: Option<i64>,
    pub repository_full_name: Option<String>,
    pub repository_id: Option<i64>,
}

/// Everything the orchestration core needs from the forge. Mockable seam.
#[async_trait]
pub trait SourceForge: Send + Sync {
    async fn get_repository(&self, full_name: &str) -> Result<RepoInfo>;

    /// Best-effort recursive file listing of the default branch, hidden
    /// directories skipped. Truncation upstream is acceptable.
    async fn get_file_list(&self, full_name: &str, git_ref: &str) -> Result<Vec<String>>;

    async fn get_file_content(
        &self,
        full_name: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<String>>;

    async fn create_issue(
        &self,
        full_name: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<IssueInfo>;

    async fn create_issue_comment(
        &self,
        full_name: &str,
        issue_number: i64,
        body: &str,
    ) -> Result<()>;

    async fn list_issue_comments(
        &self,
        full_name: &str,
        issue_number: i64,
    ) -> Result<Vec<CommentInfo>>;

    async fn list_pr_reviews(&self, full_name: &str, pr_number: i64)
        -> Result<Vec<PrReviewInfo>>;

    async fn compare_commits(
        &self,
        full_name: &str,
        base: &str,
        head: &str,
    ) -> Result<Vec<FileDiff>>;

    async fn create_pull_request(
        &self,
        full_name: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<CreatedPr>;

    // Project board (Projects V2)

    async fn add_item_to_project(&self, project_id: &str, content_node_id: &str)
        -> Result<String>;

    async fn move_item_to_column(
        &self,
        project_id: &str,
        item_id: &str,
        column: &str,
    ) -> Result<()>;

    async fn get_item_status(&self, project_id: &str, item_id: &str) -> Result<Option<String>>;

    async fn get_item_content(&self, item_id: &str) -> Result<BoardItemContent>;
}

/// Produces an authenticated forge client for an installation. The
/// production factory mints a fresh installation token per client; tests
/// hand back one shared in-memory forge.
#[async_trait]
pub trait ForgeFactory: Send + Sync {
    async fn forge_for(&self, installation_id: i64) -> Result<Arc<dyn SourceForge>>;
}

pub struct GithubForgeFactory {
    tokens: Arc<dyn TokenProvider>,
}

impl GithubForgeFactory {
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl ForgeFactory for GithubForgeFactory {
    async fn forge_for(&self, installation_id: i64) -> Result<Arc<dyn SourceForge>> {
        let client = GithubClient::for_installation(&self.tokens, installation_id).await?;
        Ok(Arc::new(client))
    }
}

/// Wraps one forge instance; every installation resolves to it.
pub struct StaticForgeFactory(pub Arc<dyn SourceForge>);

#[async_trait]
impl ForgeFactory for StaticForgeFactory {
    async fn forge_for(&self, _installation_id: i64) -> Result<Arc<dyn SourceForge>> {
        Ok(self.0.clone())
    }
}

// ── GitHub implementation ─────────────────────────────────────────────

pub struct GithubClient {
    http: reqwest::Client,
    token: String,
    /// Cache of project id -> (status field id, option name -> option id).
    status_fields: tokio::sync::Mutex<HashMap<String, StatusField>>,
}

#[derive(Debug, Clone)]
struct StatusField {
    field_id: String,
    options: HashMap<String, String>,
}

impl GithubClient {
    pub fn new(token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            status_fields: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Build a client for an installation via the token provider.
    pub async fn for_installation(
        provider: &Arc<dyn TokenProvider>,
        installation_id: i64,
    ) -> Result<Self> {
        let token = provider.installation_token(installation_id).await?;
        Ok(Self::new(token))
    }

    fn rest(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", API_ROOT, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let resp = req.send().await.map_err(to_transient)?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(ConductorError::Transient(format!("GitHub {}", status)).into());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("GitHub API error {}: {}", status, truncate(&body, 300));
        }
        resp.json().await.map_err(to_transient)
    }

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(GRAPHQL_URL)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .json(&json!({"query": query, "variables": variables}))
            .send()
            .await
            .map_err(to_transient)?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(ConductorError::Transient(format!("GitHub GraphQL {}", status)).into());
        }
        let body: serde_json::Value = resp.json().await.map_err(to_transient)?;
        if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                bail!("GitHub GraphQL error: {}", errors[0]);
            }
        }
        Ok(body)
    }

    /// Resolve the `Status` single-select field of a project, cached per
    /// project id.
    async fn status_field(&self, project_id: &str) -> Result<StatusField> {
        {
            let cache = self.status_fields.lock().await;
            if let Some(found) = cache.get(project_id) {
                return Ok(found.clone());
            }
        }
        let body = self
            .graphql(
                "query($projectId: ID!) {
                    node(id: $projectId) {
                        ... on ProjectV2 {
                            fields(first: 50) {
                                nodes {
                                    ... on ProjectV2SingleSelectField {
                                        id
                                        name
                                        options { id name }
                                    }
                                }
                            }
                        }
                    }
                }",
                json!({"projectId": project_id}),
            )
            .await?;
        let field = parse_status_field(&body)
            .with_context(|| format!("Project {} has no Status field", project_id))?;
        self.status_fields
            .lock()
            .await
            .insert(project_id.to_string(), field.clone());
        Ok(field)
    }
}

fn to_transient(e: reqwest::Error) -> anyhow::Error {
    if e.is_timeout() || e.is_connect() {
        ConductorError::Transient(e.to_string()).into()
    } else {
        anyhow::Error::from(e)
    }
}

/// First `max` chars; error bodies can carry multi-byte UTF-8, so the cut
/// must land on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn parse_status_field(body: &serde_json::Value) -> Option<StatusField> {
    let nodes = body
        .pointer("/data/node/fields/nodes")?
        .as_array()?;
    for node in nodes {
        if node.get("name").and_then(|n| n.as_str()) == Some("Status") {
            let field_id = node.get("id")?.as_str()?.to_string();
            let mut options = HashMap::new();
            if let Some(opts) = node.get("options").and_then(|o| o.as_array()) {
                for opt in opts {
                    if let (Some(id), Some(name)) = (
                        opt.get("id").and_then(|v| v.as_str()),
                        opt.get("name").and_then(|v| v.as_str()),
                    ) {
                        options.insert(name.to_string(), id.to_string());
                    }
                }
            }
            return Some(StatusField { field_id, options });
        }
    }
    None
}

/// Filter a recursive tree listing down to visible blobs.
fn visible_blob_paths(tree: &serde_json::Value) -> Vec<String> {
    let mut paths = Vec::new();
    if let Some(entries) = tree.get("tree").and_then(|t| t.as_array()) {
        for entry in entries {
            let is_blob = entry.get("type").and_then(|t| t.as_str()) == Some("blob");
            if !is_blob {
                continue;
            }
            if let Some(path) = entry.get("path").and_then(|p| p.as_str()) {
                let hidden = path.split('/').any(|seg| seg.starts_with('.'));
                if !hidden {
                    paths.push(path.to_string());
                }
            }
        }
    }
    paths
}

#[async_trait]
impl SourceForge for GithubClient {
    async fn get_repository(&self, full_name: &str) -> Result<RepoInfo> {
        let body = self
            .send_json(self.rest(reqwest::Method::GET, &format!("/repos/{}", full_name)))
            .await?;
        let info: RepoInfo = serde_json::from_value(body).context("Bad repository response")?;
        Ok(info)
    }

    async fn get_file_list(&self, full_name: &str, git_ref: &str) -> Result<Vec<String>> {
        let body = self
            .send_json(self.rest(
                reqwest::Method::GET,
                &format!("/repos/{}/git/trees/{}?recursive=1", full_name, git_ref),
            ))
            .await?;
        Ok(visible_blob_paths(&body))
    }

    async fn get_file_content(
        &self,
        full_name: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<String>> {
        let resp = self
            .rest(
                reqwest::Method::GET,
                &format!("/repos/{}/contents/{}?ref={}", full_name, path, git_ref),
            )
            .header("Accept", "application/vnd.github.raw+json")
            .send()
            .await
            .map_err(to_transient)?;
        match resp.status() {
            s if s.is_success() => Ok(Some(resp.text().await.map_err(to_transient)?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_server_error() => {
                Err(ConductorError::Transient(format!("GitHub {}", s)).into())
            }
            s => bail!("GitHub contents error {} for {}", s, path),
        }
    }

    async fn create_issue(
        &self,
        full_name: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<IssueInfo> {
        let response = self
            .send_json(
                self.rest(reqwest::Method::POST, &format!("/repos/{}/issues", full_name))
                    .json(&json!({"title": title, "body": body, "labels": labels})),
            )
            .await?;
        Ok(IssueInfo {
            number: response
                .get("number")
                .and_then(|n| n.as_i64())
                .context("Issue response missing number")?,
            node_id: response
                .get("node_id")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
            url: response
                .get("html_url")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn create_issue_comment(
        &self,
        full_name: &str,
        issue_number: i64,
        body: &str,
    ) -> Result<()> {
        self.send_json(
            self.rest(
                reqwest::Method::POST,
                &format!("/repos/{}/issues/{}/comments", full_name, issue_number),
            )
            .json(&json!({"body": body})),
        )
        .await?;
        Ok(())
    }

    async fn list_issue_comments(
        &self,
        full_name: &str,
        issue_number: i64,
    ) -> Result<Vec<CommentInfo>> {
        let body = self
            .send_json(self.rest(
                reqwest::Method::GET,
                &format!(
                    "/repos/{}/issues/{}/comments?per_page=50",
                    full_name, issue_number
                ),
            ))
            .await?;
        let mut comments = Vec::new();
        if let Some(entries) = body.as_array() {
            for entry in entries {
                comments.push(CommentInfo {
                    author: entry
                        .pointer("/user/login")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    body: entry
                        .get("body")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    created_at: entry
                        .get("created_at")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        Ok(comments)
    }

    async fn list_pr_reviews(
        &self,
        full_name: &str,
        pr_number: i64,
    ) -> Result<Vec<PrReviewInfo>> {
        let body = self
            .send_json(self.rest(
                reqwest::Method::GET,
                &format!("/repos/{}/pulls/{}/reviews?per_page=50", full_name, pr_number),
            ))
            .await?;
        let mut reviews = Vec::new();
        if let Some(entries) = body.as_array() {
            for entry in entries {
                reviews.push(PrReviewInfo {
                    author: entry
                        .pointer("/user/login")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    body: entry
                        .get("body")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        Ok(reviews)
    }

    async fn compare_commits(
        &self,
        full_name: &str,
        base: &str,
        head: &str,
    ) -> Result<Vec<FileDiff>> {
        let body = self
            .send_json(self.rest(
                reqwest::Method::GET,
                &format!("/repos/{}/compare/{}...{}", full_name, base, head),
            ))
            .await?;
        let mut diffs = Vec::new();
        if let Some(files) = body.get("files").and_then(|f| f.as_array()) {
            for file in files {
                diffs.push(FileDiff {
                    path: file
                        .get("filename")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    status: file
                        .get("status")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    patch: file
                        .get("patch")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                });
            }
        }
        Ok(diffs)
    }

    async fn create_pull_request(
        &self,
        full_name: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<CreatedPr> {
        let response = self
            .send_json(
                self.rest(reqwest::Method::POST, &format!("/repos/{}/pulls", full_name))
                    .json(&json!({"title": title, "body": body, "head": head, "base": base})),
            )
            .await?;
        Ok(CreatedPr {
            number: response
                .get("number")
                .and_then(|n| n.as_i64())
                .context("PR response missing number")?,
            url: response
                .get("html_url")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
            head_sha: response
                .pointer("/head/sha")
                .and_then(|n| n.as_str())
                .map(String::from),
        })
    }

    async fn add_item_to_project(
        &self,
        project_id: &str,
        content_node_id: &str,
    ) -> Result<String> {
        let body = self
            .graphql(
                "mutation($projectId: ID!, $contentId: ID!) {
                    addProjectV2ItemById(input: {projectId: $projectId, contentId: $contentId}) {
                        item { id }
                    }
                }",
                json!({"projectId": project_id, "contentId": content_node_id}),
            )
            .await?;
        body.pointer("/data/addProjectV2ItemById/item/id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .context("addProjectV2ItemById returned no item id")
    }

    async fn move_item_to_column(
        &self,
        project_id: &str,
        item_id: &str,
        column: &str,
    ) -> Result<()> {
        let field = self.status_field(project_id).await?;
        let option_id = field
            .options
            .get(column)
            .with_context(|| format!("Project has no status option '{}'", column))?;
        self.graphql(
            "mutation($projectId: ID!, $itemId: ID!, $fieldId: ID!, $optionId: String!) {
                updateProjectV2ItemFieldValue(input: {
                    projectId: $projectId,
                    itemId: $itemId,
                    fieldId: $fieldId,
                    value: {singleSelectOptionId: $optionId}
                }) { projectV2Item { id } }
            }",
            json!({
                "projectId": project_id,
                "itemId": item_id,
                "fieldId": field.field_id,
                "optionId": option_id,
            }),
        )
        .await?;
        Ok(())
    }

    async fn get_item_status(&self, project_id: &str, item_id: &str) -> Result<Option<String>> {
        let _ = project_id;
        let body = self
            .graphql(
                "query($itemId: ID!) {
                    node(id: $itemId) {
                        ... on ProjectV2Item {
                            fieldValueByName(name: \"Status\") {
                                ... on ProjectV2ItemFieldSingleSelectValue { name }
                            }
                        }
                    }
                }",
                json!({"itemId": item_id}),
            )
            .await?;
        Ok(body
            .pointer("/data/node/fieldValueByName/name")
            .and_then(|v| v.as_str())
            .map(String::from))
    }

    async fn get_item_content(&self, item_id: &str) -> Result<BoardItemContent> {
        let body = self
            .graphql(
                "query($itemId: ID!) {
                    node(id: $itemId) {
                        ... on ProjectV2Item {
                            content {
                                ... on Issue {
                                    title
                                    body
                                    number
                                    repository { nameWithOwner databaseId }
                                }
                                ... on DraftIssue { title body }
                            }
                        }
                    }
                }",
                json!({"itemId": item_id}),
            )
            .await?;
        let content = body
            .pointer("/data/node/content")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(BoardItemContent {
            title: content
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            body: content
                .get("body")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            issue_number: content.get("number").and_then(|v| v.as_i64()),
            repository_full_name: content
                .pointer("/repository/nameWithOwner")
                .and_then(|v| v.as_str())
                .map(String::from),
            repository_id: content
                .pointer("/repository/databaseId")
                .and_then(|v| v.as_i64()),
        })
    }
}
