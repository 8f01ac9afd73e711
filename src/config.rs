//! Configuration for Conductor.
//!
//! Two layers:
//! - `ConductorConfig`: the repository-root `.conductor.yml` read from the
//!   target repository's default branch. Everything is optional with
//!   defaults except `version`.
//! - `ServerSettings`: process-level settings (port, database path,
//!   workspaces root, webhook secret) from CLI flags and `CONDUCTOR_*`
//!   environment variables.
//!
//! # Configuration File Format
//!
//! ```yaml
//! version: "1.0"
//! project:
//!   name: my-monorepo
//! subprojects:
//!   autoDetect:
//!     enabled: true
//!     patterns: ["packages/*", "apps/*"]
//!   explicit:
//!     - path: services/api
//!       name: api
//!       language: typescript
//!       testCommand: npm test
//! agents:
//!   master:
//!     model: claude-sonnet-4-5
//!   subAgent:
//!     maxParallel: 5
//!     timeoutMinutes: 30
//! workflow:
//!   triggers:
//!     startColumn: Todo
//!   branchPattern: "conductor/{task_id}/{short_description}"
//!   requireSmokeTest: false
//! notifications:
//!   slack:
//!     enabled: true
//!     webhookUrl: https://hooks.slack.example/T000
//! security:
//!   blockedPatterns: [".env", "secrets/**"]
//! ```

use std::path::PathBuf;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ConductorError;

pub const DEFAULT_MAX_REVIEW_ITERATIONS: i64 = 3;
pub const DEFAULT_REVIEW_PASS_THRESHOLD: usize = 0;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConductorConfig {
    pub version: String,
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub subprojects: SubprojectsSection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub notifications: NotificationsSection,
    #[serde(default)]
    pub security: SecuritySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubprojectsSection {
    #[serde(default)]
    pub auto_detect: AutoDetectSection,
    #[serde(default)]
    pub explicit: Vec<ExplicitSubproject>,
}

impl Default for SubprojectsSection {
    fn default() -> Self {
        Self {
            auto_detect: AutoDetectSection::default(),
            explicit: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDetectSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
}

impl Default for AutoDetectSection {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: default_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplicitSubproject {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentsSection {
    #[serde(default)]
    pub master: AgentSection,
    #[serde(default)]
    pub sub_agent: SubAgentSection,
    #[serde(default)]
    pub code_review: AgentSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentSection {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentSection {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
}

impl Default for SubAgentSection {
    fn default() -> Self {
        Self {
            model: None,
            max_turns: None,
            max_parallel: default_max_parallel(),
            timeout_minutes: default_timeout_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSection {
    #[serde(default)]
    pub triggers: TriggersSection,
    #[serde(default = "default_branch_pattern")]
    pub branch_pattern: String,
    /// Reserved; parsed but not acted upon by the core.
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(default)]
    pub require_smoke_test: bool,
    #[serde(default)]
    pub smoke_test_webhook: Option<String>,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            triggers: TriggersSection::default(),
            branch_pattern: default_branch_pattern(),
            auto_merge: false,
            require_smoke_test: false,
            smoke_test_webhook: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggersSection {
    #[serde(default = "default_start_column")]
    pub start_column: String,
}

impl Default for TriggersSection {
    fn default() -> Self {
        Self {
            start_column: default_start_column(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationsSection {
    #[serde(default)]
    pub telegram: Option<TelegramSection>,
    #[serde(default)]
    pub slack: Option<SlackSection>,
    #[serde(default)]
    pub webhook: Option<WebhookSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramSection {
    #[serde(default)]
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackSection {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSection {
    #[serde(default)]
    pub enabled: bool,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySection {
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    /// Advisory limit for PR assembly; not enforced by the core.
    #[serde(default)]
    pub max_files_per_pr: Option<usize>,
    #[serde(default)]
    pub max_lines_per_pr: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_patterns() -> Vec<String> {
    vec!["packages/*".to_string(), "apps/*".to_string()]
}

fn default_max_parallel() -> usize {
    5
}

fn default_timeout_minutes() -> u64 {
    30
}

fn default_branch_pattern() -> String {
    "conductor/{task_id}/{short_description}".to_string()
}

fn default_start_column() -> String {
    "Todo".to_string()
}

impl ConductorConfig {
    /// Parse `.conductor.yml` content and validate it.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: ConductorConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let version_re = Regex::new(r"^\d+\.\d+$").expect("static regex");
        if !version_re.is_match(&self.version) {
            return Err(ConductorError::Config(format!(
                "version must match MAJOR.MINOR, got '{}'",
                self.version
            ))
            .into());
        }
        let parallel = self.agents.sub_agent.max_parallel;
        if !(1..=10).contains(&parallel) {
            return Err(ConductorError::Config(format!(
                "agents.subAgent.maxParallel must be 1..=10, got {}",
                parallel
            ))
            .into());
        }
        let timeout = self.agents.sub_agent.timeout_minutes;
        if !(1..=120).contains(&timeout) {
            return Err(ConductorError::Config(format!(
                "agents.subAgent.timeoutMinutes must be 1..=120, got {}",
                timeout
            ))
            .into());
        }
        Ok(())
    }

    /// A config with only defaults, used when the repository carries no
    /// `.conductor.yml`.
    pub fn defaults() -> Self {
        Self {
            version: "1.0".to_string(),
            ..Default::default()
        }
    }
}

// ── Server settings ───────────────────────────────────────────────────

/// Process-level settings for the `serve` subcommand.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub db_path: PathBuf,
    pub workspaces_root: PathBuf,
    /// Shared secret for webhook signature verification. When unset,
    /// signatures are not checked (local development only).
    pub webhook_secret: Option<String>,
    /// Command for the coding-agent CLI.
    pub agent_cmd: String,
    /// Bot login used to filter our own comments out of human feedback.
    pub bot_login: String,
    /// Worker concurrency for the `subtasks` queue. The per-repo
    /// `agents.subAgent.maxParallel` still bounds an individual task's
    /// agent pool.
    pub subtask_concurrency: usize,
    /// Delay before a task re-checks its subtasks or children.
    pub poll_delay: std::time::Duration,
    pub dev_mode: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8744,
            db_path: PathBuf::from(".conductor/conductor.db"),
            workspaces_root: PathBuf::from(".conductor/workspaces"),
            webhook_secret: std::env::var("CONDUCTOR_WEBHOOK_SECRET").ok(),
            agent_cmd: std::env::var("CONDUCTOR_AGENT_CMD").unwrap_or_else(|_| "claude".to_string()),
            bot_login: std::env::var("CONDUCTOR_BOT_LOGIN")
                .unwrap_or_else(|_| "conductor[bot]".to_string()),
            subtask_concurrency: std::env::var("CONDUCTOR_SUBTASK_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            poll_delay: std::time::Duration::from_secs(30),
            dev_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = ConductorConfig::parse("version: \"1.0\"\n").unwrap();
        assert!(config.subprojects.auto_detect.enabled);
        assert_eq!(
            config.subprojects.auto_detect.patterns,
            vec!["packages/*", "apps/*"]
        );
        assert_eq!(config.agents.sub_agent.max_parallel, 5);
        assert_eq!(config.agents.sub_agent.timeout_minutes, 30);
        assert_eq!(config.workflow.triggers.start_column, "Todo");
        assert_eq!(
            config.workflow.branch_pattern,
            "conductor/{task_id}/{short_description}"
        );
        assert!(!config.workflow.auto_merge);
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
version: "1.2"
project:
  name: monorepo
subprojects:
  autoDetect:
    enabled: false
    patterns: ["libs/*"]
  explicit:
    - path: services/api
      name: api
      language: typescript
      testCommand: npm test
agents:
  master:
    model: claude-sonnet-4-5
    maxTurns: 30
  subAgent:
    maxParallel: 3
    timeoutMinutes: 45
workflow:
  triggers:
    startColumn: Ready
  branchPattern: "bot/{task_id}"
  requireSmokeTest: true
  smokeTestWebhook: https://smoke.example/run
notifications:
  slack:
    enabled: true
    webhookUrl: https://hooks.slack.example/T0
security:
  blockedPatterns: [".env"]
  maxFilesPerPr: 50
"#;
        let config = ConductorConfig::parse(yaml).unwrap();
        assert!(!config.subprojects.auto_detect.enabled);
        assert_eq!(config.subprojects.explicit[0].name, "api");
        assert_eq!(config.agents.master.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(config.agents.sub_agent.max_parallel, 3);
        assert_eq!(config.workflow.triggers.start_column, "Ready");
        assert!(config.workflow.require_smoke_test);
        assert_eq!(config.security.max_files_per_pr, Some(50));
    }

    #[test]
    fn invalid_version_rejected() {
        assert!(ConductorConfig::parse("version: \"one\"\n").is_err());
        assert!(ConductorConfig::parse("version: \"1\"\n").is_err());
    }

    #[test]
    fn out_of_range_parallelism_rejected() {
        let yaml = "version: \"1.0\"\nagents:\n  subAgent:\n    maxParallel: 11\n";
        assert!(ConductorConfig::parse(yaml).is_err());
        let yaml = "version: \"1.0\"\nagents:\n  subAgent:\n    timeoutMinutes: 0\n";
        assert!(ConductorConfig::parse(yaml).is_err());
    }
}
