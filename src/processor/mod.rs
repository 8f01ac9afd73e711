//! Job processors driving the task and subtask state machines.

pub mod subtask;
pub mod task;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::agent::AgentInvoker;
use crate::config::{ConductorConfig, ServerSettings};
use crate::db::models::{NotificationChannel, Task};
use crate::db::DbHandle;
use crate::github::{ForgeFactory, RepoInfo, SourceForge, TokenProvider};
use crate::metrics::MetricsCollector;
use crate::queue::{JobQueue, QUEUE_NOTIFICATIONS};
use crate::workspace::WorkspaceProvider;

/// Board columns with orchestration meaning.
pub const COLUMN_TODO: &str = "Todo";
pub const COLUMN_IN_PROGRESS: &str = "In Progress";
pub const COLUMN_HUMAN_REVIEW: &str = "Human Review";
pub const COLUMN_DONE: &str = "Done";
pub const COLUMN_REDO: &str = "Redo";

/// Labels applied to issues created for epic children.
pub const CHILD_ISSUE_LABELS: &[&str] = &["conductor", "automated"];

/// Everything the processors need, shared across queue workers.
pub struct ProcessorContext {
    pub db: DbHandle,
    pub queue: JobQueue,
    pub forge_factory: Arc<dyn ForgeFactory>,
    pub tokens: Arc<dyn TokenProvider>,
    pub invoker: Arc<dyn AgentInvoker>,
    pub workspaces: Arc<dyn WorkspaceProvider>,
    pub metrics: Arc<MetricsCollector>,
    pub settings: ServerSettings,
}

impl ProcessorContext {
    /// Fetch repository info and its `.conductor.yml` (defaults when absent
    /// or invalid).
    pub async fn load_repo_config(
        &self,
        forge: &dyn SourceForge,
        full_name: &str,
    ) -> Result<(RepoInfo, ConductorConfig)> {
        let repo = forge.get_repository(full_name).await?;
        let config = match forge
            .get_file_content(full_name, ".conductor.yml", &repo.default_branch)
            .await
        {
            Ok(Some(yaml)) => ConductorConfig::parse(&yaml).unwrap_or_else(|e| {
                tracing::warn!(repo = full_name, error = %e, "Invalid .conductor.yml; using defaults");
                ConductorConfig::defaults()
            }),
            _ => ConductorConfig::defaults(),
        };
        Ok((repo, config))
    }

    /// Move a task's board card. Board moves are cosmetic relative to the
    /// authoritative store, so failures log rather than fail the job; tasks
    /// created via `/trigger` have no card at all.
    pub async fn move_card(&self, forge: &dyn SourceForge, task: &Task, column: &str) {
        if task.github_project_item_id.is_empty()
            || task.github_project_item_id.starts_with("manual-")
        {
            return;
        }
        if let Err(e) = forge
            .move_item_to_column(&task.github_project_id, &task.github_project_item_id, column)
            .await
        {
            tracing::warn!(task_id = %task.id, column, error = %e, "Board card move failed");
        }
    }

    /// Insert a notification row per enabled channel and enqueue delivery.
    pub async fn enqueue_notifications(
        &self,
        task: &Task,
        config: &ConductorConfig,
        notification_type: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        // The repo config decides which channels fire and where they point;
        // the per-channel target rides inside the payload so the sender
        // needs no config fetch of its own.
        let mut channels = Vec::new();
        if let Some(telegram) = &config.notifications.telegram {
            if telegram.enabled {
                channels.push((
                    NotificationChannel::Telegram,
                    serde_json::json!({
                        "botToken": telegram.bot_token,
                        "chatId": telegram.chat_id,
                    }),
                ));
            }
        }
        if let Some(slack) = &config.notifications.slack {
            if slack.enabled {
                channels.push((
                    NotificationChannel::Slack,
                    serde_json::json!({"webhookUrl": slack.webhook_url}),
                ));
            }
        }
        if let Some(webhook) = &config.notifications.webhook {
            if webhook.enabled {
                channels.push((
                    NotificationChannel::Webhook,
                    serde_json::json!({"url": webhook.url}),
                ));
            }
        }
        for (channel, target) in channels {
            let task_id = task.id.clone();
            let notification_type = notification_type.to_string();
            let mut payload = payload.clone();
            if let Some(object) = payload.as_object_mut() {
                object.insert("target".to_string(), target);
            }
            let notification = self
                .db
                .call(move |db| {
                    db.insert_notification(&task_id, &notification_type, channel, &payload)
                })
                .await?;
            self.queue
                .enqueue(
                    QUEUE_NOTIFICATIONS,
                    &format!("notify-{}", notification.id),
                    serde_json::json!({ "notificationId": notification.id }),
                )
                .await?;
        }
        Ok(())
    }

    /// Scratch directory for analysis-mode agent runs.
    pub fn scratch_dir(&self) -> PathBuf {
        self.settings.workspaces_root.join(".scratch")
    }
}

/// A time-salted job id suffix, for re-enqueues while the same logical job
/// id is still live.
pub fn nonce() -> String {
    format!("{}", chrono::Utc::now().timestamp_millis())
}
