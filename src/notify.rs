//! Outbound notification delivery.
//!
//! Consumes the `notifications` queue. Each job references a notification
//! row; delivery marks `sent_at` or records the error and rethrows so the
//! queue retries.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::db::models::{Notification, NotificationChannel};
use crate::db::DbHandle;
use crate::errors::ConductorError;
use crate::queue::{Job, JobContext, JobHandler};

/// Per-channel delivery endpoints, resolved from the repository config at
/// enqueue time and from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct NotifyTargets {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub webhook_url: Option<String>,
}

impl NotifyTargets {
    pub fn from_env() -> Self {
        Self {
            telegram_bot_token: std::env::var("CONDUCTOR_TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("CONDUCTOR_TELEGRAM_CHAT_ID").ok(),
            slack_webhook_url: std::env::var("CONDUCTOR_SLACK_WEBHOOK_URL").ok(),
            webhook_url: std::env::var("CONDUCTOR_NOTIFY_WEBHOOK_URL").ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotifyJobPayload {
    notification_id: String,
}

pub struct NotificationSender {
    db: DbHandle,
    targets: NotifyTargets,
    http: reqwest::Client,
}

impl NotificationSender {
    pub fn new(db: DbHandle, targets: NotifyTargets) -> Self {
        Self {
            db,
            targets,
            http: reqwest::Client::new(),
        }
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let text = render_message(notification);
        // Targets embedded at enqueue time (from the repo config) win over
        // the process-level environment fallbacks.
        let target = notification.payload.get("target");
        match notification.channel {
            NotificationChannel::Telegram => {
                let token = target
                    .and_then(|t| t.get("botToken"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .or_else(|| self.targets.telegram_bot_token.clone());
                let chat_id = target
                    .and_then(|t| t.get("chatId"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .or_else(|| self.targets.telegram_chat_id.clone());
                let (token, chat_id) = match (token, chat_id) {
                    (Some(token), Some(chat_id)) => (token, chat_id),
                    _ => bail!("Telegram notification target is not configured"),
                };
                let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
                let resp = self
                    .http
                    .post(&url)
                    .json(&serde_json::json!({
                        "chat_id": chat_id,
                        "text": text,
                        "parse_mode": "Markdown",
                    }))
                    .send()
                    .await
                    .map_err(transient)?;
                check_status(resp).await
            }
            NotificationChannel::Slack => {
                let url = target
                    .and_then(|t| t.get("webhookUrl"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .or_else(|| self.targets.slack_webhook_url.clone())
                    .context("Slack notification target is not configured")?;
                let resp = self
                    .http
                    .post(&url)
                    .json(&serde_json::json!({"text": text}))
                    .send()
                    .await
                    .map_err(transient)?;
                check_status(resp).await
            }
            NotificationChannel::Webhook => {
                let url = target
                    .and_then(|t| t.get("url"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .or_else(|| self.targets.webhook_url.clone())
                    .context("Webhook notification target is not configured")?;
                let resp = self
                    .http
                    .post(&url)
                    .json(&serde_json::json!({
                        "type": notification.notification_type,
                        "taskId": notification.task_id,
                        "payload": notification.payload,
                    }))
                    .send()
                    .await
                    .map_err(transient)?;
                check_status(resp).await
            }
        }
    }
}

fn transient(e: reqwest::Error) -> anyhow::Error {
    ConductorError::Transient(e.to_string()).into()
}

async fn check_status(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error() {
        return Err(ConductorError::Transient(format!("notification endpoint {}", status)).into());
    }
    bail!("Notification endpoint rejected delivery: {}", status)
}

/// Human-readable message text per notification type.
fn render_message(notification: &Notification) -> String {
    let payload = &notification.payload;
    let title = payload
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("(untitled)");
    match notification.notification_type.as_str() {
        "human_review_needed" => format!(
            "*Conductor needs input* on \"{}\"\n{}",
            title,
            payload
                .get("question")
                .and_then(|v| v.as_str())
                .unwrap_or("")
        ),
        "pr_created" => format!(
            "*Pull request opened* for \"{}\"\n{}",
            title,
            payload.get("url").and_then(|v| v.as_str()).unwrap_or("")
        ),
        "task_completed" => format!("*Task completed*: \"{}\"", title),
        "task_failed" => format!(
            "*Task failed*: \"{}\"\n{}",
            title,
            payload.get("error").and_then(|v| v.as_str()).unwrap_or("")
        ),
        other => format!("Conductor event `{}` for \"{}\"", other, title),
    }
}

#[async_trait]
impl JobHandler for NotificationSender {
    async fn handle(&self, job: Job, _ctx: JobContext) -> Result<()> {
        let payload: NotifyJobPayload = serde_json::from_value(job.payload.clone())
            .context("Bad notification job payload")?;
        let notification = {
            let id = payload.notification_id.clone();
            self.db
                .call(move |db| db.get_notification(&id))
                .await?
                .with_context(|| format!("Notification {} not found", payload.notification_id))?
        };
        if notification.sent_at.is_some() {
            return Ok(());
        }

        match self.deliver(&notification).await {
            Ok(()) => {
                let id = notification.id.clone();
                self.db.call(move |db| db.mark_notification_sent(&id)).await?;
                Ok(())
            }
            Err(err) => {
                let id = notification.id.clone();
                let message = format!("{:#}", err);
                let _ = self
                    .db
                    .call(move |db| db.mark_notification_failed(&id, &message))
                    .await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(kind: &str, payload: serde_json::Value) -> Notification {
        Notification {
            id: "n1".into(),
            task_id: "t1".into(),
            notification_type: kind.into(),
            channel: NotificationChannel::Slack,
            payload,
            sent_at: None,
            error: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn messages_name_the_task() {
        let n = notification(
            "human_review_needed",
            serde_json::json!({"title": "Add hello", "question": "Which db?"}),
        );
        let text = render_message(&n);
        assert!(text.contains("Add hello"));
        assert!(text.contains("Which db?"));

        let n = notification(
            "pr_created",
            serde_json::json!({"title": "Add hello", "url": "https://example.com/pr/1"}),
        );
        assert!(render_message(&n).contains("https://example.com/pr/1"));
    }

    #[test]
    fn unknown_types_still_render() {
        let n = notification("something_else", serde_json::json!({"title": "T"}));
        assert!(render_message(&n).contains("something_else"));
    }
}
