//! HTTP surface: webhook ingress, manual triggering, health, metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::db::models::NewTask;
use crate::metrics::{render_exposition, DbAggregates};
use crate::processor::task::{TaskAction, TaskJobPayload};
use crate::processor::ProcessorContext;
use crate::queue::QUEUE_TASKS;
use crate::webhook::{verify_signature, WebhookIntake};

pub struct AppState {
    pub ctx: Arc<ProcessorContext>,
    pub intake: WebhookIntake,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(ctx: Arc<ProcessorContext>) -> Self {
        Self {
            intake: WebhookIntake::new(ctx.clone()),
            ctx,
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid signature".to_string()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    let mut router = Router::new()
        .route("/webhooks", post(receive_webhook))
        .route("/trigger", post(trigger_task))
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health))
        .route("/metrics", get(metrics));
    if state.ctx.settings.dev_mode {
        router = router.layer(CorsLayer::permissive());
    }
    router.with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn start_server(state: SharedState) -> Result<()> {
    let addr = format!("127.0.0.1:{}", state.ctx.settings.port);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, "Conductor listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutting down");
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn receive_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(secret) = &state.ctx.settings.webhook_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        verify_signature(secret, &body, signature).map_err(|_| ApiError::Unauthorized)?;
    }
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))?;

    state
        .intake
        .handle_event(&event, &payload)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    repository_full_name: String,
    installation_id: i64,
    title: String,
    #[serde(default)]
    description: Option<String>,
}

async fn trigger_task(
    State(state): State<SharedState>,
    Json(req): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }
    let new_task = NewTask {
        github_project_item_id: format!("manual-{}", uuid::Uuid::new_v4()),
        github_project_id: String::new(),
        repository_full_name: req.repository_full_name,
        installation_id: req.installation_id,
        title: req.title,
        description: req.description.unwrap_or_default(),
        ..Default::default()
    };
    let task = state
        .ctx
        .db
        .call(move |db| db.insert_task(&new_task))
        .await?;
    state
        .ctx
        .queue
        .enqueue(
            QUEUE_TASKS,
            &format!("decompose-{}", task.id),
            TaskJobPayload::json(&task.id, TaskAction::Decompose),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"taskId": task.id, "status": task.status})),
    ))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn health_ready(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .ctx
        .db
        .call(|db| {
            db.conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(anyhow::Error::from)
        })
        .await?;
    Ok(Json(serde_json::json!({"status": "ready"})))
}

async fn metrics(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let aggregates = state
        .ctx
        .db
        .call(|db| {
            let (input_tokens, output_tokens, total_cost) = db.token_totals()?;
            Ok(DbAggregates {
                tasks_by_status: db.count_tasks_by_status()?,
                subtasks_by_status: db.count_subtasks_by_status()?,
                agent_runs_by_type: db.count_agent_runs_by_type()?,
                input_tokens,
                output_tokens,
                total_cost,
                avg_task_duration_seconds: db.avg_task_duration_seconds()?,
            })
        })
        .await?;
    let body = render_exposition(&aggregates, &state.ctx.metrics);
    Ok((
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::MockInvoker;
    use crate::config::ServerSettings;
    use crate::db::{ConductorDb, DbHandle};
    use crate::github::mock::MockForge;
    use crate::github::StaticForgeFactory;
    use crate::metrics::MetricsCollector;
    use crate::queue::JobQueue;
    use crate::workspace::mock::MockWorkspaces;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct StubTokens;

    #[async_trait::async_trait]
    impl crate::github::TokenProvider for StubTokens {
        async fn installation_token(&self, _installation_id: i64) -> anyhow::Result<String> {
            Ok("test-token".to_string())
        }
    }

    fn test_state(secret: Option<&str>) -> SharedState {
        let db = DbHandle::new(ConductorDb::new_in_memory().unwrap());
        let ctx = Arc::new(ProcessorContext {
            db: db.clone(),
            queue: JobQueue::new(db),
            forge_factory: Arc::new(StaticForgeFactory(Arc::new(MockForge::new()))),
            tokens: Arc::new(StubTokens),
            invoker: Arc::new(MockInvoker::new()),
            workspaces: Arc::new(MockWorkspaces::new()),
            metrics: Arc::new(MetricsCollector::new()),
            settings: ServerSettings {
                webhook_secret: secret.map(String::from),
                ..Default::default()
            },
        });
        Arc::new(AppState::new(ctx))
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let app = build_router(test_state(None));
        for path in ["/health", "/health/ready", "/health/live"] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "path {}", path);
        }
    }

    #[tokio::test]
    async fn trigger_creates_task_and_enqueues_decompose() {
        let state = test_state(None);
        let app = build_router(state.clone());
        let req = Request::builder()
            .method("POST")
            .uri("/trigger")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "repositoryFullName": "o/r",
                    "installationId": 1,
                    "title": "Add hello",
                    "description": "Add hello() to src/index.ts",
                })
                .to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "pending");
        let task_id = body["taskId"].as_str().unwrap().to_string();

        let status = state
            .ctx
            .db
            .call(move |db| db.get_job_status(QUEUE_TASKS, &format!("decompose-{}", task_id)))
            .await
            .unwrap();
        assert_eq!(status, Some(crate::queue::JobStatus::Waiting));
    }

    #[tokio::test]
    async fn trigger_rejects_empty_title() {
        let app = build_router(test_state(None));
        let req = Request::builder()
            .method("POST")
            .uri("/trigger")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"repositoryFullName": "o/r", "installationId": 1, "title": " "})
                    .to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_requires_valid_signature() {
        let app = build_router(test_state(Some("s3cret")));
        let req = Request::builder()
            .method("POST")
            .uri("/webhooks")
            .header("x-github-event", "pull_request")
            .header("x-hub-signature-256", "sha256=deadbeef")
            .body(Body::from("{}"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_ignores_unknown_events() {
        let app = build_router(test_state(None));
        let req = Request::builder()
            .method("POST")
            .uri("/webhooks")
            .header("x-github-event", "star")
            .body(Body::from("{}"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exposes_prometheus_text() {
        let state = test_state(None);
        state
            .ctx
            .db
            .call(|db| {
                db.insert_task(&crate::db::models::NewTask {
                    github_project_item_id: "PVTI_1".into(),
                    github_project_id: "PVT_1".into(),
                    repository_full_name: "o/r".into(),
                    installation_id: 1,
                    title: "T".into(),
                    description: String::new(),
                    ..Default::default()
                })
            })
            .await
            .unwrap();
        let app = build_router(state);
        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("conductor_tasks{status=\"pending\"} 1"));
        assert!(text.contains("conductor_cost_usd_total"));
    }
}
