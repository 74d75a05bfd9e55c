//! Thin axum JSON API over the pipeline and scheduler.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ksa_core::RunOutcome;
use ksa_pipeline::{Pipeline, Scheduler};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "ksa-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Arc<Scheduler>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InitializeBody {
    max_pages: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SendCurrentBody {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerBody {
    action: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/notifications/check",
            get(check_usage_handler).post(check_handler),
        )
        .route("/api/notifications/initialize", post(initialize_handler))
        .route("/api/notifications/send-current", post(send_current_handler))
        .route(
            "/api/scheduler",
            get(scheduler_status_handler).post(scheduler_control_handler),
        )
        .route("/api/test/connections", get(test_connections_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "json api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn check_usage_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "POST to run an announcement check.",
        "endpoint": "/api/notifications/check",
        "method": "POST",
    }))
}

async fn check_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.pipeline.check_and_notify().await;
    outcome_response(outcome)
}

async fn initialize_handler(State(state): State<Arc<AppState>>, raw: String) -> Response {
    // tolerate an absent or malformed body, like the trigger inputs do
    let body: InitializeBody = serde_json::from_str(&raw).unwrap_or_default();
    let max_pages = body.max_pages.unwrap_or(5);
    match state.pipeline.initialize(max_pages).await {
        Ok(outcome) => Json(json!({
            "success": true,
            "message": "initialization completed",
            "data": {
                "totalProcessed": outcome.total_processed,
                "ongoingAnnouncements": outcome.ongoing_announcements,
                "uniqueAnnouncements": outcome.unique_announcements,
                "pagesProcessed": outcome.pages_processed,
                "maxPages": outcome.max_pages,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn send_current_handler(State(state): State<Arc<AppState>>, raw: String) -> Response {
    let body: SendCurrentBody = serde_json::from_str(&raw).unwrap_or_default();
    let limit = body.limit.unwrap_or(5);
    let outcome = state.pipeline.send_current(limit).await;
    outcome_response(outcome)
}

async fn scheduler_status_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.scheduler.status().await;
    Json(json!({
        "success": true,
        "message": "scheduler status",
        "data": status,
    }))
}

async fn scheduler_control_handler(State(state): State<Arc<AppState>>, raw: String) -> Response {
    let body: SchedulerBody = serde_json::from_str(&raw).unwrap_or_default();
    match body.action.as_deref() {
        Some("start") => match state.scheduler.start().await {
            Ok(started) => {
                let message = if started {
                    "scheduler started"
                } else {
                    "scheduler already running"
                };
                Json(json!({
                    "success": true,
                    "message": message,
                    "data": state.scheduler.status().await,
                }))
                .into_response()
            }
            Err(err) => server_error(err),
        },
        Some("stop") => match state.scheduler.stop().await {
            Ok(stopped) => {
                let message = if stopped {
                    "scheduler stopped"
                } else {
                    "scheduler not running"
                };
                Json(json!({
                    "success": true,
                    "message": message,
                    "data": state.scheduler.status().await,
                }))
                .into_response()
            }
            Err(err) => server_error(err),
        },
        Some("run-once") => {
            let outcome = state.scheduler.run_once().await;
            outcome_response(outcome)
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "unknown action; use start, stop or run-once",
            })),
        )
            .into_response(),
    }
}

async fn test_connections_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let report = state.pipeline.test_connections().await;
    let success = report.source.success && report.notifier.success && report.storage.success;
    Json(json!({
        "success": success,
        "data": report,
    }))
}

fn outcome_response(outcome: RunOutcome) -> Response {
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let errors = if outcome.errors.is_empty() {
        serde_json::Value::Null
    } else {
        json!(outcome.errors)
    };
    let body = json!({
        "success": outcome.success,
        "message": outcome.message,
        "data": {
            "totalAnnouncements": outcome.total_announcements,
            "ongoingAnnouncements": outcome.ongoing_announcements,
            "newAnnouncements": outcome.new_announcements,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        },
        "errors": errors,
    });
    (status, Json(body)).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "message": err.to_string(),
        })),
    )
        .into_response()
}
