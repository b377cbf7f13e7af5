//! Internal HTTP port: completion callbacks, heartbeats, user responses and
//! activity notifications from the reasoning service and intake path.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collaborators::{CompletionOutcome, CompletionReport};
use crate::engine::TaskOrchestrationEngine;
use crate::error::{Error, TaskError};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TaskOrchestrationEngine>,
}

/// Build the Axum router for the internal port.
pub fn internal_routes(engine: Arc<TaskOrchestrationEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/internal/activity", post(record_activity))
        .route("/internal/tasks/{id}/completion", post(complete_task))
        .route("/internal/tasks/{id}/heartbeat", post(heartbeat))
        .route("/internal/tasks/{id}/respond", post(respond))
        .route("/internal/subjects/{subject}/messages", post(record_message))
        .with_state(AppState { engine })
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn parse_task_id(id: &str) -> Result<Uuid, (StatusCode, Json<serde_json::Value>)> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let engine = &state.engine;
    let breaker = engine.circuit_breaker();
    Json(serde_json::json!({
        "status": "ok",
        "service": "ai-orchestrator",
        "execution_backend": breaker.state(engine.now()),
        "running_heartbeats": engine.heartbeats().tracked(),
    }))
}

// ── Activity ────────────────────────────────────────────────────────────

async fn record_activity(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.notify_interactive_start();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "recorded"})),
    )
}

// ── Task callbacks ──────────────────────────────────────────────────────

async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(outcome): Json<CompletionOutcome>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state
        .engine
        .handle_completion(CompletionReport { task_id, outcome })
        .await
    {
        Ok(effect) => {
            debug!(task_id = %task_id, effect = ?effect, "Completion handled");
            (StatusCode::OK, Json(serde_json::json!({ "effect": effect })))
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to handle completion");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    progress: Option<String>,
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.engine.record_heartbeat(task_id, body.progress).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "recorded"})),
        ),
        Ok(false) => error_body(StatusCode::NOT_FOUND, "Task not found or not executing"),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to record heartbeat");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Deserialize)]
struct RespondRequest {
    response: String,
}

async fn respond(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RespondRequest>,
) -> impl IntoResponse {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.engine.respond_to_user_task(task_id, body.response).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "requeued"})),
        ),
        Err(Error::Task(e @ TaskError::NotFound { .. })) => {
            error_body(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(Error::Task(e @ TaskError::UnexpectedState { .. })) => {
            error_body(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to apply user response");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Intake ──────────────────────────────────────────────────────────────

async fn record_message(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> impl IntoResponse {
    let engine = &state.engine;
    match engine.store().record_message(&subject, engine.now()).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "recorded"})),
        ),
        Err(e) => {
            warn!(subject_id = %subject, error = %e, "Failed to record message");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ProcessingMode, Task, TaskState};
    use crate::testing::TestHarness;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn completion_route_reports_effect() {
        let h = TestHarness::new();
        let task = Task::new("doc", ProcessingMode::Foreground, json!({}), h.clock.now())
            .with_state(TaskState::ReadyForGpu);
        h.insert(&task).await.unwrap();
        h.engine.run_execution_cycle().await.unwrap();

        let app = internal_routes(h.engine.clone());
        let (status, body) = post_json(
            app,
            &format!("/internal/tasks/{}/completion", task.id),
            json!({"outcome": "done", "details": "ok"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["effect"], "completed");
    }

    #[tokio::test]
    async fn malformed_id_is_rejected() {
        let h = TestHarness::new();
        let app = internal_routes(h.engine.clone());
        let (status, _) = post_json(app, "/internal/tasks/not-a-uuid/heartbeat", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn respond_to_task_not_waiting_is_conflict() {
        let h = TestHarness::new();
        let task = Task::new("doc", ProcessingMode::Foreground, json!({}), h.clock.now())
            .with_state(TaskState::ReadyForGpu);
        h.insert(&task).await.unwrap();

        let app = internal_routes(h.engine.clone());
        let (status, _) = post_json(
            app.clone(),
            &format!("/internal/tasks/{}/respond", task.id),
            json!({"response": "yes"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = post_json(
            app,
            &format!("/internal/tasks/{}/respond", Uuid::new_v4()),
            json!({"response": "yes"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn activity_route_records_signal() {
        let h = TestHarness::new();
        let app = internal_routes(h.engine.clone());
        let (status, _) = post_json(app, "/internal/activity", json!({})).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(h.engine.activity().last_activity(), Some(h.clock.now()));
    }
}
