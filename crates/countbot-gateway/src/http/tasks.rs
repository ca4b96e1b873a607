//! Subagent task management endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::error_response;
use crate::app::AppState;

pub async fn list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let tasks = state.subagents.list();
    Json(serde_json::json!({
        "count": tasks.len(),
        "tasks": tasks,
    }))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.subagents.stats()).unwrap_or_default())
}

pub async fn get(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.subagents.get(&id) {
        Some(task) => Json(serde_json::to_value(task).unwrap_or_default()).into_response(),
        None => error_response(404, format!("任务不存在: {id}")),
    }
}

/// DELETE /api/tasks/{id} cancels a running task.
pub async fn cancel(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if state.subagents.get(&id).is_none() {
        return error_response(404, format!("任务不存在: {id}"));
    }
    let cancelled = state.subagents.cancel(&id);
    Json(serde_json::json!({
        "success": cancelled,
        "message": if cancelled { "任务已取消" } else { "任务未在运行" },
    }))
    .into_response()
}

/// POST /api/tasks/{id}/delete removes the record entirely.
pub async fn remove(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if state.subagents.delete(&id) {
        Json(serde_json::json!({ "success": true })).into_response()
    } else {
        error_response(404, format!("任务不存在: {id}"))
    }
}
