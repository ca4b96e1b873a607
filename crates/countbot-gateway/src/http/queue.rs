//! Queue inspection and cancellation endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::app::AppState;

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut stats = state.handler.queue_stats();
    stats["metrics"] = serde_json::to_value(state.bus.metrics()).unwrap_or_default();
    Json(stats)
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub session_id: String,
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CancelRequest>,
) -> Json<serde_json::Value> {
    let cancelled = state.handler.cancel_task(&body.session_id);
    Json(serde_json::json!({
        "success": cancelled,
        "message": if cancelled { "任务已取消" } else { "没有正在执行的任务" },
    }))
}

pub async fn active_tasks(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.handler.active_task_sessions();
    Json(serde_json::json!({
        "active_tasks": sessions,
        "count": sessions.len(),
    }))
}
