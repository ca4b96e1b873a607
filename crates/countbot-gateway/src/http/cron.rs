//! Cron job CRUD and manual execution.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::error;

use countbot_cron::schedule::{describe_schedule, validate_schedule};
use countbot_cron::service::JobUpdate;

use super::{cron_error_response, error_response};
use crate::app::AppState;

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Response {
    match state.cron.list_jobs(false) {
        Ok(jobs) => {
            let jobs: Vec<serde_json::Value> = jobs
                .iter()
                .map(|job| {
                    let mut value = serde_json::to_value(job).unwrap_or_default();
                    value["schedule_description"] =
                        serde_json::json!(describe_schedule(&job.schedule));
                    value
                })
                .collect();
            Json(serde_json::json!({ "jobs": jobs })).into_response()
        }
        Err(e) => cron_error_response(e),
    }
}

pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.cron.get_job(&id) {
        Ok(Some(job)) => Json(serde_json::to_value(&job).unwrap_or_default()).into_response(),
        Ok(None) => error_response(404, format!("任务不存在: {id}")),
        Err(e) => cron_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub schedule: String,
    pub message: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    #[serde(default)]
    pub deliver_response: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJobRequest>,
) -> Response {
    match state.cron.add_job(
        &body.name,
        &body.schedule,
        &body.message,
        body.enabled,
        body.channel.as_deref(),
        body.chat_id.as_deref(),
        body.deliver_response,
    ) {
        Ok(job) => Json(serde_json::to_value(&job).unwrap_or_default()).into_response(),
        Err(e) => cron_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub message: Option<String>,
    pub enabled: Option<bool>,
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub deliver_response: Option<bool>,
}

pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateJobRequest>,
) -> Response {
    let update = JobUpdate {
        name: body.name,
        schedule: body.schedule,
        message: body.message,
        enabled: body.enabled,
        channel: body.channel,
        chat_id: body.chat_id,
        deliver_response: body.deliver_response,
    };
    match state.cron.update_job(&id, update) {
        Ok(job) => Json(serde_json::to_value(&job).unwrap_or_default()).into_response(),
        Err(e) => cron_error_response(e),
    }
}

pub async fn delete_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.cron.delete_job(&id) {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => cron_error_response(e),
    }
}

/// Run a job immediately, bypassing its schedule. Stats are recorded the
/// same way scheduled runs are.
pub async fn run_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let job = match state.cron.get_job(&id) {
        Ok(Some(job)) => job,
        Ok(None) => return error_response(404, format!("任务不存在: {id}")),
        Err(e) => return cron_error_response(e),
    };

    let scheduler = Arc::clone(&state.scheduler);
    let started_at = countbot_cron::schedule::now_shanghai();
    let outcome = scheduler
        .executor()
        .execute(&job, CancellationToken::new())
        .await;

    let (status, error_text, response) = match &outcome {
        Ok(response) => ("ok", None, Some(response.as_str())),
        Err(e) => ("error", Some(e.as_str()), None),
    };
    if let Err(e) = state
        .cron
        .record_execution(&id, started_at, status, error_text, response)
        .await
    {
        error!(job_id = %id, "failed to record manual run: {e}");
    }

    match outcome {
        Ok(response) => {
            Json(serde_json::json!({ "success": true, "response": response })).into_response()
        }
        Err(e) => error_response(500, format!("任务执行失败: {e}")),
    }
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    pub schedule: String,
}

pub async fn validate(Json(body): Json<ValidateRequest>) -> Json<serde_json::Value> {
    let valid = validate_schedule(&body.schedule);
    Json(serde_json::json!({
        "valid": valid,
        "description": if valid { describe_schedule(&body.schedule) } else { String::new() },
    }))
}
