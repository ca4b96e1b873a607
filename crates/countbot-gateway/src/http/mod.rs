pub mod channels;
pub mod cron;
pub mod health;
pub mod queue;
pub mod settings;
pub mod tasks;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Render an HTTP error with a Chinese `detail` body.
pub fn error_response(status: u16, detail: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(serde_json::json!({ "detail": detail.into() }))).into_response()
}

/// Map a core error onto its HTTP status and error code.
pub fn core_error_response(e: countbot_core::CountBotError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({ "detail": e.to_string(), "code": e.code() })),
    )
        .into_response()
}

/// Map cron-service errors onto the REST error vocabulary.
pub fn cron_error_response(e: countbot_cron::CronError) -> Response {
    use countbot_cron::CronError;
    match e {
        CronError::InvalidSchedule(expr) => {
            error_response(400, format!("无效的 cron 表达式: {expr}"))
        }
        CronError::JobNotFound { id } => error_response(404, format!("任务不存在: {id}")),
        CronError::BuiltinProtected(field) => {
            error_response(403, format!("内置任务的 {field} 不允许修改"))
        }
        CronError::Database(e) => error_response(500, format!("数据库错误: {e}")),
    }
}
