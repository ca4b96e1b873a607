//! Channel listing, status, testing, and config endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use countbot_core::CountBotError;

use super::{core_error_response, error_response};
use crate::app::AppState;

const CHANNEL_NAMES: [&str; 6] = ["telegram", "discord", "qq", "wechat", "dingtalk", "feishu"];

pub async fn list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = state.config.read().unwrap();
    let channels: Vec<serde_json::Value> = CHANNEL_NAMES
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "enabled": channel_enabled(&config.channels, name),
                "registered": state.supervisor.get(name).is_some(),
            })
        })
        .collect();
    Json(serde_json::json!({ "channels": channels }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.supervisor.statuses()).unwrap_or_default())
}

#[derive(Deserialize)]
pub struct TestRequest {
    pub channel: String,
}

pub async fn test(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestRequest>,
) -> Json<serde_json::Value> {
    let result = state.supervisor.test_channel(&body.channel).await;
    Json(serde_json::to_value(result).unwrap_or_default())
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    pub channel: String,
    pub config: serde_json::Value,
}

/// Persist a channel's configuration. Takes effect on restart — adapters are
/// constructed from config at startup.
pub async fn update(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateRequest>,
) -> Response {
    if !CHANNEL_NAMES.contains(&body.channel.as_str()) {
        return core_error_response(CountBotError::InvalidInput(format!(
            "未知渠道: {}",
            body.channel
        )));
    }
    let key = format!("channels.{}", body.channel);
    match state.settings.set(&key, &body.config) {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "message": "配置已保存，重启后生效",
        }))
        .into_response(),
        Err(e) => error_response(500, format!("保存失败: {e}")),
    }
}

pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> Response {
    if !CHANNEL_NAMES.contains(&channel.as_str()) {
        return core_error_response(CountBotError::NotFound(format!("未知渠道: {channel}")));
    }
    let config = state.config.read().unwrap();
    let value = match channel.as_str() {
        "telegram" => serde_json::to_value(&config.channels.telegram),
        "discord" => serde_json::to_value(&config.channels.discord),
        "qq" => serde_json::to_value(&config.channels.qq),
        "wechat" => serde_json::to_value(&config.channels.wechat),
        "dingtalk" => serde_json::to_value(&config.channels.dingtalk),
        "feishu" => serde_json::to_value(&config.channels.feishu),
        _ => unreachable!(),
    };
    match value {
        Ok(mut value) => {
            redact_secrets(&mut value);
            Json(value).into_response()
        }
        Err(e) => error_response(500, format!("序列化失败: {e}")),
    }
}

fn channel_enabled(channels: &countbot_core::config::ChannelsConfig, name: &str) -> bool {
    match name {
        "telegram" => channels.telegram.enabled,
        "discord" => channels.discord.enabled,
        "qq" => channels.qq.enabled,
        "wechat" => channels.wechat.enabled,
        "dingtalk" => channels.dingtalk.enabled,
        "feishu" => channels.feishu.enabled,
        _ => false,
    }
}

/// Mask secret-bearing fields before they leave the API.
fn redact_secrets(value: &mut serde_json::Value) {
    const SECRET_KEYS: [&str; 5] = ["token", "secret", "client_secret", "app_secret", "api_key"];
    if let Some(obj) = value.as_object_mut() {
        for key in SECRET_KEYS {
            if let Some(field) = obj.get_mut(key) {
                if field.as_str().map(|s| !s.is_empty()).unwrap_or(false) {
                    *field = serde_json::json!("******");
                }
            }
        }
    }
}
