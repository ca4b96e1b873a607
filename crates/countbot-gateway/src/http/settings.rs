//! Settings, provider metadata, and personality endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use countbot_agent::agent_loop::LoopParams;
use countbot_agent::openai::OpenAiClient;
use countbot_agent::provider::{chat_collect, text_message, ChatRequest};
use countbot_agent::registry;
use countbot_agent::safety;
use countbot_settings::SettingsError;

use super::error_response;
use crate::app::AppState;

pub async fn get_settings(State(state): State<Arc<AppState>>) -> Response {
    match state.settings.all() {
        Ok(mut map) => {
            // Server-applied defaults the frontend should always see.
            let config = state.config.read().unwrap();
            map.entry("model".to_string())
                .or_insert_with(|| serde_json::to_value(&config.model).unwrap_or_default());
            map.entry("persona".to_string())
                .or_insert_with(|| serde_json::to_value(&config.persona).unwrap_or_default());
            map.entry("security".to_string())
                .or_insert_with(|| serde_json::to_value(&config.security).unwrap_or_default());
            Json(serde_json::to_value(map).unwrap_or_default()).into_response()
        }
        Err(e) => error_response(500, format!("读取设置失败: {e}")),
    }
}

/// Store settings and hot-apply the parts live components care about
/// (model parameters, persona, provider credentials).
pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let Some(entries) = body.as_object() else {
        return error_response(400, "请求体必须是 JSON 对象");
    };

    for (key, value) in entries {
        if let Err(e) = state.settings.set(key, value) {
            return error_response(500, format!("保存设置失败: {e}"));
        }
    }

    apply_live_settings(&state, entries);
    Json(serde_json::json!({ "success": true })).into_response()
}

fn apply_live_settings(state: &Arc<AppState>, entries: &serde_json::Map<String, serde_json::Value>) {
    let mut config = state.config.write().unwrap();

    if let Some(model) = entries.get("model") {
        if let Ok(model_config) =
            serde_json::from_value::<countbot_core::config::ModelConfig>(model.clone())
        {
            config.model = model_config.clone();
            state.agent.update_params(LoopParams {
                model: model_config.model.clone(),
                temperature: model_config.temperature,
                max_tokens: model_config.max_tokens,
                max_iterations: model_config.max_iterations,
            });
            info!(model = %model_config.model, "model settings applied");
        }
    }

    if let Some(persona) = entries.get("persona") {
        if let Ok(persona_config) =
            serde_json::from_value::<countbot_core::config::PersonaConfig>(persona.clone())
        {
            state.agent.context().set_persona(persona_config.clone());
            state
                .handler
                .set_max_history(persona_config.max_history_messages);
            state.heartbeat.set_config(persona_config.heartbeat.clone());
            if let Err(e) = state.cron.ensure_heartbeat_job(&persona_config.heartbeat) {
                tracing::warn!("failed to sync heartbeat job: {e}");
            }
            config.persona = persona_config;
            info!("persona settings applied");
        }
    }

    if let Some(providers) = entries.get("providers") {
        if let Ok(provider_list) =
            serde_json::from_value::<Vec<countbot_core::config::ProviderEntry>>(providers.clone())
        {
            config.providers = provider_list;
            if let Some(active) = config.active_provider() {
                let client = OpenAiClient::new(
                    &active.id,
                    active.api_key.clone(),
                    active.api_base.clone(),
                );
                state.agent.set_provider(Arc::new(client));
                info!(provider = %active.id, "provider switched");
            }
        }
    }
}

#[derive(Deserialize)]
pub struct TestConnectionRequest {
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    pub api_base: Option<String>,
    pub model: Option<String>,
}

/// Fire a one-token completion against the given provider credentials.
pub async fn test_connection(Json(body): Json<TestConnectionRequest>) -> Json<serde_json::Value> {
    let model = body
        .model
        .or_else(|| registry::lookup(&body.provider).map(|p| p.default_model.to_string()))
        .unwrap_or_else(|| "gpt-4o".to_string());

    let client = OpenAiClient::new(&body.provider, body.api_key, body.api_base);
    let mut request = ChatRequest::new(model, vec![text_message("user", "ping")]);
    request.max_tokens = 16;

    match chat_collect(&client, request).await {
        Ok(_) => Json(serde_json::json!({ "success": true, "message": "连接成功" })),
        Err(e) => Json(serde_json::json!({ "success": false, "message": e.to_string() })),
    }
}

pub async fn providers() -> Json<serde_json::Value> {
    let providers: Vec<serde_json::Value> = registry::KNOWN_PROVIDERS
        .iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "name": p.name,
                "base_url": p.base_url,
                "default_model": p.default_model,
            })
        })
        .collect();
    Json(serde_json::json!({ "providers": providers }))
}

pub async fn dangerous_patterns() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "patterns": safety::dangerous_patterns() }))
}

pub async fn list_personalities(State(state): State<Arc<AppState>>) -> Response {
    match state.personalities.list() {
        Ok(list) => Json(serde_json::to_value(list).unwrap_or_default()).into_response(),
        Err(e) => error_response(500, format!("读取人格失败: {e}")),
    }
}

pub async fn delete_personality(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.personalities.delete(&id) {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(SettingsError::BuiltinProtected(_)) => {
            error_response(403, "内置人格不允许删除")
        }
        Err(SettingsError::NotFound(_)) => error_response(404, format!("人格不存在: {id}")),
        Err(e) => error_response(500, format!("删除失败: {e}")),
    }
}
