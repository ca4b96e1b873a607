//! Gateway authentication.
//!
//! Requests from loopback without proxy headers are trusted. Everything else
//! needs a session token from `POST /api/auth/login` — either a
//! `CountBot_token` cookie or an `Authorization: Bearer` header. Auth
//! endpoints and the health probe are always open.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::app::AppState;

const TOKEN_COOKIE: &str = "CountBot_token";

/// Paths that never require auth.
fn is_open_path(path: &str) -> bool {
    path.starts_with("/api/auth/") || path == "/api/health" || path == "/login"
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_open_path(&path) {
        return next.run(request).await;
    }

    // Loopback with no proxy headers is trusted (local desktop usage).
    let forwarded = request.headers().contains_key("x-forwarded-for")
        || request.headers().contains_key("x-real-ip");
    let is_loopback = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().is_loopback())
        .unwrap_or(false);
    if is_loopback && !forwarded {
        return next.run(request).await;
    }

    // Password-less deployments accept only loopback traffic.
    let password_configured = {
        let config = state.config.read().unwrap();
        !config.gateway.password_hash.is_empty()
    };
    if !password_configured {
        warn!(%path, "rejecting non-loopback request: no password configured");
        return unauthorized("仅允许本机访问，请配置访问密码后重试");
    }

    if let Some(token) = extract_token(&request) {
        if state.auth_tokens.contains_key(&token) {
            return next.run(request).await;
        }
    }

    unauthorized("认证失败，请重新登录")
}

fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "detail": detail })),
    )
        .into_response()
}

fn extract_token(request: &Request) -> Option<String> {
    if let Some(auth) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    let cookies = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    for part in cookies.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(&format!("{TOKEN_COOKIE}=")) {
            return Some(value.to_string());
        }
    }
    None
}

/// Salted SHA-256 of the login password.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Response {
    let (expected, salt) = {
        let config = state.config.read().unwrap();
        (
            config.gateway.password_hash.clone(),
            config.gateway.password_salt.clone(),
        )
    };

    if expected.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "detail": "未配置访问密码" })),
        )
            .into_response();
    }

    if hash_password(&salt, &body.password) != expected {
        warn!("login failed: wrong password");
        return unauthorized("密码错误");
    }

    let token = Uuid::new_v4().to_string();
    state.auth_tokens.insert(token.clone(), chrono::Utc::now().to_rfc3339());

    (
        StatusCode::OK,
        [(
            header::SET_COOKIE,
            format!("{TOKEN_COOKIE}={token}; HttpOnly; Path=/; SameSite=Lax"),
        )],
        Json(serde_json::json!({ "success": true, "token": token })),
    )
        .into_response()
}

pub async fn logout(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if let Some(token) = extract_token(&request) {
        state.auth_tokens.remove(&token);
    }
    (StatusCode::OK, Json(serde_json::json!({ "success": true }))).into_response()
}
