//! HTTP service keeping the API secret on the server.
//!
//! - `POST /api/getWebSocketUrl`: `{host, path}` in, signed `{wsUrl}` out
//! - `POST /api/chat`: answers the last message of `{messages}` in one
//!   exchange and returns `{content}`

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::{rfc1123, sign_url, Credentials, ResolveRequest, ResolveResponse};
use crate::completion::complete_once;
use crate::config::ServiceConfig;
use crate::connection::Transport;

/// Upper bound on a single `/api/chat` exchange
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared state for the handlers
pub struct ApiState {
    pub credentials: Credentials,
    pub config: ServiceConfig,
    pub transport: Arc<dyn Transport>,
    pub chat_timeout: Duration,
}

impl ApiState {
    pub fn new(
        credentials: Credentials,
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            credentials,
            config,
            transport,
            chat_timeout: CHAT_TIMEOUT,
        }
    }
}

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub chat_id: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub content: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/getWebSocketUrl", post(get_websocket_url))
        .route("/api/chat", post(chat))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Sign a websocket URL for the requested target.
///
/// POST /api/getWebSocketUrl
pub async fn get_websocket_url(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ResolveRequest>,
) -> Response {
    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
    let (Some(host), Some(path)) = (non_empty(request.host), non_empty(request.path)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing host or path");
    };

    match sign_url(&state.credentials, &host, &path, &rfc1123(chrono::Utc::now())) {
        Ok(ws_url) => {
            tracing::debug!("Signed websocket url for {}{}", host, path);
            Json(ResolveResponse { ws_url }).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to sign websocket url: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

/// Answer the last message over a dedicated connection.
///
/// POST /api/chat
pub async fn chat(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let Some(last) = request.messages.last() else {
        return error_response(StatusCode::BAD_REQUEST, "No messages provided");
    };

    let config = &state.config;
    let url = match sign_url(
        &state.credentials,
        &config.host,
        &config.path,
        &rfc1123(chrono::Utc::now()),
    ) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!("Failed to sign websocket url: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let envelope = config.envelope(&last.content);
    match complete_once(
        state.transport.as_ref(),
        &url,
        &envelope,
        state.chat_timeout,
    )
    .await
    {
        Ok(content) => Json(ChatResponse { content }).into_response(),
        Err(e) => {
            tracing::error!("Chat request failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}
