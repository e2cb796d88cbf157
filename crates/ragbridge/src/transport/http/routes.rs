//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::bridge::protocol::{ChatTurn, Source};
use crate::error::BridgeError;
use crate::state::BridgeSnapshot;
use crate::worker_bridge::{WorkerBridge, WorkerReply};

/// Shown to end users when the worker cannot answer a chat message.
pub const CHAT_FALLBACK: &str =
    "I'm having trouble reaching the career advisor right now. Please try again in a moment.";

/// Shown to end users when the personalized greeting cannot be generated.
pub const GREETING_FALLBACK: &str =
    "Welcome! Your results are ready. Ask me anything about the careers that match your interests.";

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<WorkerBridge>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(bridge: Arc<WorkerBridge>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bridge,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Resolves to `true` once `/shutdown` has been called.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub chat_history: Vec<ChatTurn>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GreetingRequest {
    pub assessment_summary: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReplyResponse {
    pub response: String,
    pub sources: Vec<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn health_check(State(state): State<AppState>) -> Json<BridgeSnapshot> {
    Json(state.bridge.snapshot())
}

async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    let result = state
        .bridge
        .chat_with_sources(
            &request.message,
            &request.chat_history,
            request.language.as_deref(),
        )
        .await;
    reply_or_fallback("chat", result, CHAT_FALLBACK)
}

async fn greeting(
    State(state): State<AppState>,
    Json(request): Json<GreetingRequest>,
) -> Response {
    let result = state
        .bridge
        .greeting_with_sources(&request.assessment_summary, request.language.as_deref())
        .await;
    reply_or_fallback("greeting", result, GREETING_FALLBACK)
}

fn reply_or_fallback(
    command: &'static str,
    result: Result<WorkerReply, BridgeError>,
    fallback: &str,
) -> Response {
    match result {
        Ok(reply) => (
            StatusCode::OK,
            Json(ReplyResponse {
                response: reply.text,
                sources: reply.sources,
                error: None,
            }),
        )
            .into_response(),
        Err(BridgeError::InvalidInput(message)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": message })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(command, error = %e, retryable = e.is_retryable(), "Serving fallback reply");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReplyResponse {
                    response: fallback.to_string(),
                    sources: Vec::new(),
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    state.shutdown_tx.send_replace(true);
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/chat", post(chat))
        .route("/greeting", post(greeting))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}
