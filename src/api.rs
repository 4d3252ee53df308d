//! REST API server for the advisory orchestrator
//!
//! Exposes turn processing, profile access, and session management
//! over HTTP for frontend integration.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::agent::AdvisoryEngine;
use crate::store::ProfileStore;

/// Reply shown for a turn the safety classifier blocked; the blocked
/// input itself never reaches a stage.
const BLOCKED_REPLY: &str =
    "I can't help with that request. Let's keep things to safe, finance-related topics.";

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    /// Absent or empty starts a new session.
    pub session_id: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<AdvisoryEngine>,
    pub store: Arc<dyn ProfileStore>,
}

/// =============================
/// Endpoints
/// =============================

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn chat(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Empty message".into())),
        );
    }

    info!(user_id = %req.user_id, "Chat turn received");

    match state
        .engine
        .process_turn(req.session_id.as_deref(), &req.user_id, &req.message)
        .await
    {
        Ok(result) => {
            let response_text = result
                .message
                .unwrap_or_else(|| BLOCKED_REPLY.to_string());

            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "session_id": result.session_id,
                    "user_id": req.user_id,
                    "message": req.message,
                    "response": response_text,
                    "stage": result.stage.as_str(),
                    "debate_history": result.debate_history,
                }))),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Turn processing failed: {}", e))),
        ),
    }
}

async fn get_profile(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.store.load_profile(&user_id).await {
        Ok(profile) if profile.is_empty() => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!(
                "Profile not found for user: {}",
                user_id
            ))),
        ),
        Ok(profile) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "user_id": user_id,
                "profile": profile,
            }))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Profile load failed: {}", e))),
        ),
    }
}

async fn update_profile(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(updates): Json<Map<String, Value>>,
) -> (StatusCode, Json<ApiResponse>) {
    // Merge over the stored record so a partial body never wipes fields.
    let mut profile = match state.store.load_profile(&user_id).await {
        Ok(profile) => profile,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Profile load failed: {}", e))),
            )
        }
    };
    crate::state::merge_values(&mut profile, updates);

    match state.store.save_profile(&user_id, &profile).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "user_id": user_id,
                "updated_profile": profile,
            }))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Profile update failed: {}", e))),
        ),
    }
}

async fn delete_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    if state.engine.sessions().remove(&session_id).await {
        (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "status": "deleted",
                "session_id": session_id,
            }))),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Session not found".into())),
        )
    }
}

async fn list_sessions(State(state): State<ApiState>) -> Json<ApiResponse> {
    let keys = state.engine.sessions().session_keys().await;
    let count = keys.len();
    Json(ApiResponse::success(serde_json::json!({
        "active_sessions": keys,
        "count": count,
    })))
}

/// =============================
/// Router
/// =============================

pub fn create_router(engine: Arc<AdvisoryEngine>, store: Arc<dyn ProfileStore>) -> Router {
    let state = ApiState { engine, store };

    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/profile/:user_id", get(get_profile).post(update_profile))
        .route("/session/:session_id", delete(delete_session))
        .route("/sessions", get(list_sessions))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    engine: Arc<AdvisoryEngine>,
    store: Arc<dyn ProfileStore>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(engine, store);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
