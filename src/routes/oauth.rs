use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::auth::AuthStatus;
use crate::error::ProxyError;

// --- Types ---

#[derive(Serialize, ToSchema)]
pub struct StartAuthResponse {
    pub url: String,
    pub state: String,
    pub message: String,
    pub next_step: String,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct CallbackRequest {
    /// The `code#state` string shown after authorizing
    pub code: String,
}

#[derive(Serialize, ToSchema)]
pub struct CallbackResponse {
    pub success: bool,
    pub expires_at: u64,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

// --- Handlers ---

/// Get OAuth connection status
#[utoipa::path(
    get,
    path = "/auth/status",
    tag = "auth",
    responses(
        (status = 200, body = AuthStatus),
    )
)]
pub async fn auth_status(State(state): State<Arc<AppState>>) -> Json<AuthStatus> {
    Json(state.oauth.status().await)
}

/// Start OAuth flow
#[utoipa::path(
    get,
    path = "/auth/start",
    tag = "auth",
    responses(
        (status = 200, body = StartAuthResponse),
    )
)]
pub async fn start_auth(State(state): State<Arc<AppState>>) -> Json<StartAuthResponse> {
    let request = state.oauth.start_flow().await;
    Json(StartAuthResponse {
        url: request.url,
        state: request.state,
        message: "Open the URL in a browser, authorize, then POST the displayed code to /auth/callback as {\"code\": \"...\"}".to_string(),
        next_step: "callback".to_string(),
    })
}

/// Exchange OAuth code
#[utoipa::path(
    post,
    path = "/auth/callback",
    tag = "auth",
    request_body = CallbackRequest,
    responses(
        (status = 200, body = CallbackResponse),
        (status = 400, description = "Malformed request body"),
        (status = 401, description = "No pending flow, or the code was rejected"),
    )
)]
pub async fn auth_callback(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CallbackRequest>, JsonRejection>,
) -> Result<Json<CallbackResponse>, ProxyError> {
    let Json(body) = body.map_err(|e| ProxyError::InvalidRequest(e.body_text()))?;
    let record = state.oauth.complete_flow(&body.code).await?;
    Ok(Json(CallbackResponse {
        success: true,
        expires_at: record.expires_at,
        message: "Authenticated, /v1/chat/completions is ready".to_string(),
    }))
}

/// Delete OAuth credentials
#[utoipa::path(
    post,
    path = "/auth/logout",
    tag = "auth",
    responses(
        (status = 200, body = SuccessResponse),
        (status = 500, description = "Credential file could not be removed"),
    )
)]
pub async fn logout(State(state): State<Arc<AppState>>) -> Result<Json<SuccessResponse>, ProxyError> {
    state.oauth.logout().await?;
    Ok(Json(SuccessResponse { success: true }))
}
