use axum::{extract::State, response::Json};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::{AppState, BUILD_TIME, GIT_HASH, VERSION};

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub authenticated: bool,
}

#[derive(Serialize, ToSchema)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, body = HealthResponse),
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        authenticated: state.oauth.is_authenticated().await,
    })
}

/// Build information
#[utoipa::path(
    get,
    path = "/version",
    tag = "health",
    responses(
        (status = 200, body = VersionResponse),
    )
)]
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: VERSION.to_string(),
        git_hash: GIT_HASH.to_string(),
        build_time: BUILD_TIME.to_string(),
    })
}
