//! HTTP surface: OAuth management, health, and the OpenAI-compatible API.

pub mod auth;
pub mod health;
pub mod oauth;
pub mod openai;

use axum::{
    Json, Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::AppState;
use crate::config::CorsMode;

/// CORS configuration based on environment
pub fn cors_layer(mode: &CorsMode) -> CorsLayer {
    match mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }

    let cors_origins = mode.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };

            match &cors_origins {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("[::1]")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true)
}

pub fn build_router(state: Arc<AppState>, cors_mode: &CorsMode) -> Router {
    // Auth and health routes with OpenAPI spec generation
    let (documented_routes, openapi) = OpenApiRouter::with_openapi(Default::default())
        .routes(routes!(oauth::auth_status))
        .routes(routes!(oauth::start_auth))
        .routes(routes!(oauth::auth_callback))
        .routes(routes!(oauth::logout))
        .routes(routes!(health::health))
        .routes(routes!(health::version))
        .split_for_parts();

    // OpenAI-compatible API, behind the optional shared key
    let api_routes = Router::new()
        .route("/models", get(openai::list_models))
        .route("/chat/completions", post(openai::chat_completions))
        .route("/embeddings", post(openai::embeddings))
        .route("/images/generations", post(openai::image_generations))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .merge(documented_routes)
        .route(
            "/api-docs/openapi.json",
            get(move || {
                let doc = openapi.clone();
                async move { Json(doc) }
            }),
        )
        .route("/v1/health", get(health::health))
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_mode))
        .with_state(state)
}
