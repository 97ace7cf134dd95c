use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use reqwest::{Client, RequestBuilder};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::AppState;
use crate::constants::{ANTHROPIC_VERSION, OAUTH_BETA_HEADER, USER_AGENT};
use crate::error::ProxyError;

/// Extract API key from Authorization: Bearer header (OpenAI style)
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

/// Extract API key from either Authorization or x-api-key header
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    extract_bearer_token(headers)
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
}

/// Middleware guarding `/v1/*` when a shared API key is configured.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(request).await;
    };

    let provided = extract_api_key(request.headers()).unwrap_or_default();

    // Constant-time comparison to prevent timing attacks
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        next.run(request).await
    } else {
        ProxyError::InvalidApiKey.into_response()
    }
}

/// Build a request to the Anthropic messages API with OAuth headers
pub fn build_anthropic_request(
    client: &Client,
    url: &str,
    token: &str,
    stream: bool,
) -> RequestBuilder {
    let accept = if stream {
        "text/event-stream"
    } else {
        "application/json"
    };

    client
        .post(url)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", token))
        .header("anthropic-beta", OAUTH_BETA_HEADER)
        .header("user-agent", USER_AGENT)
        .header("accept", accept)
}
