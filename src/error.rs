use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// The OAuth step the operator has to perform next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    /// No flow in progress: visit `/auth/start`.
    Start,
    /// A flow is pending: post the code to `/auth/callback`.
    Callback,
}

impl AuthStep {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthStep::Start => "start",
            AuthStep::Callback => "callback",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("Not authenticated, continue the OAuth flow at /auth/{}", .step.as_str())]
    AuthRequired { step: AuthStep },

    #[error("OAuth code exchange failed: {0}")]
    AuthExchangeFailed(String),

    #[error("OAuth token refresh failed, re-authenticate via /auth/start: {0}")]
    RefreshFailed(String),

    #[error("Invalid or missing API key")]
    InvalidApiKey,

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream error ({status} {code}): {message}")]
    UpstreamError {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Upstream request timed out")]
    UpstreamTimeout,

    #[error("Malformed upstream stream: {0}")]
    MalformedStream(String),

    #[error("Network error: {0}")]
    NetworkError(Arc<reqwest::Error>),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::UpstreamTimeout
        } else {
            ProxyError::NetworkError(Arc::new(e))
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::StorageError(e.to_string())
    }
}

/// Anthropic error body: `{"type": "error", "error": {"type": ..., "message": ...}}`
#[derive(Debug, Deserialize)]
struct UpstreamErrorBody {
    error: UpstreamErrorDetail,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorDetail {
    #[serde(rename = "type")]
    error_type: String,
    #[serde(default)]
    message: String,
}

/// Caller-facing status for a known upstream error type.
fn known_upstream_status(error_type: &str) -> Option<StatusCode> {
    match error_type {
        "invalid_request_error" => Some(StatusCode::BAD_REQUEST),
        "authentication_error" => Some(StatusCode::UNAUTHORIZED),
        "permission_error" => Some(StatusCode::FORBIDDEN),
        "not_found_error" => Some(StatusCode::NOT_FOUND),
        "request_too_large" => Some(StatusCode::PAYLOAD_TOO_LARGE),
        "rate_limit_error" => Some(StatusCode::TOO_MANY_REQUESTS),
        "overloaded_error" => Some(StatusCode::SERVICE_UNAVAILABLE),
        "timeout_error" => Some(StatusCode::GATEWAY_TIMEOUT),
        _ => None,
    }
}

/// Caller-facing status for an upstream error type. Unknown types map to 502.
pub fn status_for_upstream_error(error_type: &str) -> StatusCode {
    known_upstream_status(error_type).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Status relayed for an upstream failure: the error type when it is known,
/// otherwise the upstream's own 4xx (or 503/504), otherwise 502.
fn relayed_status(error_type: &str, upstream_status: u16) -> StatusCode {
    if let Some(status) = known_upstream_status(error_type) {
        return status;
    }
    match StatusCode::from_u16(upstream_status) {
        Ok(status)
            if status.is_client_error()
                || status == StatusCode::SERVICE_UNAVAILABLE
                || status == StatusCode::GATEWAY_TIMEOUT =>
        {
            status
        }
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl ProxyError {
    /// Build an `UpstreamError` from a non-success upstream response body.
    pub fn from_upstream(status: u16, body: &str) -> Self {
        match serde_json::from_str::<UpstreamErrorBody>(body) {
            Ok(parsed) => ProxyError::UpstreamError {
                status,
                code: parsed.error.error_type,
                message: parsed.error.message,
            },
            Err(_) => ProxyError::UpstreamError {
                status,
                code: "upstream_error".to_string(),
                message: body.chars().take(512).collect(),
            },
        }
    }

    /// Build an `UpstreamError` from an in-stream `error` event.
    pub fn from_stream_error(error_type: &str, message: &str) -> Self {
        ProxyError::UpstreamError {
            status: status_for_upstream_error(error_type).as_u16(),
            code: error_type.to_string(),
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AuthRequired { .. }
            | ProxyError::AuthExchangeFailed(_)
            | ProxyError::RefreshFailed(_)
            | ProxyError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ProxyError::UnknownModel(_) => StatusCode::NOT_FOUND,
            ProxyError::UnsupportedFeature(_) | ProxyError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::UpstreamError { status, code, .. } => relayed_status(code, *status),
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::MalformedStream(_) | ProxyError::NetworkError(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::StorageError(_) | ProxyError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::AuthRequired { .. }
            | ProxyError::AuthExchangeFailed(_)
            | ProxyError::RefreshFailed(_)
            | ProxyError::InvalidApiKey => "authentication_error",
            ProxyError::UnknownModel(_)
            | ProxyError::UnsupportedFeature(_)
            | ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::UpstreamError { .. }
            | ProxyError::UpstreamTimeout
            | ProxyError::MalformedStream(_)
            | ProxyError::NetworkError(_) => "upstream_error",
            ProxyError::StorageError(_) | ProxyError::ConfigError(_) => "server_error",
        }
    }

    fn code(&self) -> &str {
        match self {
            ProxyError::AuthRequired { .. } => "auth_required",
            ProxyError::AuthExchangeFailed(_) => "auth_exchange_failed",
            ProxyError::RefreshFailed(_) => "refresh_failed",
            ProxyError::InvalidApiKey => "invalid_api_key",
            ProxyError::UnknownModel(_) => "model_not_found",
            ProxyError::UnsupportedFeature(_) => "unsupported_feature",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::UpstreamError { code, .. } => code,
            ProxyError::UpstreamTimeout => "upstream_timeout",
            ProxyError::MalformedStream(_) => "malformed_stream",
            ProxyError::NetworkError(_) => "upstream_unreachable",
            ProxyError::StorageError(_) => "storage_error",
            ProxyError::ConfigError(_) => "config_error",
        }
    }

    /// The OAuth step that resolves this error, if it is an auth error.
    pub fn auth_step(&self) -> Option<AuthStep> {
        match self {
            ProxyError::AuthRequired { step } => Some(*step),
            ProxyError::AuthExchangeFailed(_) => Some(AuthStep::Callback),
            ProxyError::RefreshFailed(_) => Some(AuthStep::Start),
            _ => None,
        }
    }

    /// OpenAI-style error envelope, also used as the payload of in-stream error frames.
    pub fn to_openai_body(&self) -> Value {
        let mut error = Map::new();
        error.insert("message".into(), Value::String(self.to_string()));
        error.insert("type".into(), Value::String(self.error_type().into()));
        error.insert("code".into(), Value::String(self.code().into()));
        if let Some(step) = self.auth_step() {
            error.insert("step".into(), Value::String(step.as_str().into()));
        }
        json!({ "error": error })
    }

    /// Convert error to OpenAI-compatible error response
    pub fn to_openai_response(&self) -> Response {
        (self.status(), Json(self.to_openai_body())).into_response()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.to_openai_response()
    }
}
