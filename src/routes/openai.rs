use axum::{
    Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::header,
    response::{IntoResponse, Response},
};
use reqwest::RequestBuilder;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::AppState;
use crate::constants::MODELS_CREATED_AT;
use crate::error::ProxyError;
use crate::transforms::{
    AnthropicResponse, OpenAIChatRequest, stream_to_openai_sse, transform_openai_request,
    transform_openai_response, translate_stream,
};

use super::auth::build_anthropic_request;

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let models: Vec<Value> = state
        .models
        .list()
        .iter()
        .map(|m| {
            json!({
                "id": m.alias,
                "object": "model",
                "created": MODELS_CREATED_AT,
                "owned_by": "anthropic",
                "anthropic_id": m.upstream_model_id
            })
        })
        .collect();

    Json(json!({
        "object": "list",
        "data": models
    }))
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Result<Json<OpenAIChatRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let Json(body) = body.map_err(|e| ProxyError::InvalidRequest(e.body_text()))?;

    let alias = body.model.clone();
    let stream = body.is_stream();
    let include_usage = body.include_usage();

    // Everything that can be rejected locally is checked before touching the network
    let upstream_model = state.models.resolve(&alias)?;
    let upstream_body = transform_openai_request(body, upstream_model)?;
    let token = state.oauth.get_valid_token().await?;

    debug!(
        "Forwarding chat completion: {alias} -> {upstream_model} (stream: {stream}, messages: {})",
        upstream_body.messages.len()
    );

    let request = build_anthropic_request(
        &state.http_client,
        &state.messages_url,
        &token,
        stream,
    )
    .json(&upstream_body);

    if stream {
        let response = with_timeout(state.request_timeout, send_upstream(request)).await?;
        let deltas = translate_stream(response.bytes_stream(), state.stream_idle_timeout);
        let sse_stream = stream_to_openai_sse(deltas, alias, include_usage);

        Ok((
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(sse_stream),
        )
            .into_response())
    } else {
        let anthropic_response = with_timeout(state.request_timeout, async {
            let response = send_upstream(request).await?;
            let status = response.status().as_u16();
            let bytes = response.bytes().await?;
            serde_json::from_slice::<AnthropicResponse>(&bytes).map_err(|e| {
                ProxyError::UpstreamError {
                    status,
                    code: "invalid_response".to_string(),
                    message: format!("Failed to parse response: {e}"),
                }
            })
        })
        .await?;

        let openai_response = transform_openai_response(anthropic_response, &alias);
        Ok(Json(openai_response).into_response())
    }
}

pub async fn embeddings() -> ProxyError {
    ProxyError::UnsupportedFeature("embeddings are not available for subscription models".into())
}

pub async fn image_generations() -> ProxyError {
    ProxyError::UnsupportedFeature(
        "image generation is not available for subscription models".into(),
    )
}

/// Send the request, turning non-success responses into `UpstreamError`.
async fn send_upstream(request: RequestBuilder) -> Result<reqwest::Response, ProxyError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let err = ProxyError::from_upstream(status.as_u16(), &text);
    warn!("Upstream returned {status}: {err}");
    Err(err)
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, ProxyError>>,
) -> Result<T, ProxyError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
}

#[cfg(test)]
mod tests {
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{any, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::constants::ANTHROPIC_VERSION;
    use crate::routes::testing::{app, read_body, read_json, test_state};

    fn chat_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn message_response() -> Value {
        json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-20250514",
            "content": [{"type": "text", "text": "Hello! How can I help?"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 7}
        })
    }

    #[tokio::test]
    async fn test_non_streaming_chat_completion() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, Some("access-1"), None).await;

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("authorization", "Bearer access-1"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({
                "model": "claude-sonnet-4-20250514",
                "max_tokens": 50,
                "system": "Be brief.",
                "stream": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(message_response()))
            .expect(1)
            .mount(&server)
            .await;

        let response = app(&state)
            .oneshot(chat_request(json!({
                "model": "claude-sonnet-4",
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "Hello!"}
                ],
                "max_tokens": 50
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "claude-sonnet-4");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello! How can I help?");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["prompt_tokens"], 10);
        assert_eq!(body["usage"]["completion_tokens"], 7);
        assert_eq!(body["usage"]["total_tokens"], 17);
    }

    #[tokio::test]
    async fn test_unknown_model_makes_no_upstream_call() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, Some("access-1"), None).await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let response = app(&state)
            .oneshot(chat_request(json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "Hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = read_json(response).await;
        assert_eq!(body["error"]["code"], "model_not_found");
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_unsupported_feature_makes_no_upstream_call() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, Some("access-1"), None).await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let response = app(&state)
            .oneshot(chat_request(json!({
                "model": "claude-sonnet-4",
                "messages": [{"role": "user", "content": "Hi"}],
                "n": 3
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["error"]["code"], "unsupported_feature");
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_mapped() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, Some("access-1"), None).await;

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "type": "error",
                "error": {"type": "rate_limit_error", "message": "Rate limited"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = app(&state)
            .oneshot(chat_request(json!({
                "model": "claude-opus",
                "messages": [{"role": "user", "content": "Hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = read_json(response).await;
        assert_eq!(body["error"]["code"], "rate_limit_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("Rate limited"));
    }

    #[tokio::test]
    async fn test_plain_text_upstream_error_keeps_status() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, Some("access-1"), None).await;

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
            .expect(1)
            .mount(&server)
            .await;

        let response = app(&state)
            .oneshot(chat_request(json!({
                "model": "claude-opus",
                "messages": [{"role": "user", "content": "Hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = read_json(response).await;
        assert_eq!(body["error"]["code"], "upstream_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("Too Many Requests"));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, Some("access-1"), None).await;
        let state = Arc::new(AppState {
            request_timeout: Duration::from_millis(100),
            ..Arc::into_inner(state).unwrap()
        });

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(message_response())
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let response = app(&state)
            .oneshot(chat_request(json!({
                "model": "claude-sonnet-4",
                "messages": [{"role": "user", "content": "Hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(read_json(response).await["error"]["code"], "upstream_timeout");
    }

    #[tokio::test]
    async fn test_streaming_chat_completion() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, Some("access-1"), None).await;

        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_9\",\"usage\":{\"input_tokens\":4}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\"},\"usage\":{\"output_tokens\":1}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("accept", "text/event-stream"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = app(&state)
            .oneshot(chat_request(json!({
                "model": "claude-sonnet-4",
                "messages": [{"role": "user", "content": "Hi"}],
                "stream": true,
                "stream_options": {"include_usage": true}
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let body = read_body(response).await;
        assert!(body.contains("\"id\":\"chatcmpl-msg_9\""));
        assert!(body.contains("\"content\":\"Hi\""));
        assert!(body.contains("\"finish_reason\":\"length\""));
        assert!(body.contains("\"total_tokens\":5"));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_unauthenticated_request_names_next_step() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, None, None).await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let response = app(&state)
            .oneshot(chat_request(json!({
                "model": "claude-sonnet-4",
                "messages": [{"role": "user", "content": "Hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = read_json(response).await;
        assert_eq!(body["error"]["code"], "auth_required");
        assert_eq!(body["error"]["step"], "start");
    }

    #[tokio::test]
    async fn test_invalid_body_is_rejected() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, Some("access-1"), None).await;

        let response = app(&state)
            .oneshot(chat_request(json!({"messages": "not a list"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_embeddings_and_images_are_unsupported() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, Some("access-1"), None).await;

        for uri in ["/v1/embeddings", "/v1/images/generations"] {
            let response = app(&state)
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(uri)
                        .header("content-type", "application/json")
                        .body(Body::from("{}"))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(
                read_json(response).await["error"]["code"],
                "unsupported_feature"
            );
        }
    }

    #[tokio::test]
    async fn test_models_list_and_api_key_guard() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&server, &dir, None, Some("secret")).await;

        let response = app(&state)
            .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(read_json(response).await["error"]["code"], "invalid_api_key");

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["object"], "list");
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"claude-sonnet-4"));
        assert_eq!(body["data"][0]["owned_by"], "anthropic");
        let sonnet = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["id"] == "claude-sonnet-4")
            .unwrap();
        assert_eq!(sonnet["anthropic_id"], "claude-sonnet-4-20250514");

        // Health stays open, including under /v1
        for uri in ["/health", "/v1/health"] {
            let response = app(&state)
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            let body = read_json(response).await;
            assert_eq!(body["status"], "ok");
            assert_eq!(body["authenticated"], false);
        }
    }
}
