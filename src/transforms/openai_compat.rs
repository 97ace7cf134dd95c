//! OpenAI-compatible API format conversion.
//!
//! This module converts between OpenAI chat completion format and
//! Anthropic messages format.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::constants::DEFAULT_MAX_TOKENS;
use crate::error::ProxyError;

// ============================================================================
// OpenAI Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenAIChatRequest {
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    pub max_tokens: Option<u32>,
    pub max_completion_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: Option<bool>,
    pub stream_options: Option<StreamOptions>,
    pub tools: Option<Vec<OpenAITool>>,
    pub tool_choice: Option<Value>,
    pub stop: Option<StopSequences>,
    pub n: Option<u32>,
    pub response_format: Option<Value>,
    pub modalities: Option<Vec<String>>,
}

impl OpenAIChatRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options.as_ref().is_some_and(|o| o.include_usage)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(default)]
    pub content: OpenAIContent,
    pub tool_calls: Option<Vec<OpenAIToolCall>>,
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
pub enum OpenAIContent {
    Text(String),
    Parts(Vec<OpenAIContentPart>),
    #[default]
    Null,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum OpenAIContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIToolCall {
    pub id: String,
    pub function: OpenAIFunctionCall,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAITool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: Option<OpenAIFunctionDef>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIFunctionDef {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

// ============================================================================
// Anthropic Request Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<UpstreamMessage>,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<UpstreamTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamRole {
    User,
    Assistant,
}

#[derive(Debug, Serialize)]
pub struct UpstreamMessage {
    pub role: UpstreamRole,
    pub content: Vec<UpstreamContent>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamContent {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize)]
pub struct UpstreamTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

// ============================================================================
// Anthropic Response Types (for deserializing responses)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AnthropicResponse {
    pub id: String,
    pub content: Vec<AnthropicResponseContent>,
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicResponseContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

// ============================================================================
// OpenAI Response Types (for serializing responses)
// ============================================================================

#[derive(Debug, Serialize)]
pub struct OpenAIChatResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<OpenAIChoice>,
    pub usage: OpenAIUsage,
}

#[derive(Debug, Serialize)]
pub struct OpenAIChoice {
    pub index: u32,
    pub message: OpenAIResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAIResponseMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAIResponseToolCall>>,
}

#[derive(Debug, Serialize)]
pub struct OpenAIResponseToolCall {
    pub id: String,
    pub r#type: String,
    pub function: OpenAIResponseFunction,
}

#[derive(Debug, Serialize)]
pub struct OpenAIResponseFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpenAIUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl OpenAIUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

// ============================================================================
// Transform Functions
// ============================================================================

/// Transform an OpenAI chat request into an Anthropic messages request.
///
/// `upstream_model` is the already-resolved model id. Everything without an
/// Anthropic equivalent is rejected here, before any network call.
pub fn transform_openai_request(
    req: OpenAIChatRequest,
    upstream_model: &str,
) -> Result<UpstreamRequest, ProxyError> {
    reject_unsupported_options(&req)?;

    let mut messages: Vec<UpstreamMessage> = Vec::new();
    let mut system_parts: Vec<String> = Vec::new();

    for msg in req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                let text = extract_text_content(&msg.content)?;
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" => messages.push(UpstreamMessage {
                role: UpstreamRole::User,
                content: convert_message_content(&msg.content, None)?,
            }),
            "assistant" => messages.push(UpstreamMessage {
                role: UpstreamRole::Assistant,
                content: convert_message_content(&msg.content, msg.tool_calls.as_deref())?,
            }),
            "tool" => {
                // Tool results must be in a user message for Anthropic API
                let tool_use_id = msg.tool_call_id.ok_or_else(|| {
                    ProxyError::InvalidRequest("tool message without tool_call_id".into())
                })?;
                messages.push(UpstreamMessage {
                    role: UpstreamRole::User,
                    content: vec![UpstreamContent::ToolResult {
                        tool_use_id,
                        content: extract_text_content(&msg.content)?,
                    }],
                });
            }
            other => {
                return Err(ProxyError::UnsupportedFeature(format!(
                    "message role '{other}'"
                )));
            }
        }
    }

    let tools = req
        .tools
        .map(|tools| tools.into_iter().map(convert_tool).collect::<Result<Vec<_>, _>>())
        .transpose()?;

    let tool_choice = req.tool_choice.map(convert_tool_choice).transpose()?;

    let stop_sequences = req.stop.map(|stop| match stop {
        StopSequences::One(s) => vec![s],
        StopSequences::Many(v) => v,
    });

    Ok(UpstreamRequest {
        model: upstream_model.to_string(),
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
        messages,
        max_tokens: req
            .max_tokens
            .or(req.max_completion_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        stream: req.stream.unwrap_or(false),
        tools,
        tool_choice,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences,
    })
}

/// Map an Anthropic `stop_reason` onto an OpenAI `finish_reason`.
pub fn map_stop_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") | Some("pause_turn") => "stop",
        Some("max_tokens") | Some("model_context_window_exceeded") => "length",
        Some("tool_use") => "tool_calls",
        Some("refusal") => "content_filter",
        None => {
            warn!("Upstream response has no stop_reason, reporting \"stop\"");
            "stop"
        }
        Some(other) => {
            warn!("Unrecognized upstream stop_reason {other:?}, reporting \"stop\"");
            "stop"
        }
    }
}

/// Transform an Anthropic response to OpenAI format.
pub fn transform_openai_response(resp: AnthropicResponse, model: &str) -> OpenAIChatResponse {
    let mut text_content = String::new();
    let mut thinking_content = String::new();
    let mut tool_calls: Vec<OpenAIResponseToolCall> = Vec::new();

    for content in resp.content {
        match content {
            AnthropicResponseContent::Text { text } => {
                text_content.push_str(&text);
            }
            AnthropicResponseContent::Thinking { thinking } => {
                thinking_content.push_str(&thinking);
            }
            AnthropicResponseContent::ToolUse { id, name, input } => {
                tool_calls.push(OpenAIResponseToolCall {
                    id,
                    r#type: "function".to_string(),
                    function: OpenAIResponseFunction {
                        name,
                        arguments: input.to_string(),
                    },
                });
            }
            AnthropicResponseContent::Other => {}
        }
    }

    OpenAIChatResponse {
        id: format!("chatcmpl-{}", resp.id),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: model.to_string(),
        choices: vec![OpenAIChoice {
            index: 0,
            message: OpenAIResponseMessage {
                role: "assistant".to_string(),
                content: (!text_content.is_empty()).then_some(text_content),
                reasoning_content: (!thinking_content.is_empty()).then_some(thinking_content),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: map_stop_reason(resp.stop_reason.as_deref()).to_string(),
        }],
        usage: OpenAIUsage::new(resp.usage.input_tokens, resp.usage.output_tokens),
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn reject_unsupported_options(req: &OpenAIChatRequest) -> Result<(), ProxyError> {
    if req.n.is_some_and(|n| n > 1) {
        return Err(ProxyError::UnsupportedFeature(
            "n > 1 (multiple choices)".into(),
        ));
    }

    if let Some(format) = &req.response_format {
        let format_type = format.get("type").and_then(Value::as_str).unwrap_or("text");
        if format_type != "text" {
            return Err(ProxyError::UnsupportedFeature(format!(
                "response_format '{format_type}'"
            )));
        }
    }

    if let Some(modality) = req
        .modalities
        .iter()
        .flatten()
        .find(|m| m.as_str() != "text")
    {
        return Err(ProxyError::UnsupportedFeature(format!(
            "output modality '{modality}'"
        )));
    }

    Ok(())
}

fn extract_text_content(content: &OpenAIContent) -> Result<String, ProxyError> {
    match content {
        OpenAIContent::Text(t) => Ok(t.clone()),
        OpenAIContent::Parts(parts) => {
            let mut texts = Vec::new();
            for part in parts {
                match part {
                    OpenAIContentPart::Text { text } => texts.push(text.as_str()),
                    _ => {
                        return Err(ProxyError::UnsupportedFeature(
                            "non-text content in a system or tool message".into(),
                        ));
                    }
                }
            }
            Ok(texts.join("\n"))
        }
        OpenAIContent::Null => Ok(String::new()),
    }
}

fn convert_message_content(
    content: &OpenAIContent,
    tool_calls: Option<&[OpenAIToolCall]>,
) -> Result<Vec<UpstreamContent>, ProxyError> {
    let mut result = Vec::new();

    match content {
        OpenAIContent::Text(text) => {
            if !text.is_empty() {
                result.push(UpstreamContent::Text { text: text.clone() });
            }
        }
        OpenAIContent::Parts(parts) => {
            for part in parts {
                match part {
                    OpenAIContentPart::Text { text } => {
                        if !text.is_empty() {
                            result.push(UpstreamContent::Text { text: text.clone() });
                        }
                    }
                    OpenAIContentPart::ImageUrl { image_url } => {
                        result.push(UpstreamContent::Image {
                            source: convert_image_url(&image_url.url)?,
                        });
                    }
                    OpenAIContentPart::Unsupported => {
                        return Err(ProxyError::UnsupportedFeature(
                            "content part type (only text and image_url are supported)".into(),
                        ));
                    }
                }
            }
        }
        OpenAIContent::Null => {}
    }

    for call in tool_calls.unwrap_or_default() {
        let input: Value = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.function.arguments).map_err(|e| {
                ProxyError::UnsupportedFeature(format!(
                    "tool call {} has invalid JSON arguments: {e}",
                    call.id
                ))
            })?
        };
        result.push(UpstreamContent::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input,
        });
    }

    // Ensure non-empty content
    if result.is_empty() {
        result.push(UpstreamContent::Text {
            text: String::new(),
        });
    }

    Ok(result)
}

fn convert_image_url(url: &str) -> Result<ImageSource, ProxyError> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (header, data) = rest.split_once(',').ok_or_else(|| {
            ProxyError::InvalidRequest("image data URL without a payload".into())
        })?;
        let Some(media_type) = header.strip_suffix(";base64") else {
            return Err(ProxyError::UnsupportedFeature(
                "image data URLs that are not base64-encoded".into(),
            ));
        };
        return Ok(ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        });
    }

    if url.starts_with("https://") || url.starts_with("http://") {
        return Ok(ImageSource::Url {
            url: url.to_string(),
        });
    }

    Err(ProxyError::UnsupportedFeature(
        "image URLs other than data: or http(s)".into(),
    ))
}

fn convert_tool(tool: OpenAITool) -> Result<UpstreamTool, ProxyError> {
    // OpenAI format: {"type": "function", "function": {"name": "...", "description": "...", "parameters": {...}}}
    // Anthropic format: {"name": "...", "description": "...", "input_schema": {...}}
    if tool.tool_type != "function" {
        return Err(ProxyError::UnsupportedFeature(format!(
            "tool type '{}'",
            tool.tool_type
        )));
    }

    let function = tool.function.ok_or_else(|| {
        ProxyError::UnsupportedFeature("function tool without a function definition".into())
    })?;
    let name = function
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ProxyError::UnsupportedFeature("function tool without a name".into()))?;

    Ok(UpstreamTool {
        name,
        description: function.description,
        input_schema: function
            .parameters
            .unwrap_or_else(|| json!({"type": "object"})),
    })
}

fn convert_tool_choice(choice: Value) -> Result<Value, ProxyError> {
    match &choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Ok(json!({"type": "auto"})),
            "none" => Ok(json!({"type": "none"})),
            "required" => Ok(json!({"type": "any"})),
            other => Err(ProxyError::UnsupportedFeature(format!(
                "tool_choice '{other}'"
            ))),
        },
        Value::Object(obj) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str);
            match (obj.get("type").and_then(Value::as_str), name) {
                (Some("function"), Some(name)) => Ok(json!({"type": "tool", "name": name})),
                _ => Err(ProxyError::UnsupportedFeature(format!(
                    "tool_choice {choice}"
                ))),
            }
        }
        _ => Err(ProxyError::UnsupportedFeature(format!(
            "tool_choice {choice}"
        ))),
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: Value) -> OpenAIChatRequest {
        serde_json::from_value(body).unwrap()
    }

    fn translate(body: Value) -> Result<UpstreamRequest, ProxyError> {
        transform_openai_request(request(body), "claude-sonnet-4-20250514")
    }

    #[test]
    fn test_system_message_is_hoisted() {
        let upstream = translate(json!({
            "model": "claude-sonnet-4",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "Hello!"},
                {"role": "assistant", "content": "Hi."},
                {"role": "system", "content": [{"type": "text", "text": "Also polite."}]},
                {"role": "user", "content": "Bye"}
            ]
        }))
        .unwrap();

        assert_eq!(upstream.system.as_deref(), Some("Be terse.\n\nAlso polite."));
        let roles: Vec<UpstreamRole> = upstream.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![UpstreamRole::User, UpstreamRole::Assistant, UpstreamRole::User]
        );

        let wire = serde_json::to_value(&upstream).unwrap();
        for message in wire["messages"].as_array().unwrap() {
            assert_ne!(message["role"], "system");
            assert!(!message.to_string().contains("Be terse."));
        }
    }

    #[test]
    fn test_passthrough_fields() {
        let upstream = translate(json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "Hello!"}],
            "max_tokens": 50,
            "stream": true,
            "temperature": 0.5,
            "stop": "END"
        }))
        .unwrap();

        assert_eq!(upstream.model, "claude-sonnet-4-20250514");
        assert_eq!(upstream.max_tokens, 50);
        assert!(upstream.stream);
        assert_eq!(upstream.temperature, Some(0.5));
        assert_eq!(upstream.stop_sequences, Some(vec!["END".to_string()]));
        assert!(upstream.system.is_none());
        assert_eq!(
            upstream.messages[0].content,
            vec![UpstreamContent::Text {
                text: "Hello!".into()
            }]
        );
    }

    #[test]
    fn test_max_tokens_defaults() {
        let upstream = translate(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}]
        }))
        .unwrap();
        assert_eq!(upstream.max_tokens, DEFAULT_MAX_TOKENS);
        assert!(!upstream.stream);

        let upstream = translate(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "max_completion_tokens": 77
        }))
        .unwrap();
        assert_eq!(upstream.max_tokens, 77);
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let err = translate(json!({
            "model": "m",
            "messages": [{"role": "function", "name": "f", "content": "{}"}]
        }))
        .unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedFeature(ref m) if m.contains("function")));
    }

    #[test]
    fn test_tool_round_trip_messages() {
        let upstream = translate(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "Weather in Oslo?"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "Rainy"}
            ]
        }))
        .unwrap();

        assert_eq!(
            upstream.messages[1].content,
            vec![UpstreamContent::ToolUse {
                id: "call_1".into(),
                name: "get_weather".into(),
                input: json!({"city": "Oslo"})
            }]
        );
        assert_eq!(upstream.messages[2].role, UpstreamRole::User);
        assert_eq!(
            upstream.messages[2].content,
            vec![UpstreamContent::ToolResult {
                tool_use_id: "call_1".into(),
                content: "Rainy".into()
            }]
        );
    }

    #[test]
    fn test_unparsable_tool_arguments() {
        let err = translate(json!({
            "model": "m",
            "messages": [{"role": "assistant", "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "f", "arguments": "{not json"}
            }]}]
        }))
        .unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_tools_are_mapped() {
        let upstream = translate(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Get weather",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
                }
            }],
            "tool_choice": {"type": "function", "function": {"name": "get_weather"}}
        }))
        .unwrap();

        let wire = serde_json::to_value(&upstream).unwrap();
        assert_eq!(wire["tools"][0]["name"], "get_weather");
        assert_eq!(wire["tools"][0]["description"], "Get weather");
        assert_eq!(wire["tools"][0]["input_schema"]["properties"]["city"]["type"], "string");
        assert_eq!(wire["tool_choice"], json!({"type": "tool", "name": "get_weather"}));
    }

    #[test]
    fn test_tool_choice_modes() {
        assert_eq!(convert_tool_choice(json!("auto")).unwrap(), json!({"type": "auto"}));
        assert_eq!(convert_tool_choice(json!("none")).unwrap(), json!({"type": "none"}));
        assert_eq!(convert_tool_choice(json!("required")).unwrap(), json!({"type": "any"}));
        assert!(convert_tool_choice(json!("sometimes")).is_err());
    }

    #[test]
    fn test_unrepresentable_tools_fail() {
        let err = translate(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"type": "code_interpreter"}]
        }))
        .unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedFeature(_)));

        let err = translate(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"type": "function", "function": {"description": "nameless"}}]
        }))
        .unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_features_without_upstream_analog() {
        for extra in [
            json!({"n": 2}),
            json!({"response_format": {"type": "json_schema", "json_schema": {}}}),
            json!({"modalities": ["text", "audio"]}),
        ] {
            let mut body = json!({
                "model": "m",
                "messages": [{"role": "user", "content": "x"}]
            });
            body.as_object_mut()
                .unwrap()
                .extend(extra.as_object().unwrap().clone());
            assert!(
                matches!(translate(body).unwrap_err(), ProxyError::UnsupportedFeature(_)),
                "{extra}"
            );
        }

        let err = translate(json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "input_audio", "input_audio": {"data": "", "format": "wav"}}
            ]}]
        }))
        .unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_image_parts() {
        let upstream = translate(json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "What is this?"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBORw0KGgo="}},
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.jpg"}}
            ]}]
        }))
        .unwrap();

        let content = &upstream.messages[0].content;
        assert_eq!(content.len(), 3);
        assert_eq!(
            content[1],
            UpstreamContent::Image {
                source: ImageSource::Base64 {
                    media_type: "image/png".into(),
                    data: "iVBORw0KGgo=".into()
                }
            }
        );
        assert_eq!(
            content[2],
            UpstreamContent::Image {
                source: ImageSource::Url {
                    url: "https://example.com/cat.jpg".into()
                }
            }
        );
    }

    #[test]
    fn test_stop_reason_table() {
        let table = [
            ("end_turn", "stop"),
            ("stop_sequence", "stop"),
            ("pause_turn", "stop"),
            ("max_tokens", "length"),
            ("model_context_window_exceeded", "length"),
            ("tool_use", "tool_calls"),
            ("refusal", "content_filter"),
        ];
        for (upstream, expected) in table {
            assert_eq!(map_stop_reason(Some(upstream)), expected, "{upstream}");
        }
        assert_eq!(map_stop_reason(None), "stop");
        assert_eq!(map_stop_reason(Some("brand_new_reason")), "stop");
    }

    #[test]
    fn test_transform_text_response() {
        let resp: AnthropicResponse = serde_json::from_value(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig"},
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": " there"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 5}
        }))
        .unwrap();

        let out = serde_json::to_value(transform_openai_response(resp, "claude-sonnet-4")).unwrap();
        assert_eq!(out["id"], "chatcmpl-msg_01");
        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["model"], "claude-sonnet-4");
        assert_eq!(out["choices"][0]["message"]["role"], "assistant");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello there");
        assert_eq!(out["choices"][0]["message"]["reasoning_content"], "hmm");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(
            out["usage"],
            json!({"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17})
        );
    }

    #[test]
    fn test_transform_tool_use_response() {
        let resp: AnthropicResponse = serde_json::from_value(json!({
            "id": "msg_02",
            "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Oslo"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 3, "output_tokens": 4}
        }))
        .unwrap();

        let out = serde_json::to_value(transform_openai_response(resp, "m")).unwrap();
        let message = &out["choices"][0]["message"];
        assert!(message["content"].is_null());
        assert_eq!(message["tool_calls"][0]["id"], "toolu_1");
        assert_eq!(message["tool_calls"][0]["type"], "function");
        assert_eq!(message["tool_calls"][0]["function"]["name"], "get_weather");
        assert_eq!(
            message["tool_calls"][0]["function"]["arguments"],
            "{\"city\":\"Oslo\"}"
        );
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
    }
}
