//! SSE stream transformations.
//!
//! Upstream bytes flow through three stages:
//! - `SseDecoder`: reassembles complete SSE frames from arbitrarily split chunks
//! - `translate_stream`: turns upstream events into ordered `StreamDelta`s
//! - `stream_to_openai_sse`: renders deltas as OpenAI `chat.completion.chunk` frames
//!
//! The encoder emits keep-alive comments to prevent connection timeouts
//! during long-running requests (e.g., extended thinking).

use async_stream::stream;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, warn};

use super::openai_compat::{OpenAIUsage, map_stop_reason, unix_now};
use crate::error::ProxyError;

/// Keep-alive interval for SSE streams (prevents proxy/load balancer timeouts).
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// SSE keep-alive comment (ignored by clients but keeps connection alive).
const KEEP_ALIVE_COMMENT: &str = ": keep-alive\n\n";

const DONE_FRAME: &str = "data: [DONE]\n\n";

// ============================================================================
// SSE Frame Decoding
// ============================================================================

/// One complete server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Bytes are buffered until a blank line closes the
/// frame, so chunk boundaries (even inside a UTF-8 sequence) never matter.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame carrying data, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<SseFrame>, ProxyError> {
        while let Some((end, delimiter_len)) = find_frame_end(&self.buffer) {
            let raw = self.buffer.split_to(end);
            self.buffer.advance(delimiter_len);

            let text = std::str::from_utf8(&raw)
                .map_err(|e| ProxyError::MalformedStream(format!("frame is not UTF-8: {e}")))?;

            if let Some(frame) = parse_frame(text) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    /// True when bytes of an unfinished frame are still buffered.
    pub fn has_partial_frame(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }
}

fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}

fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.join("\n"),
    })
}

// ============================================================================
// Anthropic SSE Event Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UpstreamEvent {
    MessageStart {
        message: MessageInfo,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop,
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        usage: Option<StreamUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    id: String,
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    #[serde(default)]
    message: String,
}

// ============================================================================
// Stream Deltas
// ============================================================================

/// Incremental piece of a chat completion, in upstream order.
#[derive(Debug)]
pub enum StreamDelta {
    /// The assistant turn began.
    Start { id: String },
    /// A tool call began; `index` is the tool call's ordinal in this turn.
    ToolCallStart { index: u32, id: String, name: String },
    Content(ContentDelta),
    Finish { finish_reason: &'static str },
    /// Terminal: the turn completed.
    Done { usage: OpenAIUsage },
    /// Terminal: the stream failed.
    Error(ProxyError),
}

impl StreamDelta {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamDelta::Done { .. } | StreamDelta::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentDelta {
    Text(String),
    Reasoning(String),
    ToolArguments { index: u32, partial_json: String },
    /// A delta kind with no OpenAI counterpart (e.g. thinking signatures).
    Opaque,
}

/// Per-stream translation state.
#[derive(Debug, Default)]
struct EventTranslator {
    /// Upstream content block index → tool call ordinal
    tool_calls: HashMap<u32, u32>,
    input_tokens: u32,
    output_tokens: u32,
}

impl EventTranslator {
    fn on_event(&mut self, event: UpstreamEvent) -> Option<StreamDelta> {
        match event {
            UpstreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.record_usage(&usage);
                }
                Some(StreamDelta::Start { id: message.id })
            }
            UpstreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if content_block.block_type != "tool_use" {
                    return None;
                }
                let ordinal = self.tool_calls.len() as u32;
                self.tool_calls.insert(index, ordinal);
                Some(StreamDelta::ToolCallStart {
                    index: ordinal,
                    id: content_block.id.unwrap_or_default(),
                    name: content_block.name.unwrap_or_default(),
                })
            }
            UpstreamEvent::ContentBlockDelta { index, delta } => {
                let content = match delta {
                    BlockDelta::TextDelta { text } => ContentDelta::Text(text),
                    BlockDelta::ThinkingDelta { thinking } => ContentDelta::Reasoning(thinking),
                    BlockDelta::InputJsonDelta { partial_json } => ContentDelta::ToolArguments {
                        index: self.tool_calls.get(&index).copied().unwrap_or(0),
                        partial_json,
                    },
                    BlockDelta::Other => ContentDelta::Opaque,
                };
                Some(StreamDelta::Content(content))
            }
            UpstreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.record_usage(&usage);
                }
                Some(StreamDelta::Finish {
                    finish_reason: map_stop_reason(delta.stop_reason.as_deref()),
                })
            }
            UpstreamEvent::MessageStop => Some(StreamDelta::Done {
                usage: OpenAIUsage::new(self.input_tokens, self.output_tokens),
            }),
            UpstreamEvent::Error { error } => Some(StreamDelta::Error(
                ProxyError::from_stream_error(&error.error_type, &error.message),
            )),
            UpstreamEvent::ContentBlockStop | UpstreamEvent::Ping | UpstreamEvent::Unknown => None,
        }
    }

    fn record_usage(&mut self, usage: &StreamUsage) {
        if let Some(input) = usage.input_tokens {
            self.input_tokens = input;
        }
        if let Some(output) = usage.output_tokens {
            self.output_tokens = output;
        }
    }
}

/// Translate an upstream SSE body into ordered deltas.
///
/// The stream always ends with exactly one terminal delta (`Done` or
/// `Error`). A read that stalls for longer than `idle_timeout` ends it with
/// `UpstreamTimeout`. Dropping the returned stream drops `body`.
pub fn translate_stream<S, E>(
    body: S,
    idle_timeout: Duration,
) -> impl Stream<Item = StreamDelta> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    stream! {
        let mut body = std::pin::pin!(body);
        let mut decoder = SseDecoder::new();
        let mut translator = EventTranslator::default();

        loop {
            let chunk = match tokio::time::timeout(idle_timeout, body.next()).await {
                Err(_) => {
                    warn!("Upstream stream idle for {idle_timeout:?}, aborting");
                    yield StreamDelta::Error(ProxyError::UpstreamTimeout);
                    return;
                }
                Ok(None) => {
                    let detail = if decoder.has_partial_frame() {
                        "upstream closed mid-frame"
                    } else {
                        "upstream closed before message_stop"
                    };
                    yield StreamDelta::Error(ProxyError::MalformedStream(detail.to_string()));
                    return;
                }
                Ok(Some(Err(e))) => {
                    yield StreamDelta::Error(ProxyError::MalformedStream(format!(
                        "failed to read upstream body: {e}"
                    )));
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            decoder.push(&chunk);

            loop {
                let frame = match decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        yield StreamDelta::Error(e);
                        return;
                    }
                };

                let event: UpstreamEvent = match serde_json::from_str(&frame.data) {
                    Ok(event) => event,
                    Err(e) => {
                        yield StreamDelta::Error(ProxyError::MalformedStream(format!(
                            "unparsable {} event: {e}",
                            frame.event.as_deref().unwrap_or("data")
                        )));
                        return;
                    }
                };

                if let Some(delta) = translator.on_event(event) {
                    let terminal = delta.is_terminal();
                    yield delta;
                    if terminal {
                        return;
                    }
                }
            }
        }
    }
}

// ============================================================================
// OpenAI SSE Encoding
// ============================================================================

struct ChunkWriter {
    id: String,
    created: u64,
    model: String,
}

impl ChunkWriter {
    fn frame(&self, delta: Value, finish_reason: Option<&str>) -> Bytes {
        let chunk = json!({
            "id": &self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": &self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason
            }]
        });
        Bytes::from(format!("data: {chunk}\n\n"))
    }

    fn usage_frame(&self, usage: OpenAIUsage) -> Bytes {
        let chunk = json!({
            "id": &self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": &self.model,
            "choices": [],
            "usage": usage
        });
        Bytes::from(format!("data: {chunk}\n\n"))
    }
}

fn content_delta(content: ContentDelta) -> Value {
    match content {
        ContentDelta::Text(text) => json!({ "content": text }),
        ContentDelta::Reasoning(thinking) => json!({ "reasoning_content": thinking }),
        ContentDelta::ToolArguments {
            index,
            partial_json,
        } => json!({
            "tool_calls": [{
                "index": index,
                "function": { "arguments": partial_json }
            }]
        }),
        ContentDelta::Opaque => json!({}),
    }
}

/// Logs streams that end before a terminal frame was written.
struct DisconnectGuard {
    finished: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Client went away mid-stream, cancelling upstream request");
        }
    }
}

/// Render deltas as OpenAI SSE frames.
///
/// `model` is echoed as given (the caller's alias). Successful streams end
/// with `data: [DONE]`, preceded by a usage chunk when `include_usage` is
/// set; failed streams end with an error frame and no `[DONE]`.
///
/// Includes keep-alive pings every 15 seconds to prevent connection timeouts.
pub fn stream_to_openai_sse(
    deltas: impl Stream<Item = StreamDelta> + Send + 'static,
    model: String,
    include_usage: bool,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        let mut deltas = std::pin::pin!(deltas);
        let mut guard = DisconnectGuard { finished: false };
        let mut writer = ChunkWriter {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: unix_now(),
            model,
        };

        let mut keep_alive = interval(KEEP_ALIVE_INTERVAL);
        keep_alive.reset(); // Don't fire immediately

        loop {
            tokio::select! {
                biased; // Prefer data over keep-alive when both ready

                delta = deltas.next() => {
                    let Some(delta) = delta else {
                        // Upstream translation always ends with a terminal delta
                        guard.finished = true;
                        break;
                    };
                    keep_alive.reset();

                    match delta {
                        StreamDelta::Start { id } => {
                            writer.id = format!("chatcmpl-{id}");
                            yield Ok(writer.frame(json!({ "role": "assistant", "content": "" }), None));
                        }
                        StreamDelta::ToolCallStart { index, id, name } => {
                            let delta = json!({
                                "tool_calls": [{
                                    "index": index,
                                    "id": id,
                                    "type": "function",
                                    "function": { "name": name, "arguments": "" }
                                }]
                            });
                            yield Ok(writer.frame(delta, None));
                        }
                        StreamDelta::Content(content) => {
                            yield Ok(writer.frame(content_delta(content), None));
                        }
                        StreamDelta::Finish { finish_reason } => {
                            yield Ok(writer.frame(json!({}), Some(finish_reason)));
                        }
                        StreamDelta::Done { usage } => {
                            guard.finished = true;
                            if include_usage {
                                yield Ok(writer.usage_frame(usage));
                            }
                            yield Ok(Bytes::from(DONE_FRAME));
                            break;
                        }
                        StreamDelta::Error(e) => {
                            guard.finished = true;
                            warn!("Stream terminated with error: {e}");
                            yield Ok(Bytes::from(format!("data: {}\n\n", e.to_openai_body())));
                            break;
                        }
                    }
                }

                // Keep-alive timer fired
                _ = keep_alive.tick() => {
                    yield Ok(Bytes::from(KEEP_ALIVE_COMMENT));
                }
            }
        }
    }
}
