//! Request/response transformations between the OpenAI and Anthropic formats.
//!
//! This module provides:
//! - `openai_compat`: OpenAI ↔ Anthropic format conversion
//! - `streaming`: SSE stream transformations

pub mod openai_compat;
pub mod streaming;

// Re-export commonly used items
pub use openai_compat::{
    AnthropicResponse, OpenAIChatRequest, transform_openai_request, transform_openai_response,
};
pub use streaming::{stream_to_openai_sse, translate_stream};
