//! Abstract streaming model call.
//!
//! Provider adapters (OpenAI, Claude, Gemini, ...) live outside this crate.
//! They implement [`ChatModel`] and decode their wire formats into the
//! provider-agnostic [`StreamChunk`] values consumed by the stream assembler.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::GenerationError;
use crate::models::message::{FinishReason, Message};

/// Chunks emitted while a model streams a reply.
///
/// Marked non-exhaustive so new chunk kinds can be added without breaking
/// consumers; the assembler ignores kinds it does not understand.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        result: Value,
        is_error: bool,
    },
    /// A file produced by the model, as a `data:` URL.
    File {
        mime_type: String,
        data_url: String,
    },
    /// Informational notice to surface inline in the message.
    Info(String),
    TokenUsage {
        input_tokens: u32,
        output_tokens: u32,
    },
    Done(FinishReason),
}

/// Type alias for chunk streams.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, GenerationError>>;

/// Prompt context for one model call.
///
/// Image parts in `messages` reference blob storage keys; the bytes for every
/// key that survived context construction are inlined in `blobs` so provider
/// adapters need no storage access of their own.
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    pub messages: Vec<Message>,
    pub blobs: HashMap<String, Vec<u8>>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A model that can stream one reply for a prompt context.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Display name stamped onto generated messages.
    fn name(&self) -> &str;

    fn supports_vision(&self) -> bool {
        false
    }

    fn supports_tool_use(&self) -> bool {
        false
    }

    fn supports_system_message(&self) -> bool {
        true
    }

    /// Start a completion. Errors raised before any chunk is produced are
    /// returned directly; mid-stream failures arrive as `Err` items.
    async fn chat(&self, context: ChatContext) -> Result<ChunkStream, GenerationError>;
}
