//! Message types and content parts.
//!
//! A [`Message`] is plain data: it carries no callbacks or live handles, so it
//! can be cloned, serialized, and diffed freely. Cancellation handles for
//! in-flight generations live in a side-table owned by the generation
//! controller, keyed by message id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Lifecycle state of a tool-call content part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallState {
    /// The model requested the call; no result yet.
    Call,
    /// The call completed and `result` holds its output.
    Result,
    /// The call failed and `result` holds a serialized error.
    Error,
}

/// One typed unit of assistant output, composed incrementally during
/// generation.
///
/// Invariant during streaming: at most one text part and at most one
/// reasoning part are "open" (still being appended to) at any instant, and a
/// reasoning part is closed (its `duration_ms` stamped) the moment any
/// non-reasoning chunk arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        /// Unix millis when the first reasoning delta arrived.
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<i64>,
        /// Total thinking time. `None` only while the part is still open.
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
        state: ToolCallState,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Image {
        storage_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ocr_result: Option<String>,
    },
    Info {
        text: String,
    },
}

/// Transient sub-state shown while a message is being prepared or generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MessageStatus {
    UploadingFile { file_name: String },
    LoadingAttachment { url: String },
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    /// Normal stop signaled by the provider.
    Stop,
    /// Token limit reached.
    Length,
    /// The provider requested tool execution.
    ToolUse,
    /// The stream terminated due to an error.
    Error,
    /// Cancelled locally.
    Aborted,
}

/// Token counts reported by the provider for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content_parts: Vec<ContentPart>,
    /// True while a generation is actively mutating this message.
    #[serde(default)]
    pub generating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_extra: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    /// Display name of the provider/model that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Latency from request start to the first streamed chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_token_latency_ms: Option<i64>,
    pub timestamp: i64,
}

impl Message {
    /// Create a message with a single text part.
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content_parts: vec![ContentPart::Text { text: text.into() }],
            generating: false,
            error: None,
            error_code: None,
            error_extra: None,
            status: None,
            model: None,
            usage: None,
            finish_reason: None,
            first_token_latency_ms: None,
            timestamp: now_millis(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, text)
    }

    /// Create an empty assistant message in the `generating` state, the
    /// target of a new generation.
    pub fn assistant_pending() -> Self {
        let mut message = Self::new(MessageRole::Assistant, "");
        message.content_parts.clear();
        message.generating = true;
        message
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some() || self.error_code.is_some()
    }

    /// Concatenated text of all plain-text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content_parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}
