//! Incremental assembly of stream chunks into content parts.
//!
//! The assembler keeps track of which text/reasoning part is still "open" so
//! consecutive deltas merge into one part instead of producing a part per
//! chunk. A reasoning part is closed, and its duration stamped, the moment
//! any non-reasoning chunk arrives.

use std::sync::Arc;

use crate::models::message::{ContentPart, ToolCallState, now_millis};
use crate::repositories::error::RepositoryResult;
use crate::services::llm_service::StreamChunk;
use crate::services::storage_service::BlobStorage;

pub struct StreamAssembler {
    parts: Vec<ContentPart>,
    /// Index into `parts` of the text part currently receiving deltas.
    open_text: Option<usize>,
    /// Index into `parts` of the reasoning part currently receiving deltas.
    open_reasoning: Option<usize>,
    storage: Arc<dyn BlobStorage>,
    /// Blob key prefix, normally the session id.
    scope: String,
}

impl StreamAssembler {
    pub fn new(storage: Arc<dyn BlobStorage>, scope: impl Into<String>) -> Self {
        Self {
            parts: Vec::new(),
            open_text: None,
            open_reasoning: None,
            storage,
            scope: scope.into(),
        }
    }

    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    pub fn into_parts(mut self) -> Vec<ContentPart> {
        self.close_reasoning();
        self.parts
    }

    /// Fold one chunk into the accumulated parts.
    ///
    /// Unknown chunk kinds and bookkeeping chunks (`TokenUsage`, `Done`) are
    /// ignored; the generation controller reads those off the stream itself.
    pub async fn apply(&mut self, chunk: StreamChunk) -> RepositoryResult<()> {
        match chunk {
            StreamChunk::TextDelta(delta) => {
                self.close_reasoning();
                match self.open_text {
                    Some(index) => {
                        if let ContentPart::Text { text } = &mut self.parts[index] {
                            text.push_str(&delta);
                        }
                    }
                    None => {
                        self.parts.push(ContentPart::Text { text: delta });
                        self.open_text = Some(self.parts.len() - 1);
                    }
                }
            }
            StreamChunk::ReasoningDelta(delta) => {
                // Some providers emit empty keep-alive reasoning chunks;
                // skip them so they don't open a part.
                if delta.is_empty() {
                    return Ok(());
                }
                self.open_text = None;
                match self.open_reasoning {
                    Some(index) => {
                        if let ContentPart::Reasoning { text, .. } = &mut self.parts[index] {
                            text.push_str(&delta);
                        }
                    }
                    None => {
                        self.parts.push(ContentPart::Reasoning {
                            text: delta,
                            start_time: Some(now_millis()),
                            duration_ms: None,
                        });
                        self.open_reasoning = Some(self.parts.len() - 1);
                    }
                }
            }
            StreamChunk::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                self.close_reasoning();
                self.open_text = None;
                self.parts.push(ContentPart::ToolCall {
                    tool_call_id,
                    tool_name,
                    args,
                    state: ToolCallState::Call,
                    result: None,
                });
            }
            StreamChunk::ToolResult {
                tool_call_id,
                result,
                is_error,
            } => {
                // Match the most recent call with this id.
                for part in self.parts.iter_mut().rev() {
                    if let ContentPart::ToolCall {
                        tool_call_id: id,
                        state,
                        result: slot,
                        ..
                    } = part
                        && *id == tool_call_id
                    {
                        *state = if is_error {
                            ToolCallState::Error
                        } else {
                            ToolCallState::Result
                        };
                        *slot = Some(result);
                        break;
                    }
                }
            }
            StreamChunk::File {
                mime_type,
                data_url,
            } => {
                if mime_type.starts_with("image/") {
                    self.close_reasoning();
                    self.open_text = None;
                    let storage_key = self.storage.save_image(&self.scope, &data_url).await?;
                    self.parts.push(ContentPart::Image {
                        storage_key,
                        ocr_result: None,
                    });
                }
            }
            StreamChunk::Info(text) => {
                self.close_reasoning();
                self.open_text = None;
                self.parts.push(ContentPart::Info { text });
            }
            // TokenUsage and Done bookkeeping, plus any future chunk kinds.
            _ => {}
        }
        Ok(())
    }

    /// Close any still-open reasoning part. Called when the stream ends for
    /// any reason, so an interrupted generation still gets its thinking time.
    pub fn finish(&mut self) {
        self.close_reasoning();
        self.open_text = None;
    }

    fn close_reasoning(&mut self) {
        if let Some(index) = self.open_reasoning.take()
            && let ContentPart::Reasoning {
                start_time,
                duration_ms,
                ..
            } = &mut self.parts[index]
        {
            let started = start_time.unwrap_or_else(now_millis);
            // Clamp to 1ms so non-streaming providers that deliver all
            // reasoning at once still show a non-zero duration.
            *duration_ms = Some((now_millis() - started).max(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage_service::InMemoryBlobStorage;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    fn assembler() -> StreamAssembler {
        StreamAssembler::new(Arc::new(InMemoryBlobStorage::new()), "test-session")
    }

    #[tokio::test]
    async fn consecutive_text_deltas_merge_into_one_part() {
        let mut asm = assembler();
        asm.apply(StreamChunk::TextDelta("Hel".into())).await.unwrap();
        asm.apply(StreamChunk::TextDelta("lo".into())).await.unwrap();
        asm.finish();

        assert_eq!(asm.parts().len(), 1);
        assert_eq!(
            asm.parts()[0],
            ContentPart::Text {
                text: "Hello".into()
            }
        );
    }

    #[tokio::test]
    async fn text_after_reasoning_closes_and_stamps_duration() {
        let mut asm = assembler();
        asm.apply(StreamChunk::ReasoningDelta("thinking".into()))
            .await
            .unwrap();
        asm.apply(StreamChunk::TextDelta("answer".into()))
            .await
            .unwrap();

        let ContentPart::Reasoning {
            start_time,
            duration_ms,
            ..
        } = &asm.parts()[0]
        else {
            panic!("expected reasoning part first");
        };
        assert!(start_time.is_some());
        assert!(duration_ms.unwrap() >= 1);
    }

    #[tokio::test]
    async fn interrupted_reasoning_still_gets_duration_on_finish() {
        let mut asm = assembler();
        asm.apply(StreamChunk::ReasoningDelta("partial".into()))
            .await
            .unwrap();
        asm.finish();

        let ContentPart::Reasoning { duration_ms, .. } = &asm.parts()[0] else {
            panic!("expected reasoning part");
        };
        assert!(duration_ms.unwrap() >= 1);
    }

    #[tokio::test]
    async fn empty_reasoning_delta_does_not_open_a_part() {
        let mut asm = assembler();
        asm.apply(StreamChunk::ReasoningDelta(String::new()))
            .await
            .unwrap();
        asm.finish();
        assert!(asm.parts().is_empty());
    }

    #[tokio::test]
    async fn text_resumes_in_new_part_after_tool_call() {
        let mut asm = assembler();
        asm.apply(StreamChunk::TextDelta("before".into()))
            .await
            .unwrap();
        asm.apply(StreamChunk::ToolCall {
            tool_call_id: "tc-1".into(),
            tool_name: "search".into(),
            args: serde_json::json!({"q": "x"}),
        })
        .await
        .unwrap();
        asm.apply(StreamChunk::TextDelta("after".into()))
            .await
            .unwrap();

        assert_eq!(asm.parts().len(), 3);
        assert_eq!(
            asm.parts()[2],
            ContentPart::Text {
                text: "after".into()
            }
        );
    }

    #[tokio::test]
    async fn tool_result_updates_matching_call() {
        let mut asm = assembler();
        asm.apply(StreamChunk::ToolCall {
            tool_call_id: "tc-1".into(),
            tool_name: "search".into(),
            args: serde_json::json!({}),
        })
        .await
        .unwrap();
        asm.apply(StreamChunk::ToolResult {
            tool_call_id: "tc-1".into(),
            result: serde_json::json!({"hits": 2}),
            is_error: false,
        })
        .await
        .unwrap();

        let ContentPart::ToolCall { state, result, .. } = &asm.parts()[0] else {
            panic!("expected tool call part");
        };
        assert_eq!(*state, ToolCallState::Result);
        assert_eq!(result.as_ref().unwrap()["hits"], 2);
    }

    #[tokio::test]
    async fn image_file_is_stored_and_referenced_by_key() {
        let storage = Arc::new(InMemoryBlobStorage::new());
        let mut asm = StreamAssembler::new(storage.clone(), "s-9");
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(b"png"));
        asm.apply(StreamChunk::File {
            mime_type: "image/png".into(),
            data_url,
        })
        .await
        .unwrap();

        let ContentPart::Image { storage_key, .. } = &asm.parts()[0] else {
            panic!("expected image part");
        };
        assert!(storage_key.starts_with("s-9/"));
        assert!(storage.get_blob(storage_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bookkeeping_chunks_are_ignored() {
        let mut asm = assembler();
        asm.apply(StreamChunk::TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        })
        .await
        .unwrap();
        asm.apply(StreamChunk::Done(
            crate::models::message::FinishReason::Stop,
        ))
        .await
        .unwrap();
        assert!(asm.parts().is_empty());
    }
}
