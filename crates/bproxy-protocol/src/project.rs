//! Projects decoder output into the outbound OpenAI-compatible SSE stream.

use bytes::Bytes;
use time::OffsetDateTime;

use crate::openai::{
    ChatCompletionChunk, ChunkObjectType, FinishReason, StreamChoice, StreamDelta,
};

/// Prefix signaling the consumer to replace its entire visible content with
/// what follows, instead of appending. Emitted when an earlier classification
/// had to be corrected retroactively.
pub const CONTENT_REPLACE_MARKER: &str = "<<[REPLACE]>>";

/// Literal stream-termination frame.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Builds the delta frames for one streamed completion.
///
/// All frames of a stream share one id and creation timestamp; ids are
/// monotonic across streams (time-ordered).
#[derive(Debug, Clone)]
pub struct ResponseProjector {
    id: String,
    model: String,
    created: i64,
}

impl ResponseProjector {
    pub fn new(id: String, model: String) -> Self {
        Self {
            id,
            model,
            created: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    fn chunk(&self, delta: StreamDelta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: ChunkObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            conversation_id: None,
        }
    }

    /// Zero, one, or two delta frames: reasoning first, then content.
    pub fn project_chunk(&self, thinking_delta: &str, answer_delta: &str) -> Vec<ChatCompletionChunk> {
        let mut frames = Vec::new();
        if !thinking_delta.is_empty() {
            frames.push(self.chunk(
                StreamDelta {
                    reasoning_content: Some(thinking_delta.to_string()),
                    ..Default::default()
                },
                None,
            ));
        }
        if !answer_delta.is_empty() {
            frames.push(self.chunk(
                StreamDelta {
                    content: Some(answer_delta.to_string()),
                    ..Default::default()
                },
                None,
            ));
        }
        frames
    }

    /// One frame whose content substitutes everything emitted so far.
    pub fn project_replace(&self, full_content: &str) -> ChatCompletionChunk {
        self.chunk(
            StreamDelta {
                content: Some(format!("{CONTENT_REPLACE_MARKER}{full_content}")),
                ..Default::default()
            },
            None,
        )
    }

    /// The trailer frame: empty delta, stop reason, and the conversation id
    /// needed to resume the exchange later. The caller follows it with
    /// [`DONE_FRAME`].
    pub fn project_trailer(&self, conversation_id: &str) -> ChatCompletionChunk {
        let mut chunk = self.chunk(StreamDelta::default(), Some(FinishReason::Stop));
        chunk.conversation_id = Some(conversation_id.to_string());
        chunk
    }
}

/// Encodes one chunk as an SSE data line.
pub fn encode_chunk(chunk: &ChatCompletionChunk) -> Bytes {
    // Serialization of these fully-owned types cannot fail.
    let json = serde_json::to_string(chunk).unwrap_or_default();
    Bytes::from(format!("data: {json}\n\n"))
}
