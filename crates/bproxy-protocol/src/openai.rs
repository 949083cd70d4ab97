//! Outbound OpenAI-compatible stream types and the minimal inbound request
//! shape the bridge accepts.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkObjectType {
    #[serde(rename = "chat.completion.chunk")]
    ChatCompletionChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: i64,
    pub delta: StreamDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: ChunkObjectType,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    /// Extension field: identity needed to resume this conversation later.
    /// OpenAI-compatible consumers ignore it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Inbound `/v1/chat/completions` body. Fields the bridge does not forward
/// upstream are accepted and dropped rather than rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Resumes an earlier exchange when set.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

fn default_stream() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_serialization_omits_absent_fields() {
        let chunk = ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: ChunkObjectType::ChatCompletionChunk,
            created: 1,
            model: "bridge".to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta {
                    content: Some("hi".to_string()),
                    ..Default::default()
                },
                finish_reason: None,
            }],
            conversation_id: None,
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains("\"object\":\"chat.completion.chunk\""));
        assert!(json.contains("\"content\":\"hi\""));
        assert!(!json.contains("reasoning_content"));
        assert!(!json.contains("conversation_id"));
    }

    #[test]
    fn request_defaults_to_streaming() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"model":"bridge","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert!(req.stream);
        assert!(req.conversation_id.is_none());
    }
}
