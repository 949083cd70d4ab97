//! Wire-level types for bproxy.
//!
//! This crate intentionally performs **no** I/O. It parses the upstream SSE
//! byte stream, folds the provider's diff-patch events into normalized
//! thinking/answer buffers, and renders outbound OpenAI-compatible chunks.
//! A higher layer owns sockets, credentials, and locks.

pub mod decode;
pub mod openai;
pub mod project;
pub mod sse;

pub use decode::{DecoderConfig, Fragment, FragmentLane, StreamDecoder};
pub use openai::{ChatCompletionChunk, ChatMessage, ChatRequest, StreamChoice, StreamDelta};
pub use project::{ResponseProjector, CONTENT_REPLACE_MARKER, DONE_FRAME};
pub use sse::{SseEvent, SseParser};
