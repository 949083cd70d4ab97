use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use bproxy_auth::{AccessGuard, AccessSerializer, AcquireError, Credential, CredentialPool};
use bproxy_common::{new_completion_id, new_conversation_id};
use bproxy_protocol::project::{encode_chunk, DONE_FRAME};
use bproxy_protocol::{ChatRequest, DecoderConfig, ResponseProjector, SseParser, StreamDecoder};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub upstream_base_url: String,
    /// Upstream path receiving the chat payload.
    pub chat_path: String,
    pub decoder: DecoderConfig,
}

impl EngineConfig {
    pub fn new(upstream_base_url: impl Into<String>) -> Self {
        Self {
            upstream_base_url: upstream_base_url.into(),
            chat_path: "/api/chat".to_string(),
            decoder: DecoderConfig::default(),
        }
    }

    fn chat_url(&self) -> String {
        format!(
            "{}{}",
            self.upstream_base_url.trim_end_matches('/'),
            self.chat_path
        )
    }
}

/// Tracks how much of each decoder buffer has already been emitted, since
/// the decoder only ever appends.
#[derive(Debug, Default)]
struct DeltaTracker {
    thinking_sent: usize,
    answer_sent: usize,
}

impl DeltaTracker {
    fn take<'a>(&mut self, decoder: &'a StreamDecoder) -> (&'a str, &'a str) {
        let thinking = &decoder.thinking()[self.thinking_sent..];
        let answer = &decoder.answer()[self.answer_sent..];
        self.thinking_sent = decoder.thinking().len();
        self.answer_sent = decoder.answer().len();
        (thinking, answer)
    }
}

/// Runs one chat exchange end to end and streams OpenAI-compatible SSE bytes.
pub struct ExchangeEngine {
    pool: Arc<CredentialPool>,
    serializer: Arc<AccessSerializer>,
    client: wreq::Client,
    config: EngineConfig,
}

impl ExchangeEngine {
    pub fn new(
        pool: Arc<CredentialPool>,
        serializer: Arc<AccessSerializer>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let client = wreq::Client::builder()
            .build()
            .map_err(|err| EngineError::Upstream(err.to_string()))?;
        Ok(Self {
            pool,
            serializer,
            client,
            config,
        })
    }

    /// Acquires a credential and its identity lock, issues the upstream call,
    /// and hands back the outbound SSE stream. The identity lock travels with
    /// the pump task and is released exactly once at the terminal event:
    /// upstream EOF, a finish control event, or an error — whichever is first.
    /// Errors before the stream starts release the lock on the way out.
    pub async fn stream_chat(
        &self,
        request: ChatRequest,
    ) -> Result<ReceiverStream<Result<Bytes, EngineError>>, EngineError> {
        let credential = self.pool.acquire().await?;
        let guard = self.serializer.acquire(&credential.identity()).await;

        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(new_conversation_id);
        let response = self.send_upstream(&credential, &request, &conversation_id).await?;

        let projector = ResponseProjector::new(new_completion_id(), request.model.clone());
        let decoder = StreamDecoder::new(self.config.decoder.clone());
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, EngineError>>(32);
        tokio::spawn(pump_stream(
            response,
            decoder,
            projector,
            conversation_id,
            tx,
            guard,
        ));
        Ok(ReceiverStream::new(rx))
    }

    async fn send_upstream(
        &self,
        credential: &Credential,
        request: &ChatRequest,
        conversation_id: &str,
    ) -> Result<wreq::Response, EngineError> {
        let body = json!({
            "messages": request.messages,
            "conversation_id": conversation_id,
            "project_id": credential.project_id,
        });
        let response = self
            .client
            .post(self.config.chat_url())
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", credential.access_token),
            )
            .json(&body)
            .send()
            .await
            .map_err(|err| EngineError::Upstream(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "upstream rejected the exchange");
            return Err(EngineError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

async fn pump_stream(
    response: wreq::Response,
    mut decoder: StreamDecoder,
    projector: ResponseProjector,
    conversation_id: String,
    tx: tokio::sync::mpsc::Sender<Result<Bytes, EngineError>>,
    guard: AccessGuard,
) {
    // Dropping the guard on any return below is the single release point.
    let _guard = guard;
    let mut parser = SseParser::new();
    let mut tracker = DeltaTracker::default();
    let mut stream = response.bytes_stream();

    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx.send(Err(EngineError::Upstream(err.to_string()))).await;
                return;
            }
        };
        for event in parser.push_bytes(&chunk) {
            decoder.push_event(&event);
        }
        if !flush_deltas(&decoder, &projector, &mut tracker, &tx).await {
            // Receiver went away; client disconnected.
            debug!("downstream receiver dropped mid-stream");
            return;
        }
        if decoder.finished() {
            break;
        }
    }

    for event in parser.finish() {
        decoder.push_event(&event);
    }
    if !flush_deltas(&decoder, &projector, &mut tracker, &tx).await {
        return;
    }

    // The decoder's buffers only grow, so every delta sent above stays valid
    // and this path never needs a `CONTENT_REPLACE_MARKER` frame. That frame
    // shape is part of the outbound contract for consumers that re-render a
    // transcript after reclassifying ambiguous text themselves.
    let trailer = projector.project_trailer(&conversation_id);
    if tx.send(Ok(encode_chunk(&trailer))).await.is_err() {
        return;
    }
    let _ = tx.send(Ok(Bytes::from_static(DONE_FRAME.as_bytes()))).await;
}

async fn flush_deltas(
    decoder: &StreamDecoder,
    projector: &ResponseProjector,
    tracker: &mut DeltaTracker,
    tx: &tokio::sync::mpsc::Sender<Result<Bytes, EngineError>>,
) -> bool {
    let (thinking, answer) = tracker.take(decoder);
    for chunk in projector.project_chunk(thinking, answer) {
        if tx.send(Ok(encode_chunk(&chunk))).await.is_err() {
            return false;
        }
    }
    true
}
