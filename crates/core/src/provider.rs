//! Adapter trait — the abstraction over upstream LLM providers.
//!
//! An adapter knows how to translate a canonical request into its
//! provider's native wire format, execute it, and translate the response
//! back. Streaming is an additional capability: adapters that can stream
//! override [`Adapter::execute_stream`] and report it via
//! [`Adapter::supports_streaming`]; the default implementation wraps
//! `execute` into a single terminal chunk.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chat::{
    ApiType, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    EmbeddingsRequest, EmbeddingsResponse, ImageGenerationRequest, ImageGenerationResponse,
    TranscriptionRequest, TranscriptionResponse, Usage,
};
use crate::error::{GatewayError, Result};
use modelrelay_stream::pipe::{DEFAULT_CAPACITY, StreamPipe};

/// The request carrier handed to adapters by the router.
///
/// `model` is the logical model id; the router passes the candidate's
/// upstream model separately and adapters must put that on the wire
/// byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub api_type: ApiType,
    pub model: String,
    pub payload: RequestPayload,
}

impl ProviderRequest {
    pub fn chat(api_type: ApiType, request: ChatCompletionRequest) -> Self {
        Self {
            model: request.model.clone(),
            api_type,
            payload: RequestPayload::Chat(request),
        }
    }
}

/// Typed request payload, interpreted per [`ApiType`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestPayload {
    Chat(ChatCompletionRequest),
    Embeddings(EmbeddingsRequest),
    Images(ImageGenerationRequest),
    Transcription(TranscriptionRequest),
    /// Provider-native body forwarded untouched (Gemini passthrough),
    /// tagged with the native operation name from the request path.
    Raw {
        op: String,
        body: serde_json::Value,
    },
}

/// Typed response payload mirroring [`RequestPayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponsePayload {
    Chat(ChatCompletionResponse),
    Embeddings(EmbeddingsResponse),
    Images(ImageGenerationResponse),
    Transcription(TranscriptionResponse),
    Raw(serde_json::Value),
}

/// Outcome status of one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Success,
    Error,
    Timeout,
}

/// The result of a successful adapter execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResult {
    /// Which provider produced this.
    pub provider: String,
    pub status: ProviderStatus,
    pub payload: ResponsePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Wall-clock time spent on the upstream call.
    pub latency: Duration,
}

/// One chunk flowing through a streaming pipe.
///
/// `data` is the serialized canonical chunk (the SSE `data:` payload).
/// The final chunk carries the cumulative usage for the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub sequence: u64,
    pub data: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn new(id: impl Into<String>, sequence: u64, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sequence,
            data: data.into(),
            is_final: false,
            usage: None,
            error: None,
        }
    }

    pub fn terminal(
        id: impl Into<String>,
        sequence: u64,
        data: impl Into<String>,
        usage: Option<Usage>,
    ) -> Self {
        Self {
            id: id.into(),
            sequence,
            data: data.into(),
            is_final: true,
            usage,
            error: None,
        }
    }

    /// An error chunk terminating the stream abnormally.
    pub fn failed(id: impl Into<String>, sequence: u64, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sequence,
            data: String::new(),
            is_final: true,
            usage: None,
            error: Some(error.into()),
        }
    }
}

/// The pipe type carried between adapters and the SSE writer.
pub type ChunkPipe = StreamPipe<StreamChunk>;

/// The uniform provider contract.
///
/// Adapters own their base URL, credentials, transformers, retry policy,
/// and a dedicated HTTP client; they share no mutable state with each
/// other.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable provider name (e.g. "openai", "anthropic", "gemini").
    fn name(&self) -> &str;

    /// Execute a request against the provider and return the canonical
    /// result. `upstream_model` is the identifier the provider expects on
    /// the wire and must be forwarded unmodified.
    async fn execute(&self, request: &ProviderRequest, upstream_model: &str)
    -> Result<ProviderResult>;

    /// Whether this adapter implements native streaming.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Execute a streaming request, returning the pipe the caller reads
    /// chunks from.
    ///
    /// Default implementation executes non-streaming and emits the whole
    /// response as one terminal chunk, so every adapter is streamable.
    async fn execute_stream(
        &self,
        request: &ProviderRequest,
        upstream_model: &str,
    ) -> Result<Arc<ChunkPipe>> {
        let result = self.execute(request, upstream_model).await?;
        let ResponsePayload::Chat(response) = &result.payload else {
            return Err(GatewayError::RequestMalformed(format!(
                "streaming unsupported for {} requests",
                request.api_type
            )));
        };

        let content = response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        let finish = response
            .choices
            .first()
            .map(|c| c.finish_reason)
            .unwrap_or(crate::chat::FinishReason::Stop);

        let chunk = ChatCompletionChunk::terminal(
            response.id.clone(),
            response.model.clone(),
            finish,
            response.usage,
        );
        let mut chunk = chunk;
        chunk.choices[0].delta.role = Some(crate::chat::ChatRole::Assistant);
        chunk.choices[0].delta.content = Some(content);

        let data = serde_json::to_string(&chunk)
            .map_err(|e| GatewayError::Internal(format!("chunk serialization: {e}")))?;

        let pipe = Arc::new(ChunkPipe::new(DEFAULT_CAPACITY));
        pipe.send(StreamChunk::terminal(
            response.id.clone(),
            0,
            data,
            Some(response.usage),
        ))
        .await
        .map_err(|e| GatewayError::Internal(format!("pipe rejected first chunk: {e}")))?;
        Ok(pipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, FinishReason};

    struct EchoAdapter;

    #[async_trait]
    impl Adapter for EchoAdapter {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            request: &ProviderRequest,
            upstream_model: &str,
        ) -> Result<ProviderResult> {
            let RequestPayload::Chat(chat) = &request.payload else {
                return Err(GatewayError::RequestMalformed("chat only".into()));
            };
            let text = chat.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(ProviderResult {
                provider: "echo".into(),
                status: ProviderStatus::Success,
                payload: ResponsePayload::Chat(ChatCompletionResponse::single(
                    upstream_model,
                    text,
                    FinishReason::Stop,
                    Usage::new(1, 1),
                )),
                usage: Some(Usage::new(1, 1)),
                latency: Duration::from_millis(1),
            })
        }
    }

    fn chat_request(content: &str) -> ProviderRequest {
        ProviderRequest::chat(
            ApiType::Chat,
            ChatCompletionRequest {
                model: "m".into(),
                messages: vec![ChatMessage::user(content)],
                temperature: None,
                top_p: None,
                max_tokens: None,
                stop: vec![],
                user: None,
                stream: false,
            },
        )
    }

    #[tokio::test]
    async fn default_stream_wraps_execute_as_single_terminal_chunk() {
        let adapter = EchoAdapter;
        assert!(!adapter.supports_streaming());

        let pipe = adapter
            .execute_stream(&chat_request("hello"), "m")
            .await
            .unwrap();

        let chunk = pipe.recv().await.unwrap();
        assert!(chunk.is_final);
        assert_eq!(chunk.sequence, 0);
        assert_eq!(chunk.usage.unwrap().total_tokens, 2);

        let parsed: ChatCompletionChunk = serde_json::from_str(&chunk.data).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("hello"));
        assert_eq!(parsed.choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn provider_request_keeps_logical_model() {
        let req = chat_request("x");
        assert_eq!(req.model, "m");
        assert_eq!(req.api_type, ApiType::Chat);
    }
}
