//! GPT-family provider adapter.
//!
//! The canonical wire shapes are OpenAI-compatible, so request and
//! response transformation is effectively pass-through; this adapter's
//! work is authentication (`Authorization: Bearer`), endpoint selection
//! per api-type, retries over a replayable body, and SSE re-framing for
//! streams.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, trace, warn};

use modelrelay_core::chat::{ApiType, ChatCompletionChunk, Usage};
use modelrelay_core::error::{GatewayError, Result};
use modelrelay_core::provider::{
    Adapter, ChunkPipe, ProviderRequest, ProviderResult, ProviderStatus, RequestPayload,
    ResponsePayload, StreamChunk,
};
use modelrelay_stream::pipe::DEFAULT_CAPACITY;
use modelrelay_stream::sse::SseParser;

use crate::retry::{RetryPolicy, send_with_retry, status_error, truncate_body};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_STREAM_IDLE: Duration = Duration::from_secs(60);

/// GPT-family adapter.
pub struct OpenAiAdapter {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    stream_idle: Duration,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "openai".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client: build_client(DEFAULT_TIMEOUT),
            retry: RetryPolicy::default(),
            stream_idle: DEFAULT_STREAM_IDLE,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Replace the request timeout. The client's configuration is
    /// immutable after construction, so this builds a fresh client.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, api_type: ApiType) -> Result<String> {
        let path = match api_type {
            ApiType::Chat | ApiType::Responses | ApiType::Messages => "/chat/completions",
            ApiType::Embeddings => "/embeddings",
            ApiType::Images => "/images/generations",
            ApiType::Transcriptions => "/audio/transcriptions",
        };
        Ok(format!("{}{}", self.base_url, path))
    }

    fn json_request(&self, url: &str, body: Vec<u8>) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .body(body)
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("failed to build HTTP client")
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: &ProviderRequest,
        upstream_model: &str,
    ) -> Result<ProviderResult> {
        let url = self.endpoint(request.api_type)?;
        let started = Instant::now();

        let (payload, usage) = match &request.payload {
            RequestPayload::Chat(chat) => {
                let mut chat = chat.clone();
                chat.model = upstream_model.to_string();
                chat.stream = false;
                let body = serde_json::to_vec(&chat)
                    .map_err(|e| GatewayError::Internal(format!("serialize request: {e}")))?;

                debug!(provider = %self.name, model = %upstream_model, "chat completion request");
                let response = send_with_retry(&self.retry, self.json_request(&url, body)).await?;
                let parsed: modelrelay_core::chat::ChatCompletionResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Internal(format!("parse response: {e}")))?;
                let usage = parsed.usage;
                (ResponsePayload::Chat(parsed), Some(usage))
            }
            RequestPayload::Embeddings(embeddings) => {
                let mut embeddings = embeddings.clone();
                embeddings.model = upstream_model.to_string();
                let body = serde_json::to_vec(&embeddings)
                    .map_err(|e| GatewayError::Internal(format!("serialize request: {e}")))?;

                let response = send_with_retry(&self.retry, self.json_request(&url, body)).await?;
                let parsed: modelrelay_core::chat::EmbeddingsResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Internal(format!("parse response: {e}")))?;
                let usage = parsed.usage;
                (ResponsePayload::Embeddings(parsed), Some(usage))
            }
            RequestPayload::Images(images) => {
                let mut images = images.clone();
                images.model = Some(upstream_model.to_string());
                let body = serde_json::to_vec(&images)
                    .map_err(|e| GatewayError::Internal(format!("serialize request: {e}")))?;

                let response = send_with_retry(&self.retry, self.json_request(&url, body)).await?;
                let parsed: modelrelay_core::chat::ImageGenerationResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Internal(format!("parse response: {e}")))?;
                (ResponsePayload::Images(parsed), None)
            }
            RequestPayload::Transcription(transcription) => {
                let response = self
                    .send_transcription(&url, transcription, upstream_model)
                    .await?;
                let parsed: modelrelay_core::chat::TranscriptionResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Internal(format!("parse response: {e}")))?;
                (ResponsePayload::Transcription(parsed), None)
            }
            RequestPayload::Raw { .. } => {
                return Err(GatewayError::RequestMalformed(
                    "native passthrough is not supported by this provider".into(),
                ));
            }
        };

        Ok(ProviderResult {
            provider: self.name.clone(),
            status: ProviderStatus::Success,
            payload,
            usage,
            latency: started.elapsed(),
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn execute_stream(
        &self,
        request: &ProviderRequest,
        upstream_model: &str,
    ) -> Result<Arc<ChunkPipe>> {
        let RequestPayload::Chat(chat) = &request.payload else {
            return Err(GatewayError::RequestMalformed(format!(
                "streaming unsupported for {} requests",
                request.api_type
            )));
        };

        let url = self.endpoint(request.api_type)?;
        let mut chat = chat.clone();
        chat.model = upstream_model.to_string();
        chat.stream = true;
        let body = serde_json::to_vec(&chat)
            .map_err(|e| GatewayError::Internal(format!("serialize request: {e}")))?;

        debug!(provider = %self.name, model = %upstream_model, "chat completion stream request");
        let response = send_with_retry(
            &self.retry,
            self.json_request(&url, body).header("Accept", "text/event-stream"),
        )
        .await?;

        let pipe = Arc::new(ChunkPipe::new(DEFAULT_CAPACITY));
        let producer_pipe = pipe.clone();
        let idle = self.stream_idle;
        let provider = self.name.clone();

        tokio::spawn(async move {
            pump_openai_stream(response, producer_pipe, idle, provider).await;
        });

        Ok(pipe)
    }
}

impl OpenAiAdapter {
    /// Multipart bodies cannot be cloned, so the form is rebuilt from the
    /// owned request on every retry attempt.
    async fn send_transcription(
        &self,
        url: &str,
        transcription: &modelrelay_core::chat::TranscriptionRequest,
        upstream_model: &str,
    ) -> Result<reqwest::Response> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = GatewayError::Internal("retry loop made no attempts".into());

        for attempt in 0..attempts {
            let mut form = reqwest::multipart::Form::new()
                .part(
                    "file",
                    reqwest::multipart::Part::bytes(transcription.audio.clone())
                        .file_name(transcription.file_name.clone()),
                )
                .text("model", upstream_model.to_string());
            if let Some(language) = &transcription.language {
                form = form.text("language", language.clone());
            }

            let result = self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .multipart(form)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    let error = status_error(status, &body);
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    last_error = error;
                }
                Err(error) if error.is_timeout() => {
                    last_error = GatewayError::UpstreamTimeout(error.to_string());
                }
                Err(error) => {
                    last_error = GatewayError::TransportError(error.to_string());
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
        }

        Err(last_error)
    }
}

/// Pump the upstream SSE body into the pipe, re-framing each data payload
/// as a canonical chunk.
///
/// GPT-family chunks are already canonical; the pump tracks usage and
/// finish_reason so the final chunk always carries both, synthesizing a
/// terminal chunk when the upstream ends without one.
async fn pump_openai_stream(
    response: reqwest::Response,
    pipe: Arc<ChunkPipe>,
    idle: Duration,
    provider: String,
) {
    let cancel = pipe.cancellation_token();
    let mut byte_stream = response.bytes_stream();
    let mut parser = SseParser::new();
    let mut sequence: u64 = 0;
    let mut stream_id = String::new();
    let mut model = String::new();
    let mut last_usage: Option<Usage> = None;
    let mut finished = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = tokio::time::timeout(idle, byte_stream.next()) => next,
        };

        let bytes = match next {
            Err(_) => {
                warn!(provider = %provider, "stream idle gap exceeded");
                let _ = pipe
                    .send(StreamChunk::failed(&stream_id, sequence, "stream idle timeout"))
                    .await;
                return;
            }
            Ok(None) => break,
            Ok(Some(Err(error))) => {
                warn!(provider = %provider, error = %error, "stream body error");
                let _ = pipe
                    .send(StreamChunk::failed(
                        &stream_id,
                        sequence,
                        truncate_body(&error.to_string()),
                    ))
                    .await;
                return;
            }
            Ok(Some(Ok(bytes))) => bytes,
        };

        for event in parser.push(&bytes) {
            if event.is_done() {
                if !finished {
                    // Upstream ended without a finish_reason chunk.
                    let chunk = ChatCompletionChunk::terminal(
                        stream_id.clone(),
                        model.clone(),
                        modelrelay_core::chat::FinishReason::Stop,
                        last_usage.unwrap_or_default(),
                    );
                    let data = serde_json::to_string(&chunk).unwrap_or_default();
                    let _ = pipe
                        .send(StreamChunk::terminal(&stream_id, sequence, data, last_usage))
                        .await;
                }
                return;
            }
            if finished {
                // Trailing chunks after the terminal one (e.g. a late
                // usage-only frame) have already been accounted for.
                continue;
            }

            let mut chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                Err(error) => {
                    trace!(provider = %provider, error = %error, "ignoring unparseable stream chunk");
                    continue;
                }
            };
            stream_id = chunk.id.clone();
            model = chunk.model.clone();
            if let Some(usage) = chunk.usage {
                last_usage = Some(usage);
            }

            let is_final = chunk
                .choices
                .first()
                .is_some_and(|c| c.finish_reason.is_some());
            if is_final {
                finished = true;
                if chunk.usage.is_none() {
                    chunk.usage = Some(last_usage.unwrap_or_default());
                }
            }

            let data = match serde_json::to_string(&chunk) {
                Ok(data) => data,
                Err(_) => continue,
            };
            let send = if is_final {
                StreamChunk::terminal(&chunk.id, sequence, data, chunk.usage)
            } else {
                StreamChunk::new(&chunk.id, sequence, data)
            };
            sequence += 1;
            if pipe.send(send).await.is_err() {
                return;
            }
        }
    }

    if !finished {
        // Body ended without [DONE]; close the stream cleanly anyway.
        let chunk = ChatCompletionChunk::terminal(
            stream_id.clone(),
            model.clone(),
            modelrelay_core::chat::FinishReason::Stop,
            last_usage.unwrap_or_default(),
        );
        let data = serde_json::to_string(&chunk).unwrap_or_default();
        let _ = pipe
            .send(StreamChunk::terminal(&stream_id, sequence, data, last_usage))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_defaults() {
        let adapter = OpenAiAdapter::new("sk-test");
        assert_eq!(adapter.name(), "openai");
        assert_eq!(adapter.base_url, DEFAULT_BASE_URL);
        assert!(adapter.supports_streaming());
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let adapter = OpenAiAdapter::new("sk-test").with_base_url("https://proxy.example.com/v1/");
        assert_eq!(adapter.base_url, "https://proxy.example.com/v1");
    }

    #[test]
    fn endpoints_per_api_type() {
        let adapter = OpenAiAdapter::new("sk-test");
        assert!(
            adapter
                .endpoint(ApiType::Chat)
                .unwrap()
                .ends_with("/chat/completions")
        );
        assert!(
            adapter
                .endpoint(ApiType::Responses)
                .unwrap()
                .ends_with("/chat/completions")
        );
        assert!(
            adapter
                .endpoint(ApiType::Embeddings)
                .unwrap()
                .ends_with("/embeddings")
        );
        assert!(
            adapter
                .endpoint(ApiType::Images)
                .unwrap()
                .ends_with("/images/generations")
        );
        assert!(
            adapter
                .endpoint(ApiType::Transcriptions)
                .unwrap()
                .ends_with("/audio/transcriptions")
        );
    }

    #[tokio::test]
    async fn raw_payload_rejected() {
        let adapter = OpenAiAdapter::new("sk-test");
        let request = ProviderRequest {
            api_type: ApiType::Chat,
            model: "m".into(),
            payload: RequestPayload::Raw {
                op: "generateContent".into(),
                body: serde_json::json!({}),
            },
        };
        let err = adapter.execute(&request, "m").await.unwrap_err();
        assert!(matches!(err, GatewayError::RequestMalformed(_)));
    }
}
