//! Claude-family provider adapter.
//!
//! Speaks the native Messages API:
//! - `x-api-key` header authentication (not Bearer) plus `anthropic-version`
//! - system messages lifted out of the list into the top-level `system` field
//! - consecutive same-role messages merged (the API rejects runs)
//! - `max_tokens` is required; defaulted when the caller omits it
//! - streaming via typed SSE events (`message_start`, `content_block_delta`,
//!   `message_delta`, `message_stop`)

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use modelrelay_core::chat::{
    ApiType, ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    ChatMessage, ChatRole, FinishReason, Usage,
};
use modelrelay_core::error::{GatewayError, Result};
use modelrelay_core::provider::{
    Adapter, ChunkPipe, ProviderRequest, ProviderResult, ProviderStatus, RequestPayload,
    ResponsePayload, StreamChunk,
};
use modelrelay_stream::pipe::DEFAULT_CAPACITY;
use modelrelay_stream::sse::SseParser;

use crate::retry::{RetryPolicy, send_with_retry, truncate_body};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_STREAM_IDLE: Duration = Duration::from_secs(60);

/// Claude-family adapter over the native Messages API.
pub struct AnthropicAdapter {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    stream_idle: Duration,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "anthropic".into(),
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

    /// Replace the request timeout by rebuilding the client; the existing
    /// client's configuration is never mutated.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the native request body from the canonical request.
    fn native_body(chat: &ChatCompletionRequest, upstream_model: &str, stream: bool) -> serde_json::Value {
        let (system, merged) = transform_messages(&chat.messages);

        let mut body = serde_json::json!({
            "model": upstream_model,
            "messages": merged,
            "max_tokens": chat.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        if let Some(temperature) = chat.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = chat.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if !chat.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(chat.stop);
        }
        if let Some(user) = &chat.user {
            body["metadata"] = serde_json::json!({ "user_id": user });
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    fn request(&self, body: Vec<u8>) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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

/// Lift system messages into a top-level string (newline-joined) and merge
/// consecutive same-role messages in the remainder.
fn transform_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<serde_json::Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut merged: Vec<(&'static str, String)> = Vec::new();

    for message in messages {
        let role = match message.role {
            ChatRole::System => {
                system_parts.push(&message.content);
                continue;
            }
            ChatRole::Assistant => "assistant",
            // Plain-text tool results ride along as user turns.
            ChatRole::User | ChatRole::Tool => "user",
        };
        match merged.last_mut() {
            Some((last_role, content)) if *last_role == role => {
                content.push('\n');
                content.push_str(&message.content);
            }
            _ => merged.push((role, message.content.clone())),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    let messages = merged
        .into_iter()
        .map(|(role, content)| serde_json::json!({ "role": role, "content": content }))
        .collect();
    (system, messages)
}

/// `stop_reason` → canonical `finish_reason`. `end_turn` and
/// `stop_sequence` both map to `stop`, as does anything unrecognized.
fn map_stop_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: &ProviderRequest,
        upstream_model: &str,
    ) -> Result<ProviderResult> {
        let RequestPayload::Chat(chat) = &request.payload else {
            return Err(GatewayError::RequestMalformed(format!(
                "{} requests are not supported by this provider",
                request.api_type
            )));
        };
        if !matches!(
            request.api_type,
            ApiType::Chat | ApiType::Responses | ApiType::Messages
        ) {
            return Err(GatewayError::RequestMalformed(format!(
                "{} requests are not supported by this provider",
                request.api_type
            )));
        }

        let body = serde_json::to_vec(&Self::native_body(chat, upstream_model, false))
            .map_err(|e| GatewayError::Internal(format!("serialize request: {e}")))?;

        debug!(provider = %self.name, model = %upstream_model, "messages request");
        let started = Instant::now();
        let response = send_with_retry(&self.retry, self.request(body)).await?;
        let native: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("parse response: {e}")))?;
        let latency = started.elapsed();

        let canonical = native.into_canonical();
        let usage = canonical.usage;
        Ok(ProviderResult {
            provider: self.name.clone(),
            status: ProviderStatus::Success,
            payload: ResponsePayload::Chat(canonical),
            usage: Some(usage),
            latency,
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

        let body = serde_json::to_vec(&Self::native_body(chat, upstream_model, true))
            .map_err(|e| GatewayError::Internal(format!("serialize request: {e}")))?;

        debug!(provider = %self.name, model = %upstream_model, "messages stream request");
        let response = send_with_retry(
            &self.retry,
            self.request(body).header("Accept", "text/event-stream"),
        )
        .await?;

        let pipe = Arc::new(ChunkPipe::new(DEFAULT_CAPACITY));
        let producer_pipe = pipe.clone();
        let idle = self.stream_idle;
        let provider = self.name.clone();
        let model = upstream_model.to_string();

        tokio::spawn(async move {
            pump_anthropic_stream(response, producer_pipe, idle, provider, model).await;
        });

        Ok(pipe)
    }
}

/// State machine over the typed Messages stream events.
async fn pump_anthropic_stream(
    response: reqwest::Response,
    pipe: Arc<ChunkPipe>,
    idle: Duration,
    provider: String,
    model: String,
) {
    let cancel = pipe.cancellation_token();
    let mut byte_stream = response.bytes_stream();
    let mut parser = SseParser::new();
    let mut sequence: u64 = 0;
    let mut stream_id = String::new();
    let mut input_tokens: u32 = 0;
    let mut output_tokens: u32 = 0;
    let mut finish = FinishReason::Stop;

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

        for sse in parser.push(&bytes) {
            let event: serde_json::Value = match serde_json::from_str(&sse.data) {
                Ok(value) => value,
                Err(error) => {
                    trace!(provider = %provider, error = %error, "ignoring unparseable stream event");
                    continue;
                }
            };

            match event["type"].as_str().unwrap_or("") {
                "message_start" => {
                    let message = &event["message"];
                    stream_id = message["id"].as_str().unwrap_or("").to_string();
                    input_tokens = message["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;

                    let chunk = ChatCompletionChunk::role_opener(&stream_id, &model);
                    if !send_chunk(&pipe, &stream_id, &mut sequence, chunk, false).await {
                        return;
                    }
                }
                "content_block_delta" => {
                    let delta = &event["delta"];
                    if delta["type"].as_str() == Some("text_delta")
                        && let Some(text) = delta["text"].as_str()
                    {
                        let chunk = ChatCompletionChunk::content(&stream_id, &model, text);
                        if !send_chunk(&pipe, &stream_id, &mut sequence, chunk, false).await {
                            return;
                        }
                    }
                }
                "message_delta" => {
                    if let Some(stop_reason) = event["delta"]["stop_reason"].as_str() {
                        finish = map_stop_reason(Some(stop_reason));
                    }
                    if let Some(out) = event["usage"]["output_tokens"].as_u64() {
                        output_tokens = out as u32;
                    }
                }
                "message_stop" => {
                    let usage = Usage::new(input_tokens, output_tokens);
                    let chunk = ChatCompletionChunk::terminal(&stream_id, &model, finish, usage);
                    let _ = send_chunk(&pipe, &stream_id, &mut sequence, chunk, true).await;
                    return;
                }
                // content_block_start / content_block_stop carry no text;
                // ping is a keepalive.
                _ => {}
            }
        }
    }

    // Upstream closed without message_stop; terminate the stream anyway.
    let usage = Usage::new(input_tokens, output_tokens);
    let chunk = ChatCompletionChunk::terminal(&stream_id, &model, finish, usage);
    let _ = send_chunk(&pipe, &stream_id, &mut sequence, chunk, true).await;
}

async fn send_chunk(
    pipe: &ChunkPipe,
    stream_id: &str,
    sequence: &mut u64,
    chunk: ChatCompletionChunk,
    is_final: bool,
) -> bool {
    let usage = chunk.usage;
    let Ok(data) = serde_json::to_string(&chunk) else {
        return true;
    };
    let item = if is_final {
        StreamChunk::terminal(stream_id, *sequence, data, usage)
    } else {
        StreamChunk::new(stream_id, *sequence, data)
    };
    *sequence += 1;
    pipe.send(item).await.is_ok()
}

// ── Native response types ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl MessagesResponse {
    /// Concatenate text blocks and compose canonical usage.
    fn into_canonical(self) -> ChatCompletionResponse {
        let mut content = String::new();
        for block in &self.content {
            if let ResponseBlock::Text { text } = block {
                content.push_str(text);
            }
        }

        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion".into(),
            created: chrono::Utc::now().timestamp(),
            model: self.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::assistant(content),
                finish_reason: map_stop_reason(self.stop_reason.as_deref()),
            }],
            usage: Usage::new(self.usage.input_tokens, self.usage.output_tokens),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_defaults() {
        let adapter = AnthropicAdapter::new("sk-ant-test");
        assert_eq!(adapter.name(), "anthropic");
        assert_eq!(adapter.base_url, DEFAULT_BASE_URL);
        assert!(adapter.supports_streaming());
    }

    #[test]
    fn system_messages_lift_into_top_level_field() {
        let messages = vec![
            ChatMessage::system("You are helpful"),
            ChatMessage::system("Be concise"),
            ChatMessage::user("Hello"),
        ];
        let (system, merged) = transform_messages(&messages);
        assert_eq!(system.as_deref(), Some("You are helpful\nBe concise"));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["role"], "user");
    }

    #[test]
    fn consecutive_same_role_messages_merge() {
        let messages = vec![
            ChatMessage::user("first"),
            ChatMessage::user("second"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("third"),
        ];
        let (_, merged) = transform_messages(&messages);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0]["content"], "first\nsecond");
        assert_eq!(merged[1]["role"], "assistant");
        assert_eq!(merged[2]["content"], "third");
    }

    #[test]
    fn native_body_defaults_max_tokens() {
        let chat = ChatCompletionRequest {
            model: "claude-fast".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(0.2),
            top_p: None,
            max_tokens: None,
            stop: vec!["END".into()],
            user: Some("caller-7".into()),
            stream: false,
        };
        let body = AnthropicAdapter::native_body(&chat, "claude-sonnet-4-20250514", false);

        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["stop_sequences"][0], "END");
        assert_eq!(body["metadata"]["user_id"], "caller-7");
        assert!(body.get("stream").is_none());
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn stream_flag_set_for_streaming_body() {
        let chat = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: None,
            top_p: None,
            max_tokens: Some(256),
            stop: vec![],
            user: None,
            stream: true,
        };
        let body = AnthropicAdapter::native_body(&chat, "m", true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(map_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(map_stop_reason(Some("stop_sequence")), FinishReason::Stop);
        assert_eq!(map_stop_reason(Some("tool_use")), FinishReason::Stop);
        assert_eq!(map_stop_reason(None), FinishReason::Stop);
    }

    #[test]
    fn response_text_blocks_concatenate() {
        let native: MessagesResponse = serde_json::from_str(
            r#"{
                "id": "msg_01",
                "model": "claude-sonnet-4-20250514",
                "content": [
                    {"type": "text", "text": "Hello"},
                    {"type": "text", "text": " world"}
                ],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 4}
            }"#,
        )
        .unwrap();

        let canonical = native.into_canonical();
        assert_eq!(canonical.choices[0].message.content, "Hello world");
        assert_eq!(canonical.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(canonical.usage.prompt_tokens, 12);
        assert_eq!(canonical.usage.completion_tokens, 4);
        assert_eq!(canonical.usage.total_tokens, 16);
        assert_eq!(canonical.id, "msg_01");
    }

    #[test]
    fn max_tokens_stop_reason_maps_to_length() {
        let native: MessagesResponse = serde_json::from_str(
            r#"{
                "id": "msg_02",
                "model": "claude-sonnet-4-20250514",
                "content": [{"type": "text", "text": "truncated"}],
                "stop_reason": "max_tokens",
                "usage": {"input_tokens": 5, "output_tokens": 100}
            }"#,
        )
        .unwrap();
        assert_eq!(
            native.into_canonical().choices[0].finish_reason,
            FinishReason::Length
        );
    }

    #[tokio::test]
    async fn embeddings_rejected() {
        let adapter = AnthropicAdapter::new("sk-ant-test");
        let request = ProviderRequest {
            api_type: ApiType::Embeddings,
            model: "m".into(),
            payload: RequestPayload::Embeddings(modelrelay_core::chat::EmbeddingsRequest {
                model: "m".into(),
                input: modelrelay_core::chat::EmbeddingInput::Single("x".into()),
            }),
        };
        let err = adapter.execute(&request, "m").await.unwrap_err();
        assert!(matches!(err, GatewayError::RequestMalformed(_)));
    }
}
