//! Gemini-family provider adapter.
//!
//! Speaks the native generateContent API:
//! - `x-goog-api-key` header authentication
//! - the operation is embedded in the endpoint path
//!   (`/v1beta/models/{model}:generateContent` or `:streamGenerateContent`)
//! - messages become `contents` with `{role, parts:[{text}]}`; `assistant`
//!   is renamed `model`; system messages are prepended to the first user
//!   turn
//! - sampling parameters live in the `generationConfig` sub-object
//! - a default safety-settings block covers the four harm categories
//! - native passthrough bodies are forwarded untouched

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use modelrelay_core::chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    ChatRole, FinishReason, Usage,
};
use modelrelay_core::error::{GatewayError, Result};
use modelrelay_core::provider::{
    Adapter, ChunkPipe, ProviderRequest, ProviderResult, ProviderStatus, RequestPayload,
    ResponsePayload, StreamChunk,
};
use modelrelay_stream::pipe::DEFAULT_CAPACITY;
use modelrelay_stream::sse::SseParser;

use crate::retry::{RetryPolicy, send_with_retry, truncate_body};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_STREAM_IDLE: Duration = Duration::from_secs(60);

/// The four categories every request gets a safety block for. The
/// gateway never adds filtering the caller did not ask for, hence
/// BLOCK_NONE.
const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
];

/// Gemini-family adapter.
pub struct GeminiAdapter {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    stream_idle: Duration,
}

impl GeminiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "gemini".into(),
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

    /// Endpoint with the operation embedded in the path. The model id is
    /// forwarded exactly as received.
    fn endpoint(&self, model: &str, op: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, model, op)
    }

    fn request(&self, url: &str, body: Vec<u8>) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .body(body)
    }

    /// Build the native request body from the canonical request.
    fn native_body(chat: &ChatCompletionRequest) -> serde_json::Value {
        let contents = transform_contents(&chat.messages);

        let mut generation_config = serde_json::Map::new();
        if let Some(temperature) = chat.temperature {
            generation_config.insert("temperature".into(), serde_json::json!(temperature));
        }
        if let Some(top_p) = chat.top_p {
            generation_config.insert("topP".into(), serde_json::json!(top_p));
        }
        if let Some(max_tokens) = chat.max_tokens {
            generation_config.insert("maxOutputTokens".into(), serde_json::json!(max_tokens));
        }
        if !chat.stop.is_empty() {
            generation_config.insert("stopSequences".into(), serde_json::json!(chat.stop));
        }

        let safety_settings: Vec<_> = SAFETY_CATEGORIES
            .iter()
            .map(|category| {
                serde_json::json!({ "category": category, "threshold": "BLOCK_NONE" })
            })
            .collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "safetySettings": safety_settings,
        });
        if !generation_config.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation_config);
        }
        body
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("failed to build HTTP client")
}

/// Canonical messages → `contents`. System messages are joined with a
/// blank line and prepended to the first user turn; `assistant` becomes
/// `model`.
fn transform_contents(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut contents: Vec<(String, String)> = Vec::new();

    for message in messages {
        let role = match message.role {
            ChatRole::System => {
                system_parts.push(&message.content);
                continue;
            }
            ChatRole::Assistant => "model",
            ChatRole::User | ChatRole::Tool => "user",
        };
        contents.push((role.to_string(), message.content.clone()));
    }

    if !system_parts.is_empty() {
        let system = system_parts.join("\n\n");
        match contents.iter_mut().find(|(role, _)| role == "user") {
            Some(entry) => entry.1 = format!("{system}\n\n{}", entry.1),
            None => contents.insert(0, ("user".into(), system)),
        }
    }

    contents
        .into_iter()
        .map(|(role, text)| {
            serde_json::json!({ "role": role, "parts": [{ "text": text }] })
        })
        .collect()
}

/// `finishReason` → canonical `finish_reason`.
fn map_finish_reason(finish_reason: Option<&str>) -> FinishReason {
    match finish_reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[async_trait]
impl Adapter for GeminiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: &ProviderRequest,
        upstream_model: &str,
    ) -> Result<ProviderResult> {
        let started = Instant::now();
        match &request.payload {
            RequestPayload::Chat(chat) => {
                let url = self.endpoint(upstream_model, "generateContent");
                let body = serde_json::to_vec(&Self::native_body(chat))
                    .map_err(|e| GatewayError::Internal(format!("serialize request: {e}")))?;

                debug!(provider = %self.name, model = %upstream_model, "generateContent request");
                let response = send_with_retry(&self.retry, self.request(&url, body)).await?;
                let native: GeminiResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Internal(format!("parse response: {e}")))?;

                let canonical = native.into_canonical(upstream_model);
                let usage = canonical.usage;
                Ok(ProviderResult {
                    provider: self.name.clone(),
                    status: ProviderStatus::Success,
                    payload: ResponsePayload::Chat(canonical),
                    usage: Some(usage),
                    latency: started.elapsed(),
                })
            }
            RequestPayload::Raw { op, body } => {
                let url = self.endpoint(upstream_model, op);
                let bytes = serde_json::to_vec(body)
                    .map_err(|e| GatewayError::Internal(format!("serialize request: {e}")))?;

                debug!(provider = %self.name, model = %upstream_model, op = %op, "native passthrough");
                let response = send_with_retry(&self.retry, self.request(&url, bytes)).await?;
                let native: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Internal(format!("parse response: {e}")))?;
                Ok(ProviderResult {
                    provider: self.name.clone(),
                    status: ProviderStatus::Success,
                    payload: ResponsePayload::Raw(native),
                    usage: None,
                    latency: started.elapsed(),
                })
            }
            _ => Err(GatewayError::RequestMalformed(format!(
                "{} requests are not supported by this provider",
                request.api_type
            ))),
        }
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

        // alt=sse makes the upstream emit standard SSE frames.
        let url = format!(
            "{}?alt=sse",
            self.endpoint(upstream_model, "streamGenerateContent")
        );
        let body = serde_json::to_vec(&Self::native_body(chat))
            .map_err(|e| GatewayError::Internal(format!("serialize request: {e}")))?;

        debug!(provider = %self.name, model = %upstream_model, "streamGenerateContent request");
        let response = send_with_retry(
            &self.retry,
            self.request(&url, body).header("Accept", "text/event-stream"),
        )
        .await?;

        let pipe = Arc::new(ChunkPipe::new(DEFAULT_CAPACITY));
        let producer_pipe = pipe.clone();
        let idle = self.stream_idle;
        let provider = self.name.clone();
        let model = upstream_model.to_string();

        tokio::spawn(async move {
            pump_gemini_stream(response, producer_pipe, idle, provider, model).await;
        });

        Ok(pipe)
    }
}

/// Each upstream SSE data payload is a partial [`GeminiResponse`]; the
/// chunk carrying a `finishReason` is terminal and must include the
/// aggregated usage.
async fn pump_gemini_stream(
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
    let stream_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let mut usage = Usage::default();
    let mut opened = false;

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
            if sse.is_done() {
                break;
            }
            let partial: GeminiResponse = match serde_json::from_str(&sse.data) {
                Ok(value) => value,
                Err(error) => {
                    trace!(provider = %provider, error = %error, "ignoring unparseable stream chunk");
                    continue;
                }
            };

            if let Some(meta) = &partial.usage_metadata {
                usage = Usage {
                    prompt_tokens: meta.prompt_token_count,
                    completion_tokens: meta.candidates_token_count,
                    total_tokens: meta.total_token_count,
                };
            }

            let Some(candidate) = partial.candidates.first() else {
                continue;
            };
            let text = candidate.text();

            if !opened {
                opened = true;
                let chunk = ChatCompletionChunk::role_opener(&stream_id, &model);
                if !send(&pipe, &stream_id, &mut sequence, chunk, false).await {
                    return;
                }
            }

            if !text.is_empty() {
                let chunk = ChatCompletionChunk::content(&stream_id, &model, text);
                if !send(&pipe, &stream_id, &mut sequence, chunk, false).await {
                    return;
                }
            }

            if let Some(reason) = candidate.finish_reason.as_deref() {
                let finish = map_finish_reason(Some(reason));
                let chunk = ChatCompletionChunk::terminal(&stream_id, &model, finish, usage);
                let _ = send(&pipe, &stream_id, &mut sequence, chunk, true).await;
                return;
            }
        }
    }

    // Body ended without a finishReason; terminate cleanly.
    let chunk = ChatCompletionChunk::terminal(&stream_id, &model, FinishReason::Stop, usage);
    let _ = send(&pipe, &stream_id, &mut sequence, chunk, true).await;
}

async fn send(
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
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

impl GeminiCandidate {
    /// Concatenate every `parts[].text`.
    fn text(&self) -> String {
        let Some(content) = &self.content else {
            return String::new();
        };
        let mut text = String::new();
        for part in &content.parts {
            if let Some(t) = &part.text {
                text.push_str(t);
            }
        }
        text
    }
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u32,
}

impl GeminiResponse {
    fn into_canonical(self, model: &str) -> ChatCompletionResponse {
        let (content, finish_reason) = match self.candidates.first() {
            Some(candidate) => (
                candidate.text(),
                map_finish_reason(candidate.finish_reason.as_deref()),
            ),
            None => (String::new(), FinishReason::Stop),
        };
        let usage = match &self.usage_metadata {
            Some(meta) => Usage {
                prompt_tokens: meta.prompt_token_count,
                completion_tokens: meta.candidates_token_count,
                total_tokens: meta.total_token_count,
            },
            None => Usage::default(),
        };

        ChatCompletionResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".into(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::assistant(content),
                finish_reason,
            }],
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_defaults() {
        let adapter = GeminiAdapter::new("key");
        assert_eq!(adapter.name(), "gemini");
        assert!(adapter.supports_streaming());
    }

    #[test]
    fn endpoint_embeds_model_and_op() {
        let adapter = GeminiAdapter::new("key").with_base_url("https://proxy.example.com");
        assert_eq!(
            adapter.endpoint("gemini-2.0-flash", "generateContent"),
            "https://proxy.example.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn assistant_renamed_model_and_parts_wrapped() {
        let messages = vec![
            ChatMessage::user("question"),
            ChatMessage::assistant("answer"),
        ];
        let contents = transform_contents(&messages);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "question");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn system_prepended_to_first_user_turn() {
        let messages = vec![
            ChatMessage::system("Rule one"),
            ChatMessage::system("Rule two"),
            ChatMessage::user("hello"),
        ];
        let contents = transform_contents(&messages);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["parts"][0]["text"], "Rule one\n\nRule two\n\nhello");
    }

    #[test]
    fn system_only_conversation_becomes_user_turn() {
        let messages = vec![ChatMessage::system("standalone")];
        let contents = transform_contents(&messages);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "standalone");
    }

    #[test]
    fn sampling_params_land_in_generation_config() {
        let chat = ChatCompletionRequest {
            model: "gemini-2.0-flash".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(0.9),
            top_p: Some(0.8),
            max_tokens: Some(512),
            stop: vec!["STOP".into()],
            user: None,
            stream: false,
        };
        let body = GeminiAdapter::native_body(&chat);
        let config = &body["generationConfig"];
        assert_eq!(config["temperature"], 0.9);
        assert_eq!(config["topP"], 0.8);
        assert_eq!(config["maxOutputTokens"], 512);
        assert_eq!(config["stopSequences"][0], "STOP");
    }

    #[test]
    fn safety_block_covers_four_categories() {
        let chat = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: vec![],
            user: None,
            stream: false,
        };
        let body = GeminiAdapter::native_body(&chat);
        let settings = body["safetySettings"].as_array().unwrap();
        assert_eq!(settings.len(), 4);
        for setting in settings {
            assert_eq!(setting["threshold"], "BLOCK_NONE");
        }
        let categories: Vec<_> = settings
            .iter()
            .map(|s| s["category"].as_str().unwrap())
            .collect();
        assert!(categories.contains(&"HARM_CATEGORY_DANGEROUS_CONTENT"));
        assert!(categories.contains(&"HARM_CATEGORY_SEXUALLY_EXPLICIT"));
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("SAFETY")), FinishReason::ContentFilter);
        assert_eq!(
            map_finish_reason(Some("RECITATION")),
            FinishReason::ContentFilter
        );
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("OTHER")), FinishReason::Stop);
    }

    #[test]
    fn response_parts_concatenate_and_usage_composes() {
        let native: GeminiResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Hel"}, {"text": "lo"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {
                    "promptTokenCount": 8,
                    "candidatesTokenCount": 2,
                    "totalTokenCount": 10
                }
            }"#,
        )
        .unwrap();

        let canonical = native.into_canonical("gemini-2.0-flash");
        assert_eq!(canonical.choices[0].message.content, "Hello");
        assert_eq!(canonical.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(canonical.usage.total_tokens, 10);
        assert_eq!(canonical.model, "gemini-2.0-flash");
    }

    #[test]
    fn safety_finish_maps_to_content_filter() {
        let native: GeminiResponse = serde_json::from_str(
            r#"{"candidates": [{"finishReason": "SAFETY"}]}"#,
        )
        .unwrap();
        let canonical = native.into_canonical("m");
        assert_eq!(
            canonical.choices[0].finish_reason,
            FinishReason::ContentFilter
        );
        assert_eq!(canonical.choices[0].message.content, "");
    }
}
