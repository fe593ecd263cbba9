//! HTTP handlers for the model endpoints, the Gemini-native passthrough,
//! and the admin surface.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Extension;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use modelrelay_auth::{Permissions, Principal};
use modelrelay_core::chat::{
    ApiType, ChatCompletionRequest, EmbeddingsRequest, ImageGenerationRequest, ModelList,
    TranscriptionRequest, Usage,
};
use modelrelay_core::context::RequestContext;
use modelrelay_core::error::GatewayError;
use modelrelay_core::provider::{
    ChunkPipe, ProviderRequest, RequestPayload, ResponsePayload,
};

use crate::SharedState;
use crate::dispatch::StreamContext;
use crate::middleware::{ApiError, require};

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ── Chat-style endpoints ──────────────────────────────────────────────────

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<SharedState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    complete_chat(state, ctx, ApiType::Chat, payload).await
}

/// `POST /v1/responses`
pub async fn responses(
    State(state): State<SharedState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    complete_chat(state, ctx, ApiType::Responses, payload).await
}

/// `POST /v1/messages` — Claude-style alias; the route table decides
/// which family serves it.
pub async fn messages(
    State(state): State<SharedState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    complete_chat(state, ctx, ApiType::Messages, payload).await
}

async fn complete_chat(
    state: SharedState,
    ctx: Arc<RequestContext>,
    api_type: ApiType,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(chat) = payload.map_err(bad_json)?;
    if chat.model.is_empty() {
        return Err(ApiError(GatewayError::RequestMalformed(
            "model is required".into(),
        )));
    }
    if chat.messages.is_empty() {
        return Err(ApiError(GatewayError::RequestMalformed(
            "messages must not be empty".into(),
        )));
    }

    let stream = chat.stream;
    let request = ProviderRequest::chat(api_type, chat);

    if stream {
        return stream_chat(state, ctx, request).await;
    }

    let (result, _attempts) = state.gateway.handle(&ctx, request).await;
    let result = result.map_err(ApiError)?;
    match result.payload {
        ResponsePayload::Chat(response) => Ok(Json(response).into_response()),
        _ => Err(ApiError(GatewayError::Internal(
            "adapter returned a non-chat payload".into(),
        ))),
    }
}

// ── SSE writer ────────────────────────────────────────────────────────────

/// Cancels and closes the pipe when the client goes away mid-stream, so
/// the producer task observes the disconnect within bounded time.
struct PipeGuard(Arc<ChunkPipe>);

impl Drop for PipeGuard {
    fn drop(&mut self) {
        self.0.cancel();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pipe = self.0.clone();
            handle.spawn(async move {
                pipe.close().await;
            });
        }
    }
}

enum SsePhase {
    Streaming,
    EmitDone,
    Closing,
}

struct SseWriter {
    pipe: Arc<ChunkPipe>,
    _guard: PipeGuard,
    state: SharedState,
    stream_ctx: StreamContext,
    started: Instant,
    phase: SsePhase,
    usage: Option<Usage>,
    status: &'static str,
}

async fn stream_chat(
    state: SharedState,
    ctx: Arc<RequestContext>,
    request: ProviderRequest,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let model = request.model.clone();
    let api_type = request.api_type;

    let (result, attempts) = state.gateway.handle_stream(&ctx, request).await;
    let pipe = result.map_err(ApiError)?;

    let stream_ctx = StreamContext::new(&ctx, api_type, &model, &attempts);
    info!(request_id = %stream_ctx.request_id, provider = %stream_ctx.provider, "stream established");

    let writer = SseWriter {
        _guard: PipeGuard(pipe.clone()),
        pipe,
        state: state.clone(),
        stream_ctx,
        started,
        phase: SsePhase::Streaming,
        usage: None,
        status: "success",
    };

    let stream = futures::stream::unfold(writer, |mut writer| async move {
        loop {
            match writer.phase {
                SsePhase::Streaming => match writer.pipe.recv().await {
                    Some(chunk) => {
                        if let Some(error) = chunk.error {
                            writer.phase = SsePhase::EmitDone;
                            writer.status = "error";
                            let data =
                                json!({ "error": { "message": error, "code": 502 } }).to_string();
                            return Some((Ok::<_, Infallible>(Event::default().data(data)), writer));
                        }
                        if chunk.is_final {
                            writer.usage = chunk.usage;
                            writer.phase = SsePhase::EmitDone;
                        }
                        return Some((Ok(Event::default().data(chunk.data)), writer));
                    }
                    None => {
                        // Pipe ended without a terminal chunk (cancelled).
                        writer.status = "cancelled";
                        writer.phase = SsePhase::Closing;
                    }
                },
                SsePhase::EmitDone => {
                    writer.phase = SsePhase::Closing;
                    return Some((Ok(Event::default().data("[DONE]")), writer));
                }
                SsePhase::Closing => {
                    writer.pipe.close().await;
                    writer.state.gateway.finish_stream(
                        &writer.stream_ctx,
                        writer.usage,
                        writer.started.elapsed(),
                        writer.status,
                    );
                    return None;
                }
            }
        }
    });

    let keepalive = state.keepalive;
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(keepalive)
            .text("keepalive"),
    );

    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
    headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
    headers.insert("x-accel-buffering", "no".parse().unwrap());
    Ok(response)
}

// ── Other model endpoints ─────────────────────────────────────────────────

/// `POST /v1/embeddings`
pub async fn embeddings(
    State(state): State<SharedState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    payload: Result<Json<EmbeddingsRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(bad_json)?;
    let provider_request = ProviderRequest {
        api_type: ApiType::Embeddings,
        model: request.model.clone(),
        payload: RequestPayload::Embeddings(request),
    };

    let (result, _attempts) = state.gateway.handle(&ctx, provider_request).await;
    let result = result.map_err(ApiError)?;
    match result.payload {
        ResponsePayload::Embeddings(response) => Ok(Json(response).into_response()),
        _ => Err(ApiError(GatewayError::Internal(
            "adapter returned a non-embeddings payload".into(),
        ))),
    }
}

/// `POST /v1/images/generations`
pub async fn image_generations(
    State(state): State<SharedState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    payload: Result<Json<ImageGenerationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(bad_json)?;
    let Some(model) = request.model.clone() else {
        return Err(ApiError(GatewayError::RequestMalformed(
            "model is required".into(),
        )));
    };
    let provider_request = ProviderRequest {
        api_type: ApiType::Images,
        model,
        payload: RequestPayload::Images(request),
    };

    let (result, _attempts) = state.gateway.handle(&ctx, provider_request).await;
    let result = result.map_err(ApiError)?;
    match result.payload {
        ResponsePayload::Images(response) => Ok(Json(response).into_response()),
        _ => Err(ApiError(GatewayError::Internal(
            "adapter returned a non-image payload".into(),
        ))),
    }
}

/// `POST /v1/audio/transcriptions` (multipart)
pub async fn transcriptions(
    State(state): State<SharedState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut model: Option<String> = None;
    let mut language: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::RequestMalformed(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "model" => {
                model = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| GatewayError::RequestMalformed(e.to_string()))?,
                );
            }
            "language" => {
                language = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| GatewayError::RequestMalformed(e.to_string()))?,
                );
            }
            "file" => {
                let name = field.file_name().unwrap_or("audio").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::RequestMalformed(e.to_string()))?;
                file = Some((name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let model =
        model.ok_or_else(|| GatewayError::RequestMalformed("model field is required".into()))?;
    let (file_name, audio) =
        file.ok_or_else(|| GatewayError::RequestMalformed("file field is required".into()))?;

    let provider_request = ProviderRequest {
        api_type: ApiType::Transcriptions,
        model: model.clone(),
        payload: RequestPayload::Transcription(TranscriptionRequest {
            model,
            file_name,
            audio,
            language,
        }),
    };

    let (result, _attempts) = state.gateway.handle(&ctx, provider_request).await;
    let result = result.map_err(ApiError)?;
    match result.payload {
        ResponsePayload::Transcription(response) => Ok(Json(response).into_response()),
        _ => Err(ApiError(GatewayError::Internal(
            "adapter returned a non-transcription payload".into(),
        ))),
    }
}

/// `GET /v1/models`
pub async fn models(State(state): State<SharedState>) -> Json<ModelList> {
    let models = state.gateway.router().table().logical_models();
    Json(ModelList::new(models))
}

/// `POST /v1beta/models/{model}:{op}` — Gemini-native passthrough.
pub async fn gemini_passthrough(
    State(state): State<SharedState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    Path(model_op): Path<String>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = payload.map_err(bad_json)?;
    let Some((model, op)) = model_op.split_once(':') else {
        return Err(ApiError(GatewayError::RequestMalformed(
            "path must be models/{model}:{operation}".into(),
        )));
    };
    match op {
        "generateContent" | "countTokens" => {}
        "streamGenerateContent" => {
            return Err(ApiError(GatewayError::RequestMalformed(
                "streaming passthrough is not supported; use /v1/chat/completions with stream:true"
                    .into(),
            )));
        }
        other => {
            return Err(ApiError(GatewayError::RequestMalformed(format!(
                "unknown operation '{other}'"
            ))));
        }
    }

    let provider_request = ProviderRequest {
        api_type: ApiType::Chat,
        model: model.to_string(),
        payload: RequestPayload::Raw {
            op: op.to_string(),
            body,
        },
    };

    let (result, _attempts) = state.gateway.handle(&ctx, provider_request).await;
    let result = result.map_err(ApiError)?;
    match result.payload {
        ResponsePayload::Raw(response) => Ok(Json(response).into_response()),
        _ => Err(ApiError(GatewayError::Internal(
            "adapter returned a non-native payload".into(),
        ))),
    }
}

// ── Admin surface ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// `GET /admin/usage`
pub async fn admin_usage(
    State(state): State<SharedState>,
    Extension(principal): Extension<Arc<Principal>>,
    Query(query): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    require(&principal, Permissions::USAGE_READ)?;
    let records = state.gateway.usage().recent(query.limit.unwrap_or(100));
    Ok(Json(json!({ "records": records })).into_response())
}

/// `GET /admin/traces`
pub async fn admin_traces(
    State(state): State<SharedState>,
    Extension(principal): Extension<Arc<Principal>>,
    Query(query): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    require(&principal, Permissions::CONTROL_READ)?;
    let events = state.gateway.traces().recent(query.limit.unwrap_or(100));
    Ok(Json(json!({ "events": events })).into_response())
}

/// `GET /admin/providers` — routing table plus circuit snapshots.
pub async fn admin_providers(
    State(state): State<SharedState>,
    Extension(principal): Extension<Arc<Principal>>,
) -> Result<Response, ApiError> {
    require(&principal, Permissions::PROVIDER_READ)?;
    let router = state.gateway.router();
    Ok(Json(json!({
        "adapters": router.adapters().names(),
        "models": router.table().logical_models(),
        "circuits": router.breaker().snapshot(),
    }))
    .into_response())
}

fn bad_json(rejection: JsonRejection) -> ApiError {
    ApiError(GatewayError::RequestMalformed(rejection.body_text()))
}
