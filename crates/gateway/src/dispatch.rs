//! The gateway orchestrator: one logical call end-to-end.
//!
//! `handle` correlates ids, invokes the router, and emits the side
//! outputs — trace events for request start / each attempt / request end,
//! and a usage record on success. Nothing here writes to external
//! persistence; the in-memory stores are drained by collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;

use modelrelay_core::chat::{ApiType, Usage};
use modelrelay_core::context::RequestContext;
use modelrelay_core::error::GatewayError;
use modelrelay_core::provider::{ChunkPipe, ProviderRequest, ProviderResult};
use modelrelay_routing::{Attempt, AttemptStatus, Router};
use modelrelay_telemetry::{TraceEvent, TraceKind, TraceStore, UsageRecord, UsageStore};

/// Orchestrates dispatch plus telemetry for one request.
pub struct Gateway {
    router: Arc<Router>,
    usage: Arc<UsageStore>,
    traces: Arc<TraceStore>,
}

impl Gateway {
    pub fn new(router: Arc<Router>, usage: Arc<UsageStore>, traces: Arc<TraceStore>) -> Self {
        Self {
            router,
            usage,
            traces,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn usage(&self) -> &Arc<UsageStore> {
        &self.usage
    }

    pub fn traces(&self) -> &Arc<TraceStore> {
        &self.traces
    }

    /// Handle a non-streaming request.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        request: ProviderRequest,
    ) -> (Result<ProviderResult, GatewayError>, Vec<Attempt>) {
        self.trace_start(ctx, &request);

        let outcome = self.router.dispatch(&request).await;
        self.trace_attempts(ctx, &outcome.attempts);

        match &outcome.result {
            Ok(result) => {
                self.record_usage(
                    ctx,
                    request.api_type,
                    &request.model,
                    &result.provider,
                    "success",
                    result.usage,
                    result.latency,
                );
                self.trace_end(ctx, "success");
                info!(
                    request_id = %ctx.request_id(),
                    provider = %result.provider,
                    model = %request.model,
                    "request served"
                );
            }
            Err(error) => {
                self.trace_end(ctx, &error_kind(error));
            }
        }

        (outcome.result, outcome.attempts)
    }

    /// Handle a streaming request: dispatch and hand back the pipe. The
    /// SSE writer calls [`Gateway::finish_stream`] when the final chunk
    /// has crossed, which is when the usage record and `request.end`
    /// trace are emitted.
    pub async fn handle_stream(
        &self,
        ctx: &RequestContext,
        request: ProviderRequest,
    ) -> (Result<Arc<ChunkPipe>, GatewayError>, Vec<Attempt>) {
        self.trace_start(ctx, &request);

        let outcome = self.router.dispatch_stream(&request).await;
        self.trace_attempts(ctx, &outcome.attempts);

        if let Err(error) = &outcome.result {
            self.trace_end(ctx, &error_kind(error));
        }

        (outcome.result, outcome.attempts)
    }

    /// Complete the telemetry for a finished stream.
    pub fn finish_stream(
        &self,
        ctx: &StreamContext,
        usage: Option<Usage>,
        latency: Duration,
        status: &str,
    ) {
        let record = UsageRecord {
            timestamp: chrono::Utc::now(),
            request_id: ctx.request_id.clone(),
            api_key_name: ctx.api_key_name.clone(),
            api_type: ctx.api_type.to_string(),
            model: ctx.model.clone(),
            provider: ctx.provider.clone(),
            status: status.to_string(),
            total_tokens: usage.map(|u| u.total_tokens).unwrap_or(0),
            latency_ms: latency.as_millis() as u64,
        };
        self.usage.push(record);

        let mut attributes = serde_json::Map::new();
        attributes.insert("status".into(), json!(status));
        self.traces.push(TraceEvent::new(
            &ctx.request_id,
            &ctx.trace_id,
            TraceKind::RequestEnd,
            attributes,
        ));
    }

    fn record_usage(
        &self,
        ctx: &RequestContext,
        api_type: ApiType,
        model: &str,
        provider: &str,
        status: &str,
        usage: Option<Usage>,
        latency: Duration,
    ) {
        self.usage.push(UsageRecord {
            timestamp: chrono::Utc::now(),
            request_id: ctx.request_id(),
            api_key_name: ctx.api_key_name(),
            api_type: api_type.to_string(),
            model: model.to_string(),
            provider: provider.to_string(),
            status: status.to_string(),
            total_tokens: usage.map(|u| u.total_tokens).unwrap_or(0),
            latency_ms: latency.as_millis() as u64,
        });
    }

    fn trace_start(&self, ctx: &RequestContext, request: &ProviderRequest) {
        let mut attributes = serde_json::Map::new();
        attributes.insert("api_type".into(), json!(request.api_type.to_string()));
        attributes.insert("model".into(), json!(request.model));
        attributes.insert("user".into(), json!(ctx.api_key_name()));
        self.traces.push(TraceEvent::new(
            ctx.request_id(),
            ctx.trace_id(),
            TraceKind::RequestStart,
            attributes,
        ));
    }

    fn trace_attempts(&self, ctx: &RequestContext, attempts: &[Attempt]) {
        for attempt in attempts {
            let mut attributes = serde_json::Map::new();
            attributes.insert("provider".into(), json!(attempt.provider));
            attributes.insert(
                "status".into(),
                json!(match attempt.status {
                    AttemptStatus::Success => "success",
                    AttemptStatus::Error => "error",
                    AttemptStatus::CircuitOpen => "circuit_open",
                }),
            );
            attributes.insert("latency_ms".into(), json!(attempt.duration.as_millis() as u64));
            if let Some(error) = &attempt.error {
                attributes.insert("error".into(), json!(error));
            }
            self.traces.push(TraceEvent::new(
                ctx.request_id(),
                ctx.trace_id(),
                TraceKind::Attempt,
                attributes,
            ));
        }
    }

    fn trace_end(&self, ctx: &RequestContext, status: &str) {
        let mut attributes = serde_json::Map::new();
        attributes.insert("status".into(), json!(status));
        self.traces.push(TraceEvent::new(
            ctx.request_id(),
            ctx.trace_id(),
            TraceKind::RequestEnd,
            attributes,
        ));
    }
}

/// Correlation info the SSE writer needs to finish a stream's telemetry
/// after the request context is gone.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub request_id: String,
    pub trace_id: String,
    pub api_key_name: String,
    pub api_type: ApiType,
    pub model: String,
    pub provider: String,
}

impl StreamContext {
    pub fn new(
        ctx: &RequestContext,
        api_type: ApiType,
        model: &str,
        attempts: &[Attempt],
    ) -> Self {
        let provider = attempts
            .iter()
            .rev()
            .find(|a| a.status == AttemptStatus::Success)
            .map(|a| a.provider.clone())
            .unwrap_or_default();
        Self {
            request_id: ctx.request_id(),
            trace_id: ctx.trace_id(),
            api_key_name: ctx.api_key_name(),
            api_type,
            model: model.to_string(),
            provider,
        }
    }
}

fn error_kind(error: &GatewayError) -> String {
    match error {
        GatewayError::AuthMissing => "auth_missing",
        GatewayError::AuthInvalid => "auth_invalid",
        GatewayError::Forbidden(_) => "forbidden",
        GatewayError::ModelUnknown(_) => "model_unknown",
        GatewayError::RequestMalformed(_) => "request_malformed",
        GatewayError::UpstreamClientError { .. } => "upstream_client_error",
        GatewayError::UpstreamServerError { .. } => "upstream_server_error",
        GatewayError::UpstreamTimeout(_) => "upstream_timeout",
        GatewayError::CircuitOpen { .. } => "circuit_open",
        GatewayError::TransportError(_) => "transport_error",
        GatewayError::Cancelled => "cancelled",
        GatewayError::Internal(_) => "internal",
    }
    .to_string()
}
