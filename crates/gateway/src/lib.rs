//! HTTP gateway for ModelRelay.
//!
//! Wires the auth layers, router, provider adapters, telemetry stores,
//! and the axum route table into one server. Built on Axum.

pub mod dispatch;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::Router as AxumRouter;
use axum::middleware as axum_middleware;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use modelrelay_auth::apikey::ApiKeyStore;
use modelrelay_auth::jwt::{TokenConfig, TokenService};
use modelrelay_config::AppConfig;
use modelrelay_core::provider::Adapter;
use modelrelay_providers::{AnthropicAdapter, GeminiAdapter, OpenAiAdapter};
use modelrelay_routing::{
    AdapterRegistry, BreakerConfig, Candidate, CircuitBreaker, Router, RoutingTable,
};
use modelrelay_telemetry::{TraceStore, UsageStore};

pub use dispatch::Gateway;
pub use middleware::ApiError;

/// Shared application state behind every handler.
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub keys: ApiKeyStore,
    pub tokens: Option<Arc<TokenService>>,
    pub keepalive: Duration,
}

pub type SharedState = Arc<AppState>;

/// Build the full axum router.
///
/// Layers applied outside-in: HTTP trace logging, CORS, rate limiting;
/// API-key auth guards the model endpoints and JWT/RBAC guards `/admin`.
pub fn build_router(state: SharedState) -> AxumRouter {
    let limiter = Arc::new(middleware::RateLimiter::new(60, Duration::from_secs(60)));

    let model_routes = AxumRouter::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/responses", post(handlers::responses))
        .route("/v1/messages", post(handlers::messages))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/images/generations", post(handlers::image_generations))
        .route("/v1/audio/transcriptions", post(handlers::transcriptions))
        .route("/v1/models", get(handlers::models))
        .route("/v1beta/models/{model_op}", post(handlers::gemini_passthrough))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::api_key_auth,
        ));

    let admin_routes = AxumRouter::new()
        .route("/admin/usage", get(handlers::admin_usage))
        .route("/admin/traces", get(handlers::admin_traces))
        .route("/admin/providers", get(handlers::admin_providers))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::admin_auth,
        ));

    let cors = CorsLayer::new()
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    AxumRouter::new()
        .route("/health", get(handlers::health))
        .merge(model_routes)
        .merge(admin_routes)
        .layer(axum_middleware::from_fn(move |request, next| {
            let limiter = limiter.clone();
            middleware::rate_limit(limiter, request, next)
        }))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Assemble shared state from configuration: adapters, routing table,
/// breaker, telemetry stores, auth.
pub fn build_state(config: &AppConfig) -> Result<SharedState, Box<dyn std::error::Error>> {
    let request_timeout = Duration::from_secs(config.request_timeout_secs);

    let mut registry = AdapterRegistry::new();
    for (name, settings) in &config.providers {
        let api_key = settings.api_key.clone().unwrap_or_default();
        let adapter: Arc<dyn Adapter> = match name.as_str() {
            "openai" => {
                let mut adapter = OpenAiAdapter::new(&api_key).with_timeout(request_timeout);
                if let Some(base_url) = &settings.base_url {
                    adapter = adapter.with_base_url(base_url);
                }
                Arc::new(adapter)
            }
            "anthropic" => {
                let mut adapter = AnthropicAdapter::new(&api_key).with_timeout(request_timeout);
                if let Some(base_url) = &settings.base_url {
                    adapter = adapter.with_base_url(base_url);
                }
                Arc::new(adapter)
            }
            "gemini" => {
                let mut adapter = GeminiAdapter::new(&api_key).with_timeout(request_timeout);
                if let Some(base_url) = &settings.base_url {
                    adapter = adapter.with_base_url(base_url);
                }
                Arc::new(adapter)
            }
            other => {
                warn!(provider = %other, "unknown provider in config, skipping");
                continue;
            }
        };
        registry.register(adapter);
    }

    let mut table = RoutingTable::new();
    for (logical_model, entries) in &config.routes {
        let candidates = entries
            .iter()
            .map(|entry| {
                Candidate::new(
                    &entry.provider,
                    entry
                        .upstream_model
                        .clone()
                        .unwrap_or_else(|| logical_model.clone()),
                    entry.weight,
                )
            })
            .collect();
        table.insert(logical_model.clone(), candidates);
    }

    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
        failure_threshold: config.breaker.failure_threshold,
        open_duration: Duration::from_secs(config.breaker.open_duration_secs),
    }));
    let router = Arc::new(Router::new(table, registry, breaker, config.retry_budget));

    let gateway = Arc::new(Gateway::new(
        router,
        Arc::new(UsageStore::default()),
        Arc::new(TraceStore::default()),
    ));

    let tokens = match (&config.auth.access_secret, &config.auth.refresh_secret) {
        (Some(access), Some(refresh)) => {
            let mut token_config = TokenConfig::new(&config.auth.issuer, access, refresh);
            token_config.access_ttl = Duration::from_secs(config.auth.access_ttl_minutes * 60);
            token_config.refresh_ttl =
                Duration::from_secs(config.auth.refresh_ttl_days * 24 * 60 * 60);
            Some(Arc::new(TokenService::new(token_config)?))
        }
        _ => {
            warn!("JWT secrets not configured; admin surface disabled");
            None
        }
    };

    Ok(Arc::new(AppState {
        gateway,
        keys: ApiKeyStore::from_named(&config.api_keys),
        tokens,
        keepalive: Duration::from_secs(config.keepalive_interval_secs.max(1)),
    }))
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let listen = config.listen.clone();
    let state = build_state(&config)?;
    let app = build_router(state);

    info!(addr = %listen, "gateway starting");
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let config = AppConfig::default();
        build_state(&config).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_is_open() {
        let app = build_router(test_state());
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, serde_json::json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn model_endpoints_require_credentials() {
        let app = build_router(test_state());
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"model":"m","messages":[]}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_disabled_without_secrets() {
        let app = build_router(test_state());
        let request = Request::builder()
            .uri("/admin/usage")
            .header("authorization", "Bearer whatever")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
