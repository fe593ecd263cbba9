//! The router: candidate selection and the retry budget loop.
//!
//! Given a provider request, the router looks up the candidate list for
//! the logical model and walks it in canonical order, skipping candidates
//! whose circuit is open, stopping early on success or on a non-retryable
//! error, and recording one attempt per candidate touched. The request is
//! never mutated between attempts; per-attempt transformation happens
//! inside each adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use modelrelay_core::error::GatewayError;
use modelrelay_core::provider::{Adapter, ChunkPipe, ProviderRequest, ProviderResult};

use crate::breaker::CircuitBreaker;
use crate::table::RoutingTable;

type CallFuture<T> =
    std::pin::Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send>>;

/// Outcome of one adapter call (or circuit skip) during dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Error,
    CircuitOpen,
}

/// One record per candidate the router touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub index: u32,
    pub provider: String,
    pub upstream_model: String,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
}

/// What a dispatch produced: the terminal result plus every attempt made.
pub struct DispatchOutcome<T> {
    pub result: Result<T, GatewayError>,
    pub attempts: Vec<Attempt>,
}

/// Named adapter registry. Populated at startup, read-only afterwards.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Routes one provider request to a candidate, with a retry budget across
/// candidates.
pub struct Router {
    table: RoutingTable,
    adapters: AdapterRegistry,
    breaker: Arc<CircuitBreaker>,
    /// Highest attempt index allowed per request (attempt indices run
    /// 0..=min(budget, candidates-1)).
    retry_budget: u32,
}

impl Router {
    pub fn new(
        table: RoutingTable,
        adapters: AdapterRegistry,
        breaker: Arc<CircuitBreaker>,
        retry_budget: u32,
    ) -> Self {
        Self {
            table,
            adapters,
            breaker,
            retry_budget,
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Dispatch a non-streaming request.
    pub async fn dispatch(&self, request: &ProviderRequest) -> DispatchOutcome<ProviderResult> {
        fn execute(
            adapter: Arc<dyn Adapter>,
            request: ProviderRequest,
            upstream_model: String,
        ) -> CallFuture<ProviderResult> {
            Box::pin(async move { adapter.execute(&request, &upstream_model).await })
        }
        self.run(request, execute).await
    }

    /// Dispatch a streaming request; the result is the pipe to read
    /// chunks from.
    pub async fn dispatch_stream(
        &self,
        request: &ProviderRequest,
    ) -> DispatchOutcome<Arc<ChunkPipe>> {
        fn execute_stream(
            adapter: Arc<dyn Adapter>,
            request: ProviderRequest,
            upstream_model: String,
        ) -> CallFuture<Arc<ChunkPipe>> {
            Box::pin(async move { adapter.execute_stream(&request, &upstream_model).await })
        }
        self.run(request, execute_stream).await
    }

    async fn run<T>(
        &self,
        request: &ProviderRequest,
        call: fn(Arc<dyn Adapter>, ProviderRequest, String) -> CallFuture<T>,
    ) -> DispatchOutcome<T> {
        let mut attempts = Vec::new();

        let Some(candidates) = self.table.candidates(&request.model) else {
            return DispatchOutcome {
                result: Err(GatewayError::ModelUnknown(request.model.clone())),
                attempts,
            };
        };
        if candidates.is_empty() {
            return DispatchOutcome {
                result: Err(GatewayError::ModelUnknown(request.model.clone())),
                attempts,
            };
        }

        let last_index = (self.retry_budget as usize).min(candidates.len() - 1);
        let mut last_error: Option<GatewayError> = None;

        for (i, candidate) in candidates.iter().take(last_index + 1).enumerate() {
            let cell = self
                .breaker
                .cell(&candidate.provider, &candidate.upstream_model);

            if !cell.try_acquire() {
                debug!(
                    provider = %candidate.provider,
                    model = %candidate.upstream_model,
                    "skipping candidate, circuit open"
                );
                attempts.push(Attempt {
                    index: i as u32,
                    provider: candidate.provider.clone(),
                    upstream_model: candidate.upstream_model.clone(),
                    status: AttemptStatus::CircuitOpen,
                    error: Some("circuit open".into()),
                    duration: Duration::ZERO,
                });
                last_error = Some(GatewayError::CircuitOpen {
                    provider: candidate.provider.clone(),
                    model: candidate.upstream_model.clone(),
                });
                continue;
            }

            let Some(adapter) = self.adapters.get(&candidate.provider) else {
                // A route pointing at an unregistered adapter is a config
                // defect, not a provider failure.
                warn!(provider = %candidate.provider, "route names unregistered adapter");
                attempts.push(Attempt {
                    index: i as u32,
                    provider: candidate.provider.clone(),
                    upstream_model: candidate.upstream_model.clone(),
                    status: AttemptStatus::Error,
                    error: Some("adapter not registered".into()),
                    duration: Duration::ZERO,
                });
                last_error = Some(GatewayError::Internal(format!(
                    "adapter '{}' not registered",
                    candidate.provider
                )));
                continue;
            };

            info!(
                attempt = i,
                provider = %candidate.provider,
                model = %candidate.upstream_model,
                "dispatching to candidate"
            );

            let started = Instant::now();
            let result = call(
                adapter,
                request.clone(),
                candidate.upstream_model.clone(),
            )
            .await;
            let duration = started.elapsed();

            match result {
                Ok(value) => {
                    cell.record_success();
                    attempts.push(Attempt {
                        index: i as u32,
                        provider: candidate.provider.clone(),
                        upstream_model: candidate.upstream_model.clone(),
                        status: AttemptStatus::Success,
                        error: None,
                        duration,
                    });
                    return DispatchOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(error) => {
                    if error.is_retryable() {
                        cell.record_failure();
                    }
                    warn!(
                        attempt = i,
                        provider = %candidate.provider,
                        error = %error,
                        retryable = error.is_retryable(),
                        "candidate failed"
                    );
                    attempts.push(Attempt {
                        index: i as u32,
                        provider: candidate.provider.clone(),
                        upstream_model: candidate.upstream_model.clone(),
                        status: AttemptStatus::Error,
                        error: Some(error.to_string()),
                        duration,
                    });
                    let retryable = error.is_retryable();
                    last_error = Some(error);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        DispatchOutcome {
            result: Err(last_error.unwrap_or_else(|| {
                GatewayError::Internal("dispatch produced no attempts".into())
            })),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use modelrelay_core::chat::{
        ApiType, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, FinishReason, Usage,
    };
    use modelrelay_core::provider::{ProviderStatus, RequestPayload, ResponsePayload};

    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::table::Candidate;

    struct SuccessAdapter {
        name: String,
        calls: AtomicUsize,
    }

    impl SuccessAdapter {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Adapter for SuccessAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(
            &self,
            _request: &ProviderRequest,
            upstream_model: &str,
        ) -> Result<ProviderResult, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderResult {
                provider: self.name.clone(),
                status: ProviderStatus::Success,
                payload: ResponsePayload::Chat(ChatCompletionResponse::single(
                    upstream_model,
                    "ok",
                    FinishReason::Stop,
                    Usage::new(5, 5),
                )),
                usage: Some(Usage::new(5, 5)),
                latency: Duration::from_millis(1),
            })
        }
    }

    struct FailingAdapter {
        name: String,
        calls: AtomicUsize,
        errors: Mutex<Vec<GatewayError>>,
    }

    impl FailingAdapter {
        /// Fails with the given errors in order, repeating the last one.
        fn new(name: &str, errors: Vec<GatewayError>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                calls: AtomicUsize::new(0),
                errors: Mutex::new(errors),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Adapter for FailingAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(
            &self,
            _request: &ProviderRequest,
            _upstream_model: &str,
        ) -> Result<ProviderResult, GatewayError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let errors = self.errors.lock().unwrap();
            let error = errors.get(n).or_else(|| errors.last()).unwrap();
            Err(clone_error(error))
        }
    }

    fn clone_error(error: &GatewayError) -> GatewayError {
        match error {
            GatewayError::UpstreamServerError { status, message } => {
                GatewayError::UpstreamServerError {
                    status: *status,
                    message: message.clone(),
                }
            }
            GatewayError::UpstreamClientError { status, message } => {
                GatewayError::UpstreamClientError {
                    status: *status,
                    message: message.clone(),
                }
            }
            GatewayError::UpstreamTimeout(m) => GatewayError::UpstreamTimeout(m.clone()),
            other => GatewayError::Internal(other.to_string()),
        }
    }

    fn request(model: &str) -> ProviderRequest {
        ProviderRequest {
            api_type: ApiType::Chat,
            model: model.into(),
            payload: RequestPayload::Chat(ChatCompletionRequest {
                model: model.into(),
                messages: vec![ChatMessage::user("hello")],
                temperature: None,
                top_p: None,
                max_tokens: None,
                stop: vec![],
                user: None,
                stream: false,
            }),
        }
    }

    fn server_error() -> GatewayError {
        GatewayError::UpstreamServerError {
            status: 503,
            message: "unavailable".into(),
        }
    }

    fn router_with(
        routes: Vec<(&str, Vec<Candidate>)>,
        adapters: Vec<Arc<dyn Adapter>>,
        budget: u32,
    ) -> Router {
        let mut table = RoutingTable::new();
        for (model, candidates) in routes {
            table.insert(model, candidates);
        }
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        Router::new(table, registry, Arc::new(CircuitBreaker::default()), budget)
    }

    #[tokio::test]
    async fn unknown_model_returns_without_attempts() {
        let router = router_with(vec![], vec![], 2);
        let outcome = router.dispatch(&request("nonexistent")).await;
        assert!(matches!(
            outcome.result.unwrap_err(),
            GatewayError::ModelUnknown(_)
        ));
        assert!(outcome.attempts.is_empty());
    }

    #[tokio::test]
    async fn success_produces_one_attempt() {
        let adapter = SuccessAdapter::new("mock");
        let router = router_with(
            vec![("gpt-4o-mini", vec![Candidate::new("mock", "gpt-4o-mini", 100)])],
            vec![adapter.clone()],
            2,
        );

        let outcome = router.dispatch(&request("gpt-4o-mini")).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].status, AttemptStatus::Success);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn retryable_failure_moves_to_next_candidate() {
        let a = FailingAdapter::new("a", vec![server_error()]);
        let b = SuccessAdapter::new("b");
        let router = router_with(
            vec![(
                "m",
                vec![Candidate::new("a", "m", 50), Candidate::new("b", "m", 50)],
            )],
            vec![a.clone(), b.clone()],
            2,
        );

        let outcome = router.dispatch(&request("m")).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].status, AttemptStatus::Error);
        assert_eq!(outcome.attempts[0].provider, "a");
        assert_eq!(outcome.attempts[1].status, AttemptStatus::Success);
        assert_eq!(outcome.attempts[1].provider, "b");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_returns_immediately() {
        let a = FailingAdapter::new(
            "a",
            vec![GatewayError::UpstreamClientError {
                status: 400,
                message: "bad request".into(),
            }],
        );
        let b = SuccessAdapter::new("b");
        let router = router_with(
            vec![(
                "m",
                vec![Candidate::new("a", "m", 90), Candidate::new("b", "m", 10)],
            )],
            vec![a.clone(), b.clone()],
            2,
        );

        let outcome = router.dispatch(&request("m")).await;
        assert!(matches!(
            outcome.result.unwrap_err(),
            GatewayError::UpstreamClientError { status: 400, .. }
        ));
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn budget_caps_candidates_touched() {
        let a = FailingAdapter::new("a", vec![server_error()]);
        let b = FailingAdapter::new("b", vec![server_error()]);
        let c = SuccessAdapter::new("c");
        let router = router_with(
            vec![(
                "m",
                vec![
                    Candidate::new("a", "m", 90),
                    Candidate::new("b", "m", 50),
                    Candidate::new("c", "m", 10),
                ],
            )],
            vec![a.clone(), b.clone(), c.clone()],
            1,
        );

        // Budget 1 allows attempt indices 0 and 1 only.
        let outcome = router.dispatch(&request("m")).await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn open_circuit_skips_candidate() {
        let a = FailingAdapter::new("a", vec![server_error()]);
        let b = SuccessAdapter::new("b");

        let mut table = RoutingTable::new();
        table.insert(
            "m",
            vec![Candidate::new("a", "m", 90), Candidate::new("b", "m", 10)],
        );
        let mut registry = AdapterRegistry::new();
        registry.register(a.clone());
        registry.register(b.clone());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
        }));
        let router = Router::new(table, registry, breaker.clone(), 2);

        // First dispatch trips the breaker for (a, m) and succeeds via b.
        let first = router.dispatch(&request("m")).await;
        assert!(first.result.is_ok());
        assert_eq!(breaker.cell("a", "m").state(), CircuitState::Open);

        // Second dispatch records a circuit-open attempt without calling a.
        let second = router.dispatch(&request("m")).await;
        assert!(second.result.is_ok());
        assert_eq!(second.attempts[0].status, AttemptStatus::CircuitOpen);
        assert_eq!(second.attempts[1].status, AttemptStatus::Success);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);
    }

    #[tokio::test]
    async fn sole_candidate_with_open_circuit_returns_circuit_open() {
        let a = FailingAdapter::new("a", vec![server_error()]);
        let mut table = RoutingTable::new();
        table.insert("m", vec![Candidate::new("a", "m", 100)]);
        let mut registry = AdapterRegistry::new();
        registry.register(a.clone());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
        }));
        let router = Router::new(table, registry, breaker, 2);

        let first = router.dispatch(&request("m")).await;
        assert!(first.result.is_err());

        let second = router.dispatch(&request("m")).await;
        assert!(matches!(
            second.result.unwrap_err(),
            GatewayError::CircuitOpen { .. }
        ));
        assert_eq!(second.attempts.len(), 1);
        assert_eq!(second.attempts[0].status, AttemptStatus::CircuitOpen);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn consecutive_failures_open_circuit_at_threshold() {
        let a = FailingAdapter::new("a", vec![server_error()]);
        let mut table = RoutingTable::new();
        table.insert("m", vec![Candidate::new("a", "m", 100)]);
        let mut registry = AdapterRegistry::new();
        registry.register(a.clone());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_secs(60),
        }));
        let router = Router::new(table, registry, breaker.clone(), 0);

        for _ in 0..3 {
            let outcome = router.dispatch(&request("m")).await;
            assert!(outcome.result.is_err());
        }
        assert_eq!(breaker.cell("a", "m").state(), CircuitState::Open);
        assert_eq!(a.calls(), 3);

        let blocked = router.dispatch(&request("m")).await;
        assert!(matches!(
            blocked.result.unwrap_err(),
            GatewayError::CircuitOpen { .. }
        ));
        assert_eq!(a.calls(), 3);
    }

    #[tokio::test]
    async fn client_errors_do_not_trip_breaker() {
        let a = FailingAdapter::new(
            "a",
            vec![GatewayError::UpstreamClientError {
                status: 422,
                message: "unprocessable".into(),
            }],
        );
        let mut table = RoutingTable::new();
        table.insert("m", vec![Candidate::new("a", "m", 100)]);
        let mut registry = AdapterRegistry::new();
        registry.register(a.clone());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
        }));
        let router = Router::new(table, registry, breaker.clone(), 0);

        let _ = router.dispatch(&request("m")).await;
        let _ = router.dispatch(&request("m")).await;
        assert_eq!(breaker.cell("a", "m").state(), CircuitState::Closed);
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn dispatch_stream_uses_default_wrapping() {
        let adapter = SuccessAdapter::new("mock");
        let router = router_with(
            vec![("m", vec![Candidate::new("mock", "m", 100)])],
            vec![adapter.clone()],
            2,
        );

        let outcome = router.dispatch_stream(&request("m")).await;
        let pipe = outcome.result.unwrap();
        assert_eq!(outcome.attempts.len(), 1);

        let chunk = pipe.recv().await.unwrap();
        assert!(chunk.is_final);
        assert_eq!(chunk.usage.unwrap().total_tokens, 10);
    }
}
