//! Request-gating layers: API-key auth, JWT/RBAC for the admin surface,
//! rate limiting, and the JSON error envelope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::warn;

use modelrelay_auth::jwt::TokenService;
use modelrelay_auth::{Permissions, Principal};
use modelrelay_core::context::{ApiKeyName, RequestContext};
use modelrelay_core::error::GatewayError;

use crate::SharedState;

/// Wrapper rendering a [`GatewayError`] as the JSON error envelope
/// `{"error":{"message":…,"code":…}}` with the matching HTTP status.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.http_status();
        let status =
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": { "message": self.0.to_string(), "code": code }
        }));
        (status, body).into_response()
    }
}

/// Envelope for statuses outside the error taxonomy (rate limiting).
pub fn envelope(status: StatusCode, message: &str) -> Response {
    let body = Json(json!({
        "error": { "message": message, "code": status.as_u16() }
    }));
    (status, body).into_response()
}

/// API-key authentication for the model endpoints.
///
/// On success the request gains a fully populated [`RequestContext`]:
/// request-id (inherited from `x-request-id` or generated), trace-id
/// (inherited from `x-trace-id` or generated), and the logical key name.
pub async fn api_key_auth(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let query = request.uri().query().map(str::to_string);
    let key_name = state
        .keys
        .authenticate(request.headers(), query.as_deref())
        .map_err(ApiError)?;

    let request_id = header_value(&request, "x-request-id");
    let trace_id = header_value(&request, "x-trace-id");
    let mut ctx = RequestContext::with_correlation(request_id, trace_id);
    ctx.insert(ApiKeyName(key_name));
    request.extensions_mut().insert(Arc::new(ctx));

    Ok(next.run(request).await)
}

/// JWT authentication + project-scope enforcement for the admin surface.
///
/// Verifies an operator bearer token, rebuilds the principal, and checks
/// the `x-project-id` scope when the caller supplies one. Per-permission
/// checks happen in the handlers via [`require`].
pub async fn admin_auth(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(tokens) = &state.tokens else {
        warn!("admin request but no JWT secrets configured");
        return Err(ApiError(GatewayError::AuthInvalid));
    };

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
        .ok_or(ApiError(GatewayError::AuthMissing))?;

    let claims = tokens
        .verify_access(token)
        .map_err(|_| ApiError(GatewayError::AuthInvalid))?;
    let principal = TokenService::principal_from_claims(&claims)
        .map_err(|_| ApiError(GatewayError::AuthInvalid))?;

    if let Some(project) = request
        .headers()
        .get("x-project-id")
        .and_then(|v| v.to_str().ok())
        && !principal.can_access_project(project)
    {
        return Err(ApiError(GatewayError::Forbidden(format!(
            "no access to project '{project}'"
        ))));
    }

    request.extensions_mut().insert(Arc::new(principal));
    Ok(next.run(request).await)
}

/// Handler-side permission check.
pub fn require(principal: &Principal, needed: Permissions) -> Result<(), ApiError> {
    if principal.can(needed) {
        Ok(())
    } else {
        Err(ApiError(GatewayError::Forbidden(format!(
            "role '{}' lacks the required permission",
            principal.role
        ))))
    }
}

/// In-memory sliding-window rate limiter keyed by credential.
///
/// Timestamps per client key; stale entries evicted when the map grows
/// large. `/health` is exempt so monitoring can poll it freely.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clients: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// `true` when the client is within its budget.
    pub fn check(&self, client_key: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        if clients.len() > 10_000 {
            clients.retain(|_, timestamps| {
                timestamps
                    .last()
                    .is_some_and(|t| now.duration_since(*t) < self.window)
            });
        }

        let timestamps = clients.entry(client_key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.max_requests {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Rate-limiting middleware over any credential-bearing request.
pub async fn rate_limit(
    limiter: Arc<RateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let client_key = request
        .headers()
        .get("authorization")
        .or_else(|| request.headers().get("x-api-key"))
        .or_else(|| request.headers().get("x-goog-api-key"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    if !limiter.check(&client_key) {
        warn!("rate limit exceeded");
        return Err(envelope(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
        ));
    }

    Ok(next.run(request).await)
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_within_budget() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("client"));
        assert!(limiter.check("client"));
        assert!(limiter.check("client"));
        assert!(!limiter.check("client"));
    }

    #[test]
    fn rate_limiter_isolates_clients() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[tokio::test]
    async fn api_error_envelope_shape() {
        let response = ApiError(GatewayError::AuthMissing).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], 401);
        assert!(body["error"]["message"].is_string());
    }

    #[test]
    fn require_respects_mask() {
        use modelrelay_auth::Role;
        let viewer = Principal::new("u", "v@example.com", Role::Viewer, "ws");
        assert!(require(&viewer, Permissions::USAGE_READ).is_ok());
        assert!(require(&viewer, Permissions::SYSTEM_ADMIN).is_err());
    }
}
