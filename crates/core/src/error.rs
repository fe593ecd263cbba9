//! Error taxonomy for the ModelRelay gateway.
//!
//! Uses `thiserror` for ergonomic error definitions. Every observable
//! failure in the dispatch path maps to exactly one variant; the HTTP
//! layer renders the variant through [`GatewayError::http_status`] and the
//! router consults [`GatewayError::is_retryable`] before moving to the
//! next candidate.

use thiserror::Error;

/// The gateway-wide error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No credential present in any recognized location.
    #[error("missing credential")]
    AuthMissing,

    /// Credential present but rejected.
    #[error("invalid credential")]
    AuthInvalid,

    /// RBAC denied the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No route configured for the logical model.
    #[error("unknown model: {0}")]
    ModelUnknown(String),

    /// Bad JSON, missing required field, or an unusable parameter.
    #[error("malformed request: {0}")]
    RequestMalformed(String),

    /// Provider returned a 4xx.
    #[error("upstream client error (status {status}): {message}")]
    UpstreamClientError { status: u16, message: String },

    /// Provider returned a 5xx.
    #[error("upstream server error (status {status}): {message}")]
    UpstreamServerError { status: u16, message: String },

    /// Deadline exceeded talking to the provider.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// The candidate's circuit breaker is open.
    #[error("circuit open for {provider}/{model}")]
    CircuitOpen { provider: String, model: String },

    /// Connect, TLS, or DNS failure before any HTTP status was received.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The request context was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// Anything that should never surface to a caller as-is.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The HTTP status the outer layer surfaces for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthMissing | Self::AuthInvalid => 401,
            Self::Forbidden(_) => 403,
            Self::ModelUnknown(_) | Self::RequestMalformed(_) => 400,
            Self::UpstreamClientError { .. }
            | Self::UpstreamServerError { .. }
            | Self::TransportError(_) => 502,
            Self::UpstreamTimeout(_) => 504,
            Self::CircuitOpen { .. } => 503,
            Self::Cancelled => 499,
            Self::Internal(_) => 500,
        }
    }

    /// Whether the router should consider the next candidate.
    ///
    /// `CircuitOpen` counts as retryable: the breaker blocks one candidate,
    /// not the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamServerError { .. }
                | Self::UpstreamTimeout(_)
                | Self::TransportError(_)
                | Self::CircuitOpen { .. }
        )
    }
}

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(GatewayError::AuthMissing.http_status(), 401);
        assert_eq!(GatewayError::AuthInvalid.http_status(), 401);
        assert_eq!(GatewayError::Forbidden("x".into()).http_status(), 403);
        assert_eq!(GatewayError::ModelUnknown("m".into()).http_status(), 400);
        assert_eq!(
            GatewayError::UpstreamClientError {
                status: 404,
                message: "no".into()
            }
            .http_status(),
            502
        );
        assert_eq!(
            GatewayError::UpstreamServerError {
                status: 500,
                message: "boom".into()
            }
            .http_status(),
            502
        );
        assert_eq!(GatewayError::UpstreamTimeout("t".into()).http_status(), 504);
        assert_eq!(
            GatewayError::CircuitOpen {
                provider: "p".into(),
                model: "m".into()
            }
            .http_status(),
            503
        );
        assert_eq!(GatewayError::Cancelled.http_status(), 499);
    }

    #[test]
    fn retryability_follows_classification() {
        assert!(
            GatewayError::UpstreamServerError {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(GatewayError::UpstreamTimeout("t".into()).is_retryable());
        assert!(GatewayError::TransportError("dns".into()).is_retryable());
        assert!(
            !GatewayError::UpstreamClientError {
                status: 400,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!GatewayError::RequestMalformed("bad".into()).is_retryable());
        assert!(!GatewayError::Cancelled.is_retryable());
    }
}
