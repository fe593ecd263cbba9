//! Upstream status classification and the shared retry helper.
//!
//! Request bodies are serialized once by the adapter and replayed from the
//! retained bytes on every attempt (`RequestBuilder::try_clone` works
//! because the bodies are plain byte buffers, never caller streams).

use std::time::Duration;

use tracing::{debug, warn};

use modelrelay_core::error::GatewayError;

/// How an upstream HTTP status is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Success,
    /// 4xx — the request itself is wrong; never retried.
    ClientError,
    /// 408, 409, 425, 429 — transient; retried in-adapter.
    Throttled,
    /// 5xx — retried in-adapter and across candidates.
    ServerError,
}

/// Classify an upstream status code.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        200..=299 => ErrorClass::Success,
        408 | 409 | 425 | 429 => ErrorClass::Throttled,
        400..=499 => ErrorClass::ClientError,
        _ => ErrorClass::ServerError,
    }
}

/// Map a terminal upstream status to the gateway error taxonomy.
///
/// The body is truncated so upstream error text cannot smuggle headers,
/// secrets, or paths into the envelope at unbounded length.
pub fn status_error(status: u16, body: &str) -> GatewayError {
    let message = truncate_body(body);
    if status >= 500 {
        GatewayError::UpstreamServerError { status, message }
    } else {
        GatewayError::UpstreamClientError { status, message }
    }
}

/// Cap surfaced upstream bodies at 512 bytes.
pub fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Exponential backoff schedule for in-adapter retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.initial_delay.mul_f64(factor.max(0.0));
        delay.min(self.max_delay)
    }
}

/// Send a request with the adapter's retry schedule.
///
/// Throttled and server-error statuses are retried; client errors and
/// success return immediately. Transport failures and timeouts are
/// retryable. The final failure is mapped into the gateway taxonomy.
pub async fn send_with_retry(
    policy: &RetryPolicy,
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response, GatewayError> {
    let mut last_error = GatewayError::Internal("retry loop made no attempts".into());
    let attempts = policy.max_attempts.max(1);

    for attempt in 0..attempts {
        let request = builder
            .try_clone()
            .ok_or_else(|| GatewayError::Internal("request body is not replayable".into()))?;

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match classify_status(status) {
                    ErrorClass::Success => return Ok(response),
                    ErrorClass::ClientError => {
                        let body = response.text().await.unwrap_or_default();
                        return Err(status_error(status, &body));
                    }
                    ErrorClass::Throttled | ErrorClass::ServerError => {
                        let body = response.text().await.unwrap_or_default();
                        last_error = status_error(status, &body);
                        debug!(status, attempt, "upstream transient failure");
                    }
                }
            }
            Err(error) if error.is_timeout() => {
                last_error = GatewayError::UpstreamTimeout(error.to_string());
                debug!(attempt, "upstream timeout");
            }
            Err(error) => {
                last_error = GatewayError::TransportError(error.to_string());
                debug!(attempt, error = %error, "upstream transport failure");
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }

    warn!(error = %last_error, "upstream retries exhausted");
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        assert_eq!(classify_status(200), ErrorClass::Success);
        assert_eq!(classify_status(201), ErrorClass::Success);
        for status in [400, 401, 403, 404, 422] {
            assert_eq!(classify_status(status), ErrorClass::ClientError, "{status}");
        }
        for status in [408, 409, 425, 429] {
            assert_eq!(classify_status(status), ErrorClass::Throttled, "{status}");
        }
        for status in [500, 502, 503, 504] {
            assert_eq!(classify_status(status), ErrorClass::ServerError, "{status}");
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        // Far attempt hits the cap.
        assert_eq!(policy.delay_for(30), Duration::from_secs(30));
    }

    #[test]
    fn status_error_splits_on_500() {
        assert!(matches!(
            status_error(404, "not found"),
            GatewayError::UpstreamClientError { status: 404, .. }
        ));
        assert!(matches!(
            status_error(503, "overloaded"),
            GatewayError::UpstreamServerError { status: 503, .. }
        ));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2048);
        let truncated = truncate_body(&body);
        assert!(truncated.len() < 600);
        assert!(truncated.ends_with('…'));

        assert_eq!(truncate_body("short"), "short");
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let body = "é".repeat(400);
        let truncated = truncate_body(&body);
        assert!(truncated.ends_with('…'));
    }
}
