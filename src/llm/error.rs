//! Model-call error types with retry classification.
//!
//! Transient errors (rate limit, 5xx, network, deadline) are retried by the stage
//! runner with the same prompt; everything else fails the stage call.

use std::time::Duration;

/// Error from a model call.
#[derive(Debug, Clone)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    pub message: String,
    /// Suggested retry delay (from Retry-After header)
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn of(kind: LlmErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            message,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::of(LlmErrorKind::RateLimited, Some(429), message)
        }
    }

    pub fn server_error(status_code: u16, message: String) -> Self {
        Self::of(LlmErrorKind::ServerError, Some(status_code), message)
    }

    /// Bad request, auth, unknown model.
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self::of(LlmErrorKind::ClientError, Some(status_code), message)
    }

    pub fn network_error(message: String) -> Self {
        Self::of(LlmErrorKind::NetworkError, None, message)
    }

    /// The call exceeded its deadline.
    pub fn timeout(after: Duration) -> Self {
        Self::of(
            LlmErrorKind::Timeout,
            None,
            format!("model call exceeded {}s deadline", after.as_secs()),
        )
    }

    /// The provider answered but the envelope was unreadable.
    pub fn parse_error(message: String) -> Self {
        Self::of(LlmErrorKind::ParseError, None, message)
    }

    /// Build an error from an HTTP status and response body.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status) {
            LlmErrorKind::RateLimited => Self::rate_limited(message, retry_after),
            LlmErrorKind::ServerError => Self::server_error(status, message),
            _ => Self::client_error(status, message),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Get the suggested delay before retry.
    ///
    /// Returns `retry_after` if set, otherwise exponential backoff with a small
    /// deterministic jitter, capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }

        let base_ms: u64 = match self.kind {
            LlmErrorKind::RateLimited => 5_000,
            LlmErrorKind::ServerError => 2_000,
            _ => 1_000,
        };

        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let jitter_range = delay_ms / 4;
        let jitter = if jitter_range > 0 {
            (attempt as u64 * 7_919) % jitter_range
        } else {
            0
        };

        Duration::from_millis((delay_ms + jitter).min(60_000))
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of model-call errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429
    RateLimited,
    /// 500, 502, 503, 504
    ServerError,
    /// 400, 401, 403, 404
    ClientError,
    /// Connection failed or stream broke
    NetworkError,
    /// Deadline elapsed
    Timeout,
    /// Unreadable provider response envelope
    ParseError,
}

impl LlmErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited
                | LlmErrorKind::ServerError
                | LlmErrorKind::NetworkError
                | LlmErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::ServerError => write!(f, "Server error"),
            LlmErrorKind::ClientError => write!(f, "Client error"),
            LlmErrorKind::NetworkError => write!(f, "Network error"),
            LlmErrorKind::Timeout => write!(f, "Timeout"),
            LlmErrorKind::ParseError => write!(f, "Parse error"),
        }
    }
}

/// Transient retry policy applied per stage call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Upper bound for a single backoff sleep
    pub max_delay: Duration,
    pub retry_rate_limits: bool,
    pub retry_server_errors: bool,
    pub retry_network_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_delay: Duration::from_secs(10),
            retry_rate_limits: true,
            retry_server_errors: true,
            retry_network_errors: true,
        }
    }
}

impl RetryConfig {
    /// No backoff at all; used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Check if the given error should be retried based on this config.
    pub fn should_retry(&self, error: &LlmError) -> bool {
        match error.kind {
            LlmErrorKind::RateLimited => self.retry_rate_limits,
            LlmErrorKind::ServerError => self.retry_server_errors,
            LlmErrorKind::NetworkError | LlmErrorKind::Timeout => self.retry_network_errors,
            LlmErrorKind::ClientError | LlmErrorKind::ParseError => false,
        }
    }

    pub fn delay_for(&self, error: &LlmError, attempt: u32) -> Duration {
        error.suggested_delay(attempt).min(self.max_delay)
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        408 => LlmErrorKind::Timeout,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmErrorKind::RateLimited.is_transient());
        assert!(LlmErrorKind::ServerError.is_transient());
        assert!(LlmErrorKind::NetworkError.is_transient());
        assert!(LlmErrorKind::Timeout.is_transient());
        assert!(!LlmErrorKind::ClientError.is_transient());
        assert!(!LlmErrorKind::ParseError.is_transient());
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(408), LlmErrorKind::Timeout);
        assert_eq!(classify_http_status(502), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let error = LlmError::server_error(503, "busy".to_string());
        assert!(error.suggested_delay(1) > error.suggested_delay(0));
        assert!(error.suggested_delay(20) <= Duration::from_secs(60));

        let config = RetryConfig {
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for(&error, 3), Duration::from_millis(5));
    }

    #[test]
    fn test_retry_after_respected() {
        let error = LlmError::rate_limited("slow down".to_string(), Some(Duration::from_secs(3)));
        assert_eq!(error.suggested_delay(4), Duration::from_secs(3));
        assert!(RetryConfig::default().should_retry(&error));
        assert!(!RetryConfig::default().should_retry(&LlmError::client_error(400, "bad".into())));
    }
}
