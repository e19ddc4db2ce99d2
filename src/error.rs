use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::path::PathBuf;
use std::time::Duration;

/// Why a generation request was not allowed to run to completion.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error("rate limit exceeded for '{category}': {limit} requests per {}s", window.as_secs())]
    RateLimited {
        category: String,
        limit: u32,
        window: Duration,
        retry_after: Duration,
    },

    #[error("address {address} is temporarily blocked")]
    TemporarilyBlocked {
        address: String,
        retry_after: Duration,
    },

    #[error("no capacity available after waiting {:.1}s (cpu {cpu:.1}%)", waited.as_secs_f64())]
    CapacityUnavailable { waited: Duration, cpu: f32 },

    #[error(
        "generation exceeded the maximum wait time of {} seconds; shorten the request or retry when load decreases",
        timeout.as_secs()
    )]
    DeadlineExceeded { timeout: Duration, elapsed: Duration },
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } | Self::TemporarilyBlocked { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::CapacityUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::TemporarilyBlocked { retry_after, .. } => {
                Some(*retry_after)
            }
            Self::CapacityUnavailable { .. } | Self::DeadlineExceeded { .. } => None,
        }
    }

    /// Short label used for metrics and the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::TemporarilyBlocked { .. } => "blocked",
            Self::CapacityUnavailable { .. } => "capacity_unavailable",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        // round up so clients never retry a moment too early
        let retry_after = self.retry_after().map(|d| {
            let secs = d.as_secs();
            if d.subsec_nanos() > 0 { secs + 1 } else { secs }
        });
        let body = serde_json::json!({
            "error": self.kind(),
            "detail": self.to_string(),
            "retry_after": retry_after,
        });

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Outcome of a bounded run: either the deadline fired or the operation
/// itself failed, in which case its error is passed through untouched.
#[derive(Debug, thiserror::Error)]
pub enum RunError<E> {
    #[error(transparent)]
    Deadline(AdmissionError),

    #[error("{0}")]
    Operation(E),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read cpu statistics: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected cpu statistics format: {0}")]
    Format(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid rate limit table: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("rate limit table has no '{}' category", crate::config::DEFAULT_CATEGORY)]
    MissingDefault,

    #[error("category '{0}' needs a non-zero limit and window")]
    InvalidCategory(String),

    #[error("category '{0}' is defined twice")]
    DuplicateCategory(String),

    #[error("route '{path}' points at unknown category '{category}'")]
    UnknownCategory { path: String, category: String },

    #[error("cpu max threshold {max} is above the critical threshold {critical}")]
    Thresholds { max: f32, critical: f32 },

    #[error("at least one backend is required")]
    NoBackends,
}

/// Failures of the forwarded generation call itself.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid generation request: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    #[error("no healthy backends available")]
    NoHealthyBackend,

    #[error("backend request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("backend returned {0}")]
    BadStatus(StatusCode),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, kind) = match self {
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::NoHealthyBackend => (StatusCode::SERVICE_UNAVAILABLE, "generation_failed"),
            Self::Upstream(_) | Self::BadStatus(_) => (StatusCode::BAD_GATEWAY, "generation_failed"),
        };
        let body = serde_json::json!({
            "error": kind,
            "detail": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_message_advises_caller() {
        let err = AdmissionError::DeadlineExceeded {
            timeout: Duration::from_secs(180),
            elapsed: Duration::from_secs(180),
        };
        assert_eq!(
            err.to_string(),
            "generation exceeded the maximum wait time of 180 seconds; shorten the request or retry when load decreases"
        );
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(err.retry_after().is_none());
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let err = AdmissionError::RateLimited {
            category: "chat".into(),
            limit: 30,
            window: Duration::from_secs(60),
            retry_after: Duration::from_millis(12_300),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "13");
    }

    #[test]
    fn capacity_maps_to_service_unavailable() {
        let err = AdmissionError::CapacityUnavailable {
            waited: Duration::from_secs(30),
            cpu: 97.5,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn malformed_body_maps_to_bad_request() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let response = GatewayError::from(parse).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn operation_error_displays_unchanged() {
        let err: RunError<std::io::Error> =
            RunError::Operation(std::io::Error::other("model crashed"));
        assert_eq!(err.to_string(), "model crashed");
    }
}
