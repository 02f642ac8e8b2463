//! # Error Handling Module
//!
//! Defines the full error taxonomy for the gateway core and its mapping onto
//! client-visible HTTP responses. Every terminal outcome of the request
//! pipeline is one of these variants, each with a stable machine-readable
//! kind string.
//!
//! Classification helpers drive the resilience layer:
//! - `is_retryable()` gates the retry executor
//! - `is_breaker_failure()` decides what the circuit breaker records

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy for the routing and resilience core
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display`
/// with the given message.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// No route definition matched the request path (terminal, never retried)
    #[error("no route matched path: {path}")]
    NoRouteMatched { path: String },

    /// Admission rejected by the per-key token bucket
    #[error("rate limit exceeded for key {key}, retry after {}ms", .retry_after.as_millis())]
    RateLimited { key: String, retry_after: Duration },

    /// Circuit breaker rejected the call without a network attempt
    #[error("circuit open for route: {route}")]
    CircuitOpen { route: String },

    /// Service is unknown to the registry or has zero healthy endpoints
    #[error("no endpoints available for service: {service}")]
    NoEndpointsAvailable { service: String },

    /// The discovery provider could not be queried
    #[error("discovery unavailable for service {service}: {message}")]
    DiscoveryUnavailable { service: String, message: String },

    /// Network-level failure talking to an upstream endpoint
    #[error("upstream error from {endpoint}: {message}")]
    Upstream { endpoint: String, message: String },

    /// A single dispatch attempt exceeded its timeout
    #[error("attempt timed out after {}ms", .timeout.as_millis())]
    AttemptTimeout { timeout: Duration },

    /// The request-scoped deadline elapsed; no further attempts are made
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// All retry attempts failed; carries the last underlying error
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<GatewayError>,
    },

    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors for unexpected failures
    #[error("internal error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, etc.)
    #[error("i/o error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("json error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("yaml error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an upstream error for the given endpoint authority
    pub fn upstream<S: Into<String>>(endpoint: S, message: S) -> Self {
        Self::Upstream {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a discovery error for the given service
    pub fn discovery<S: Into<String>>(service: S, message: S) -> Self {
        Self::DiscoveryUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Get the HTTP status code this error maps to for the caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoRouteMatched { .. } => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoEndpointsAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DiscoveryUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::AttemptTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::RetriesExhausted { last, .. } => last.status_code(),
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error may be retried against another endpoint
    ///
    /// Only transient transport failures qualify. Everything that is
    /// deterministic (no route, bad config) or already a resilience verdict
    /// (circuit open, rate limited, deadline) is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::AttemptTimeout { .. })
    }

    /// Check if this error counts as a failure sample for the circuit breaker
    pub fn is_breaker_failure(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::AttemptTimeout { .. })
    }

    /// Stable machine-readable error kind for API responses and events
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NoRouteMatched { .. } => "no_route_matched",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoEndpointsAvailable { .. } => "no_endpoints_available",
            Self::DiscoveryUnavailable { .. } => "discovery_unavailable",
            Self::Upstream { .. } => "upstream_error",
            Self::AttemptTimeout { .. } => "attempt_timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Convert terminal errors into client responses
///
/// Every error renders as a structured JSON body with the stable kind
/// string; `RateLimited` additionally carries a `Retry-After` header so
/// well-behaved callers can back off.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "kind": self.error_type(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            }
        });

        let mut response = (status, Json(error_response)).into_response();

        if let Self::RateLimited { retry_after, .. } = &self {
            // Retry-After is whole seconds; round up so the hint is never early.
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::NoRouteMatched {
                path: "/missing".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::RateLimited {
                key: "1.2.3.4".into(),
                retry_after: Duration::from_millis(500),
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::CircuitOpen {
                route: "loans".into()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::DeadlineExceeded.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::upstream("10.0.0.1:8080", "connection refused").is_retryable());
        assert!(GatewayError::AttemptTimeout {
            timeout: Duration::from_secs(1)
        }
        .is_retryable());

        assert!(!GatewayError::NoRouteMatched { path: "/x".into() }.is_retryable());
        assert!(!GatewayError::CircuitOpen { route: "r".into() }.is_retryable());
        assert!(!GatewayError::DeadlineExceeded.is_retryable());
        assert!(!GatewayError::config("bad route").is_retryable());
    }

    #[test]
    fn test_retries_exhausted_maps_to_last_error() {
        let err = GatewayError::RetriesExhausted {
            attempts: 3,
            last: Box::new(GatewayError::AttemptTimeout {
                timeout: Duration::from_secs(2),
            }),
        };
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.error_type(), "retries_exhausted");
    }

    #[test]
    fn test_breaker_failure_classification() {
        assert!(GatewayError::upstream("10.0.0.1:8080", "reset").is_breaker_failure());
        assert!(!GatewayError::RateLimited {
            key: "k".into(),
            retry_after: Duration::from_secs(1)
        }
        .is_breaker_failure());
    }
}
