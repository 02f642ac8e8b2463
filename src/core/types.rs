//! # Core Types Module
//!
//! Foundational data structures shared across the gateway: the unified
//! request/response pair the pipeline operates on, and the endpoint/snapshot
//! model the discovery layer publishes.
//!
//! Snapshots are immutable once published: the registry replaces the whole
//! `Arc<ServiceSnapshot>` on refresh and readers keep whichever snapshot they
//! resolved, so no reader ever observes a partially updated endpoint set.

use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use uuid::Uuid;

/// Represents an inbound request before it enters the pipeline
///
/// Protocol-specific detail is stripped at the server boundary; everything
/// the routing and resilience layers need lives here.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Unique identifier for this request (tracing and event correlation)
    pub id: String,

    /// HTTP method (GET, POST, etc.)
    pub method: Method,

    /// Request path without query string
    pub path: String,

    /// Raw query string, if any
    pub query: Option<String>,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body; `Bytes` keeps clones cheap across retry attempts
    pub body: Bytes,

    /// Client's remote address, when known
    pub remote_addr: Option<SocketAddr>,

    /// Timestamp when the request was received
    pub received_at: Instant,
}

impl IncomingRequest {
    /// Create a new request with a generated id
    pub fn new(
        method: Method,
        path: impl Into<String>,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            path: path.into(),
            query,
            headers,
            body,
            remote_addr,
            received_at: Instant::now(),
        }
    }

    /// Get a header value by name, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Client IP as a string, used by the per-caller rate-limit key resolver
    pub fn client_ip(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.ip().to_string())
    }
}

/// Response returned by the gateway to the caller
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,

    /// Authority of the endpoint that produced this response, if any
    pub upstream: Option<String>,
}

impl GatewayResponse {
    /// Create a new response
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            upstream: None,
        }
    }

    /// Create a plain-text response
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        Self::new(status, headers, Bytes::from(text.into().into_bytes()))
    }

    /// Create a JSON response from a serializable value
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Result<Self, serde_json::Error> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(status, headers, Bytes::from(body)))
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(axum::body::Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Health of an endpoint as reported by discovery
///
/// Advisory only: the registry does not probe endpoints itself. `Unknown`
/// endpoints are still eligible for traffic; only an explicit `Unhealthy`
/// report excludes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Whether this endpoint may receive traffic
    pub fn is_available(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One network-addressable instance of a backend service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP address
    pub host: String,

    /// TCP port
    pub port: u16,

    /// Discovery-reported health
    #[serde(default = "default_health")]
    pub health: HealthStatus,
}

fn default_health() -> HealthStatus {
    HealthStatus::Unknown
}

impl Endpoint {
    /// Create an endpoint with unknown health
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            health: HealthStatus::Unknown,
        }
    }

    /// `host:port` authority string, used as the endpoint's identity
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable, versioned view of the known endpoints for one service
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    /// Logical service name
    pub service: String,

    /// Ordered endpoint set as returned by discovery
    pub endpoints: Vec<Endpoint>,

    /// Generation counter, incremented on every successful refresh
    pub generation: u64,

    /// When this snapshot was published
    pub refreshed_at: Instant,
}

impl ServiceSnapshot {
    /// Endpoints currently eligible for traffic
    pub fn available_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.health.is_available())
            .cloned()
            .collect()
    }
}
