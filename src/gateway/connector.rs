//! # Upstream Connector
//!
//! The abstract downstream-call contract and its HTTP implementation. The
//! pipeline only ever sees `invoke(endpoint, request) -> response or error`;
//! transport detail stays here.
//!
//! Hop-by-hop headers are stripped in both directions, and `Host` is
//! rewritten per selected endpoint.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Endpoint, GatewayResponse};

/// Headers that are connection-scoped and must not be forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// One dispatch attempt's view of the request
///
/// The path is the route-rewritten one; the pipeline builds this once per
/// request and reuses it across retry attempts.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Abstract downstream call
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Perform one call against one endpoint
    async fn invoke(
        &self,
        endpoint: &Endpoint,
        request: &UpstreamRequest,
    ) -> GatewayResult<GatewayResponse>;
}

/// HTTP connector backed by a pooled `reqwest` client
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }

    fn build_url(endpoint: &Endpoint, request: &UpstreamRequest) -> GatewayResult<Url> {
        let mut url = Url::parse(&format!("http://{}", endpoint.authority()))
            .map_err(|e| GatewayError::internal(format!("invalid endpoint authority: {e}")))?;
        url.set_path(&request.path);
        url.set_query(request.query.as_deref());
        Ok(url)
    }
}

#[async_trait]
impl UpstreamConnector for HttpConnector {
    async fn invoke(
        &self,
        endpoint: &Endpoint,
        request: &UpstreamRequest,
    ) -> GatewayResult<GatewayResponse> {
        let url = Self::build_url(endpoint, request)?;
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::internal(format!("invalid method: {e}")))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name.as_str()) {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::upstream(endpoint.authority(), e.to_string()))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| GatewayError::upstream(endpoint.authority(), e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::upstream(endpoint.authority(), e.to_string()))?;

        let mut out = GatewayResponse::new(status, headers, body);
        out.upstream = Some(endpoint.authority());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("host"));
        assert!(!is_hop_by_hop("x-correlation-id"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn test_url_construction() {
        let endpoint = Endpoint::new("10.0.0.1", 9001);
        let request = UpstreamRequest {
            method: Method::GET,
            path: "/42/loans".to_string(),
            query: Some("verbose=1".to_string()),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };

        let url = HttpConnector::build_url(&endpoint, &request).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:9001/42/loans?verbose=1");
    }

    #[test]
    fn test_url_without_query() {
        let endpoint = Endpoint::new("backend.internal", 8080);
        let request = UpstreamRequest {
            method: Method::GET,
            path: "/health".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };

        let url = HttpConnector::build_url(&endpoint, &request).unwrap();
        assert_eq!(url.as_str(), "http://backend.internal:8080/health");
    }
}
