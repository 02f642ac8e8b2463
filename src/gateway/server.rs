//! # Gateway Server
//!
//! Thin HTTP boundary over the pipeline: a catch-all axum handler adapts
//! inbound requests into `IncomingRequest`, hands them to the pipeline, and
//! renders either the upstream response or the terminal error.
//!
//! `/__gateway/health` is served by the gateway itself and never routed
//! upstream: it reports the route count and per-service snapshot staleness.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::core::error::GatewayResult;
use crate::core::types::IncomingRequest;
use crate::gateway::pipeline::GatewayPipeline;

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
        }
    }
}

/// The gateway's HTTP front
pub struct GatewayServer {
    pipeline: Arc<GatewayPipeline>,
    config: ServerConfig,
}

impl GatewayServer {
    pub fn new(pipeline: Arc<GatewayPipeline>, config: ServerConfig) -> Self {
        Self { pipeline, config }
    }

    /// Build the axum application
    pub fn app(&self) -> Router {
        Router::new()
            .route("/__gateway/health", get(health_handler))
            .fallback(proxy_handler)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(Arc::clone(&self.pipeline))
    }

    /// Bind and serve until the shutdown token fires
    pub async fn serve(&self, shutdown: CancellationToken) -> GatewayResult<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "gateway listening");

        axum::serve(
            listener,
            self.app()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        info!("gateway listener stopped");
        Ok(())
    }
}

/// Catch-all handler: every unreserved path goes through the pipeline
async fn proxy_handler(
    State(pipeline): State<Arc<GatewayPipeline>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = IncomingRequest::new(
        method,
        uri.path(),
        uri.query().map(str::to_string),
        headers,
        body,
        Some(remote_addr),
    );

    match pipeline.handle(request).await {
        Ok(response) => response.into_response(),
        Err(err) => err.into_response(),
    }
}

/// Gateway self-health: route count and snapshot staleness per service
async fn health_handler(State(pipeline): State<Arc<GatewayPipeline>>) -> Response {
    let registry = pipeline.registry();
    let services: serde_json::Map<String, serde_json::Value> = registry
        .watched_services()
        .into_iter()
        .map(|service| {
            let staleness_ms = registry
                .staleness(&service)
                .map(|age| age.as_millis() as u64);
            (service, json!({ "snapshot_age_ms": staleness_ms }))
        })
        .collect();

    let body = json!({
        "status": "ok",
        "routes": pipeline.route_table().load().len(),
        "services": services,
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// Periodic staleness watchdog
///
/// Emits a warning-level event when any watched service's snapshot ages past
/// twice the poll interval, so an operator notices a silently failing
/// provider even without scraping the health endpoint.
pub fn spawn_staleness_watchdog(
    pipeline: Arc<GatewayPipeline>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = pipeline.registry().poll_interval();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let registry = pipeline.registry();
                    for service in registry.watched_services() {
                        if let Some(age) = registry.staleness(&service) {
                            if age > interval * 2 {
                                tracing::warn!(
                                    service = %service,
                                    age = %humantime::format_duration(Duration::from_secs(age.as_secs())),
                                    "service snapshot is stale"
                                );
                            }
                        }
                    }
                }
            }
        }
    })
}
