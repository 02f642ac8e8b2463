//! # Gateway Pipeline
//!
//! Composes the router, rate limiter, circuit breaker, retry executor, load
//! balancer and endpoint registry into the end-to-end request handler:
//!
//! ```text
//! request → route match → rate-limit admit → [per attempt: breaker admit →
//! resolve snapshot → select endpoint → invoke] → breaker records outcome →
//! response (or configured fallback)
//! ```
//!
//! Each request runs as its own task; the only serialization points are the
//! per-route breaker lock and the per-key bucket lock. Retry attempts within
//! one request are strictly sequential and every attempt re-resolves its
//! endpoint, steering around the endpoint the previous attempt failed on.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest};
use crate::discovery::EndpointRegistry;
use crate::gateway::connector::{UpstreamConnector, UpstreamRequest};
use crate::load_balancing::LoadBalancer;
use crate::observability::{EventBus, GatewayEvent};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerRegistry, RateLimitConfig, RateLimiter, RetryExecutor,
};
use crate::routing::{FallbackConfig, FilterSpec, Route, SharedRouteTable};

/// The end-to-end request handler
pub struct GatewayPipeline {
    routes: Arc<SharedRouteTable>,
    registry: Arc<EndpointRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    breakers: CircuitBreakerRegistry,
    limiters: DashMap<String, Arc<RateLimiter>>,
    retry: RetryExecutor,
    connector: Arc<dyn UpstreamConnector>,
    events: EventBus,
}

impl GatewayPipeline {
    pub fn new(
        routes: Arc<SharedRouteTable>,
        registry: Arc<EndpointRegistry>,
        balancer: Arc<dyn LoadBalancer>,
        connector: Arc<dyn UpstreamConnector>,
        events: EventBus,
    ) -> Self {
        Self {
            routes,
            registry,
            balancer,
            breakers: CircuitBreakerRegistry::new(events.clone()),
            limiters: DashMap::new(),
            retry: RetryExecutor::new(events.clone()),
            connector,
            events,
        }
    }

    /// The live route table handle
    pub fn route_table(&self) -> &Arc<SharedRouteTable> {
        &self.routes
    }

    /// The endpoint registry backing this pipeline
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Handle one inbound request to a terminal response or error
    pub async fn handle(&self, mut request: IncomingRequest) -> GatewayResult<GatewayResponse> {
        let started = request.received_at;

        // In-flight requests keep the table snapshot they resolve here.
        let table = self.routes.load();
        let matched = table
            .match_request(&request.method, &request.path)
            .ok_or_else(|| GatewayError::NoRouteMatched {
                path: request.path.clone(),
            })?;
        let route = Arc::clone(&matched.route);

        debug!(
            request_id = %request.id,
            route = %route.id,
            service = %route.service,
            path = %request.path,
            rewritten = %matched.rewritten_path,
            "route matched"
        );
        self.events.publish(GatewayEvent::RouteMatched {
            request_id: request.id.clone(),
            route: route.id.clone(),
            service: route.service.clone(),
            rewritten_path: matched.rewritten_path.clone(),
        });

        if let Some(config) = &route.policy.rate_limit {
            let limiter = self.limiter_for(&route.id, config);
            let key = limiter.resolve_key(&request);
            limiter.check(&key)?;
        }

        self.apply_request_filters(&route.filters, &mut request);

        let upstream = Arc::new(UpstreamRequest {
            method: request.method.clone(),
            path: matched.rewritten_path.clone(),
            query: request.query.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });

        let deadline = started + route.policy.timeout;
        let breaker = self
            .breakers
            .get_or_create(&route.id, &route.policy.circuit_breaker);
        // Authority of the endpoint the previous attempt failed against.
        let avoid: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let registry = Arc::clone(&self.registry);
        let balancer = Arc::clone(&self.balancer);
        let connector = Arc::clone(&self.connector);
        let dispatch_route = Arc::clone(&route);

        let outcome = self
            .retry
            .execute(
                &route.policy.retry,
                &request.id,
                &route.id,
                &request.method,
                deadline,
                move |_attempt| {
                    Self::dispatch_once(
                        Arc::clone(&registry),
                        Arc::clone(&balancer),
                        Arc::clone(&connector),
                        Arc::clone(&breaker),
                        Arc::clone(&dispatch_route),
                        Arc::clone(&upstream),
                        Arc::clone(&avoid),
                        deadline,
                    )
                },
            )
            .await;

        match outcome {
            Ok(mut response) => {
                self.apply_response_filters(&route.filters, started, &mut response);
                Ok(response)
            }
            Err(err) => {
                if let Some(fallback) = &route.fallback {
                    if Self::fallback_applies(&err) {
                        warn!(
                            request_id = %request.id,
                            route = %route.id,
                            error = %err,
                            "primary path failed, serving fallback"
                        );
                        metrics::counter!("gateway_fallbacks", "route" => route.id.clone())
                            .increment(1);
                        let mut response = Self::fallback_response(fallback, &err);
                        self.apply_response_filters(&route.filters, started, &mut response);
                        return Ok(response);
                    }
                }
                Err(err)
            }
        }
    }

    /// One dispatch attempt: breaker gate, endpoint resolution, the call,
    /// and outcome recording
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_once(
        registry: Arc<EndpointRegistry>,
        balancer: Arc<dyn LoadBalancer>,
        connector: Arc<dyn UpstreamConnector>,
        breaker: Arc<CircuitBreaker>,
        route: Arc<Route>,
        upstream: Arc<UpstreamRequest>,
        avoid: Arc<Mutex<Option<String>>>,
        deadline: Instant,
    ) -> GatewayResult<GatewayResponse> {
        // A breaker that opened mid-retry-sequence rejects right here, before
        // any network attempt.
        breaker.admit()?;

        let result =
            Self::attempt_call(&registry, &balancer, &connector, &route, &upstream, &avoid, deadline)
                .await;

        // Every admitted call must report back, or a half-open probe slot
        // would leak.
        match &result {
            Ok(response) => {
                if response.status.as_u16() >= route.policy.failure_status_min {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }
            }
            Err(err) if err.is_breaker_failure() => breaker.record_failure(),
            Err(_) => breaker.record_cancelled(),
        }

        result
    }

    async fn attempt_call(
        registry: &EndpointRegistry,
        balancer: &Arc<dyn LoadBalancer>,
        connector: &Arc<dyn UpstreamConnector>,
        route: &Route,
        upstream: &UpstreamRequest,
        avoid: &Mutex<Option<String>>,
        deadline: Instant,
    ) -> GatewayResult<GatewayResponse> {
        let snapshot = registry.resolve(&route.service)?;
        let pool = snapshot.available_endpoints();

        let avoid_authority = avoid.lock().clone();
        let index = balancer
            .select(&route.service, &pool, avoid_authority.as_deref())
            .await
            .ok_or_else(|| GatewayError::NoEndpointsAvailable {
                service: route.service.clone(),
            })?;
        let endpoint = pool[index].clone();

        let now = Instant::now();
        if now >= deadline {
            return Err(GatewayError::DeadlineExceeded);
        }
        // The tighter of per-attempt timeout and remaining request budget.
        let cap = route.policy.attempt_timeout.min(deadline - now);

        match tokio::time::timeout(cap, connector.invoke(&endpoint, upstream)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                *avoid.lock() = Some(endpoint.authority());
                Err(err)
            }
            Err(_) => {
                *avoid.lock() = Some(endpoint.authority());
                if Instant::now() >= deadline {
                    Err(GatewayError::DeadlineExceeded)
                } else {
                    Err(GatewayError::AttemptTimeout { timeout: cap })
                }
            }
        }
    }

    fn limiter_for(&self, route_id: &str, config: &RateLimitConfig) -> Arc<RateLimiter> {
        self.limiters
            .entry(route_id.to_string())
            .or_insert_with(|| {
                Arc::new(RateLimiter::new(
                    route_id,
                    config.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    fn apply_request_filters(&self, filters: &[FilterSpec], request: &mut IncomingRequest) {
        for filter in filters {
            match filter {
                FilterSpec::CorrelationId { header } => {
                    if let Ok(name) = HeaderName::from_bytes(header.as_bytes()) {
                        if !request.headers.contains_key(&name) {
                            if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
                                request.headers.insert(name, value);
                            }
                        }
                    }
                }
                FilterSpec::RequestHeader { name, value } => {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(value),
                    ) {
                        request.headers.insert(name, value);
                    }
                }
                FilterSpec::ResponseHeader { .. } | FilterSpec::ResponseTiming { .. } => {}
            }
        }
    }

    fn apply_response_filters(
        &self,
        filters: &[FilterSpec],
        started: Instant,
        response: &mut GatewayResponse,
    ) {
        for filter in filters {
            match filter {
                FilterSpec::ResponseHeader { name, value } => {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(value),
                    ) {
                        response.headers.insert(name, value);
                    }
                }
                FilterSpec::ResponseTiming { header } => {
                    let elapsed_ms = started.elapsed().as_millis().to_string();
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(header.as_bytes()),
                        HeaderValue::from_str(&elapsed_ms),
                    ) {
                        response.headers.insert(name, value);
                    }
                }
                FilterSpec::CorrelationId { .. } | FilterSpec::RequestHeader { .. } => {}
            }
        }
    }

    /// Whether a terminal error is eligible for fallback suppression
    ///
    /// Dispatch-path failures are; admission verdicts are not: a fallback
    /// must never turn a rate-limit rejection into a successful response.
    fn fallback_applies(err: &GatewayError) -> bool {
        matches!(
            err,
            GatewayError::CircuitOpen { .. }
                | GatewayError::NoEndpointsAvailable { .. }
                | GatewayError::DiscoveryUnavailable { .. }
                | GatewayError::Upstream { .. }
                | GatewayError::AttemptTimeout { .. }
                | GatewayError::DeadlineExceeded
                | GatewayError::RetriesExhausted { .. }
        )
    }

    fn fallback_response(fallback: &FallbackConfig, err: &GatewayError) -> GatewayResponse {
        let status = StatusCode::from_u16(fallback.status).unwrap_or(StatusCode::OK);
        let mut response = GatewayResponse::new(
            status,
            axum::http::HeaderMap::new(),
            Bytes::from(fallback.body.clone().into_bytes()),
        );
        if let Ok(value) = fallback.content_type.parse() {
            response.headers.insert("content-type", value);
        }
        // Mark the response as degraded, carrying the suppressed error kind.
        if let Ok(value) = err.error_type().parse() {
            response.headers.insert("x-gateway-fallback", value);
        }
        response
    }

    /// Reclaim idle rate-limit buckets across all routes
    pub fn sweep_idle_buckets(&self) {
        for limiter in self.limiters.iter() {
            limiter.value().sweep_idle();
        }
    }

    /// Spawn the periodic bucket sweep
    pub fn spawn_bucket_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => pipeline.sweep_idle_buckets(),
                }
            }
        })
    }

    /// Drop breaker and limiter state for routes absent from the new table
    pub fn prune_stale_routes(&self) {
        let live = self.routes.load().route_ids();
        self.breakers.retain_routes(&live);
        self.limiters.retain(|route_id, _| live.iter().any(|l| l == route_id));
    }
}
