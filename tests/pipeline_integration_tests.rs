//! End-to-end pipeline tests: routing, resilience behavior, and load
//! distribution, driven through `GatewayPipeline` with an in-memory
//! connector standing in for the upstream transport.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edge_gateway::core::error::{GatewayError, GatewayResult};
use edge_gateway::core::types::{Endpoint, GatewayResponse, IncomingRequest};
use edge_gateway::discovery::{DiscoveryProvider, EndpointRegistry, RegistryConfig, StaticDiscovery};
use edge_gateway::gateway::connector::{UpstreamConnector, UpstreamRequest};
use edge_gateway::gateway::GatewayPipeline;
use edge_gateway::load_balancing::RoundRobinBalancer;
use edge_gateway::observability::EventBus;
use edge_gateway::resilience::{CircuitBreakerConfig, KeyPolicy, RateLimitConfig, RetryPolicy};
use edge_gateway::routing::{PredicateDef, RouteDefinition, RouteTable, SharedRouteTable};

/// Programmable connector: counts calls per endpoint, optionally fails or
/// delays, so tests can observe exactly which attempts reached the network.
struct ScriptedConnector {
    calls: Mutex<HashMap<String, u64>>,
    failing: AtomicBool,
    delay: Duration,
}

impl ScriptedConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            delay: Duration::ZERO,
        })
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            delay,
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    fn calls_for(&self, authority: &str) -> u64 {
        self.calls.lock().get(authority).copied().unwrap_or(0)
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    async fn invoke(
        &self,
        endpoint: &Endpoint,
        _request: &UpstreamRequest,
    ) -> GatewayResult<GatewayResponse> {
        *self.calls.lock().entry(endpoint.authority()).or_insert(0) += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            Err(GatewayError::upstream(endpoint.authority(), "injected failure".into()))
        } else {
            Ok(GatewayResponse::text(StatusCode::OK, "ok"))
        }
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(10),
        jitter_fraction: 0.0,
        ..RetryPolicy::default()
    }
}

fn accounts_route() -> RouteDefinition {
    RouteDefinition {
        id: "accounts".to_string(),
        predicate: PredicateDef::Prefix("/accounts".to_string()),
        rewrite: Some("/{rest}".to_string()),
        service: "loans".to_string(),
        methods: Vec::new(),
        filters: Vec::new(),
        timeout: Duration::from_secs(5),
        attempt_timeout: Duration::from_secs(2),
        failure_status_min: 500,
        circuit_breaker: None,
        retry: Some(fast_retry()),
        rate_limit: None,
        fallback: None,
    }
}

async fn build_pipeline(
    defs: Vec<RouteDefinition>,
    endpoints: Vec<Endpoint>,
    connector: Arc<dyn UpstreamConnector>,
) -> Arc<GatewayPipeline> {
    let events = EventBus::default();
    let mut services = HashMap::new();
    services.insert("loans".to_string(), endpoints);

    let registry = Arc::new(EndpointRegistry::new(
        Arc::new(StaticDiscovery::new(services)),
        RegistryConfig::default(),
        events.clone(),
    ));
    registry.watch("loans");
    registry.refresh_all().await;

    let routes = Arc::new(SharedRouteTable::new(
        RouteTable::compile(&defs).unwrap(),
        events.clone(),
    ));
    Arc::new(GatewayPipeline::new(
        routes,
        registry,
        Arc::new(RoundRobinBalancer::new()),
        connector,
        events,
    ))
}

fn get(path: &str) -> IncomingRequest {
    IncomingRequest::new(
        Method::GET,
        path,
        None,
        HeaderMap::new(),
        Bytes::new(),
        Some("127.0.0.1:4000".parse().unwrap()),
    )
}

fn post(path: &str) -> IncomingRequest {
    IncomingRequest::new(
        Method::POST,
        path,
        None,
        HeaderMap::new(),
        Bytes::from_static(b"{\"amount\":10}"),
        Some("127.0.0.1:4000".parse().unwrap()),
    )
}

#[tokio::test]
async fn concurrent_requests_distribute_evenly_round_robin() {
    let connector = ScriptedConnector::new();
    let pipeline = build_pipeline(
        vec![accounts_route()],
        vec![Endpoint::new("10.0.0.1", 9001), Endpoint::new("10.0.0.2", 9001)],
        connector.clone(),
    )
    .await;

    let mut handles = Vec::new();
    for i in 0..100 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.handle(get(&format!("/accounts/{i}"))).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let first = connector.calls_for("10.0.0.1:9001") as i64;
    let second = connector.calls_for("10.0.0.2:9001") as i64;
    assert_eq!(first + second, 100);
    assert!((first - second).abs() <= 1, "distribution {first}/{second}");
}

#[tokio::test]
async fn three_consecutive_failures_exhaust_retries_with_three_attempts() {
    let connector = ScriptedConnector::new();
    connector.set_failing(true);
    let pipeline = build_pipeline(
        vec![accounts_route()],
        vec![Endpoint::new("10.0.0.1", 9001), Endpoint::new("10.0.0.2", 9001)],
        connector.clone(),
    )
    .await;

    let err = pipeline.handle(get("/accounts/1")).await.unwrap_err();
    assert_eq!(err.error_type(), "retries_exhausted");
    assert_eq!(connector.total_calls(), 3);

    // Retries re-resolved endpoints: with an alternative available, the
    // attempts did not all hammer the same instance.
    assert!(connector.calls_for("10.0.0.1:9001") >= 1);
    assert!(connector.calls_for("10.0.0.2:9001") >= 1);
}

#[tokio::test]
async fn non_idempotent_method_never_retried() {
    let connector = ScriptedConnector::new();
    connector.set_failing(true);
    let pipeline = build_pipeline(
        vec![accounts_route()],
        vec![Endpoint::new("10.0.0.1", 9001)],
        connector.clone(),
    )
    .await;

    let err = pipeline.handle(post("/accounts/transfer")).await.unwrap_err();
    assert_eq!(err.error_type(), "upstream_error");
    // Exactly one write attempt: no duplicate side effects on the backend.
    assert_eq!(connector.total_calls(), 1);
}

#[tokio::test]
async fn repeated_gets_succeed_without_extra_attempts() {
    let connector = ScriptedConnector::new();
    let pipeline = build_pipeline(
        vec![accounts_route()],
        vec![Endpoint::new("10.0.0.1", 9001)],
        connector.clone(),
    )
    .await;

    for _ in 0..10 {
        let response = pipeline.handle(get("/accounts/7")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }
    // One attempt per request under a closed circuit and healthy endpoints.
    assert_eq!(connector.total_calls(), 10);
}

#[tokio::test]
async fn breaker_opens_blocks_and_allows_single_probe() {
    let connector = ScriptedConnector::with_delay(Duration::from_millis(100));
    connector.set_failing(true);

    let mut def = accounts_route();
    def.retry = Some(RetryPolicy {
        max_attempts: 1,
        ..fast_retry()
    });
    def.circuit_breaker = Some(CircuitBreakerConfig {
        window_size: 4,
        min_samples: 2,
        failure_ratio: 0.5,
        reset_timeout: Duration::from_millis(100),
        half_open_max_probes: 1,
        trip_backoff_multiplier: 1.0,
        max_reset_timeout: Duration::from_secs(1),
    });
    let pipeline = build_pipeline(
        vec![def],
        vec![Endpoint::new("10.0.0.1", 9001)],
        connector.clone(),
    )
    .await;

    // Two failing calls trip the breaker.
    for _ in 0..2 {
        let err = pipeline.handle(get("/accounts/1")).await.unwrap_err();
        assert_eq!(err.error_type(), "upstream_error");
    }
    assert_eq!(connector.total_calls(), 2);

    // While open: rejected fast, zero downstream calls.
    let err = pipeline.handle(get("/accounts/1")).await.unwrap_err();
    assert_eq!(err.error_type(), "circuit_open");
    assert_eq!(connector.total_calls(), 2);

    // After the reset timeout, exactly one concurrent caller wins the probe.
    tokio::time::sleep(Duration::from_millis(150)).await;
    connector.set_failing(false);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.handle(get("/accounts/1")).await
        }));
    }
    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(err) => {
                assert_eq!(err.error_type(), "circuit_open");
                rejected += 1;
            }
        }
    }
    assert_eq!(admitted, 1, "exactly one probe may pass");
    assert_eq!(rejected, 4);
    assert_eq!(connector.total_calls(), 3);

    // The successful probe closed the circuit; traffic flows again.
    let response = pipeline.handle(get("/accounts/1")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn rate_limiter_admits_burst_then_rejects_with_hint() {
    let connector = ScriptedConnector::new();
    let mut def = accounts_route();
    def.rate_limit = Some(RateLimitConfig {
        capacity: 5,
        refill_per_second: 1.0,
        key: KeyPolicy::Global,
        idle_ttl: Duration::from_secs(60),
    });
    let pipeline = build_pipeline(
        vec![def],
        vec![Endpoint::new("10.0.0.1", 9001)],
        connector.clone(),
    )
    .await;

    for _ in 0..5 {
        pipeline.handle(get("/accounts/1")).await.unwrap();
    }
    let err = pipeline.handle(get("/accounts/1")).await.unwrap_err();
    match &err {
        GatewayError::RateLimited { retry_after, .. } => {
            assert!(*retry_after > Duration::from_millis(800));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    // The rejection never reached the connector.
    assert_eq!(connector.total_calls(), 5);

    // One refill period later exactly one more request is admitted.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    pipeline.handle(get("/accounts/1")).await.unwrap();
    let err = pipeline.handle(get("/accounts/1")).await.unwrap_err();
    assert_eq!(err.error_type(), "rate_limited");
}

/// Provider that can be switched into a failing mode
struct SwitchableProvider {
    endpoints: Vec<Endpoint>,
    failing: AtomicBool,
}

#[async_trait]
impl DiscoveryProvider for SwitchableProvider {
    async fn list(&self, service: &str) -> GatewayResult<Vec<Endpoint>> {
        if self.failing.load(Ordering::SeqCst) {
            Err(GatewayError::discovery(service, "registry offline"))
        } else {
            Ok(self.endpoints.clone())
        }
    }
}

#[tokio::test]
async fn requests_keep_flowing_on_stale_snapshot() {
    let provider = Arc::new(SwitchableProvider {
        endpoints: vec![Endpoint::new("10.0.0.1", 9001), Endpoint::new("10.0.0.2", 9001)],
        failing: AtomicBool::new(false),
    });
    let events = EventBus::default();
    let registry = Arc::new(EndpointRegistry::new(
        Arc::clone(&provider) as Arc<dyn DiscoveryProvider>,
        RegistryConfig::default(),
        events.clone(),
    ));
    registry.watch("loans");
    registry.refresh_all().await;

    // Discovery goes down; the refresh fails but the snapshot survives.
    provider.failing.store(true, Ordering::SeqCst);
    assert!(registry.refresh("loans").await.is_err());

    let connector = ScriptedConnector::new();
    let routes = Arc::new(SharedRouteTable::new(
        RouteTable::compile(&[accounts_route()]).unwrap(),
        events.clone(),
    ));
    let pipeline = Arc::new(GatewayPipeline::new(
        routes,
        registry,
        Arc::new(RoundRobinBalancer::new()),
        connector.clone(),
        events,
    ));

    for _ in 0..4 {
        let response = pipeline.handle(get("/accounts/1")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
    }
    // Both stale endpoints still take traffic.
    assert_eq!(connector.calls_for("10.0.0.1:9001"), 2);
    assert_eq!(connector.calls_for("10.0.0.2:9001"), 2);
}

#[tokio::test]
async fn route_table_swap_applies_to_new_requests() {
    let connector = ScriptedConnector::new();
    let pipeline = build_pipeline(
        vec![accounts_route()],
        vec![Endpoint::new("10.0.0.1", 9001)],
        connector.clone(),
    )
    .await;

    pipeline.handle(get("/accounts/1")).await.unwrap();

    // Swap to a table where the route lives under a different path.
    let mut moved = accounts_route();
    moved.predicate = PredicateDef::Prefix("/v2/accounts".to_string());
    pipeline
        .route_table()
        .swap(RouteTable::compile(&[moved]).unwrap());

    let err = pipeline.handle(get("/accounts/1")).await.unwrap_err();
    assert_eq!(err.error_type(), "no_route_matched");
    let response = pipeline.handle(get("/v2/accounts/1")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn deadline_bounds_slow_upstream() {
    let connector = ScriptedConnector::with_delay(Duration::from_secs(2));
    let mut def = accounts_route();
    def.timeout = Duration::from_millis(100);
    def.attempt_timeout = Duration::from_secs(10);
    let pipeline = build_pipeline(
        vec![def],
        vec![Endpoint::new("10.0.0.1", 9001)],
        connector.clone(),
    )
    .await;

    let started = std::time::Instant::now();
    let err = pipeline.handle(get("/accounts/1")).await.unwrap_err();
    assert_eq!(err.error_type(), "deadline_exceeded");
    // The in-flight attempt was abandoned at the deadline, not after the
    // upstream's full 2s delay.
    assert!(started.elapsed() < Duration::from_secs(1));
}
