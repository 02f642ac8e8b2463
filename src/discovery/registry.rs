//! # Endpoint Registry
//!
//! Caches the live endpoint set per logical service name and keeps it fresh
//! by polling the injected `DiscoveryProvider` from one background task per
//! watched service.
//!
//! Refresh publishes a complete immutable `Arc<ServiceSnapshot>` into a
//! per-service slot; `resolve` only ever reads the slot, so the request path
//! never waits on the network. A failed poll keeps the last good snapshot in
//! place (stale-but-available beats fail-closed) and the staleness age is
//! exposed for observability.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceSnapshot;
use crate::discovery::provider::DiscoveryProvider;
use crate::observability::{EventBus, GatewayEvent};

/// Polling behavior for the background refreshers
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base interval between polls of one service
    pub poll_interval: Duration,

    /// Fraction of the interval used as random jitter, in `[0.0, 1.0]`
    ///
    /// Spreads poll times so many services never hit the provider in
    /// lockstep.
    pub poll_jitter: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            poll_jitter: 0.1,
        }
    }
}

/// Per-service slot holding the current snapshot
///
/// The slot itself is tiny: a lock around an `Arc` plus counters. Readers
/// clone the `Arc` out under a read lock; refreshers swap it under a write
/// lock. No reader ever sees a half-replaced endpoint list.
#[derive(Default)]
struct ServiceSlot {
    snapshot: RwLock<Option<Arc<ServiceSnapshot>>>,
    generation: AtomicU64,
    last_refresh_error: RwLock<Option<Instant>>,
}

/// Registry of service snapshots, refreshed by polling discovery
pub struct EndpointRegistry {
    provider: Arc<dyn DiscoveryProvider>,
    slots: DashMap<String, Arc<ServiceSlot>>,
    config: RegistryConfig,
    events: EventBus,
}

impl EndpointRegistry {
    /// Create a registry over the given provider
    pub fn new(
        provider: Arc<dyn DiscoveryProvider>,
        config: RegistryConfig,
        events: EventBus,
    ) -> Self {
        Self {
            provider,
            slots: DashMap::new(),
            config,
            events,
        }
    }

    /// Effective poll interval: provider suggestion wins over configuration
    pub fn poll_interval(&self) -> Duration {
        self.provider
            .suggested_poll_interval()
            .unwrap_or(self.config.poll_interval)
    }

    /// Register a service name so it participates in refresh cycles
    pub fn watch(&self, service: &str) {
        self.slots
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(ServiceSlot::default()));
    }

    /// Service names currently watched
    pub fn watched_services(&self) -> Vec<String> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolve the most recent snapshot for a service
    ///
    /// Fails with `NoEndpointsAvailable` when the service is unknown, no
    /// snapshot has ever been published, or every endpoint in the snapshot
    /// is marked unhealthy. Never touches the network.
    pub fn resolve(&self, service: &str) -> GatewayResult<Arc<ServiceSnapshot>> {
        let slot = self
            .slots
            .get(service)
            .ok_or_else(|| GatewayError::NoEndpointsAvailable {
                service: service.to_string(),
            })?;

        let snapshot = slot
            .snapshot
            .read()
            .clone()
            .ok_or_else(|| GatewayError::NoEndpointsAvailable {
                service: service.to_string(),
            })?;

        if snapshot.available_endpoints().is_empty() {
            return Err(GatewayError::NoEndpointsAvailable {
                service: service.to_string(),
            });
        }

        Ok(snapshot)
    }

    /// Age of the snapshot currently served for a service
    pub fn staleness(&self, service: &str) -> Option<Duration> {
        let slot = self.slots.get(service)?;
        let snapshot = slot.snapshot.read().clone()?;
        Some(snapshot.refreshed_at.elapsed())
    }

    /// Poll the provider once and publish a fresh snapshot
    ///
    /// On provider failure the previous snapshot stays in place; the error
    /// is returned so callers doing an eager initial refresh can surface it.
    pub async fn refresh(&self, service: &str) -> GatewayResult<()> {
        let slot = self
            .slots
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(ServiceSlot::default()))
            .clone();

        match self.provider.list(service).await {
            Ok(endpoints) => {
                let generation = slot.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let snapshot = Arc::new(ServiceSnapshot {
                    service: service.to_string(),
                    endpoints,
                    generation,
                    refreshed_at: Instant::now(),
                });

                let endpoint_count = snapshot.endpoints.len();
                *slot.snapshot.write() = Some(snapshot);
                *slot.last_refresh_error.write() = None;

                metrics::gauge!("gateway_registry_endpoints", "service" => service.to_string())
                    .set(endpoint_count as f64);
                debug!(service, generation, endpoints = endpoint_count, "snapshot published");
                self.events.publish(GatewayEvent::SnapshotPublished {
                    service: service.to_string(),
                    generation,
                    endpoints: endpoint_count,
                });
                Ok(())
            }
            Err(err) => {
                *slot.last_refresh_error.write() = Some(Instant::now());
                metrics::counter!("gateway_registry_refresh_failures", "service" => service.to_string())
                    .increment(1);

                let stale = slot.snapshot.read().clone();
                if let Some(snapshot) = stale {
                    let age = snapshot.refreshed_at.elapsed();
                    warn!(
                        service,
                        age = %humantime::format_duration(Duration::from_secs(age.as_secs())),
                        error = %err,
                        "discovery refresh failed, serving stale snapshot"
                    );
                    if age > self.poll_interval() {
                        self.events.publish(GatewayEvent::SnapshotStale {
                            service: service.to_string(),
                            age,
                        });
                    }
                } else {
                    warn!(service, error = %err, "discovery refresh failed, no snapshot yet");
                }
                Err(err)
            }
        }
    }

    /// Eagerly refresh every watched service, ignoring individual failures
    pub async fn refresh_all(&self) {
        for service in self.watched_services() {
            let _ = self.refresh(&service).await;
        }
    }

    /// Spawn one polling task per watched service
    ///
    /// Each task sleeps a jittered interval, refreshes its service, and exits
    /// when the cancellation token fires.
    pub fn spawn_pollers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for service in self.watched_services() {
            let registry = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                info!(service = %service, "discovery poller started");
                loop {
                    let delay = registry.jittered_interval();
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            debug!(service = %service, "discovery poller stopping");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {
                            let _ = registry.refresh(&service).await;
                        }
                    }
                }
            }));
        }
        handles
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.poll_interval();
        let jitter = self.config.poll_jitter.clamp(0.0, 1.0);
        // Uniform in [1 - jitter, 1 + jitter].
        let factor = 1.0 + jitter * (2.0 * fastrand::f64() - 1.0);
        base.mul_f64(factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Endpoint, HealthStatus};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Provider that serves a fixed list until told to start failing
    struct FlakyProvider {
        endpoints: Vec<Endpoint>,
        failing: AtomicBool,
    }

    impl FlakyProvider {
        fn new(endpoints: Vec<Endpoint>) -> Self {
            Self {
                endpoints,
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl DiscoveryProvider for FlakyProvider {
        async fn list(&self, service: &str) -> GatewayResult<Vec<Endpoint>> {
            if self.failing.load(Ordering::SeqCst) {
                Err(GatewayError::discovery(service, "provider down"))
            } else {
                Ok(self.endpoints.clone())
            }
        }
    }

    fn registry_with(provider: Arc<FlakyProvider>) -> Arc<EndpointRegistry> {
        Arc::new(EndpointRegistry::new(
            provider,
            RegistryConfig::default(),
            EventBus::default(),
        ))
    }

    #[tokio::test]
    async fn test_resolve_after_refresh() {
        let provider = Arc::new(FlakyProvider::new(vec![
            Endpoint::new("10.0.0.1", 8080),
            Endpoint::new("10.0.0.2", 8080),
        ]));
        let registry = registry_with(provider);

        registry.watch("loans");
        registry.refresh("loans").await.unwrap();

        let snapshot = registry.resolve("loans").unwrap();
        assert_eq!(snapshot.endpoints.len(), 2);
        assert_eq!(snapshot.generation, 1);
    }

    #[tokio::test]
    async fn test_unknown_service_has_no_endpoints() {
        let provider = Arc::new(FlakyProvider::new(vec![]));
        let registry = registry_with(provider);

        let err = registry.resolve("ghost").unwrap_err();
        assert_eq!(err.error_type(), "no_endpoints_available");
    }

    #[tokio::test]
    async fn test_stale_snapshot_served_after_provider_failure() {
        let provider = Arc::new(FlakyProvider::new(vec![
            Endpoint::new("10.0.0.1", 8080),
            Endpoint::new("10.0.0.2", 8080),
        ]));
        let registry = registry_with(Arc::clone(&provider));

        registry.refresh("loans").await.unwrap();
        provider.failing.store(true, Ordering::SeqCst);
        assert!(registry.refresh("loans").await.is_err());

        // The previously published endpoints are still resolvable.
        let snapshot = registry.resolve("loans").unwrap();
        assert_eq!(snapshot.endpoints.len(), 2);
        assert_eq!(snapshot.generation, 1);
        assert!(registry.staleness("loans").is_some());
    }

    #[tokio::test]
    async fn test_all_unhealthy_resolves_to_error() {
        let mut bad = Endpoint::new("10.0.0.1", 8080);
        bad.health = HealthStatus::Unhealthy;
        let provider = Arc::new(FlakyProvider::new(vec![bad]));
        let registry = registry_with(provider);

        registry.refresh("loans").await.unwrap();
        let err = registry.resolve("loans").unwrap_err();
        assert_eq!(err.error_type(), "no_endpoints_available");
    }

    #[tokio::test]
    async fn test_generation_increments_per_refresh() {
        let provider = Arc::new(FlakyProvider::new(vec![Endpoint::new("10.0.0.1", 8080)]));
        let registry = registry_with(provider);

        registry.refresh("loans").await.unwrap();
        registry.refresh("loans").await.unwrap();

        let snapshot = registry.resolve("loans").unwrap();
        assert_eq!(snapshot.generation, 2);
    }
}
