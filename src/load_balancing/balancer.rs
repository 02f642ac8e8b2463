//! # Load Balancer Module
//!
//! Picks one endpoint from a registry snapshot per dispatch attempt. Policy
//! is pluggable behind the `LoadBalancer` trait; round-robin is the default.
//!
//! Selection never assumes snapshot identity is stable across calls: every
//! call re-derives its choice from the endpoint slice it is handed, and the
//! round-robin cursor is clamped modulo the current slice length so a
//! shrinking snapshot can never index out of range.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::types::Endpoint;

/// Selection policy, chosen per gateway configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    #[default]
    RoundRobin,
    Random,
}

/// Core trait for load balancing algorithms
///
/// `avoid` carries the authority of the endpoint a previous attempt of the
/// same request failed against; implementations steer around it whenever an
/// alternative exists.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Select an index into `endpoints`, or `None` when the slice is empty
    async fn select(
        &self,
        service: &str,
        endpoints: &[Endpoint],
        avoid: Option<&str>,
    ) -> Option<usize>;

    /// Algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;

    /// Per-endpoint selection counts for introspection
    fn stats(&self) -> LoadBalancerStats;
}

/// Selection statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub algorithm: String,
    pub total_selections: u64,
    pub failed_selections: u64,
    pub per_endpoint: HashMap<String, EndpointStats>,
}

/// Per-endpoint statistics
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub selections: u64,
    pub last_selected: Option<chrono::DateTime<chrono::Utc>>,
}

/// Round-robin balancer with one monotonic cursor per service
pub struct RoundRobinBalancer {
    cursors: DashMap<String, AtomicUsize>,
    stats: DashMap<String, EndpointStats>,
    total_selections: AtomicU64,
    failed_selections: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
            stats: DashMap::new(),
            total_selections: AtomicU64::new(0),
            failed_selections: AtomicU64::new(0),
        }
    }

    fn record_selection(&self, endpoint: &Endpoint) {
        self.total_selections.fetch_add(1, Ordering::Relaxed);
        let mut entry = self
            .stats
            .entry(endpoint.authority())
            .or_insert_with(|| EndpointStats {
                selections: 0,
                last_selected: None,
            });
        entry.selections += 1;
        entry.last_selected = Some(chrono::Utc::now());
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn select(
        &self,
        service: &str,
        endpoints: &[Endpoint],
        avoid: Option<&str>,
    ) -> Option<usize> {
        if endpoints.is_empty() {
            self.failed_selections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_lb_failed_selections").increment(1);
            return None;
        }

        let cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        // The cursor grows monotonically; the modulo clamps it to whatever
        // size the snapshot has right now.
        let mut index = cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();

        if endpoints.len() > 1 {
            if let Some(avoid) = avoid {
                if endpoints[index].authority() == avoid {
                    index = (index + 1) % endpoints.len();
                }
            }
        }

        self.record_selection(&endpoints[index]);
        metrics::counter!("gateway_lb_selections", "algorithm" => "round_robin").increment(1);
        debug!(
            service,
            endpoint = %endpoints[index],
            algorithm = "round_robin",
            "endpoint selected"
        );
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        "round_robin"
    }

    fn stats(&self) -> LoadBalancerStats {
        LoadBalancerStats {
            algorithm: self.algorithm_name().to_string(),
            total_selections: self.total_selections.load(Ordering::Relaxed),
            failed_selections: self.failed_selections.load(Ordering::Relaxed),
            per_endpoint: self
                .stats
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

/// Uniform random balancer
pub struct RandomBalancer {
    stats: DashMap<String, EndpointStats>,
    total_selections: AtomicU64,
    failed_selections: AtomicU64,
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self {
            stats: DashMap::new(),
            total_selections: AtomicU64::new(0),
            failed_selections: AtomicU64::new(0),
        }
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for RandomBalancer {
    async fn select(
        &self,
        _service: &str,
        endpoints: &[Endpoint],
        avoid: Option<&str>,
    ) -> Option<usize> {
        if endpoints.is_empty() {
            self.failed_selections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_lb_failed_selections").increment(1);
            return None;
        }

        let mut index = rand::thread_rng().gen_range(0..endpoints.len());
        if endpoints.len() > 1 {
            if let Some(avoid) = avoid {
                if endpoints[index].authority() == avoid {
                    index = (index + 1) % endpoints.len();
                }
            }
        }

        self.total_selections.fetch_add(1, Ordering::Relaxed);
        let mut entry = self
            .stats
            .entry(endpoints[index].authority())
            .or_insert_with(|| EndpointStats {
                selections: 0,
                last_selected: None,
            });
        entry.selections += 1;
        entry.last_selected = Some(chrono::Utc::now());
        drop(entry);

        metrics::counter!("gateway_lb_selections", "algorithm" => "random").increment(1);
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        "random"
    }

    fn stats(&self) -> LoadBalancerStats {
        LoadBalancerStats {
            algorithm: self.algorithm_name().to_string(),
            total_selections: self.total_selections.load(Ordering::Relaxed),
            failed_selections: self.failed_selections.load(Ordering::Relaxed),
            per_endpoint: self
                .stats
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

/// Build a balancer for the configured policy
pub fn balancer_for(policy: LoadBalancingPolicy) -> Arc<dyn LoadBalancer> {
    match policy {
        LoadBalancingPolicy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalancingPolicy::Random => Arc::new(RandomBalancer::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<Endpoint> {
        (0..n).map(|i| Endpoint::new(format!("10.0.0.{i}"), 8080)).collect()
    }

    #[tokio::test]
    async fn test_round_robin_rotates_in_order() {
        let balancer = RoundRobinBalancer::new();
        let pool = endpoints(3);

        let picks: Vec<usize> = {
            let mut v = Vec::new();
            for _ in 0..6 {
                v.push(balancer.select("svc", &pool, None).await.unwrap());
            }
            v
        };
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_round_robin_empty_pool() {
        let balancer = RoundRobinBalancer::new();
        assert!(balancer.select("svc", &[], None).await.is_none());
        assert_eq!(balancer.stats().failed_selections, 1);
    }

    #[tokio::test]
    async fn test_cursor_clamped_when_snapshot_shrinks() {
        let balancer = RoundRobinBalancer::new();
        let big = endpoints(4);
        for _ in 0..3 {
            balancer.select("svc", &big, None).await.unwrap();
        }

        // The cursor sits at 3; a two-endpoint snapshot must still be indexed
        // safely.
        let small = endpoints(2);
        let index = balancer.select("svc", &small, None).await.unwrap();
        assert!(index < small.len());
    }

    #[tokio::test]
    async fn test_avoid_skips_failed_endpoint() {
        let balancer = RoundRobinBalancer::new();
        let pool = endpoints(2);

        let first = balancer.select("svc", &pool, None).await.unwrap();
        let avoid = pool[first].authority();
        for _ in 0..4 {
            let next = balancer.select("svc", &pool, Some(&avoid)).await.unwrap();
            assert_ne!(pool[next].authority(), avoid);
        }
    }

    #[tokio::test]
    async fn test_avoid_ignored_when_single_endpoint() {
        let balancer = RoundRobinBalancer::new();
        let pool = endpoints(1);
        let avoid = pool[0].authority();

        // With no alternative, the same endpoint is allowed again.
        let index = balancer.select("svc", &pool, Some(&avoid)).await.unwrap();
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn test_even_distribution_across_two_endpoints() {
        let balancer = RoundRobinBalancer::new();
        let pool = endpoints(2);

        let mut counts = [0usize; 2];
        for _ in 0..100 {
            counts[balancer.select("svc", &pool, None).await.unwrap()] += 1;
        }
        assert_eq!(counts[0], 50);
        assert_eq!(counts[1], 50);
    }

    #[tokio::test]
    async fn test_random_balancer_stays_in_range() {
        let balancer = RandomBalancer::new();
        let pool = endpoints(3);
        for _ in 0..50 {
            let index = balancer.select("svc", &pool, None).await.unwrap();
            assert!(index < pool.len());
        }
    }

    #[test]
    fn test_per_service_cursors_are_independent() {
        let balancer = RoundRobinBalancer::new();
        let pool = endpoints(3);

        tokio_test::block_on(async {
            assert_eq!(balancer.select("a", &pool, None).await.unwrap(), 0);
            assert_eq!(balancer.select("a", &pool, None).await.unwrap(), 1);
            // A different service starts from its own cursor.
            assert_eq!(balancer.select("b", &pool, None).await.unwrap(), 0);
        });
    }
}
