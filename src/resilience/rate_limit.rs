//! # Rate Limiter
//!
//! Per-key admission control using a token bucket. One bucket exists per
//! (route, resolved key) pair; keys come from a configurable resolver
//! (caller identity header, source address, or a single global bucket).
//!
//! Refill and spend happen atomically under the bucket's own mutex, so
//! concurrent checks on the same key can never double-spend a token.
//! Buckets are created lazily with full capacity and reclaimed by an idle
//! sweep; a check in flight holds its own `Arc` to the bucket, so sweeping
//! can never lose it mid-decision.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::IncomingRequest;
use crate::observability::{EventBus, GatewayEvent};

/// How the admission key is derived from a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// One bucket for the whole route
    Global,
    /// One bucket per client IP address
    #[default]
    ClientIp,
    /// One bucket per value of the named request header
    Header { name: String },
}

/// Token-bucket parameters for one route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens the bucket holds
    pub capacity: u32,

    /// Tokens added per second
    pub refill_per_second: f64,

    /// Key resolver
    #[serde(default)]
    pub key: KeyPolicy,

    /// Idle period after which a bucket may be reclaimed
    #[serde(with = "humantime_serde", default = "default_idle_ttl")]
    pub idle_ttl: Duration,
}

fn default_idle_ttl() -> Duration {
    Duration::from_secs(300)
}

/// Mutable bucket state, guarded by its own mutex
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// Token-bucket rate limiter for one route
pub struct RateLimiter {
    route: String,
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    events: EventBus,
}

impl RateLimiter {
    pub fn new(route: impl Into<String>, config: RateLimitConfig, events: EventBus) -> Self {
        Self {
            route: route.into(),
            config,
            buckets: DashMap::new(),
            events,
        }
    }

    /// Resolve the admission key for a request per the configured policy
    pub fn resolve_key(&self, request: &IncomingRequest) -> String {
        match &self.config.key {
            KeyPolicy::Global => "global".to_string(),
            KeyPolicy::ClientIp => request
                .client_ip()
                .unwrap_or_else(|| "unknown".to_string()),
            KeyPolicy::Header { name } => request
                .header(name)
                .map(str::to_string)
                .unwrap_or_else(|| "anonymous".to_string()),
        }
    }

    /// Admit or reject one request under the resolved key
    pub fn check(&self, key: &str) -> GatewayResult<()> {
        self.check_at(key, Instant::now())
    }

    /// Admission decision at an explicit point in time
    ///
    /// Split out from `check` so the refill arithmetic is testable without
    /// real sleeps.
    pub fn check_at(&self, key: &str, now: Instant) -> GatewayResult<()> {
        // Clone the Arc out so the map shard lock is released before the
        // bucket lock is taken.
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(route = %self.route, key, "bucket created");
                Arc::new(Mutex::new(TokenBucket {
                    tokens: self.config.capacity as f64,
                    last_refill: now,
                    last_used: now,
                }))
            })
            .clone();

        let mut state = bucket.lock();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.config.refill_per_second)
            .min(self.config.capacity as f64);
        state.last_refill = now;
        state.last_used = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            let retry_after = if self.config.refill_per_second > 0.0 {
                Duration::from_secs_f64(deficit / self.config.refill_per_second)
            } else {
                Duration::from_secs(u64::MAX / 2)
            };
            drop(state);

            metrics::counter!("gateway_rate_limited", "route" => self.route.clone()).increment(1);
            self.events.publish(GatewayEvent::RateLimitRejected {
                route: self.route.clone(),
                key: key.to_string(),
                retry_after,
            });
            Err(GatewayError::RateLimited {
                key: key.to_string(),
                retry_after,
            })
        }
    }

    /// Number of live buckets (bounded by the idle sweep)
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Reclaim buckets idle longer than the configured TTL
    ///
    /// A bucket whose lock is currently held is in active use and is kept
    /// regardless of its recorded idle time.
    pub fn sweep_idle(&self) {
        let ttl = self.config.idle_ttl;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| match bucket.try_lock() {
            Some(state) => state.last_used.elapsed() < ttl,
            None => true,
        });
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            debug!(route = %self.route, evicted, "idle rate-limit buckets reclaimed");
        }
    }

    /// Spawn the periodic idle sweep for this limiter
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => limiter.sweep_idle(),
                }
            }
        })
    }
}
