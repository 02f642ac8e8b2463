//! # Circuit Breaker
//!
//! Per-route fault state machine guarding against calls to known-bad
//! backends.
//!
//! ## States
//! - **Closed**: calls pass through; each outcome lands in a sliding window
//!   of the last N samples. When the window holds at least `min_samples`
//!   outcomes and the failure ratio reaches the threshold, the circuit
//!   opens.
//! - **Open**: calls are rejected immediately with `CircuitOpen` until the
//!   reset timeout elapses, then the breaker moves to half-open.
//! - **HalfOpen**: a bounded number of trial calls (default one) is let
//!   through. One success closes the circuit and resets the window; one
//!   failure reopens it, growing the reset timeout on repeated trips.
//!
//! Transitions happen under one mutex per breaker, so concurrent callers in
//! half-open agree on exactly which of them holds a probe slot; everyone
//! else is rejected. Routes never share a breaker.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::{EventBus, GatewayEvent};

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of most-recent outcomes kept in the sliding window
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Minimum outcomes in the window before the trip condition is evaluated
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Failure ratio within the window that trips the circuit
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,

    /// How long to stay open before allowing a half-open probe
    #[serde(with = "humantime_serde", default = "default_reset_timeout")]
    pub reset_timeout: Duration,

    /// Concurrent trial calls allowed while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,

    /// Growth factor applied to the reset timeout on repeated trips
    #[serde(default = "default_trip_backoff_multiplier")]
    pub trip_backoff_multiplier: f64,

    /// Upper bound for the grown reset timeout
    #[serde(with = "humantime_serde", default = "default_max_reset_timeout")]
    pub max_reset_timeout: Duration,
}

fn default_window_size() -> usize {
    20
}
fn default_min_samples() -> usize {
    5
}
fn default_failure_ratio() -> f64 {
    0.5
}
fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_half_open_max_probes() -> u32 {
    1
}
fn default_trip_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_reset_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            min_samples: default_min_samples(),
            failure_ratio: default_failure_ratio(),
            reset_timeout: default_reset_timeout(),
            half_open_max_probes: default_half_open_max_probes(),
            trip_backoff_multiplier: default_trip_backoff_multiplier(),
            max_reset_timeout: default_max_reset_timeout(),
        }
    }
}

/// Public view of the breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Internal state, only touched under the breaker mutex
enum StateInner {
    /// `true` entries are failures
    Closed { window: VecDeque<bool> },
    Open { opened_at: Instant, timeout: Duration },
    HalfOpen { probes_in_flight: u32 },
}

impl StateInner {
    fn view(&self) -> CircuitState {
        match self {
            StateInner::Closed { .. } => CircuitState::Closed,
            StateInner::Open { .. } => CircuitState::Open,
            StateInner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

struct Inner {
    state: StateInner,
    /// Consecutive trips without an intervening close; drives timeout growth
    trips: u32,
}

/// Sliding-window circuit breaker for one route
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    rejected: AtomicU64,
    opened_total: AtomicU64,
    events: EventBus,
}

impl CircuitBreaker {
    /// Create a breaker for the given route name
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: StateInner::Closed {
                    window: VecDeque::new(),
                },
                trips: 0,
            }),
            rejected: AtomicU64::new(0),
            opened_total: AtomicU64::new(0),
            events,
        }
    }

    /// Name of the route this breaker governs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether a call may proceed
    ///
    /// In half-open this reserves a probe slot before the lock is released,
    /// so only `half_open_max_probes` concurrent callers ever get through.
    pub fn admit(&self) -> GatewayResult<()> {
        enum Decision {
            Allow,
            BeginProbe,
            Reject,
        }

        let mut inner = self.inner.lock();
        let decision = match &mut inner.state {
            StateInner::Closed { .. } => Decision::Allow,
            StateInner::Open { opened_at, timeout } => {
                if opened_at.elapsed() >= *timeout {
                    Decision::BeginProbe
                } else {
                    Decision::Reject
                }
            }
            StateInner::HalfOpen { probes_in_flight } => {
                if *probes_in_flight < self.config.half_open_max_probes {
                    *probes_in_flight += 1;
                    Decision::Allow
                } else {
                    Decision::Reject
                }
            }
        };

        match decision {
            Decision::Allow => Ok(()),
            Decision::BeginProbe => {
                self.transition(&mut inner, StateInner::HalfOpen { probes_in_flight: 1 });
                Ok(())
            }
            Decision::Reject => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_breaker_rejections", "route" => self.name.clone())
                    .increment(1);
                Err(GatewayError::CircuitOpen {
                    route: self.name.clone(),
                })
            }
        }
    }

    /// Record a successful call outcome
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let close = match &mut inner.state {
            StateInner::Closed { window } => {
                Self::push_outcome(window, self.config.window_size, false);
                false
            }
            // One successful probe is enough to close; the window starts
            // empty again.
            StateInner::HalfOpen { .. } => true,
            // Late result from a call admitted before the trip; the open
            // timer is authoritative.
            StateInner::Open { .. } => false,
        };

        if close {
            inner.trips = 0;
            self.transition(
                &mut inner,
                StateInner::Closed {
                    window: VecDeque::new(),
                },
            );
        }
    }

    /// Record a failed call outcome
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let trip = match &mut inner.state {
            StateInner::Closed { window } => {
                Self::push_outcome(window, self.config.window_size, true);
                let samples = window.len();
                let failures = window.iter().filter(|failed| **failed).count();
                if samples >= self.config.min_samples
                    && failures as f64 / samples as f64 >= self.config.failure_ratio
                {
                    warn!(
                        route = %self.name,
                        failures,
                        samples,
                        "failure ratio reached, opening circuit"
                    );
                    true
                } else {
                    false
                }
            }
            StateInner::HalfOpen { .. } => {
                warn!(route = %self.name, "probe failed, reopening circuit");
                true
            }
            StateInner::Open { .. } => false,
        };

        if trip {
            let timeout = self.trip_timeout(inner.trips);
            inner.trips += 1;
            self.opened_total.fetch_add(1, Ordering::Relaxed);
            self.transition(
                &mut inner,
                StateInner::Open {
                    opened_at: Instant::now(),
                    timeout,
                },
            );
        }
    }

    /// Release an admitted call that produced no outcome sample
    ///
    /// Used when a call was admitted but never reached the network (endpoint
    /// resolution failed, request deadline elapsed first). In half-open this
    /// frees the probe slot so the breaker cannot wedge with a phantom probe
    /// in flight; elsewhere it is a no-op.
    pub fn record_cancelled(&self) {
        let mut inner = self.inner.lock();
        if let StateInner::HalfOpen { probes_in_flight } = &mut inner.state {
            *probes_in_flight = probes_in_flight.saturating_sub(1);
        }
    }

    /// Current state (for introspection and tests)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state.view()
    }

    /// Calls rejected without a network attempt
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Times this breaker has opened
    pub fn opened_count(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    fn push_outcome(window: &mut VecDeque<bool>, size: usize, failed: bool) {
        window.push_back(failed);
        while window.len() > size {
            window.pop_front();
        }
    }

    fn trip_timeout(&self, trips: u32) -> Duration {
        let factor = self
            .config
            .trip_backoff_multiplier
            .max(1.0)
            .powi(trips.min(16) as i32);
        self.config
            .reset_timeout
            .mul_f64(factor)
            .min(self.config.max_reset_timeout)
    }

    fn transition(&self, inner: &mut Inner, next: StateInner) {
        let from = inner.state.view();
        let to = next.view();
        inner.state = next;
        if from != to {
            info!(route = %self.name, from = from.as_str(), to = to.as_str(), "breaker transition");
            metrics::counter!(
                "gateway_breaker_transitions",
                "route" => self.name.clone(),
                "to" => to.as_str()
            )
            .increment(1);
            self.events.publish(GatewayEvent::BreakerTransition {
                route: self.name.clone(),
                from: from.as_str(),
                to: to.as_str(),
            });
        }
    }
}

/// Registry holding one breaker per route
///
/// At most one breaker instance ever governs a given route: `get_or_create`
/// goes through the map's entry lock, so concurrent first requests for the
/// same route end up sharing a single instance.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            breakers: DashMap::new(),
            events,
        }
    }

    /// Get the breaker for a route, creating it on first use
    pub fn get_or_create(&self, route: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(route.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    route,
                    config.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    /// All breakers currently registered
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop breakers for routes no longer present after a table swap
    pub fn retain_routes(&self, live: &[String]) {
        self.breakers.retain(|route, _| live.iter().any(|l| l == route));
    }
}
