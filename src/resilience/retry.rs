//! # Retry Executor
//!
//! Re-issues failed dispatch attempts with bounded, backoffed, jittered
//! delay. Only methods in the configured retryable set are ever retried;
//! the default set is read-only methods, since the gateway cannot guarantee
//! exactly-once semantics for writes across attempts.
//!
//! Within one request the attempts are strictly sequential. The backoff
//! sleep suspends only the retrying task, and a request deadline cuts the
//! sequence short: no attempt or sleep is ever scheduled past it.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::GatewayResponse;
use crate::observability::{EventBus, GatewayEvent};

/// Retry behavior for one route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,

    /// Exponential growth factor per further attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound for a single backoff delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Multiplicative jitter: delay scales uniformly in `[1-f, 1+f]`
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Methods eligible for retry; everything else gets exactly one attempt
    #[serde(default = "default_retryable_methods")]
    pub retryable_methods: Vec<String>,

    /// Upstream status codes treated as retryable failures
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_jitter_fraction() -> f64 {
    0.2
}
fn default_retryable_methods() -> Vec<String> {
    vec!["GET".into(), "HEAD".into(), "OPTIONS".into()]
}
fn default_retryable_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            jitter_fraction: default_jitter_fraction(),
            retryable_methods: default_retryable_methods(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

impl RetryPolicy {
    /// Whether the method is whitelisted for retry
    pub fn method_is_retryable(&self, method: &Method) -> bool {
        self.retryable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Whether a response status counts as a retryable failure
    pub fn status_is_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Backoff delay after `completed_attempts` attempts, before jitter
    pub fn delay_for(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1).min(32);
        let raw = self.base_delay.mul_f64(self.multiplier.powi(exponent as i32));
        raw.min(self.max_delay)
    }

    fn jittered_delay(&self, completed_attempts: u32) -> Duration {
        let base = self.delay_for(completed_attempts);
        let fraction = self.jitter_fraction.clamp(0.0, 1.0);
        // Uniform in [1 - fraction, 1 + fraction].
        let factor = 1.0 + fraction * (2.0 * fastrand::f64() - 1.0);
        base.mul_f64(factor.max(0.0))
    }
}

/// Drives a request's attempt sequence against one attempt closure
///
/// The closure performs one full dispatch (breaker check, endpoint
/// selection, call); it is invoked with the 1-based attempt number.
pub struct RetryExecutor {
    events: EventBus,
}

impl RetryExecutor {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Execute up to `policy.max_attempts` attempts within the deadline
    ///
    /// Terminal outcomes:
    /// - first non-retryable result (response or error) is returned as-is
    /// - a retryable error on the last permitted attempt becomes
    ///   `RetriesExhausted`, carrying that error
    /// - a deadline that cannot accommodate the next attempt or backoff
    ///   sleep yields `DeadlineExceeded` immediately
    pub async fn execute<F, Fut>(
        &self,
        policy: &RetryPolicy,
        request_id: &str,
        route: &str,
        method: &Method,
        deadline: Instant,
        mut attempt: F,
    ) -> GatewayResult<GatewayResponse>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GatewayResult<GatewayResponse>>,
    {
        let retryable_method = policy.method_is_retryable(method);
        let max_attempts = if retryable_method {
            policy.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt_number = 0u32;
        loop {
            if Instant::now() >= deadline {
                return Err(GatewayError::DeadlineExceeded);
            }
            attempt_number += 1;

            match attempt(attempt_number).await {
                Ok(response) => {
                    let retry_status = attempt_number < max_attempts
                        && policy.status_is_retryable(response.status.as_u16());
                    if !retry_status {
                        return Ok(response);
                    }
                    debug!(
                        request_id,
                        route,
                        attempt = attempt_number,
                        status = response.status.as_u16(),
                        "retryable status, scheduling retry"
                    );
                }
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    if attempt_number >= max_attempts {
                        if retryable_method && max_attempts > 1 {
                            return Err(GatewayError::RetriesExhausted {
                                attempts: attempt_number,
                                last: Box::new(err),
                            });
                        }
                        return Err(err);
                    }
                    debug!(
                        request_id,
                        route,
                        attempt = attempt_number,
                        error = %err,
                        "attempt failed, scheduling retry"
                    );
                }
            }

            let delay = policy.jittered_delay(attempt_number);
            if Instant::now() + delay >= deadline {
                // Sleeping would outlive the request; stop here.
                return Err(GatewayError::DeadlineExceeded);
            }
            metrics::counter!("gateway_retries", "route" => route.to_string()).increment(1);
            self.events.publish(GatewayEvent::RetryScheduled {
                request_id: request_id.to_string(),
                route: route.to_string(),
                attempt: attempt_number + 1,
                delay,
            });
            tokio::time::sleep(delay).await;
        }
    }
}
