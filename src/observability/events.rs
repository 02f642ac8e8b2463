//! Structured gateway events
//!
//! The core emits events at every decision point (route match, breaker
//! transition, retry attempt, rate-limit rejection, snapshot refresh) on a
//! broadcast channel. External telemetry sinks subscribe; rendering them is
//! out of scope here.

use std::time::Duration;
use tokio::sync::broadcast;

/// Events emitted during request processing and background maintenance
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A request matched a route definition
    RouteMatched {
        request_id: String,
        route: String,
        service: String,
        rewritten_path: String,
    },

    /// A request was rejected by the rate limiter
    RateLimitRejected {
        route: String,
        key: String,
        retry_after: Duration,
    },

    /// A circuit breaker changed state
    BreakerTransition {
        route: String,
        from: &'static str,
        to: &'static str,
    },

    /// A retry attempt is about to be scheduled
    RetryScheduled {
        request_id: String,
        route: String,
        attempt: u32,
        delay: Duration,
    },

    /// A discovery refresh published a new snapshot
    SnapshotPublished {
        service: String,
        generation: u64,
        endpoints: usize,
    },

    /// A snapshot is being served past its refresh interval
    SnapshotStale { service: String, age: Duration },

    /// The route table was atomically replaced
    RouteTableSwapped { routes: usize },
}

/// Broadcast-based event bus
///
/// Cloning is cheap (one `Sender` clone); publishing never blocks and is a
/// no-op when nobody subscribes.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: GatewayEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
