//! # Edge Gateway - Routing and Resilience Core
//!
//! A resilience-aware request-routing core for an API gateway fronting
//! independently scaled backend services whose network locations change over
//! time. For every inbound request the gateway resolves a logical service
//! name to a currently-known endpoint, forwards the request, and applies the
//! route's fault-tolerance policy, without the caller or the backend knowing
//! anything about instance topology.
//!
//! ## Request flow
//!
//! ```text
//! inbound request
//!   → Router (declared-order first match, path rewrite)
//!   → RateLimiter (token bucket per resolved key)
//!   → CircuitBreaker (per-route sliding-window state machine)
//!   → LoadBalancer (endpoint from the registry's current snapshot)
//!   → RetryExecutor (bounded, backoffed, jittered attempts)
//!   → response, or the route's fallback
//! ```
//!
//! All state is in memory and rebuilt on restart: endpoint snapshots are
//! re-polled, breakers start closed, and buckets start full.

/// Core functionality: error types, configuration, shared data structures
pub mod core;

/// Service discovery: the provider contract and the snapshot registry
pub mod discovery;

/// The request pipeline, upstream connector, and HTTP server boundary
pub mod gateway;

/// Endpoint selection policies
pub mod load_balancing;

/// Structured events and logging setup
pub mod observability;

/// Circuit breaking, retries, and rate limiting
pub mod resilience;

/// Route definitions and the first-match router
pub mod routing;

// Re-export the types most users need directly from the crate root.

pub use crate::core::config::{ConfigWatcher, GatewayConfig};
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::types::{
    Endpoint, GatewayResponse, HealthStatus, IncomingRequest, ServiceSnapshot,
};
pub use crate::discovery::{DiscoveryProvider, EndpointRegistry, StaticDiscovery};
pub use crate::gateway::{GatewayPipeline, GatewayServer, HttpConnector, ServerConfig};
pub use crate::load_balancing::{LoadBalancer, LoadBalancingPolicy};
pub use crate::observability::{EventBus, GatewayEvent};
pub use crate::routing::{RouteDefinition, RouteTable, SharedRouteTable};
