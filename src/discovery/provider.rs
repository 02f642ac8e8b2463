//! # Discovery Provider Contract
//!
//! The registry polls a `DiscoveryProvider` for the endpoint set of each
//! logical service. The underlying mechanism (DNS, platform registry, static
//! list) is the provider's business; the gateway only depends on this
//! polling contract.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Endpoint;

/// Source of endpoint sets for logical service names
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// List the current ordered endpoint set for a service
    ///
    /// Fails with `DiscoveryUnavailable` when the backing mechanism cannot
    /// be queried. Callers treat that as "keep what you had", not "the
    /// service is gone".
    async fn list(&self, service: &str) -> GatewayResult<Vec<Endpoint>>;

    /// Poll interval suggested by the provider, when it has one
    ///
    /// The gateway-side configured interval wins when this returns `None`.
    fn suggested_poll_interval(&self) -> Option<Duration> {
        None
    }
}

/// Config-backed provider with a fixed service-to-endpoints map
///
/// Useful for tests and deployments where topology is managed externally.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, Vec<Endpoint>>,
}

impl StaticDiscovery {
    /// Build from a service-name → endpoint-list map
    pub fn new(services: HashMap<String, Vec<Endpoint>>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl DiscoveryProvider for StaticDiscovery {
    async fn list(&self, service: &str) -> GatewayResult<Vec<Endpoint>> {
        self.services.get(service).cloned().ok_or_else(|| {
            GatewayError::discovery(service, "service not present in static service map")
        })
    }
}
