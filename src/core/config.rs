//! # Configuration Module
//!
//! Configuration management for the gateway core.
//!
//! ## Key Features
//! - YAML configuration parsing with serde
//! - Environment variable override support
//! - Validation with detailed error messages, run before anything is swapped
//!   into the live gateway
//! - Hot reloading via a file system watcher: each change re-parses the
//!   whole file and, only if it validates, broadcasts a complete new config.
//!   The route table built from it replaces the old one in a single atomic
//!   swap, so a reload is all-or-nothing.

use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Endpoint;
use crate::discovery::RegistryConfig;
use crate::load_balancing::LoadBalancingPolicy;
use crate::routing::{RouteDefinition, RouteTable};

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Discovery polling and the static service map
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Route table, matched in declared order
    pub routes: Vec<RouteDefinition>,

    /// Endpoint selection policy
    #[serde(default)]
    pub load_balancing: LoadBalancingPolicy,
}

/// Listener and process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Emit JSON logs instead of human-readable ones
    #[serde(default)]
    pub json_logs: bool,

    /// Interval of the idle rate-limit bucket sweep
    #[serde(with = "humantime_serde", default = "default_bucket_sweep_interval")]
    pub bucket_sweep_interval: Duration,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_bucket_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            json_logs: false,
            bucket_sweep_interval: default_bucket_sweep_interval(),
        }
    }
}

/// Discovery-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Fraction of the poll interval used as random jitter
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter: f64,

    /// Service map for the static discovery provider
    #[serde(default)]
    pub static_services: HashMap<String, Vec<Endpoint>>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_jitter() -> f64 {
    0.1
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            poll_jitter: default_poll_jitter(),
            static_services: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file, with environment overrides
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| {
                GatewayError::config(format!(
                    "failed to read config file {}: {e}",
                    path.as_ref().display()
                ))
            })?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::config(format!("failed to parse config: {e}")))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        let config: GatewayConfig = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEWAY_*` environment variable overrides
    ///
    /// Pattern: `GATEWAY_<SECTION>_<FIELD>`, e.g. `GATEWAY_SERVER_PORT=9090`.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(addr) = env::var("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Ok(port) = env::var("GATEWAY_SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("invalid GATEWAY_SERVER_PORT: {e}")))?;
        }
        if let Ok(interval) = env::var("GATEWAY_DISCOVERY_POLL_INTERVAL") {
            self.discovery.poll_interval = humantime::parse_duration(&interval).map_err(|e| {
                GatewayError::config(format!("invalid GATEWAY_DISCOVERY_POLL_INTERVAL: {e}"))
            })?;
        }
        Ok(())
    }

    /// Validate the whole configuration
    ///
    /// Compiles the route table (which validates predicates, rewrite
    /// templates, methods and id uniqueness) and checks the cross-cutting
    /// invariants the per-route compilation cannot see.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.routes.is_empty() {
            return Err(GatewayError::config("at least one route is required"));
        }

        RouteTable::compile(&self.routes)?;

        if !(0.0..=1.0).contains(&self.discovery.poll_jitter) {
            return Err(GatewayError::config(format!(
                "discovery.poll_jitter must be within [0, 1], got {}",
                self.discovery.poll_jitter
            )));
        }

        for route in &self.routes {
            if let Some(limit) = &route.rate_limit {
                if limit.capacity == 0 {
                    return Err(GatewayError::config(format!(
                        "route {}: rate limit capacity must be positive",
                        route.id
                    )));
                }
                if limit.refill_per_second <= 0.0 {
                    return Err(GatewayError::config(format!(
                        "route {}: rate limit refill rate must be positive",
                        route.id
                    )));
                }
            }
            if !self.discovery.static_services.is_empty()
                && !self.discovery.static_services.contains_key(&route.service)
            {
                return Err(GatewayError::config(format!(
                    "route {} targets unknown service {}",
                    route.id, route.service
                )));
            }
        }
        Ok(())
    }

    /// Registry-facing view of the discovery settings
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            poll_interval: self.discovery.poll_interval,
            poll_jitter: self.discovery.poll_jitter,
        }
    }

    /// Resolved listener address
    pub fn bind_addr(&self) -> GatewayResult<SocketAddr> {
        format!("{}:{}", self.server.bind_address, self.server.port)
            .parse()
            .map_err(|e| GatewayError::config(format!("invalid bind address: {e}")))
    }
}

/// Watches the config file and broadcasts validated reloads
///
/// A change that fails to parse or validate is logged and dropped; the
/// running gateway keeps its current configuration.
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
    sender: broadcast::Sender<Arc<GatewayConfig>>,
}

impl ConfigWatcher {
    /// Start watching `path`; reload processing stops when `shutdown` fires
    pub fn spawn(path: PathBuf, shutdown: CancellationToken) -> GatewayResult<Self> {
        let (change_tx, mut change_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = change_tx.send(());
                }
            }
        })
        .map_err(|e| GatewayError::config(format!("failed to create config watcher: {e}")))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("failed to watch {}: {e}", path.display())))?;

        let (sender, _) = broadcast::channel(8);
        let broadcast_tx = sender.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = change_rx.recv() => {
                        if changed.is_none() {
                            break;
                        }
                        // Editors fire bursts of events per save; settle, then
                        // drain the backlog and reload once.
                        tokio::time::sleep(Duration::from_millis(250)).await;
                        while change_rx.try_recv().is_ok() {}

                        match GatewayConfig::load_from_file(&path).await {
                            Ok(config) => {
                                info!(path = %path.display(), routes = config.routes.len(), "configuration reloaded");
                                let _ = broadcast_tx.send(Arc::new(config));
                            }
                            Err(err) => {
                                warn!(path = %path.display(), error = %err, "config reload rejected, keeping current configuration");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            sender,
        })
    }

    /// Subscribe to validated configuration reloads
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GatewayConfig>> {
        self.sender.subscribe()
    }
}
