//! # Edge Gateway - Main Entry Point
//!
//! Startup sequence:
//! 1. load and validate configuration
//! 2. initialize structured logging
//! 3. build the discovery registry and eagerly refresh every routed service
//! 4. compile the route table and assemble the pipeline
//! 5. spawn background tasks (discovery pollers, bucket sweeper, staleness
//!    watchdog, config reload)
//! 6. serve until SIGINT/SIGTERM, then drain background tasks

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use edge_gateway::core::config::ConfigWatcher;
use edge_gateway::discovery::{EndpointRegistry, StaticDiscovery};
use edge_gateway::gateway::server::spawn_staleness_watchdog;
use edge_gateway::load_balancing::balancer_for;
use edge_gateway::observability::{logging, EventBus};
use edge_gateway::routing::{RouteTable, SharedRouteTable};
use edge_gateway::{GatewayConfig, GatewayPipeline, GatewayServer, HttpConnector, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());

    let config = GatewayConfig::load_from_file(&config_path)
        .await
        .with_context(|| format!("loading configuration from {config_path}"))?;

    logging::init(config.server.json_logs);
    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path, "starting edge gateway");

    let events = EventBus::default();

    // Discovery: watch every routed service and do one eager refresh so the
    // first requests are served from a warm snapshot.
    let provider = Arc::new(StaticDiscovery::new(config.discovery.static_services.clone()));
    let registry = Arc::new(EndpointRegistry::new(
        provider,
        config.registry_config(),
        events.clone(),
    ));
    for route in &config.routes {
        registry.watch(&route.service);
    }
    registry.refresh_all().await;

    let table = RouteTable::compile(&config.routes).context("compiling route table")?;
    info!(routes = table.len(), "route table compiled");
    let routes = Arc::new(SharedRouteTable::new(table, events.clone()));

    let pipeline = Arc::new(GatewayPipeline::new(
        Arc::clone(&routes),
        Arc::clone(&registry),
        balancer_for(config.load_balancing),
        Arc::new(HttpConnector::new()?),
        events.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = registry.spawn_pollers(shutdown.clone());
    tasks.push(pipeline.spawn_bucket_sweeper(config.server.bucket_sweep_interval, shutdown.clone()));
    tasks.push(spawn_staleness_watchdog(Arc::clone(&pipeline), shutdown.clone()));

    // Hot reload: a validated config change swaps the route table atomically;
    // requests already in flight keep the table they started with. Listener
    // settings require a restart.
    let config_watcher = ConfigWatcher::spawn(PathBuf::from(&config_path), shutdown.clone())?;
    tasks.push(spawn_reload_task(
        config_watcher.subscribe(),
        Arc::clone(&routes),
        Arc::clone(&pipeline),
        shutdown.clone(),
    ));

    let server = GatewayServer::new(
        Arc::clone(&pipeline),
        ServerConfig {
            bind_addr: config.bind_addr()?,
        },
    );

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining");
        signal_shutdown.cancel();
    });

    server.serve(shutdown.clone()).await?;

    shutdown.cancel();
    futures::future::join_all(tasks).await;
    info!("edge gateway shutdown complete");
    Ok(())
}

/// Apply validated configuration reloads to the running gateway
fn spawn_reload_task(
    mut reloads: broadcast::Receiver<Arc<GatewayConfig>>,
    routes: Arc<SharedRouteTable>,
    pipeline: Arc<GatewayPipeline>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                reload = reloads.recv() => match reload {
                    Ok(config) => match RouteTable::compile(&config.routes) {
                        Ok(table) => {
                            for route in &config.routes {
                                pipeline.registry().watch(&route.service);
                            }
                            routes.swap(table);
                            pipeline.prune_stale_routes();
                        }
                        Err(err) => {
                            warn!(error = %err, "reloaded route table rejected");
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "config reload receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
