use std::sync::Arc;

use anyhow::{Context, Result};
use devicelink::LinkPool;
use iot_gateway::cache::{DeviceConnectionCache, EvictionReason};
use iot_gateway::config::GatewayConfig;
use iot_gateway::gateway::Gateway;
use iot_gateway::http::{self, AppState};
use iot_gateway::link_factory::{LinkFactory, unhandled_method_handler};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        relay = %config.link.relay_url,
        max_pool_size = config.link.max_pool_size,
        direct_methods = config.link.methods_enabled,
        "Starting IoT gateway"
    );

    let mut pool = LinkPool::new(config.link.clone());
    if config.link.methods_enabled {
        pool = pool.with_method_handler(unhandled_method_handler());
    }
    let factory = LinkFactory::new(pool, config.access_policy.clone());

    let cache = DeviceConnectionCache::new(factory, config.cache_settings());
    spawn_eviction_logger(&cache);

    let state = AppState {
        gateway: Arc::new(Gateway::new(cache.clone())),
        shared_access_enabled: config.shared_access_enabled,
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    http::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    })
    .await
    .context("HTTP server failed")?;

    let closed = cache.shutdown().await;
    info!(closed, "Device connections closed");

    Ok(())
}

fn spawn_eviction_logger(cache: &DeviceConnectionCache<LinkFactory>) {
    let mut evictions = cache.subscribe_evictions();
    let registry = Arc::clone(cache.registry());

    tokio::spawn(async move {
        loop {
            match evictions.recv().await {
                Ok(event) if event.reason == EvictionReason::CreationFailed => {
                    warn!(device_id = %event.device_id, "Device connection attempt discarded");
                }
                Ok(event) => {
                    info!(
                        device_id = %event.device_id,
                        reason = %event.reason,
                        registered = registry.len(),
                        "Device connection removed"
                    );
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Eviction log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
