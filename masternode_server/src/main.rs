//! Masternode - CDN edge router
//!
//! This server handles:
//! - Public HTTP ingress for protected hosts
//! - Origin proxying and background caching of discovered routes
//! - Edge node selection (geo-nearest or round-robin) and bootstrap documents
//! - Periodic node pool refresh from the control plane

mod cache;
mod config;
mod geo;
mod network;
mod routes;
mod worker;

use anyhow::Context;
use cache::ContentCache;
use network::NetworkState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,masternode_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(config::Config::from_env()?);
    tracing::info!("Starting masternode on {}:{}", config.host, config.port);
    tracing::info!("Selection policy: {:?}", config.selection_policy);

    // GeoIP
    let geo = match (config.geoip_enabled, &config.geoip_database) {
        (true, Some(path)) => {
            tracing::info!("Loading GeoIP database from {}", path.display());
            geo::GeoIp::open(path)?
        }
        _ => {
            tracing::info!("GeoIP disabled, all addresses resolve to (0, 0)");
            geo::GeoIp::Disabled
        }
    };

    // Content cache
    let cache = Arc::new(ContentCache::new(config.max_cached_routes));
    for hostname in config.protected_domains.keys() {
        cache.ensure_host(hostname);
    }
    if let Some(primer) = &config.cache_primer {
        let host = cache
            .load_primer(primer)
            .with_context(|| format!("loading cache primer {}", primer.display()))?;
        tracing::info!("Primed {} with {} routes", host.hostname(), host.route_count());
    }
    tracing::info!("Protecting {} hosts", cache.host_count());

    let template = routes::bootstrap::load_template(config.bootstrap_template.as_deref())
        .context("loading bootstrap template")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Node pool
    let network = Arc::new(NetworkState::new(&config, geo)?);
    let refresh_task = match &config.static_nodes {
        Some(addresses) => {
            let count = network.load_static(addresses).await?;
            tracing::info!("Using static node pool of {} nodes", count);
            None
        }
        None => {
            tracing::info!(
                "Polling {} every {:?}",
                config.pool_state_url(),
                config.refresh_interval
            );
            Some(network::spawn_refresh(
                network.clone(),
                config.refresh_interval,
                shutdown_rx.clone(),
            ))
        }
    };

    let workers = worker::CacheWorkers::spawn(
        cache.clone(),
        config.cache_workers,
        config.cache_queue,
        config.cache_directory.clone(),
    );

    // Create app state
    let state = routes::AppState::new(config.clone(), cache, network, workers, template)?;

    let app = routes::public_router(state.clone());
    let internal_app = routes::internal_router(state);

    // Start servers
    let public_addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let internal_addr: SocketAddr = format!("{}:{}", config.host, config.internal_port).parse()?;

    tracing::info!("Public server listening on {}", public_addr);
    tracing::info!("Internal server listening on {}", internal_addr);

    let public_server = {
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let listener = tokio::net::TcpListener::bind(public_addr).await?;
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await
        }
    };

    let internal_server = {
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let listener = tokio::net::TcpListener::bind(internal_addr).await?;
            axum::serve(listener, internal_app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.changed().await.ok();
                })
                .await
        }
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, draining connections");
            shutdown_tx.send(true).ok();
        }
    });

    let (public_result, internal_result) = tokio::join!(public_server, internal_server);
    if let Err(e) = public_result {
        tracing::error!("Public server error: {}", e);
    }
    if let Err(e) = internal_result {
        tracing::error!("Internal server error: {}", e);
    }

    if let Some(task) = refresh_task {
        task.await.ok();
    }
    tracing::info!("Masternode stopped");

    Ok(())
}
