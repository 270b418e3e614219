//! Route handlers for the masternode

pub mod bootstrap;
pub mod ingress;
pub mod internal;
pub mod origin;

use crate::{cache::ContentCache, config::Config, network::NetworkState, worker::CacheWorkers};
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<ContentCache>,
    pub network: Arc<NetworkState>,
    pub workers: CacheWorkers,
    /// Origin client; redirects are passed through, not followed
    pub http_client: reqwest::Client,
    /// Bootstrap document template
    pub template: Arc<String>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<ContentCache>,
        network: Arc<NetworkState>,
        workers: CacheWorkers,
        template: String,
    ) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(config.origin_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            config,
            cache,
            network,
            workers,
            http_client,
            template: Arc::new(template),
            started_at: Utc::now(),
        })
    }
}

/// Client-facing router: every request goes through the ingress decision
pub fn public_router(state: AppState) -> Router {
    Router::new()
        .fallback(ingress::handle_ingress)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health and state queries on the internal port
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .merge(internal::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
