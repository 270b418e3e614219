//! Internal health and state endpoints

use crate::routes::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use std::net::IpAddr;

/// Build the internal router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/_internal/state", get(direct_state))
        .route("/_internal/closest/{ip}", get(closest_node))
        .route("/_internal/content/{host}/{id}", get(content_route))
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.network.snapshot().await;
    let nodes = snapshot.as_ref().map(|s| s.nodes().len()).unwrap_or(0);
    let snapshot_age = snapshot.map(|s| (Utc::now() - s.built_at()).num_seconds());

    let status = if nodes > 0 { "healthy" } else { "degraded" };

    Json(serde_json::json!({
        "status": status,
        "hosts": state.cache.host_count(),
        "nodes": nodes,
        "snapshot_age_secs": snapshot_age,
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "caching": state.workers.stats(),
    }))
}

/// Edge node addresses and every host's path to hash map
async fn direct_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "nodes": state.network.node_addresses().await,
        "assets": state.cache.asset_map(),
    }))
}

/// Geographically nearest node to an address, with its distance
async fn closest_node(State(state): State<AppState>, Path(ip): Path<IpAddr>) -> Response {
    let node = match state.network.get_closest_node(ip).await {
        Ok(node) => node,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };
    let distance_km = state
        .network
        .geo()
        .resolve(ip)
        .ok()
        .map(|location| location.distance_km(&node.coordinate));

    Json(serde_json::json!({
        "id": node.id,
        "address": node.address().to_string(),
        "edge_host": node.edge_host(state.config.pool_domain.as_deref(), &state.config.cdn_subdomain),
        "distance_km": distance_km,
    }))
    .into_response()
}

/// Map a content identifier from a node inventory back to its route
async fn content_route(
    State(state): State<AppState>,
    Path((host, id)): Path<(String, String)>,
) -> Response {
    match state.cache.lookup_route_by_content_id(&host, &id) {
        Some(route) => Json(serde_json::json!({
            "path": route.path,
            "hash": route.hash,
            "no_cache": route.no_cache,
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "Unknown content").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{ContentCache, Route};
    use crate::config::Config;
    use crate::geo::GeoIp;
    use crate::network::{NetworkNode, NetworkState};
    use crate::routes::{internal_router, AppState};
    use crate::worker::CacheWorkers;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app_state() -> AppState {
        let config = Arc::new(Config::default());
        let cache = Arc::new(ContentCache::new(16));
        cache.ensure_host("demo.example.com");
        cache
            .add_route("demo.example.com", Route::new("/docs/index.html", false, "ABC"))
            .unwrap();

        let network = Arc::new(NetworkState::new(&config, GeoIp::Disabled).unwrap());
        network
            .install(vec![NetworkNode::new("a", "10.0.0.1".parse().unwrap(), 8080)])
            .await;

        let workers = CacheWorkers::spawn(cache.clone(), 1, 4, None);
        AppState::new(config, cache, network, workers, String::new()).unwrap()
    }

    async fn get(state: AppState, uri: &str) -> axum::response::Response {
        internal_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn get_json(state: AppState, uri: &str) -> serde_json::Value {
        let response = get(state, uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let health = get_json(app_state().await, "/health").await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["hosts"], 1);
        assert_eq!(health["nodes"], 1);
        assert_eq!(health["caching"]["cached"], 0);
    }

    #[tokio::test]
    async fn test_direct_state() {
        let state = get_json(app_state().await, "/_internal/state").await;
        assert_eq!(state["nodes"], serde_json::json!(["10.0.0.1:8080"]));
        assert_eq!(state["assets"]["demo.example.com"]["/docs/"], "abc");
    }

    #[tokio::test]
    async fn test_closest_node() {
        let closest = get_json(app_state().await, "/_internal/closest/203.0.113.5").await;
        assert_eq!(closest["id"], "a");
        assert_eq!(closest["address"], "10.0.0.1:8080");
        assert_eq!(closest["distance_km"], 0.0);

        let response = get(app_state().await, "/_internal/closest/not-an-ip").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_content_route() {
        let route = get_json(app_state().await, "/_internal/content/demo.example.com/ABC").await;
        assert_eq!(route["path"], "/docs/");
        assert_eq!(route["no_cache"], false);

        let response = get(app_state().await, "/_internal/content/demo.example.com/ffff").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
