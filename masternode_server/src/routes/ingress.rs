//! Public ingress handler - decides between origin proxy and edge redirect

use crate::cache::normalize_path;
use crate::routes::{bootstrap, origin, AppState};
use crate::worker::CacheJob;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Method, Request, Response, StatusCode},
    response::IntoResponse,
};
use axum_extra::extract::Host;
use masternode_common::constants;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// Handle an incoming public HTTP request
pub async fn handle_ingress(
    State(state): State<AppState>,
    Host(host): Host,
    request: Request<Body>,
) -> Response<Body> {
    let hostname = strip_port(&host).to_ascii_lowercase();

    let protected = match state.cache.lookup_host(&hostname) {
        Some(h) => h,
        None => return (StatusCode::BAD_REQUEST, "Unsupported host").into_response(),
    };

    let path = request.uri().path().to_string();
    let route_key = match normalize_path(&path) {
        Ok(key) => key,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    tracing::debug!("Ingress request for {}{} (route {})", hostname, path, route_key);

    if path == constants::SERVICE_WORKER_ROUTE {
        if let Some(script) = &state.config.service_worker_path {
            return serve_service_worker(script).await;
        }
    }

    // Routes are keyed by path alone, so query-dependent responses bypass the cache
    if request.uri().query().is_some() {
        return proxy(&state, &hostname, request).await;
    }

    let route = match protected.lookup_route(&path) {
        Some(route) => route,
        None => return proxy_and_cache(&state, &hostname, &path, request).await,
    };

    if !route.is_cacheable() {
        return proxy(&state, &hostname, request).await;
    }

    let client_ip = match client_ip(&request, &state.config.trusted_proxies) {
        Some(ip) => ip,
        None => {
            tracing::debug!("No client address for {}{}, proxying", hostname, path);
            return proxy(&state, &hostname, request).await;
        }
    };

    match state
        .network
        .select_serving_node(client_ip, route.content_id())
        .await
    {
        Ok(node) => {
            let edge_host = node.edge_host(
                state.config.pool_domain.as_deref(),
                &state.config.cdn_subdomain,
            );
            tracing::debug!("Redirecting {} to {} for {}{}", client_ip, node, hostname, route.path);

            let page = bootstrap::render(&state.template, &edge_host, &route.hash, &route.path);
            ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], page).into_response()
        }
        Err(e) => {
            tracing::debug!("Edge selection failed for {}{}: {}, proxying", hostname, path, e);
            proxy(&state, &hostname, request).await
        }
    }
}

/// Proxy a request to the host's origin
async fn proxy(state: &AppState, hostname: &str, request: Request<Body>) -> Response<Body> {
    match forward(state, hostname, request).await {
        Ok(response) => response.into_response(),
        Err(response) => response,
    }
}

/// Proxy an unknown route and queue its body for caching
async fn proxy_and_cache(
    state: &AppState,
    hostname: &str,
    path: &str,
    request: Request<Body>,
) -> Response<Body> {
    let cacheable = request.method() == Method::GET;

    let response = match forward(state, hostname, request).await {
        Ok(response) => response,
        Err(response) => return response,
    };

    if cacheable && response.status.is_success() {
        state.workers.enqueue(CacheJob {
            host: hostname.to_string(),
            path: path.to_string(),
            body: response.body.clone(),
        });
    }

    response.into_response()
}

async fn forward(
    state: &AppState,
    hostname: &str,
    request: Request<Body>,
) -> Result<origin::OriginResponse, Response<Body>> {
    let origin_url = state.config.origin_for(hostname);

    origin::forward(&state.http_client, origin_url, hostname, request)
        .await
        .map_err(|e| {
            tracing::error!("Origin request for {} failed: {}", hostname, e);
            (e.status(), e.to_string()).into_response()
        })
}

async fn serve_service_worker(script: &Path) -> Response<Body> {
    match tokio::fs::read(script).await {
        Ok(body) => ([(header::CONTENT_TYPE, "application/javascript")], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to read service worker {}: {}", script.display(), e);
            (StatusCode::NOT_FOUND, "Service worker unavailable").into_response()
        }
    }
}

/// Client address: the peer address, or the first X-Forwarded-For entry
/// when the peer is a trusted proxy
fn client_ip(request: &Request<Body>, trusted_proxies: &[IpAddr]) -> Option<IpAddr> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())?;

    if !trusted_proxies.contains(&peer) {
        return Some(peer);
    }

    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());

    Some(forwarded.unwrap_or(peer))
}

/// Drop the port from a host header value
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}
