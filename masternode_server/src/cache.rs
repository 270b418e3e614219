//! Content cache: protected hosts, their routes and content hashes
//!
//! Every map here is a `DashMap`, so request handlers and the background
//! caching workers read and write without any outside lock. Routes are
//! immutable once built; recaching a path installs a fresh `Route`.

use dashmap::DashMap;
use masternode_common::{CachePrimer, FormatError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Route limit of {limit} reached for {host}")]
    RouteLimit { host: String, limit: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum PrimerError {
    #[error("Failed to read primer file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid primer file: {0}")]
    Format(#[from] FormatError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Request path must start with '/'")]
    NotAbsolute,

    #[error("Invalid percent escape in request path")]
    BadEscape,
}

/// A path or asset under a protected host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: String,
    /// Always proxy this route, never redirect to an edge node
    pub no_cache: bool,
    /// Lowercase hex SHA-256 of the last cached body
    pub hash: String,
}

impl Route {
    pub fn new(path: impl Into<String>, no_cache: bool, hash: impl Into<String>) -> Self {
        Self {
            path: route_key(&path.into()),
            no_cache,
            hash: hash.into().to_ascii_lowercase(),
        }
    }

    /// Build a cacheable route from the body served at `path`
    pub fn from_content(path: &str, content: &[u8]) -> Self {
        Self::new(path, false, content_hash(content))
    }

    /// Content identifier edge nodes report in their inventory
    pub fn content_id(&self) -> &str {
        &self.hash
    }

    /// Whether a request for this route may be answered with a redirect
    pub fn is_cacheable(&self) -> bool {
        !self.no_cache && !self.hash.is_empty()
    }
}

/// A hostname this masternode fronts
#[derive(Debug)]
pub struct ProtectedHost {
    hostname: String,
    routes: DashMap<String, Arc<Route>>,
    by_content: DashMap<String, Arc<Route>>,
}

impl ProtectedHost {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into().to_ascii_lowercase(),
            routes: DashMap::new(),
            by_content: DashMap::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Install a route, replacing any previous route at the same path
    pub fn add_route(&self, route: Route) -> Arc<Route> {
        let route = Arc::new(route);

        if let Some(previous) = self.routes.insert(route.path.clone(), route.clone()) {
            if previous.hash != route.hash {
                self.by_content
                    .remove_if(&previous.hash, |_, r| r.path == previous.path);
            }
        }
        if !route.hash.is_empty() {
            self.by_content.insert(route.hash.clone(), route.clone());
        }

        route
    }

    pub fn lookup_route(&self, path: &str) -> Option<Arc<Route>> {
        self.routes.get(&route_key(path)).map(|r| r.value().clone())
    }

    /// Reverse lookup from an edge node inventory entry
    pub fn lookup_route_by_content_id(&self, id: &str) -> Option<Arc<Route>> {
        self.by_content
            .get(&id.to_ascii_lowercase())
            .map(|r| r.value().clone())
    }

    /// Hash `content` and install it as the cached route for `path`
    pub fn cache_route(&self, path: &str, content: &[u8]) -> Arc<Route> {
        self.add_route(Route::from_content(path, content))
    }

    /// Path to hash snapshot
    pub fn asset_map(&self) -> HashMap<String, String> {
        self.routes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().hash.clone()))
            .collect()
    }
}

/// Hostname to protected host mapping
#[derive(Debug)]
pub struct ContentCache {
    hosts: DashMap<String, Arc<ProtectedHost>>,
    max_routes_per_host: usize,
}

impl ContentCache {
    pub fn new(max_routes_per_host: usize) -> Self {
        Self {
            hosts: DashMap::new(),
            max_routes_per_host,
        }
    }

    pub fn lookup_host(&self, hostname: &str) -> Option<Arc<ProtectedHost>> {
        self.hosts
            .get(&hostname.to_ascii_lowercase())
            .map(|h| h.value().clone())
    }

    /// Insert or overwrite a host by name
    pub fn add_host(&self, host: ProtectedHost) -> Arc<ProtectedHost> {
        let host = Arc::new(host);
        self.hosts.insert(host.hostname.clone(), host.clone());
        host
    }

    /// Get an existing host or register an empty one
    pub fn ensure_host(&self, hostname: &str) -> Arc<ProtectedHost> {
        self.hosts
            .entry(hostname.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(ProtectedHost::new(hostname)))
            .value()
            .clone()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn lookup_route(&self, hostname: &str, path: &str) -> Option<Arc<Route>> {
        self.lookup_host(hostname)?.lookup_route(path)
    }

    pub fn add_route(&self, hostname: &str, route: Route) -> Result<Arc<Route>, CacheError> {
        let host = self
            .lookup_host(hostname)
            .ok_or_else(|| CacheError::UnknownHost(hostname.to_string()))?;
        Ok(host.add_route(route))
    }

    pub fn lookup_route_by_content_id(&self, hostname: &str, id: &str) -> Option<Arc<Route>> {
        self.lookup_host(hostname)?.lookup_route_by_content_id(id)
    }

    /// Hash `content` (SHA-256) and install it as a cacheable route
    ///
    /// Replacing a known path always succeeds; new paths are refused once the
    /// host holds `max_routes_per_host` routes.
    pub fn cache_route(
        &self,
        hostname: &str,
        path: &str,
        content: &[u8],
    ) -> Result<Arc<Route>, CacheError> {
        let host = self
            .lookup_host(hostname)
            .ok_or_else(|| CacheError::UnknownHost(hostname.to_string()))?;

        if host.lookup_route(path).is_none() && host.route_count() >= self.max_routes_per_host {
            return Err(CacheError::RouteLimit {
                host: host.hostname.clone(),
                limit: self.max_routes_per_host,
            });
        }

        Ok(host.cache_route(path, content))
    }

    /// Install the host and routes described by a primer document
    pub fn apply_primer(&self, primer: &CachePrimer) -> Arc<ProtectedHost> {
        let host = self.ensure_host(&primer.hostname);
        for route in &primer.routes {
            host.add_route(Route::new(route.path.as_str(), false, route.hash.as_str()));
        }
        host
    }

    /// Load a primer file from disk
    pub fn load_primer(&self, path: &Path) -> Result<Arc<ProtectedHost>, PrimerError> {
        let content = std::fs::read_to_string(path)?;
        let primer = CachePrimer::from_json(&content)?;
        Ok(self.apply_primer(&primer))
    }

    /// Per-host path to hash snapshot
    pub fn asset_map(&self) -> HashMap<String, HashMap<String, String>> {
        self.hosts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().asset_map()))
            .collect()
    }
}

/// Lowercase hex SHA-256
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Cache key for a path: a trailing "index.html" is dropped, then ".html"
pub fn route_key(path: &str) -> String {
    if let Some(prefix) = path.strip_suffix("index.html") {
        return prefix.to_string();
    }
    if let Some(prefix) = path.strip_suffix(".html") {
        return prefix.to_string();
    }
    path.to_string()
}

/// Validate a request path and turn it into its cache key
pub fn normalize_path(path: &str) -> Result<String, PathError> {
    if !path.starts_with('/') {
        return Err(PathError::NotAbsolute);
    }

    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escape = bytes.get(i + 1..i + 3).ok_or(PathError::BadEscape)?;
            if !escape.iter().all(u8::is_ascii_hexdigit) {
                return Err(PathError::BadEscape);
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    Ok(route_key(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use masternode_common::PrimerRoute;

    fn cache_with_host(host: &str) -> ContentCache {
        let cache = ContentCache::new(16);
        cache.add_host(ProtectedHost::new(host));
        cache
    }

    #[test]
    fn test_cache_route_hashes_content() {
        let cache = cache_with_host("demo.example.com");
        cache
            .add_route("demo.example.com", Route::new("/other", false, "feed"))
            .unwrap();

        let route = cache
            .cache_route("demo.example.com", "/products", b"hello world")
            .unwrap();
        assert_eq!(
            route.hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(route.is_cacheable());

        let found = cache.lookup_route("demo.example.com", "/products").unwrap();
        assert_eq!(found.hash, route.hash);

        let other = cache.lookup_route("demo.example.com", "/other").unwrap();
        assert_eq!(other.hash, "feed");
    }

    #[test]
    fn test_cache_route_is_deterministic() {
        let cache = cache_with_host("demo.example.com");
        let first = cache.cache_route("demo.example.com", "/a", b"same").unwrap();
        let second = cache.cache_route("demo.example.com", "/a", b"same").unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.hash, content_hash(b"same"));
    }

    #[test]
    fn test_recache_replaces_route_and_reverse_entry() {
        let cache = cache_with_host("demo.example.com");
        let old = cache.cache_route("demo.example.com", "/a", b"v1").unwrap();
        let new = cache.cache_route("demo.example.com", "/a", b"v2").unwrap();

        assert_eq!(cache.lookup_route("demo.example.com", "/a").unwrap().hash, new.hash);
        assert!(cache
            .lookup_route_by_content_id("demo.example.com", &old.hash)
            .is_none());
        assert_eq!(
            cache
                .lookup_route_by_content_id("demo.example.com", &new.hash.to_uppercase())
                .unwrap()
                .path,
            "/a"
        );
    }

    #[test]
    fn test_unknown_host() {
        let cache = ContentCache::new(16);
        assert!(cache.lookup_host("nope.example.com").is_none());
        assert!(cache.lookup_route("nope.example.com", "/").is_none());
        assert!(matches!(
            cache.cache_route("nope.example.com", "/", b"x"),
            Err(CacheError::UnknownHost(_))
        ));
    }

    #[test]
    fn test_host_lookup_is_case_insensitive() {
        let cache = cache_with_host("Demo.Example.com");
        assert!(cache.lookup_host("demo.example.COM").is_some());
    }

    #[test]
    fn test_route_limit() {
        let cache = ContentCache::new(1);
        cache.add_host(ProtectedHost::new("demo.example.com"));
        cache.cache_route("demo.example.com", "/a", b"1").unwrap();

        assert!(matches!(
            cache.cache_route("demo.example.com", "/b", b"2"),
            Err(CacheError::RouteLimit { limit: 1, .. })
        ));
        // Replacing an existing path is still allowed
        assert!(cache.cache_route("demo.example.com", "/a", b"3").is_ok());
    }

    #[test]
    fn test_no_cache_route_is_never_cacheable() {
        let route = Route::new("/api", true, "abcd");
        assert!(!route.is_cacheable());
        assert!(!Route::new("/empty", false, "").is_cacheable());
    }

    #[test]
    fn test_route_keys() {
        assert_eq!(route_key("/docs/index.html"), "/docs/");
        assert_eq!(route_key("/index.html"), "/");
        assert_eq!(route_key("/about.html"), "/about");
        assert_eq!(route_key("/img/logo.png"), "/img/logo.png");

        let cache = cache_with_host("demo.example.com");
        cache.cache_route("demo.example.com", "/about.html", b"x").unwrap();
        assert!(cache.lookup_route("demo.example.com", "/about").is_some());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a%20b/index.html").unwrap(), "/a%20b/");
        assert_eq!(normalize_path("*"), Err(PathError::NotAbsolute));
        assert_eq!(normalize_path("/bad%zz"), Err(PathError::BadEscape));
        assert_eq!(normalize_path("/short%2"), Err(PathError::BadEscape));
    }

    #[test]
    fn test_apply_primer() {
        let cache = ContentCache::new(16);
        let primer = CachePrimer {
            hostname: "demo.example.com".to_string(),
            routes: vec![
                PrimerRoute {
                    path: "/".to_string(),
                    hash: "ABC123".to_string(),
                },
                PrimerRoute {
                    path: "/style.css".to_string(),
                    hash: "def456".to_string(),
                },
            ],
        };
        let host = cache.apply_primer(&primer);
        assert_eq!(host.route_count(), 2);

        let root = cache.lookup_route("demo.example.com", "/").unwrap();
        assert_eq!(root.hash, "abc123");
        assert!(!root.no_cache);
        assert_eq!(
            cache
                .lookup_route_by_content_id("demo.example.com", "def456")
                .unwrap()
                .path,
            "/style.css"
        );

        let assets = cache.asset_map();
        assert_eq!(assets["demo.example.com"]["/style.css"], "def456");
    }

    #[test]
    fn test_load_primer_file() {
        let path = std::env::temp_dir().join(format!("primer-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"hostname": "files.example.com", "routes": [{"path": "/a.js", "hash": "11"}]}"#,
        )
        .unwrap();

        let cache = ContentCache::new(16);
        let host = cache.load_primer(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(host.hostname(), "files.example.com");
        assert!(cache.lookup_route("files.example.com", "/a.js").is_some());
        assert!(matches!(
            cache.load_primer(Path::new("/nonexistent/primer.json")),
            Err(PrimerError::Io(_))
        ));
    }
}
