//! Server configuration loaded from environment variables

use masternode_common::constants;
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Edge node selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Nearest node (by client location) that holds the content
    GeoNearest,
    /// Fixed rotation over the pool
    RoundRobin,
}

impl SelectionPolicy {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "geo" | "geo-nearest" => Ok(SelectionPolicy::GeoNearest),
            "round-robin" | "roundrobin" | "rr" => Ok(SelectionPolicy::RoundRobin),
            other => Err(ConfigError::InvalidValue("SELECTION_POLICY", other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to
    pub host: String,

    /// Public port for client traffic
    pub port: u16,

    /// Internal port for health and state queries
    pub internal_port: u16,

    /// Protected hostnames mapped to their origin base URL
    pub protected_domains: HashMap<String, String>,

    /// Origin used for hosts without an explicit entry (e.g. primer hosts)
    pub default_origin: String,

    /// Timeout applied to every origin request
    pub origin_timeout: Duration,

    /// Edge node selection strategy
    pub selection_policy: SelectionPolicy,

    /// Resolve IP coordinates through the GeoIP database
    pub geoip_enabled: bool,

    /// MaxMind City database (required when GeoIP is enabled)
    pub geoip_database: Option<PathBuf>,

    /// Discard nodes whose heartbeat is older than `heartbeat_threshold`
    pub heartbeat_check: bool,

    /// Maximum accepted heartbeat age
    pub heartbeat_threshold: chrono::Duration,

    /// Node pool refresh period
    pub refresh_interval: Duration,

    /// Control plane base URL (e.g. "http://127.0.0.1:3001")
    pub control_plane_url: String,

    /// Fixed node pool for offline/local testing; disables polling
    pub static_nodes: Option<Vec<String>>,

    /// Cache primer document
    pub cache_primer: Option<PathBuf>,

    /// Custom bootstrap document template
    pub bootstrap_template: Option<PathBuf>,

    /// Pool domain used to build edge hostnames
    pub pool_domain: Option<String>,

    /// Subdomain of the pool domain for content nodes
    pub cdn_subdomain: String,

    /// How many nearby nodes to consider when looking for a holder
    pub candidate_nodes: usize,

    /// Background caching workers
    pub cache_workers: usize,

    /// Background caching queue bound
    pub cache_queue: usize,

    /// Per-host limit on discovered routes
    pub max_cached_routes: usize,

    /// Write cached bodies to `{dir}/{hash}`
    pub cache_directory: Option<PathBuf>,

    /// Service worker script to serve
    pub service_worker_path: Option<PathBuf>,

    /// Peers whose X-Forwarded-For header is honoured
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            internal_port: 6000,
            protected_domains: HashMap::new(),
            default_origin: "http://127.0.0.1:8085".to_string(),
            origin_timeout: Duration::from_secs(constants::DEFAULT_ORIGIN_TIMEOUT_SECONDS),
            selection_policy: SelectionPolicy::GeoNearest,
            geoip_enabled: false,
            geoip_database: None,
            heartbeat_check: true,
            heartbeat_threshold: chrono::Duration::seconds(
                constants::DEFAULT_HEARTBEAT_THRESHOLD_SECONDS,
            ),
            refresh_interval: Duration::from_secs(constants::DEFAULT_REFRESH_INTERVAL_SECONDS),
            control_plane_url: "http://127.0.0.1:3001".to_string(),
            static_nodes: None,
            cache_primer: None,
            bootstrap_template: None,
            pool_domain: None,
            cdn_subdomain: "cdn".to_string(),
            candidate_nodes: 5,
            cache_workers: 4,
            cache_queue: 256,
            max_cached_routes: 1024,
            cache_directory: None,
            service_worker_path: None,
            trusted_proxies: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or("PORT", get("PORT"), defaults.port)
                .map_err(|_| ConfigError::InvalidPort)?,
            internal_port: parse_or("INTERNAL_PORT", get("INTERNAL_PORT"), defaults.internal_port)
                .map_err(|_| ConfigError::InvalidPort)?,
            protected_domains: match get("PROTECTED_DOMAINS") {
                Some(v) => parse_domains(&v)?,
                None => defaults.protected_domains,
            },
            default_origin: get("ORIGIN_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.default_origin),
            origin_timeout: Duration::from_secs(parse_or(
                "ORIGIN_TIMEOUT_SECS",
                get("ORIGIN_TIMEOUT_SECS"),
                defaults.origin_timeout.as_secs(),
            )?),
            selection_policy: match get("SELECTION_POLICY") {
                Some(v) => SelectionPolicy::parse(&v)?,
                None => defaults.selection_policy,
            },
            geoip_enabled: parse_bool("GEOIP_ENABLED", get("GEOIP_ENABLED"), defaults.geoip_enabled)?,
            geoip_database: get("GEOIP_DATABASE").map(PathBuf::from),
            heartbeat_check: parse_bool(
                "HEARTBEAT_CHECK",
                get("HEARTBEAT_CHECK"),
                defaults.heartbeat_check,
            )?,
            heartbeat_threshold: chrono::Duration::seconds(parse_or(
                "HEARTBEAT_THRESHOLD_SECS",
                get("HEARTBEAT_THRESHOLD_SECS"),
                defaults.heartbeat_threshold.num_seconds(),
            )?),
            refresh_interval: Duration::from_secs(parse_or(
                "REFRESH_INTERVAL_SECS",
                get("REFRESH_INTERVAL_SECS"),
                defaults.refresh_interval.as_secs(),
            )?),
            control_plane_url: get("CONTROL_PLANE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.control_plane_url),
            static_nodes: get("STATIC_NODES").map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
            cache_primer: get("CACHE_PRIMER").map(PathBuf::from),
            bootstrap_template: get("BOOTSTRAP_TEMPLATE").map(PathBuf::from),
            pool_domain: get("POOL_DOMAIN"),
            cdn_subdomain: get("CDN_SUBDOMAIN").unwrap_or(defaults.cdn_subdomain),
            candidate_nodes: parse_or("CANDIDATE_NODES", get("CANDIDATE_NODES"), defaults.candidate_nodes)?,
            cache_workers: parse_or("CACHE_WORKERS", get("CACHE_WORKERS"), defaults.cache_workers)?,
            cache_queue: parse_or("CACHE_QUEUE", get("CACHE_QUEUE"), defaults.cache_queue)?,
            max_cached_routes: parse_or(
                "MAX_CACHED_ROUTES",
                get("MAX_CACHED_ROUTES"),
                defaults.max_cached_routes,
            )?,
            cache_directory: get("CACHE_DIRECTORY").map(PathBuf::from),
            service_worker_path: get("SERVICE_WORKER_PATH").map(PathBuf::from),
            trusted_proxies: match get("TRUSTED_PROXIES") {
                Some(v) => parse_proxies(&v)?,
                None => defaults.trusted_proxies,
            },
        };

        if config.geoip_enabled && config.geoip_database.is_none() {
            return Err(ConfigError::MissingEnv("GEOIP_DATABASE"));
        }
        if config.candidate_nodes == 0 {
            return Err(ConfigError::InvalidValue("CANDIDATE_NODES", "0".to_string()));
        }
        if config.cache_workers == 0 || config.cache_queue == 0 {
            return Err(ConfigError::InvalidValue("CACHE_WORKERS", "0".to_string()));
        }
        if config.refresh_interval.is_zero() {
            return Err(ConfigError::InvalidValue("REFRESH_INTERVAL_SECS", "0".to_string()));
        }

        Ok(config)
    }

    /// Origin base URL for a protected host
    pub fn origin_for(&self, hostname: &str) -> &str {
        self.protected_domains
            .get(hostname)
            .map(String::as_str)
            .unwrap_or(&self.default_origin)
    }

    /// URL of the control plane's pool state endpoint
    pub fn pool_state_url(&self) -> String {
        format!("{}{}", self.control_plane_url, constants::POOL_STATE_ROUTE)
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key, v)),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key, v)),
        },
    }
}

/// Parse "host=origin,host=origin"
fn parse_domains(value: &str) -> Result<HashMap<String, String>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, origin) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidValue("PROTECTED_DOMAINS", entry.to_string()))?;
            let host = host.trim().to_ascii_lowercase();
            let origin = origin.trim().trim_end_matches('/').to_string();
            if host.is_empty() || origin.is_empty() {
                return Err(ConfigError::InvalidValue("PROTECTED_DOMAINS", entry.to_string()));
            }
            Ok((host, origin))
        })
        .collect()
}

/// Parse a comma separated list of IP addresses
fn parse_proxies(value: &str) -> Result<Vec<IpAddr>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse()
                .map_err(|_| ConfigError::InvalidValue("TRUSTED_PROXIES", entry.to_string()))
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
