//! Edge node representation

use crate::geo::Coordinate;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A candidate edge node
///
/// Nodes are built during a refresh and never mutated afterwards; a new
/// refresh produces new nodes.
#[derive(Debug, Clone)]
pub struct NetworkNode {
    /// Identifier assigned by the control plane
    pub id: String,
    pub ip: IpAddr,
    /// Port the node serves content on
    pub port: u16,
    pub coordinate: Coordinate,
    /// Content identifiers the node holds on disk
    pub content: HashSet<String>,
}

impl NetworkNode {
    pub fn new(id: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            id: id.into(),
            ip,
            port,
            coordinate: Coordinate::default(),
            content: HashSet::new(),
        }
    }

    pub fn with_coordinate(mut self, coordinate: Coordinate) -> Self {
        self.coordinate = coordinate;
        self
    }

    pub fn with_content<I, S>(mut self, content: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.content = content
            .into_iter()
            .map(|id| id.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn holds(&self, content_id: &str) -> bool {
        self.content.contains(&content_id.to_ascii_lowercase())
    }

    /// Endpoint clients fetch content from
    ///
    /// With a pool domain this is `https://{id}.{cdn}.{pool}:{port}`,
    /// otherwise the node's plain address.
    pub fn edge_host(&self, pool_domain: Option<&str>, cdn_subdomain: &str) -> String {
        match pool_domain {
            Some(pool) => format!("https://{}.{}.{}:{}", self.id, cdn_subdomain, pool, self.port),
            None => format!("http://{}", self.address()),
        }
    }
}

impl fmt::Display for NetworkNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}, {}]",
            self.address(),
            self.coordinate.longitude,
            self.coordinate.latitude
        )
    }
}
