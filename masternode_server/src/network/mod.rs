//! Node pool: the live set of edge nodes and the queries that pick one
//!
//! The pool holds an immutable `Snapshot` (nodes, spatial index, rotation
//! order) behind a single mutex together with the round-robin cursor.
//! Refreshes build a complete snapshot off to the side and swap the `Arc`
//! in, so readers see either the old pool or the new one.

pub mod node;
pub mod refresh;
pub mod spatial;

pub use node::NetworkNode;
pub use refresh::{spawn_refresh, RecordFilter};

use crate::config::{Config, SelectionPolicy};
use crate::geo::{GeoError, GeoIp};
use chrono::{DateTime, Utc};
use spatial::SpatialIndex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Timeout for control-plane requests
const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("No node pool snapshot has been built yet")]
    NoSnapshot,

    #[error("There are no nodes available to choose from")]
    EmptyPool,

    #[error("Could not locate client: {0}")]
    Geo(#[from] GeoError),

    #[error("No nearby node holds content {0}")]
    NotFoundNearby(String),
}

/// One immutable generation of the node pool
#[derive(Debug)]
pub struct Snapshot {
    /// Rotation order (sorted by node id)
    nodes: Vec<Arc<NetworkNode>>,
    index: SpatialIndex,
    built_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn build(mut nodes: Vec<NetworkNode>) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let coords: Vec<_> = nodes.iter().map(|n| n.coordinate).collect();
        Self {
            index: SpatialIndex::build(&coords),
            nodes: nodes.into_iter().map(Arc::new).collect(),
            built_at: Utc::now(),
        }
    }

    pub fn nodes(&self) -> &[Arc<NetworkNode>] {
        &self.nodes
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    fn nearest(&self, target: crate::geo::Coordinate, n: usize) -> Vec<Arc<NetworkNode>> {
        self.index
            .nearest(target, n)
            .into_iter()
            .map(|i| self.nodes[i].clone())
            .collect()
    }

    /// The `n` nearest nodes plus any tied with the farthest of them
    fn nearest_with_ties(&self, target: crate::geo::Coordinate, n: usize) -> Vec<Arc<NetworkNode>> {
        self.index
            .nearest_with_ties(target, n)
            .into_iter()
            .map(|i| self.nodes[i].clone())
            .collect()
    }
}

struct PoolInner {
    snapshot: Option<Arc<Snapshot>>,
    cursor: usize,
}

/// The masternode's live view of its edge nodes
pub struct NetworkState {
    inner: Mutex<PoolInner>,
    geo: GeoIp,
    policy: SelectionPolicy,
    filter: RecordFilter,
    candidates: usize,
    state_url: String,
    http_client: reqwest::Client,
}

impl NetworkState {
    pub fn new(config: &Config, geo: GeoIp) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(CONTROL_PLANE_TIMEOUT)
            .build()?;

        Ok(Self {
            inner: Mutex::new(PoolInner {
                snapshot: None,
                cursor: 0,
            }),
            geo,
            policy: config.selection_policy,
            filter: RecordFilter {
                heartbeat_check: config.heartbeat_check,
                threshold: config.heartbeat_threshold,
            },
            candidates: config.candidate_nodes,
            state_url: config.pool_state_url(),
            http_client,
        })
    }

    pub fn geo(&self) -> &GeoIp {
        &self.geo
    }

    /// Build a snapshot from `nodes` and swap it in; returns the pool size
    pub async fn install(&self, nodes: Vec<NetworkNode>) -> usize {
        let snapshot = Arc::new(Snapshot::build(nodes));
        let count = snapshot.nodes.len();

        let mut inner = self.inner.lock().await;
        inner.snapshot = Some(snapshot);
        inner.cursor = 0;
        count
    }

    pub async fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.lock().await.snapshot.clone()
    }

    pub async fn node_count(&self) -> usize {
        self.snapshot().await.map(|s| s.nodes.len()).unwrap_or(0)
    }

    /// Addresses of every node in the current snapshot
    pub async fn node_addresses(&self) -> Vec<String> {
        self.snapshot()
            .await
            .map(|s| s.nodes.iter().map(|n| n.address().to_string()).collect())
            .unwrap_or_default()
    }

    /// Geographically nearest node to `ip`
    pub async fn get_closest_node(&self, ip: IpAddr) -> Result<Arc<NetworkNode>, SelectionError> {
        let inner = self.inner.lock().await;
        let snapshot = inner.snapshot.as_ref().ok_or(SelectionError::NoSnapshot)?;
        let location = self.geo.resolve(ip)?;

        snapshot
            .nearest(location, 1)
            .into_iter()
            .next()
            .ok_or(SelectionError::EmptyPool)
    }

    /// Of the `n` nodes nearest to `ip`, those holding `content_id`, nearest first
    ///
    /// Nodes at the same distance as the `n`-th are considered too, so a pool
    /// of co-located nodes is never narrowed by id order.
    pub async fn get_n_closest_serving_nodes(
        &self,
        ip: IpAddr,
        content_id: &str,
        n: usize,
    ) -> Result<Vec<Arc<NetworkNode>>, SelectionError> {
        let inner = self.inner.lock().await;
        let snapshot = inner.snapshot.as_ref().ok_or(SelectionError::NoSnapshot)?;
        if snapshot.nodes.is_empty() {
            return Err(SelectionError::EmptyPool);
        }
        let location = self.geo.resolve(ip)?;

        let serving: Vec<_> = snapshot
            .nearest_with_ties(location, n)
            .into_iter()
            .filter(|node| node.holds(content_id))
            .collect();

        if serving.is_empty() {
            return Err(SelectionError::NotFoundNearby(content_id.to_string()));
        }
        Ok(serving)
    }

    /// Next node in the rotation
    pub async fn get_next_node(&self) -> Result<Arc<NetworkNode>, SelectionError> {
        let mut inner = self.inner.lock().await;
        let snapshot = inner.snapshot.clone().ok_or(SelectionError::EmptyPool)?;
        if snapshot.nodes.is_empty() {
            return Err(SelectionError::EmptyPool);
        }

        let position = inner.cursor % snapshot.nodes.len();
        inner.cursor = (position + 1) % snapshot.nodes.len();
        Ok(snapshot.nodes[position].clone())
    }

    /// Pick the node a client should fetch `content_id` from, per the configured policy
    pub async fn select_serving_node(
        &self,
        ip: IpAddr,
        content_id: &str,
    ) -> Result<Arc<NetworkNode>, SelectionError> {
        match self.policy {
            SelectionPolicy::GeoNearest => self
                .get_n_closest_serving_nodes(ip, content_id, self.candidates)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| SelectionError::NotFoundNearby(content_id.to_string())),
            SelectionPolicy::RoundRobin => self.get_next_node().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;

    fn node(id: &str, ip: &str, long: f64, lat: f64) -> NetworkNode {
        NetworkNode::new(id, ip.parse().unwrap(), 8080).with_coordinate(Coordinate::new(long, lat))
    }

    fn client(ip: &str) -> IpAddr {
        ip.parse().unwrap()
    }

    fn state_with(policy: SelectionPolicy, geo: GeoIp) -> NetworkState {
        let config = Config {
            selection_policy: policy,
            ..Config::default()
        };
        NetworkState::new(&config, geo).unwrap()
    }

    fn geo_table() -> GeoIp {
        GeoIp::fixed([
            (client("192.0.2.1"), Coordinate::new(0.0, 0.0)),
            (client("192.0.2.2"), Coordinate::new(-50.0, -20.0)),
        ])
    }

    #[tokio::test]
    async fn test_no_snapshot() {
        let state = state_with(SelectionPolicy::GeoNearest, geo_table());
        assert!(matches!(
            state.get_closest_node(client("192.0.2.1")).await,
            Err(SelectionError::NoSnapshot)
        ));
        assert!(matches!(state.get_next_node().await, Err(SelectionError::EmptyPool)));
        assert_eq!(state.node_count().await, 0);
    }

    #[tokio::test]
    async fn test_closest_node() {
        let state = state_with(SelectionPolicy::GeoNearest, geo_table());
        state
            .install(vec![
                node("a", "0.1.0.1", 0.1, 0.1),
                node("b", "20.0.20.0", 20.0, 20.0),
                node("c", "30.0.20.0", 30.0, 20.0),
                node("d", "40.0.20.0", -40.0, 20.0),
            ])
            .await;

        let closest = state.get_closest_node(client("192.0.2.1")).await.unwrap();
        assert_eq!(closest.ip.to_string(), "0.1.0.1");

        let closest = state.get_closest_node(client("192.0.2.2")).await.unwrap();
        assert_eq!(closest.ip.to_string(), "40.0.20.0");

        // Unknown client location
        assert!(matches!(
            state.get_closest_node(client("198.51.100.9")).await,
            Err(SelectionError::Geo(_))
        ));
    }

    #[tokio::test]
    async fn test_closest_serving_nodes_filters_inventory() {
        let state = state_with(SelectionPolicy::GeoNearest, geo_table());
        state
            .install(vec![
                node("a", "10.0.0.1", 0.1, 0.1).with_content(["other"]),
                node("b", "10.0.0.2", 20.0, 20.0).with_content(["abc"]),
                node("c", "10.0.0.3", 30.0, 20.0).with_content(["abc", "other"]),
                node("d", "10.0.0.4", -40.0, 20.0).with_content(["abc"]),
            ])
            .await;

        let serving = state
            .get_n_closest_serving_nodes(client("192.0.2.1"), "abc", 3)
            .await
            .unwrap();
        let ips: Vec<String> = serving.iter().map(|n| n.ip.to_string()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.3"]);

        assert!(matches!(
            state
                .get_n_closest_serving_nodes(client("192.0.2.1"), "missing", 4)
                .await,
            Err(SelectionError::NotFoundNearby(_))
        ));

        let selected = state
            .select_serving_node(client("192.0.2.1"), "abc")
            .await
            .unwrap();
        assert_eq!(selected.id, "b");
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let state = state_with(SelectionPolicy::RoundRobin, GeoIp::Disabled);
        state
            .install(vec![
                node("c", "10.0.0.3", 0.0, 0.0),
                node("a", "10.0.0.1", 0.0, 0.0),
                node("b", "10.0.0.2", 0.0, 0.0),
            ])
            .await;

        let mut picked = Vec::new();
        for _ in 0..4 {
            picked.push(state.get_next_node().await.unwrap().id.clone());
        }
        assert_eq!(picked, vec!["a", "b", "c", "a"]);

        // Round robin ignores inventory
        let selected = state
            .select_serving_node(client("192.0.2.1"), "anything")
            .await
            .unwrap();
        assert_eq!(selected.id, "b");
    }

    #[tokio::test]
    async fn test_install_swaps_whole_snapshot() {
        let state = state_with(SelectionPolicy::RoundRobin, GeoIp::Disabled);
        state.install(vec![node("a", "10.0.0.1", 0.0, 0.0)]).await;
        let before = state.snapshot().await.unwrap();

        state
            .install(vec![node("x", "10.0.1.1", 0.0, 0.0), node("y", "10.0.1.2", 0.0, 0.0)])
            .await;

        // Readers holding the old snapshot still see it intact
        assert_eq!(before.nodes().len(), 1);
        assert_eq!(state.node_count().await, 2);
        assert_eq!(state.get_next_node().await.unwrap().id, "x");

        state.install(Vec::new()).await;
        assert!(matches!(state.get_next_node().await, Err(SelectionError::EmptyPool)));
        assert!(matches!(
            state.get_n_closest_serving_nodes(client("192.0.2.1"), "abc", 1).await,
            Err(SelectionError::EmptyPool)
        ));
    }

    #[tokio::test]
    async fn test_disabled_geo_still_selects() {
        let state = state_with(SelectionPolicy::GeoNearest, GeoIp::Disabled);
        state
            .install(vec![node("a", "10.0.0.1", 0.0, 0.0).with_content(["abc"])])
            .await;
        let selected = state
            .select_serving_node(client("203.0.113.5"), "abc")
            .await
            .unwrap();
        assert_eq!(selected.id, "a");
        assert_eq!(state.node_addresses().await, vec!["10.0.0.1:8080"]);
    }

    #[tokio::test]
    async fn test_co_located_nodes_all_considered() {
        let state = state_with(SelectionPolicy::GeoNearest, GeoIp::Disabled);
        let mut nodes: Vec<_> = (0..8)
            .map(|i| node(&format!("n{i}"), &format!("10.0.0.{}", i + 1), 0.0, 0.0))
            .collect();
        nodes.push(node("n8", "10.0.0.9", 0.0, 0.0).with_content(["abc"]));
        state.install(nodes).await;

        let selected = state
            .select_serving_node(client("203.0.113.5"), "abc")
            .await
            .unwrap();
        assert_eq!(selected.id, "n8");

        let serving = state
            .get_n_closest_serving_nodes(client("203.0.113.5"), "abc", 1)
            .await
            .unwrap();
        assert_eq!(serving.len(), 1);
    }
}
