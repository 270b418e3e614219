//! Periodic node pool refresh from the control plane

use super::{NetworkNode, NetworkState};
use chrono::{DateTime, Utc};
use masternode_common::{ControlPlaneState, NodeRecord};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("Control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Control plane returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("Invalid static node address: {0}")]
    StaticNode(String),
}

/// Record acceptance rules applied while parsing pool state
#[derive(Debug, Clone, Copy)]
pub struct RecordFilter {
    pub heartbeat_check: bool,
    /// Maximum accepted heartbeat age; an age equal to it is accepted
    pub threshold: chrono::Duration,
}

#[derive(Debug, PartialEq, Eq)]
enum Rejection {
    Malformed,
    StaleHeartbeat,
    BadIp,
    BadPort,
}

/// Turn control-plane pool state into nodes, discarding invalid or stale records
///
/// Coordinates are left at their default; see `NetworkState::locate`.
pub fn parse_state(
    state: &ControlPlaneState,
    now: DateTime<Utc>,
    filter: &RecordFilter,
) -> Vec<NetworkNode> {
    state
        .records()
        .into_iter()
        .filter_map(|(id, record)| {
            let accepted = record
                .map_err(|_| Rejection::Malformed)
                .and_then(|record| validate_record(&id, record, now, filter));
            match accepted {
                Ok(node) => Some(node),
                Err(reason) => {
                    tracing::debug!("Discarding node record {}: {:?}", id, reason);
                    None
                }
            }
        })
        .collect()
}

fn validate_record(
    id: &str,
    record: NodeRecord,
    now: DateTime<Utc>,
    filter: &RecordFilter,
) -> Result<NetworkNode, Rejection> {
    if filter.heartbeat_check {
        let heartbeat = record
            .heartbeat
            .as_ref()
            .and_then(|f| f.data.as_i64())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or(Rejection::StaleHeartbeat)?;
        if now.signed_duration_since(heartbeat) > filter.threshold {
            return Err(Rejection::StaleHeartbeat);
        }
    }

    let ip: IpAddr = record
        .ip_address
        .as_ref()
        .and_then(|f| f.data.trim().parse().ok())
        .ok_or(Rejection::BadIp)?;

    let port = record
        .content_port
        .as_ref()
        .and_then(|f| f.data.as_i64())
        .and_then(|p| u16::try_from(p).ok())
        .ok_or(Rejection::BadPort)?;

    let content = record.disk_content.map(|f| f.data).unwrap_or_default();
    Ok(NetworkNode::new(id, ip, port).with_content(content))
}

/// Parse a fixed `ip:port` list into nodes
pub fn static_nodes(addresses: &[String]) -> Result<Vec<NetworkNode>, RefreshError> {
    addresses
        .iter()
        .enumerate()
        .map(|(i, address)| {
            let addr: SocketAddr = address
                .parse()
                .map_err(|_| RefreshError::StaticNode(address.clone()))?;
            Ok(NetworkNode::new(format!("static-{}", i), addr.ip(), addr.port()))
        })
        .collect()
}

impl NetworkState {
    /// Run one refresh cycle; on error the current snapshot stays in place
    pub async fn refresh(&self) -> Result<usize, RefreshError> {
        let response = self.http_client.get(&self.state_url).send().await?;
        if !response.status().is_success() {
            return Err(RefreshError::Status(response.status()));
        }
        let state: ControlPlaneState = response.json().await?;

        let parsed = parse_state(&state, Utc::now(), &self.filter);
        let reported = state.response.node_data_map.len();
        let nodes = self.locate(parsed);
        tracing::debug!("Accepted {} of {} reported nodes", nodes.len(), reported);

        Ok(self.install(nodes).await)
    }

    /// Install a fixed pool once; no polling happens afterwards
    pub async fn load_static(&self, addresses: &[String]) -> Result<usize, RefreshError> {
        let nodes = self.locate(static_nodes(addresses)?);
        Ok(self.install(nodes).await)
    }

    /// Attach coordinates; nodes that cannot be located are dropped
    fn locate(&self, nodes: Vec<NetworkNode>) -> Vec<NetworkNode> {
        if !self.geo.is_enabled() {
            return nodes;
        }

        nodes
            .into_iter()
            .filter_map(|node| match self.geo.resolve(node.ip) {
                Ok(coordinate) => Some(node.with_coordinate(coordinate)),
                Err(e) => {
                    tracing::warn!("Discarding node {}: {}", node.id, e);
                    None
                }
            })
            .collect()
    }
}

/// Refresh the pool every `interval` until shutdown is signalled
pub fn spawn_refresh(
    state: Arc<NetworkState>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match state.refresh().await {
                        Ok(count) => tracing::debug!("Node pool refreshed: {} nodes", count),
                        Err(e) => tracing::warn!("Node pool refresh failed, keeping previous pool: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Node pool refresh task shutting down");
                        break;
                    }
                }
            }
        }
    })
}
