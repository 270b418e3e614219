//! Masternode Common - Shared wire formats for the edge router
//!
//! This crate contains the control-plane state envelope, the cache primer
//! document and the protocol constants used by the masternode and by any
//! tooling that produces or consumes those documents.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Document errors
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Failed to parse document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

/// Envelope returned by the control plane's pool state endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneState {
    pub response: PoolState,
}

/// Pool state body
///
/// Records are kept as raw JSON so that one malformed record can be
/// discarded without failing the whole document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolState {
    #[serde(default)]
    pub node_data_map: HashMap<String, serde_json::Value>,
}

/// Control-plane values are wrapped as `{"data": ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field<T> {
    pub data: T,
}

/// A value the control plane may send either as a number or as a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Text(String),
}

impl Scalar {
    /// Interpret the value as an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(n) => Some(*n),
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// One edge node as reported by the control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    pub ip_address: Option<Field<String>>,
    pub content_port: Option<Field<Scalar>>,
    /// Unix timestamp (seconds) of the node's last heartbeat
    pub heartbeat: Option<Field<Scalar>>,
    /// Content identifiers currently held on disk
    pub disk_content: Option<Field<Vec<String>>>,
}

impl ControlPlaneState {
    pub fn from_json(s: &str) -> Result<Self, FormatError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Decode every record, keeping the ones that deserialize
    pub fn records(&self) -> Vec<(String, Result<NodeRecord, serde_json::Error>)> {
        self.response
            .node_data_map
            .iter()
            .map(|(id, value)| (id.clone(), NodeRecord::deserialize(value)))
            .collect()
    }
}

/// Static description of one protected host used to pre-populate the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePrimer {
    pub hostname: String,
    #[serde(default)]
    pub routes: Vec<PrimerRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimerRoute {
    pub path: String,
    pub hash: String,
}

impl CachePrimer {
    pub fn from_json(s: &str) -> Result<Self, FormatError> {
        let primer: CachePrimer = serde_json::from_str(s)?;
        if primer.hostname.is_empty() {
            return Err(FormatError::MissingField("hostname"));
        }
        Ok(primer)
    }
}

/// Constants for the protocol
pub mod constants {
    /// Control-plane route for the current pool state
    pub const POOL_STATE_ROUTE: &str = "/api/p2p/state";

    /// Default node pool refresh interval
    pub const DEFAULT_REFRESH_INTERVAL_SECONDS: u64 = 30;

    /// Default maximum heartbeat age
    pub const DEFAULT_HEARTBEAT_THRESHOLD_SECONDS: i64 = 10;

    /// Default origin request timeout
    pub const DEFAULT_ORIGIN_TIMEOUT_SECONDS: u64 = 5;

    /// Bootstrap template placeholders
    pub const EDGE_HOST_PLACEHOLDER: &str = "{EDGEHOST}";
    pub const EXPECTED_HASH_PLACEHOLDER: &str = "{EXPECTEDHASH}";
    pub const ROUTE_PLACEHOLDER: &str = "{ROUTE}";

    /// Route the service worker script is served on
    pub const SERVICE_WORKER_ROUTE: &str = "/masternode-sw.js";

    /// Largest request or origin body the masternode will buffer
    pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"response": {"node_data_map": {"0xdeadbeef": {"content_port": {"data": "8080"}, "ip_address": {"data": "127.0.0.1"}, "heartbeat": {"data": "999999999"}, "disk_content": {"data": ["yes", "no", "maybe"]}}}}}"#;

    #[test]
    fn test_parse_pool_state() {
        let state = ControlPlaneState::from_json(SAMPLE).unwrap();
        let records = state.records();
        assert_eq!(records.len(), 1);

        let (id, record) = &records[0];
        let record = record.as_ref().unwrap();
        assert_eq!(id, "0xdeadbeef");
        assert_eq!(record.ip_address.as_ref().unwrap().data, "127.0.0.1");
        assert_eq!(record.content_port.as_ref().unwrap().data.as_i64(), Some(8080));
        assert_eq!(record.heartbeat.as_ref().unwrap().data.as_i64(), Some(999999999));
        assert_eq!(record.disk_content.as_ref().unwrap().data.len(), 3);
    }

    #[test]
    fn test_bad_record_does_not_fail_document() {
        let json = r#"{"response": {"node_data_map": {
            "good": {"ip_address": {"data": "10.0.0.1"}, "content_port": {"data": 8080}},
            "bad": {"disk_content": {"data": "not-a-list"}}
        }}}"#;
        let state = ControlPlaneState::from_json(json).unwrap();
        let mut records = state.records();
        records.sort_by(|a, b| a.0.cmp(&b.0));

        assert!(records[0].1.is_err());
        assert_eq!(records[1].0, "good");
        assert!(records[1].1.is_ok());
    }

    #[test]
    fn test_scalar_parsing() {
        assert_eq!(Scalar::Text(" 42 ".to_string()).as_i64(), Some(42));
        assert_eq!(Scalar::Text("port".to_string()).as_i64(), None);
        assert_eq!(Scalar::Int(7).as_i64(), Some(7));
    }

    #[test]
    fn test_cache_primer() {
        let primer = CachePrimer::from_json(
            r#"{"hostname": "demo.example.com", "routes": [{"path": "/", "hash": "abc"}]}"#,
        )
        .unwrap();
        assert_eq!(primer.hostname, "demo.example.com");
        assert_eq!(primer.routes.len(), 1);
        assert_eq!(primer.routes[0].hash, "abc");

        assert!(matches!(
            CachePrimer::from_json(r#"{"hostname": ""}"#),
            Err(FormatError::MissingField("hostname"))
        ));
    }
}
