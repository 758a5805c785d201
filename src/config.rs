//! Cluster configuration.
//!
//! A cluster is described by a JSON file with a top-level `nodes` array.
//! Each entry names the node identifier, its network endpoint, and the
//! connection parameters of the relational backend it fronts. The file is
//! loaded once at startup and never reloaded.

use crate::core::node::NodeId;
use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Static description of the whole cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
}

/// Per-node configuration entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
}

/// Listen endpoint for peer and client traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

/// Connection parameters for the local relational backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_database_port")]
    pub port: u16,
}

fn default_database_port() -> u16 {
    3306
}

impl ClusterConfig {
    /// Load the configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|e| {
            DbError::Configuration(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&raw)
    }

    /// Parse the configuration from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ClusterConfig = serde_json::from_str(raw)
            .map_err(|e| DbError::Configuration(format!("invalid configuration: {}", e)))?;
        if config.nodes.is_empty() {
            return Err(DbError::Configuration(
                "configuration contains no nodes".to_string(),
            ));
        }
        Ok(config)
    }

    /// Look up the entry for a specific node.
    pub fn node(&self, node_id: NodeId) -> Result<&NodeConfig> {
        self.nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .ok_or_else(|| DbError::NotFound(format!("node {} not in configuration", node_id)))
    }
}

/// Timing knobs for the periodic machinery. Defaults match the protocol
/// contract; tests shorten them to converge quickly.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Interval between HEARTBEAT broadcasts.
    pub heartbeat_interval: Duration,
    /// Silence after which an ACTIVE peer is marked INACTIVE.
    pub heartbeat_timeout: Duration,
    /// Election watchdog: how long the initiator waits for ACKs.
    pub election_timeout: Duration,
    /// Timeout for one outbound connect and send.
    pub send_timeout: Duration,
    /// How long the 2PC coordinator collects votes before deciding.
    pub decision_window: Duration,
    /// Cadence of the pending-replication sweeper.
    pub replication_sweep_interval: Duration,
    /// Age at which an unacknowledged replication entry is dropped.
    pub replication_timeout: Duration,
    /// Grace period after startup before the first election.
    pub bootstrap_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            election_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            decision_window: Duration::from_secs(5),
            replication_sweep_interval: Duration::from_secs(60),
            replication_timeout: Duration::from_secs(60),
            bootstrap_delay: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "nodes": [
            {
                "node_id": 1,
                "network": {"host": "127.0.0.1", "port": 5001},
                "database": {"host": "127.0.0.1", "user": "ddb", "password": "ddb", "database": "ddb1"}
            },
            {
                "node_id": 2,
                "network": {"host": "127.0.0.1", "port": 5002},
                "database": {"host": "127.0.0.1", "user": "ddb", "password": "ddb", "database": "ddb2", "port": 3307}
            }
        ]
    }"#;

    #[test]
    fn test_parse_config() {
        let config = ClusterConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].network.port, 5001);
        // database port falls back to the MySQL default when omitted
        assert_eq!(config.nodes[0].database.port, 3306);
        assert_eq!(config.nodes[1].database.port, 3307);
    }

    #[test]
    fn test_node_lookup() {
        let config = ClusterConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.node(2).unwrap().network.port, 5002);
        assert!(config.node(42).is_err());
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(ClusterConfig::from_json(r#"{"nodes": []}"#).is_err());
        assert!(ClusterConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ClusterConfig::load(file.path()).unwrap();
        assert_eq!(config.nodes.len(), 2);
    }

    #[test]
    fn test_default_timings() {
        let timings = Timings::default();
        assert_eq!(timings.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(timings.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(timings.election_timeout, Duration::from_secs(5));
        assert_eq!(timings.replication_timeout, Duration::from_secs(60));
    }
}
