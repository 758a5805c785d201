//! Client-side access to the cluster.
//!
//! The client is not a cluster member: it picks a node through the load
//! balancer (round-robin unless configured otherwise), opens one connection
//! per query, sends a QUERY frame under the sentinel sender identifier and
//! reads back a single QUERY_RESPONSE frame.

use crate::cluster::balancer::{LoadBalancer, Strategy};
use crate::config::{ClusterConfig, NodeConfig};
use crate::core::message::{self, Message, Payload};
use crate::core::node::{NodeDescriptor, CLIENT_SENDER_ID};
use crate::core::result::QueryResult;
use crate::error::{DbError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use uuid::Uuid;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DdbClient {
    nodes: Vec<NodeConfig>,
    descriptors: Vec<NodeDescriptor>,
    balancer: LoadBalancer,
    strategy: Strategy,
}

impl DdbClient {
    pub fn new(config: &ClusterConfig) -> Self {
        Self::with_strategy(config, Strategy::RoundRobin)
    }

    /// Client with an explicit node selection policy.
    pub fn with_strategy(config: &ClusterConfig, strategy: Strategy) -> Self {
        tracing::debug!(
            "client initialized with {} nodes ({:?})",
            config.nodes.len(),
            strategy
        );
        let descriptors = config
            .nodes
            .iter()
            .map(|node| {
                NodeDescriptor::new(node.node_id, node.network.host.clone(), node.network.port)
            })
            .collect();
        Self {
            nodes: config.nodes.clone(),
            descriptors,
            balancer: LoadBalancer::new(),
            strategy,
        }
    }

    fn next_node(&self) -> Result<&NodeConfig> {
        let selected = self
            .balancer
            .select_node(&self.descriptors, self.strategy, None)
            .ok_or_else(|| DbError::Internal("no node available for routing".to_string()))?;
        self.nodes
            .iter()
            .find(|node| node.node_id == selected.node_id)
            .ok_or_else(|| {
                DbError::NotFound(format!("node {} not in configuration", selected.node_id))
            })
    }

    /// Send one query to the node picked by the selection policy.
    pub async fn send_query(&self, sql: &str) -> Result<QueryResult> {
        let node = self.next_node()?.clone();
        self.send_query_to(sql, &node).await
    }

    /// Send one query to a specific node and wait for its response frame.
    pub async fn send_query_to(&self, sql: &str, node: &NodeConfig) -> Result<QueryResult> {
        let message = Message::unicast(
            Payload::Query {
                sql: sql.to_string(),
            },
            CLIENT_SENDER_ID,
            node.node_id,
        )
        .with_transaction(Uuid::new_v4().to_string());
        let frame = message::encode(&message)?;

        let exchange = async {
            let stream = TcpStream::connect((node.network.host.as_str(), node.network.port))
                .await
                .map_err(|e| {
                    DbError::Network(format!("connect to node {} failed: {}", node.node_id, e))
                })?;
            let (read_half, mut write_half) = stream.into_split();

            write_half
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| DbError::Network(e.to_string()))?;
            write_half
                .write_all(b"\n")
                .await
                .map_err(|e| DbError::Network(e.to_string()))?;
            write_half
                .flush()
                .await
                .map_err(|e| DbError::Network(e.to_string()))?;

            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| DbError::Network(e.to_string()))?;
            if n == 0 {
                return Err(DbError::Network(format!(
                    "node {} closed the connection without responding",
                    node.node_id
                )));
            }

            // decode verifies the response checksum
            let response = message::decode(&line)?;
            match response.payload {
                Payload::QueryResponse { result } => Ok(result),
                other => Err(DbError::Serialization(format!(
                    "expected QUERY_RESPONSE, got {}",
                    other.wire_type()
                ))),
            }
        };

        timeout(RECEIVE_TIMEOUT, exchange)
            .await
            .map_err(|_| DbError::Timeout(format!("no response from node {}", node.node_id)))?
    }
}
