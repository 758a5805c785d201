use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier. Globally unique, totally ordered; the ordering drives
/// the bully election.
pub type NodeId = u64;

/// Sentinel sender identifier used by clients, which are not cluster
/// members.
pub const CLIENT_SENDER_ID: NodeId = 9999;

/// Liveness status of a peer.
///
/// Transitions form ACTIVE <-> SUSPECT -> INACTIVE -> ACTIVE. The
/// coordinator role is orthogonal and tracked by the election state, but
/// the wire protocol reserves a COORDINATOR status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Active,
    Inactive,
    Suspect,
    Coordinator,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "ACTIVE"),
            NodeStatus::Inactive => write!(f, "INACTIVE"),
            NodeStatus::Suspect => write!(f, "SUSPECT"),
            NodeStatus::Coordinator => write!(f, "COORDINATOR"),
        }
    }
}

/// Point-in-time view of one peer, as held in the local peer registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub query_count: u64,
}

impl NodeDescriptor {
    pub fn new(node_id: NodeId, host: String, port: u16) -> Self {
        Self {
            node_id,
            host,
            port,
            status: NodeStatus::Active,
            last_heartbeat: Some(Utc::now()),
            query_count: 0,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }
}
