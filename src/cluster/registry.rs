//! Local view of the cluster membership.
//!
//! The peer set is fixed at startup, so the registry map itself is
//! immutable; each descriptor sits behind its own lock. The health checker
//! scanning for stale peers therefore never serializes against connection
//! handlers updating heartbeats.

use crate::config::NodeConfig;
use crate::core::node::{NodeDescriptor, NodeId, NodeStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct PeerState {
    host: String,
    port: u16,
    status: NodeStatus,
    last_heartbeat: Instant,
    last_heartbeat_at: DateTime<Utc>,
    query_count: u64,
}

pub struct PeerRegistry {
    peers: HashMap<NodeId, RwLock<PeerState>>,
}

impl PeerRegistry {
    pub fn new(configs: &[NodeConfig]) -> Self {
        let now = Instant::now();
        let peers = configs
            .iter()
            .map(|config| {
                (
                    config.node_id,
                    RwLock::new(PeerState {
                        host: config.network.host.clone(),
                        port: config.network.port,
                        status: NodeStatus::Active,
                        last_heartbeat: now,
                        last_heartbeat_at: Utc::now(),
                        query_count: 0,
                    }),
                )
            })
            .collect();
        Self { peers }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All configured node identifiers, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn endpoint(&self, node_id: NodeId) -> Option<(String, u16)> {
        self.peers.get(&node_id).map(|peer| {
            let peer = peer.read();
            (peer.host.clone(), peer.port)
        })
    }

    pub fn status(&self, node_id: NodeId) -> Option<NodeStatus> {
        self.peers.get(&node_id).map(|peer| peer.read().status)
    }

    pub fn descriptor(&self, node_id: NodeId) -> Option<NodeDescriptor> {
        self.peers.get(&node_id).map(|peer| {
            let peer = peer.read();
            NodeDescriptor {
                node_id,
                host: peer.host.clone(),
                port: peer.port,
                status: peer.status,
                last_heartbeat: Some(peer.last_heartbeat_at),
                query_count: peer.query_count,
            }
        })
    }

    /// Snapshot of every peer, ascending by identifier.
    pub fn snapshot(&self) -> Vec<NodeDescriptor> {
        let mut descriptors: Vec<NodeDescriptor> = self
            .node_ids()
            .into_iter()
            .filter_map(|id| self.descriptor(id))
            .collect();
        descriptors.sort_by_key(|d| d.node_id);
        descriptors
    }

    /// Snapshot of the ACTIVE peers, ascending by identifier.
    pub fn active(&self) -> Vec<NodeDescriptor> {
        self.snapshot()
            .into_iter()
            .filter(NodeDescriptor::is_active)
            .collect()
    }

    /// Record a heartbeat from `node_id`, restoring it to ACTIVE if it had
    /// been marked otherwise. Returns `Some(true)` when the peer was
    /// restored, `None` for an unknown sender.
    pub fn record_heartbeat(&self, node_id: NodeId) -> Option<bool> {
        let peer = self.peers.get(&node_id)?;
        let mut peer = peer.write();
        peer.last_heartbeat = Instant::now();
        peer.last_heartbeat_at = Utc::now();
        let restored = peer.status != NodeStatus::Active;
        peer.status = NodeStatus::Active;
        Some(restored)
    }

    /// Returns false for an unknown node.
    pub fn set_status(&self, node_id: NodeId, status: NodeStatus) -> bool {
        match self.peers.get(&node_id) {
            Some(peer) => {
                peer.write().status = status;
                true
            }
            None => false,
        }
    }

    pub fn increment_query_count(&self, node_id: NodeId) -> u64 {
        match self.peers.get(&node_id) {
            Some(peer) => {
                let mut peer = peer.write();
                peer.query_count += 1;
                peer.query_count
            }
            None => 0,
        }
    }

    /// ACTIVE peers (other than `exclude`) that have been silent longer
    /// than `timeout`.
    pub fn stale_active_peers(&self, timeout: Duration, exclude: NodeId) -> Vec<NodeId> {
        let mut stale = Vec::new();
        for (&node_id, peer) in &self.peers {
            if node_id == exclude {
                continue;
            }
            let peer = peer.read();
            if peer.status == NodeStatus::Active && peer.last_heartbeat.elapsed() > timeout {
                stale.push(node_id);
            }
        }
        stale.sort_unstable();
        stale
    }

    #[cfg(test)]
    fn backdate_heartbeat(&self, node_id: NodeId, age: Duration) {
        if let Some(peer) = self.peers.get(&node_id) {
            peer.write().last_heartbeat = Instant::now() - age;
        }
    }
}
